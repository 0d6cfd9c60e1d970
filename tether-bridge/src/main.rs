use anyhow::{anyhow, Context};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether_bridge::adapters::credentials::FileCredentialStore;
use tether_bridge::adapters::relay_socket::RelaySocketSettings;
use tether_bridge::app::router::RouterSettings;
use tether_bridge::{run, Settings, DEFAULT_LISTEN};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Tether cloud bridge", long_about = None)]
struct Cli {
    #[arg(long, env = "TETHER_BRIDGE_LISTEN", default_value_t = DEFAULT_LISTEN)]
    listen: SocketAddr,

    #[arg(
        long,
        env = "TETHER_CREDENTIALS",
        value_name = "PATH",
        help = "Agent credentials (defaults to <config dir>/tether/agents.json)"
    )]
    credentials: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST),
        help = "Host on which agents' loopback HTTP servers are reachable"
    )]
    agent_host: IpAddr,

    #[arg(long, default_value_t = 5_000, help = "How long a healthy probe counts, in milliseconds")]
    status_ttl_ms: u64,

    #[arg(long, default_value_t = 2_000, help = "Interval between health sweeps in milliseconds")]
    probe_interval_ms: u64,

    #[arg(long, default_value_t = 1_000, help = "Health probe timeout in milliseconds")]
    probe_timeout_ms: u64,

    #[arg(
        long,
        default_value_t = 600,
        help = "Seconds an agent with no relay and no healthy probe is remembered"
    )]
    record_retention_secs: u64,

    #[arg(long, default_value_t = 30_000, help = "Direct HTTP call timeout in milliseconds")]
    direct_timeout_ms: u64,

    #[arg(long, default_value_t = 30_000, help = "Relay round-trip timeout in milliseconds")]
    relay_timeout_ms: u64,

    #[arg(long, default_value_t = 1024, help = "Maximum relayed requests in flight")]
    max_pending: usize,

    #[arg(long, default_value_t = 15, help = "Seconds between relay keep-alive pings")]
    relay_ping_secs: u64,

    #[arg(long, default_value_t = 45, help = "Seconds of relay silence before closing")]
    relay_idle_secs: u64,

    #[arg(
        long,
        default_value_t = 10,
        help = "Seconds a new relay socket has to announce its metadata"
    )]
    metadata_wait_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let path = cli
        .credentials
        .clone()
        .or_else(FileCredentialStore::default_path)
        .ok_or_else(|| anyhow!("no credentials file given and no config directory found"))?;
    let credentials = FileCredentialStore::load(&path)
        .with_context(|| format!("loading agent credentials from {}", path.display()))?;
    info!(path = %path.display(), agents = credentials.len(), "loaded agent credentials");

    let settings = settings_from(&cli);
    run(settings, Arc::new(credentials)).await
}

fn settings_from(cli: &Cli) -> Settings {
    Settings {
        listen: cli.listen,
        agent_host: cli.agent_host,
        status_ttl: Duration::from_millis(cli.status_ttl_ms),
        probe_interval: Duration::from_millis(cli.probe_interval_ms.max(1)),
        probe_timeout: Duration::from_millis(cli.probe_timeout_ms),
        record_retention: Duration::from_secs(cli.record_retention_secs),
        router: RouterSettings {
            direct_timeout: Duration::from_millis(cli.direct_timeout_ms),
            relay_timeout: Duration::from_millis(cli.relay_timeout_ms),
        },
        max_pending: cli.max_pending,
        relay_socket: RelaySocketSettings {
            metadata_wait: Duration::from_secs(cli.metadata_wait_secs),
            ping_interval: Duration::from_secs(cli.relay_ping_secs.max(1)),
            idle_timeout: Duration::from_secs(cli.relay_idle_secs.max(1)),
        },
    }
}
