use anyhow::Context;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tether_agentd::adapters::executor::ExecutorSettings;
use tether_agentd::app::relay::RelaySettings;
use tether_agentd::identity::{AgentIdentity, IdentityFile};
use tether_agentd::{run, Settings};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Tether local agent daemon", long_about = None)]
struct Cli {
    #[arg(
        long,
        env = "TETHER_IDENTITY",
        value_name = "PATH",
        help = "Identity file (defaults to <config dir>/tether/identity.json)"
    )]
    identity: Option<PathBuf>,

    #[arg(long, env = "TETHER_USER_ID", help = "Override the provisioned user id")]
    user_id: Option<String>,

    #[arg(
        long,
        env = "TETHER_SHARED_SECRET",
        hide_env_values = true,
        help = "Override the provisioned shared secret"
    )]
    shared_secret: Option<String>,

    #[arg(long, value_name = "PATH", help = "Home directory announced to the bridge")]
    home_directory: Option<PathBuf>,

    #[arg(long, env = "TETHER_HTTP_PORT", help = "Loopback port for the agent HTTP API")]
    http_port: Option<u16>,

    #[arg(
        long,
        default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST),
        help = "Listen address; must be a loopback address"
    )]
    listen_host: IpAddr,

    #[arg(long, env = "TETHER_RELAY_URL", help = "Relay WebSocket URL (ws:// or wss://)")]
    relay_url: Option<String>,

    #[arg(long, help = "Do not connect to the relay even if one is provisioned")]
    no_relay: bool,

    #[arg(long, default_value_t = 15, help = "Seconds between relay keep-alive pings")]
    keepalive_interval_secs: u64,

    #[arg(
        long,
        default_value_t = 45,
        help = "Seconds of relay silence before reconnecting"
    )]
    keepalive_timeout_secs: u64,

    #[arg(long, default_value_t = 60_000, help = "Default exec.run timeout in milliseconds")]
    exec_timeout_ms: u64,

    #[arg(
        long,
        default_value_t = 600_000,
        help = "Upper bound for per-request exec.run timeouts in milliseconds"
    )]
    exec_max_timeout_ms: u64,

    #[arg(long, default_value_t = 4, help = "Maximum concurrently running exec.run processes")]
    max_concurrent_exec: usize,

    #[arg(long, default_value_t = 1000, help = "Audit log capacity")]
    audit_capacity: usize,

    #[arg(long, default_value_t = 500, help = "Grace period after kill in milliseconds")]
    kill_grace_ms: u64,

    #[arg(
        long,
        env = "TETHER_OTLP_ENDPOINT",
        help = "OTLP endpoint for metrics (e.g., http://localhost:4318)"
    )]
    otlp_endpoint: Option<String>,
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

    let settings = settings_from(cli)?;
    run(settings).await
}

fn settings_from(cli: Cli) -> anyhow::Result<Settings> {
    let mut file = match &cli.identity {
        Some(path) => IdentityFile::load(path)?,
        None => match IdentityFile::default_path().filter(|path| path.exists()) {
            Some(path) => IdentityFile::load(&path)?,
            None => IdentityFile::default(),
        },
    };
    file.user_id = cli.user_id.or(file.user_id);
    file.shared_secret = cli.shared_secret.or(file.shared_secret);
    file.home_directory = cli.home_directory.or(file.home_directory);
    file.http_port = cli.http_port.or(file.http_port);
    let relay_url = cli.relay_url.or_else(|| file.relay_url.clone());

    let identity = AgentIdentity::from_file(&file).context("resolving agent identity")?;

    let mut settings = Settings::new(identity);
    settings.listen = SocketAddr::new(cli.listen_host, settings.identity.http_port());
    settings.relay = relay_url.filter(|_| !cli.no_relay).map(|url| {
        let mut relay = RelaySettings::new(url);
        relay.keepalive_interval = Duration::from_secs(cli.keepalive_interval_secs.max(1));
        relay.keepalive_timeout = Duration::from_secs(cli.keepalive_timeout_secs.max(1));
        relay
    });
    settings.executor = ExecutorSettings {
        default_exec_timeout: Duration::from_millis(cli.exec_timeout_ms),
        max_exec_timeout: Duration::from_millis(cli.exec_max_timeout_ms),
        ..ExecutorSettings::default()
    };
    settings.max_concurrent_exec = cli.max_concurrent_exec;
    settings.audit_capacity = cli.audit_capacity;
    settings.kill_grace = Duration::from_millis(cli.kill_grace_ms);
    settings.otlp_endpoint = cli.otlp_endpoint;
    Ok(settings)
}
