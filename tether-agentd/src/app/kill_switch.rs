use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// One-way switch into the shutting-down state.
///
/// `is_engaged` is the cheap check every operation makes first; subscribers
/// (the relay client, the server's shutdown future) are woken through a
/// watch channel.
#[derive(Clone)]
pub struct KillSwitch {
    inner: Arc<KillState>,
}

struct KillState {
    engaged: AtomicBool,
    notify: watch::Sender<bool>,
}

impl KillSwitch {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            inner: Arc::new(KillState {
                engaged: AtomicBool::new(false),
                notify,
            }),
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.inner.engaged.load(Ordering::SeqCst)
    }

    /// Returns true for the call that actually flipped the switch.
    pub fn engage(&self) -> bool {
        if self.inner.engaged.swap(true, Ordering::SeqCst) {
            return false;
        }
        warn!("kill switch engaged");
        self.inner.notify.send_replace(true);
        true
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.notify.subscribe()
    }

    /// Resolves once the switch has been engaged.
    pub async fn engaged(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|engaged| *engaged).await;
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}
