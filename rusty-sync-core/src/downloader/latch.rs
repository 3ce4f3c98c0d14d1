use std::time::Duration;

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Reusable wake-up signal for a scheduling loop.
///
/// A wake that arrives while nobody waits is remembered, so the next wait
/// returns immediately instead of sitting out its timeout.
#[derive(Debug, Default)]
pub struct WakeLatch {
    notify: Notify,
}

impl WakeLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Wait for a wake or the timeout; true if woken.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified()).await.is_ok()
    }
}
