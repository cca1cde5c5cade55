use tokio::sync::watch;
use tracing::info;

use crate::capabilities::ConnectivitySource;

/// Online/offline flag, seeded from the platform and then driven by its
/// notifications. The signal is trusted as given: no debounce, no probe.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initial: bool) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn from_source(source: &dyn ConnectivitySource) -> Self {
        Self::new(source.is_online())
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Apply a platform notification. Returns true when the state flipped;
    /// subscribers only hear about real transitions.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
