use std::sync::atomic::{AtomicBool, Ordering};

/// Platform reachability, read once to seed the monitor. Later changes are
/// pushed through `ConnectivityMonitor::set_online`.
pub trait ConnectivitySource: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Source whose answer the host sets directly.
#[derive(Debug)]
pub struct StaticConnectivity(AtomicBool);

impl StaticConnectivity {
    pub fn new(online: bool) -> Self {
        Self(AtomicBool::new(online))
    }

    pub fn set(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

impl ConnectivitySource for StaticConnectivity {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
