mod archive;
mod connectivity;
mod http;
mod kv;

use std::sync::Arc;

use crate::model::UnixTimeMs;

pub use self::archive::{ArchiveError, ArchiveKind, ArchiveRecord, ArchiveStore, DisabledArchive};
pub use self::connectivity::{ConnectivitySource, StaticConnectivity};
pub use self::http::{
    ClientConfigError, ErrorCategory, EstimationClientConfig, EstimationService,
    HttpEstimationService, RemoteError,
};
#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::{FileKvStore, SqliteKvStore};
pub use self::kv::{
    KeyNamespace, KeyValueStore, KvError, KvKey, MemoryKvStore, StorageErrorCode,
};

/// Source of queue item ids.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Everything the queue core needs from the host platform.
#[derive(Clone)]
pub struct Capabilities {
    pub kv: Arc<dyn KeyValueStore>,
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
    pub estimation: Arc<dyn EstimationService>,
    pub archive: Arc<dyn ArchiveStore>,
    pub connectivity: Arc<dyn ConnectivitySource>,
}

impl Capabilities {
    /// System clock, UUID ids and no cloud archive.
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        estimation: Arc<dyn EstimationService>,
        connectivity: Arc<dyn ConnectivitySource>,
    ) -> Self {
        Self {
            kv,
            ids: Arc::new(UuidIdGenerator),
            clock: Arc::new(SystemClock),
            estimation,
            archive: Arc::new(DisabledArchive),
            connectivity,
        }
    }

    pub fn with_archive(mut self, archive: Arc<dyn ArchiveStore>) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
