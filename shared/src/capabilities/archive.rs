use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::model::UnixTimeMs;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    MrvEstimates,
    Recommendations,
}

impl ArchiveKind {
    /// Document collection the record lands in.
    pub const fn collection(self) -> &'static str {
        match self {
            Self::MrvEstimates => "mrv_estimates",
            Self::Recommendations => "recommendations",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRecord {
    pub kind: ArchiveKind,
    pub farmer_id: String,
    pub result: Value,
    pub created_at: UnixTimeMs,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("archive unavailable: {0}")]
    Unavailable(String),

    #[error("archive rejected record: {0}")]
    Rejected(String),

    #[error("result could not be encoded: {0}")]
    Encoding(String),
}

/// Cloud copy of completed results. Best-effort: callers log failures and
/// move on.
#[async_trait::async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn archive(&self, record: ArchiveRecord) -> Result<(), ArchiveError>;
}

/// Archive that accepts and drops everything, for builds without a cloud
/// backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledArchive;

#[async_trait::async_trait]
impl ArchiveStore for DisabledArchive {
    async fn archive(&self, record: ArchiveRecord) -> Result<(), ArchiveError> {
        debug!(collection = record.kind.collection(), "archive disabled, dropping record");
        Ok(())
    }
}
