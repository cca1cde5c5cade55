use serde::{Deserialize, Serialize};

use crate::model::ActionLabel;

// --- Presentation events ---

/// What the presentation layer hears about through
/// `ActionDispatcher::subscribe`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    ConnectivityChanged {
        online: bool,
    },
    /// `duplicate` is set when an identical action was already pending.
    ActionQueued {
        label: ActionLabel,
        item_id: String,
        duplicate: bool,
    },
    ActionSubmitted {
        label: ActionLabel,
    },
    SyncFinished {
        synced: usize,
        still_pending: usize,
        dead_lettered: usize,
    },
    /// A result is available locally but its cloud copy failed.
    ArchiveDeferred {
        label: ActionLabel,
    },
}

// --- Status text ---

impl QueueEvent {
    /// One-line status shown to the farmer, if the event warrants one.
    pub fn status_message(&self) -> Option<&'static str> {
        match self {
            Self::ConnectivityChanged { .. } => None,
            Self::ActionQueued { label, .. } => Some(match label {
                ActionLabel::Estimate => "Network issue detected. Carbon request is queued.",
                ActionLabel::Recommend => {
                    "Network issue detected. Recommendation request is queued."
                }
            }),
            Self::ActionSubmitted { label } => Some(match label {
                ActionLabel::Estimate => "Carbon estimate updated successfully.",
                ActionLabel::Recommend => "Recommendations are ready.",
            }),
            Self::SyncFinished { .. } => Some("Pending actions synced."),
            Self::ArchiveDeferred { .. } => Some("Cloud sync pending. Local result is available."),
        }
    }
}
