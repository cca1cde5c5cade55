// lib.rs - offline action queue and reconciliation core

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod capabilities;
pub mod connectivity;
pub mod dedupe;
pub mod dispatcher;
pub mod event;
pub mod model;
pub mod offline_store;
pub mod outbox;
pub mod reconcile;

pub use capabilities::Capabilities;
pub use connectivity::ConnectivityMonitor;
pub use dedupe::{stable_serialize, DedupeKey};
pub use dispatcher::{ActionDispatcher, DispatchError, QueueStatus, QueuedBecause, Submission};
pub use event::QueueEvent;
pub use model::{ActionLabel, UnixTimeMs};
pub use outbox::{
    ActionQueue, DeadLetter, DeadLetterReason, Enqueued, QueueConfig, QueueError, QueueItem,
    RetryOutcome,
};
pub use reconcile::{LatestResults, ReconciliationEngine, ResultsView, SyncReport, SyncSkipped};
