//! Durable queue of actions waiting for the estimation service.
//!
//! The whole collection, pending items and dead letters, lives in one
//! storage slot. Every mutation stages the next collection, writes it while
//! the state lock is held, and only then swaps it into memory, so a failed
//! write leaves both sides at the previous state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{Clock, IdGenerator, KeyNamespace, KeyValueStore, KvError, KvKey};
use crate::dedupe::DedupeKey;
use crate::model::{ActionLabel, UnixTimeMs};
use crate::offline_store::{
    self, DeadLetterRecord, ItemRecord, StoreError, StoredQueue, MAX_STORED_RECORDS,
};

pub const DEFAULT_SLOT_KEY: &str = "offline_actions";
/// Appended to the slot key for the copy of a slot that failed to load.
pub const QUARANTINE_SUFFIX: &str = ".quarantine";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid queue config: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] KvError),

    #[error("queue snapshot could not be encoded: {0}")]
    Encode(#[from] StoreError),

    #[error("dead letter not found: {0}")]
    NotFound(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    MaxRetriesExceeded,
    NonRetryable,
    /// Payload no longer decodes into a request for its label.
    Undecodable,
    /// Pushed out by a newer action while the queue was full.
    Evicted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub label: ActionLabel,
    pub payload: Value,
    pub created_at: UnixTimeMs,
    pub retry_count: u32,
    pub dedupe_key: DedupeKey,
}

impl QueueItem {
    fn from_record(record: ItemRecord) -> Self {
        let dedupe_key = DedupeKey::derive(record.label, &record.payload);
        Self {
            id: record.id,
            label: record.label,
            payload: record.payload,
            created_at: record.created_at,
            retry_count: record.retry_count,
            dedupe_key,
        }
    }

    fn to_record(&self) -> ItemRecord {
        ItemRecord {
            id: self.id.clone(),
            label: self.label,
            payload: self.payload.clone(),
            created_at: self.created_at,
            retry_count: self.retry_count,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeadLetter {
    pub item: QueueItem,
    pub reason: DeadLetterReason,
    pub dead_at: UnixTimeMs,
}

/// Result of an enqueue. `Existing` means an identical action was already
/// pending and nothing was written.
#[derive(Clone, Debug, PartialEq)]
pub enum Enqueued {
    Created(QueueItem),
    Existing(QueueItem),
}

impl Enqueued {
    pub fn item(&self) -> &QueueItem {
        match self {
            Self::Created(item) | Self::Existing(item) => item,
        }
    }

    pub fn into_item(self) -> QueueItem {
        match self {
            Self::Created(item) | Self::Existing(item) => item,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Item was already gone, usually removed by a concurrent success.
    Missing,
    Retrying { retry_count: u32 },
    DeadLettered { retry_count: u32 },
}

/// Queue limits. Eviction counts items only: the encoded slot is also capped
/// at `offline_store::MAX_STORE_BYTES`, and an enqueue that would pass that
/// cap fails with `QueueError::Encode` and leaves the queue as it was.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_pending: usize,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub max_dead_letters: usize,
    pub slot_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: 10_000,
            max_retries: Some(25),
            max_dead_letters: 1_000,
            slot_key: DEFAULT_SLOT_KEY.to_string(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_pending == 0 {
            return Err(QueueError::Config("max_pending must be > 0".into()));
        }
        if self.max_retries == Some(0) {
            return Err(QueueError::Config("max_retries must be > 0 when set".into()));
        }
        let max_records = self.max_pending.saturating_add(self.max_dead_letters);
        if max_records > MAX_STORED_RECORDS {
            return Err(QueueError::Config(format!(
                "max_pending + max_dead_letters is {max_records}, the slot holds at most {MAX_STORED_RECORDS}"
            )));
        }
        self.slot()?;
        self.quarantine_slot()?;
        Ok(())
    }

    fn slot(&self) -> Result<KvKey, QueueError> {
        KvKey::new(KeyNamespace::Queue, self.slot_key.as_str())
            .map_err(|e| QueueError::Config(e.to_string()))
    }

    /// Where the bytes of a slot that failed to decode are kept.
    pub fn quarantine_slot(&self) -> Result<KvKey, QueueError> {
        KvKey::new(
            KeyNamespace::Cache,
            format!("{}{QUARANTINE_SUFFIX}", self.slot_key),
        )
        .map_err(|e| QueueError::Config(e.to_string()))
    }
}

#[derive(Clone, Debug, Default)]
struct QueueState {
    pending: Vec<QueueItem>,
    dead_letters: Vec<DeadLetter>,
}

impl QueueState {
    fn from_stored(stored: StoredQueue) -> (Self, usize) {
        let mut seen = HashSet::new();
        let mut dropped = 0;
        let mut pending = Vec::with_capacity(stored.pending.len());
        for record in stored.pending {
            let item = QueueItem::from_record(record);
            if seen.insert(item.dedupe_key.clone()) {
                pending.push(item);
            } else {
                dropped += 1;
            }
        }

        let dead_letters = stored
            .dead_letters
            .into_iter()
            .map(|record| DeadLetter {
                item: QueueItem::from_record(record.item),
                reason: record.reason,
                dead_at: record.dead_at,
            })
            .collect();

        (
            Self {
                pending,
                dead_letters,
            },
            dropped,
        )
    }

    fn to_stored(&self) -> StoredQueue {
        StoredQueue {
            pending: self.pending.iter().map(QueueItem::to_record).collect(),
            dead_letters: self
                .dead_letters
                .iter()
                .map(|dl| DeadLetterRecord {
                    item: dl.item.to_record(),
                    reason: dl.reason.clone(),
                    dead_at: dl.dead_at,
                })
                .collect(),
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.pending.iter().position(|item| item.id == id)
    }

    fn find_key(&self, key: &DedupeKey) -> Option<&QueueItem> {
        self.pending.iter().find(|item| &item.dedupe_key == key)
    }
}

pub struct ActionQueue {
    kv: Arc<dyn KeyValueStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    slot: KvKey,
    state: Mutex<QueueState>,
    load_warning: Option<String>,
}

impl ActionQueue {
    /// Load the queue from its slot. An unreadable or corrupted slot opens
    /// as an empty queue and records a load warning instead of failing.
    #[instrument(skip_all, fields(slot = %config.slot_key))]
    pub async fn open(
        kv: Arc<dyn KeyValueStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let slot = config.slot()?;

        let (state, load_warning) = match kv.get(&slot).await {
            Ok(None) => (QueueState::default(), None),
            Ok(Some(bytes)) => match offline_store::decode(&bytes) {
                Ok(stored) => {
                    let (state, dropped) = QueueState::from_stored(stored);
                    let warning = (dropped > 0).then(|| {
                        warn!(dropped, "dropped duplicate pending actions on load");
                        format!("{dropped} duplicate pending actions dropped")
                    });
                    (state, warning)
                }
                Err(e) => {
                    warn!(error = %e, "queue slot is corrupted, starting empty");
                    let warning = match Self::quarantine(kv.as_ref(), &config, bytes).await {
                        Ok(key) => format!("{e}; original kept at {}", key.raw()),
                        Err(q) => {
                            error!(error = %q, "could not quarantine corrupted slot");
                            e.to_string()
                        }
                    };
                    (QueueState::default(), Some(warning))
                }
            },
            Err(e) => {
                warn!(error = %e, "queue slot is unreadable, starting empty");
                (QueueState::default(), Some(e.to_string()))
            }
        };

        info!(
            pending = state.pending.len(),
            dead_letters = state.dead_letters.len(),
            "action queue loaded"
        );

        Ok(Self {
            kv,
            ids,
            clock,
            config,
            slot,
            state: Mutex::new(state),
            load_warning,
        })
    }

    async fn quarantine(
        kv: &dyn KeyValueStore,
        config: &QueueConfig,
        bytes: Vec<u8>,
    ) -> Result<KvKey, QueueError> {
        let key = config.quarantine_slot()?;
        kv.set(&key, bytes).await?;
        info!(key = %key.raw(), "corrupted queue slot quarantined");
        Ok(key)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Why the queue started empty or trimmed, if it did.
    pub fn load_warning(&self) -> Option<&str> {
        self.load_warning.as_deref()
    }

    async fn commit(&self, state: &mut QueueState, next: QueueState) -> Result<(), QueueError> {
        let bytes = offline_store::encode(&next.to_stored())?;
        self.kv.set(&self.slot, bytes).await?;
        *state = next;
        Ok(())
    }

    fn push_dead_letter(&self, next: &mut QueueState, item: QueueItem, reason: DeadLetterReason) {
        next.dead_letters.push(DeadLetter {
            item,
            reason,
            dead_at: self.clock.now(),
        });
        if next.dead_letters.len() > self.config.max_dead_letters {
            let overflow = next.dead_letters.len() - self.config.max_dead_letters;
            next.dead_letters.drain(..overflow);
        }
    }

    fn stage_new_item(
        &self,
        next: &mut QueueState,
        label: ActionLabel,
        payload: Value,
        dedupe_key: DedupeKey,
    ) -> QueueItem {
        while next.pending.len() >= self.config.max_pending {
            let oldest = next.pending.remove(0);
            warn!(id = %oldest.id, label = %oldest.label, "queue full, evicting oldest action");
            self.push_dead_letter(next, oldest, DeadLetterReason::Evicted);
        }

        let item = QueueItem {
            id: self.ids.next_id(),
            label,
            payload,
            created_at: self.clock.now(),
            retry_count: 0,
            dedupe_key,
        };
        next.pending.push(item.clone());
        item
    }

    #[instrument(skip(self, label, payload), fields(label = %label))]
    pub async fn enqueue(&self, label: ActionLabel, payload: Value) -> Result<Enqueued, QueueError> {
        let dedupe_key = DedupeKey::derive(label, &payload);
        let mut state = self.state.lock().await;

        if let Some(existing) = state.find_key(&dedupe_key) {
            debug!(id = %existing.id, "identical action already pending");
            return Ok(Enqueued::Existing(existing.clone()));
        }

        let mut next = state.clone();
        let item = self.stage_new_item(&mut next, label, payload, dedupe_key);

        if let Err(e) = self.commit(&mut state, next).await {
            error!(error = %e, "failed to persist queued action");
            return Err(e);
        }

        info!(id = %item.id, pending = state.pending.len(), "action queued");
        Ok(Enqueued::Created(item))
    }

    /// Record a failed replay. Reaching the retry cap moves the item to the
    /// dead-letter list in the same write.
    #[instrument(skip(self))]
    pub async fn bump_retry(&self, id: &str) -> Result<RetryOutcome, QueueError> {
        let mut state = self.state.lock().await;
        let Some(pos) = state.position(id) else {
            return Ok(RetryOutcome::Missing);
        };

        let mut next = state.clone();
        let retry_count = next.pending[pos].retry_count.saturating_add(1);
        next.pending[pos].retry_count = retry_count;

        let capped = self
            .config
            .max_retries
            .is_some_and(|cap| retry_count >= cap);
        if capped {
            let item = next.pending.remove(pos);
            self.push_dead_letter(&mut next, item, DeadLetterReason::MaxRetriesExceeded);
        }

        self.commit(&mut state, next).await?;

        if capped {
            warn!(retry_count, "retry cap reached, action dead-lettered");
            Ok(RetryOutcome::DeadLettered { retry_count })
        } else {
            Ok(RetryOutcome::Retrying { retry_count })
        }
    }

    #[instrument(skip(self))]
    pub async fn dead_letter(&self, id: &str, reason: DeadLetterReason) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let Some(pos) = state.position(id) else {
            return Ok(false);
        };

        let mut next = state.clone();
        let item = next.pending.remove(pos);
        self.push_dead_letter(&mut next, item, reason.clone());
        self.commit(&mut state, next).await?;

        warn!(?reason, "action dead-lettered");
        Ok(true)
    }

    #[instrument(skip(self))]
    pub async fn dequeue(&self, id: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let Some(pos) = state.position(id) else {
            return Ok(false);
        };

        let mut next = state.clone();
        next.pending.remove(pos);
        self.commit(&mut state, next).await?;
        Ok(true)
    }

    /// Drop every pending action and dead letter.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let cleared = state.pending.len();
        self.commit(&mut state, QueueState::default()).await?;
        info!(cleared, "action queue cleared");
        Ok(())
    }

    pub async fn list(&self) -> Vec<QueueItem> {
        self.state.lock().await.pending.clone()
    }

    /// Whether `id` is still pending.
    pub async fn contains(&self, id: &str) -> bool {
        self.state.lock().await.position(id).is_some()
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn retry_sum(&self) -> u64 {
        self.state
            .lock()
            .await
            .pending
            .iter()
            .map(|item| u64::from(item.retry_count))
            .sum()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Put a dead letter back in line as a fresh action. Dedupe applies: if
    /// an identical action is pending, the dead letter is just removed.
    #[instrument(skip(self))]
    pub async fn requeue_dead_letter(&self, id: &str) -> Result<Enqueued, QueueError> {
        let mut state = self.state.lock().await;
        let pos = state
            .dead_letters
            .iter()
            .position(|dl| dl.item.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        let mut next = state.clone();
        let dead = next.dead_letters.remove(pos).item;

        let outcome = match next.find_key(&dead.dedupe_key) {
            Some(existing) => Enqueued::Existing(existing.clone()),
            None => Enqueued::Created(self.stage_new_item(
                &mut next,
                dead.label,
                dead.payload,
                dead.dedupe_key,
            )),
        };

        self.commit(&mut state, next).await?;
        info!(new_id = %outcome.item().id, "dead letter requeued");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub async fn discard_dead_letter(&self, id: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let Some(pos) = state.dead_letters.iter().position(|dl| dl.item.id == id) else {
            return Ok(false);
        };

        let mut next = state.clone();
        next.dead_letters.remove(pos);
        self.commit(&mut state, next).await?;
        Ok(true)
    }
}
