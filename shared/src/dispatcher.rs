//! Boundary used by the presentation layer: try the call, queue on failure,
//! trigger syncs, read queue state.

use serde::Serialize;
use serde_json::Value;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{Capabilities, EstimationService};
use crate::connectivity::ConnectivityMonitor;
use crate::event::QueueEvent;
use crate::model::{
    ActionLabel, EstimateRequest, MrvEstimate, RecommendationRequest, RecommendationSet,
};
use crate::outbox::{ActionQueue, DeadLetter, Enqueued, QueueConfig, QueueError, QueueItem};
use crate::reconcile::{Completed, LatestResults, ReconciliationEngine, SyncReport};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("action could not be saved: {0}")]
    Queue(#[from] QueueError),

    #[error("payload could not be encoded: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueuedBecause {
    Offline,
    CallFailed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Submission<T> {
    Completed(T),
    /// Saved for the next sync. `duplicate` means an identical action was
    /// already waiting.
    Queued {
        item: QueueItem,
        duplicate: bool,
        because: QueuedBecause,
    },
}

impl<T> Submission<T> {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub online: bool,
    pub pending: usize,
    pub retry_sum: u64,
    pub dead_letters: usize,
    pub syncing: bool,
    pub load_warning: Option<String>,
}

pub struct ActionDispatcher {
    queue: Arc<ActionQueue>,
    engine: Arc<ReconciliationEngine>,
    monitor: Arc<ConnectivityMonitor>,
    service: Arc<dyn EstimationService>,
    events: broadcast::Sender<QueueEvent>,
}

impl ActionDispatcher {
    #[instrument(skip_all)]
    pub async fn open(caps: Capabilities, config: QueueConfig) -> Result<Self, DispatchError> {
        let queue = Arc::new(
            ActionQueue::open(caps.kv.clone(), caps.ids.clone(), caps.clock.clone(), config)
                .await?,
        );
        let monitor = Arc::new(ConnectivityMonitor::from_source(caps.connectivity.as_ref()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let engine = Arc::new(ReconciliationEngine::new(
            queue.clone(),
            &caps,
            monitor.clone(),
            events.clone(),
        ));

        Ok(Self {
            queue,
            engine,
            monitor,
            service: caps.estimation,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Try `remote_call` right away. On success the queue is untouched; on
    /// failure the action is queued and reported as such.
    #[instrument(skip(self, label, payload, remote_call), fields(label = %label))]
    pub async fn submit_or_queue<T, E, F, Fut>(
        &self,
        label: ActionLabel,
        payload: Value,
        remote_call: F,
    ) -> Result<Submission<T>, DispatchError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        match remote_call(payload.clone()).await {
            Ok(result) => {
                self.emit(QueueEvent::ActionSubmitted { label });
                Ok(Submission::Completed(result))
            }
            Err(e) => {
                warn!(error = %e, "direct call failed, queueing action");
                self.queue_action(label, payload, QueuedBecause::CallFailed(e.to_string()))
                    .await
            }
        }
    }

    async fn queue_action<T>(
        &self,
        label: ActionLabel,
        payload: Value,
        because: QueuedBecause,
    ) -> Result<Submission<T>, DispatchError> {
        let enqueued = self.queue.enqueue(label, payload).await?;
        let duplicate = !enqueued.is_new();
        let item = enqueued.into_item();

        self.emit(QueueEvent::ActionQueued {
            label,
            item_id: item.id.clone(),
            duplicate,
        });
        Ok(Submission::Queued {
            item,
            duplicate,
            because,
        })
    }

    /// Request a carbon estimate. Offline, the request is queued without
    /// trying the service.
    pub async fn submit_estimate(
        &self,
        request: EstimateRequest,
    ) -> Result<Submission<MrvEstimate>, DispatchError> {
        let payload = serde_json::to_value(&request)?;
        if !self.monitor.is_online() {
            return self
                .queue_action(ActionLabel::Estimate, payload, QueuedBecause::Offline)
                .await;
        }

        let submission = self
            .submit_or_queue(ActionLabel::Estimate, payload, |_| {
                self.service.estimate(&request)
            })
            .await?;

        if let Submission::Completed(result) = &submission {
            let _ = self
                .engine
                .deliver(&Completed::Estimate {
                    farmer_id: request.profile.farmer_id.clone(),
                    result: result.clone(),
                })
                .await;
        }
        Ok(submission)
    }

    pub async fn submit_recommendation(
        &self,
        request: RecommendationRequest,
    ) -> Result<Submission<RecommendationSet>, DispatchError> {
        let payload = serde_json::to_value(&request)?;
        if !self.monitor.is_online() {
            return self
                .queue_action(ActionLabel::Recommend, payload, QueuedBecause::Offline)
                .await;
        }

        let submission = self
            .submit_or_queue(ActionLabel::Recommend, payload, |_| {
                self.service.recommend(&request)
            })
            .await?;

        if let Submission::Completed(result) = &submission {
            let _ = self
                .engine
                .deliver(&Completed::Recommend {
                    farmer_id: request.profile.farmer_id.clone(),
                    result: result.clone(),
                })
                .await;
        }
        Ok(submission)
    }

    pub async fn request_sync(&self) -> SyncReport {
        self.engine.sync().await
    }

    pub async fn list(&self) -> Vec<QueueItem> {
        self.queue.list().await
    }

    pub async fn clear(&self) -> Result<(), DispatchError> {
        Ok(self.queue.clear().await?)
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.queue.dead_letters().await
    }

    pub async fn requeue_dead_letter(&self, id: &str) -> Result<Enqueued, DispatchError> {
        Ok(self.queue.requeue_dead_letter(id).await?)
    }

    pub async fn discard_dead_letter(&self, id: &str) -> Result<bool, DispatchError> {
        Ok(self.queue.discard_dead_letter(id).await?)
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Feed a platform online/offline notification.
    pub fn set_online(&self, online: bool) {
        if self.monitor.set_online(online) {
            self.emit(QueueEvent::ConnectivityChanged { online });
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.pending_count().await
    }

    pub async fn retry_sum(&self) -> u64 {
        self.queue.retry_sum().await
    }

    pub async fn latest_results(&self) -> LatestResults {
        self.engine.view().snapshot().await
    }

    pub async fn status(&self) -> QueueStatus {
        QueueStatus {
            online: self.monitor.is_online(),
            pending: self.queue.pending_count().await,
            retry_sum: self.queue.retry_sum().await,
            dead_letters: self.queue.dead_letters().await.len(),
            syncing: self.engine.is_syncing(),
            load_warning: self.queue.load_warning().map(str::to_owned),
        }
    }

    /// Spawn a task that runs a sync on every offline to online transition.
    /// It runs until aborted. Must be called inside a tokio runtime.
    /// The baseline is the state at the time of this call, so a transition
    /// made before the task is first polled still triggers a sync.
    pub fn spawn_reconnect_sync(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.monitor.subscribe();
        let was_online = *rx.borrow_and_update();
        let this = Arc::clone(self);
        tokio::spawn(async move { this.reconnect_loop(rx, was_online).await })
    }

    async fn reconnect_loop(&self, mut rx: watch::Receiver<bool>, mut was_online: bool) {
        while rx.changed().await.is_ok() {
            let online = *rx.borrow_and_update();
            if online && !was_online {
                info!("back online, syncing queued actions");
                let report = self.request_sync().await;
                debug!(?report, "reconnect sync done");
            }
            was_online = online;
        }
    }
}
