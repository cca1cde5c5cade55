//! Sync passes: drain a snapshot of the queue against the estimation
//! service, one item at a time, in queue order.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    ArchiveError, ArchiveKind, ArchiveRecord, ArchiveStore, Capabilities, Clock,
    EstimationService, RemoteError,
};
use crate::connectivity::ConnectivityMonitor;
use crate::event::QueueEvent;
use crate::model::{
    ActionLabel, EstimateRequest, MrvEstimate, RecommendationRequest, RecommendationSet,
    UnixTimeMs,
};
use crate::outbox::{ActionQueue, DeadLetterReason, QueueItem, RetryOutcome};

// ============================================================================
// Latest results
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LatestResults {
    pub estimate: Option<MrvEstimate>,
    pub estimate_updated_at: Option<UnixTimeMs>,
    pub recommendations: Option<RecommendationSet>,
    pub recommendations_updated_at: Option<UnixTimeMs>,
}

/// Last known estimate and recommendation set, from direct submissions and
/// replays alike.
#[derive(Debug, Default)]
pub struct ResultsView {
    inner: RwLock<LatestResults>,
}

impl ResultsView {
    pub async fn snapshot(&self) -> LatestResults {
        self.inner.read().await.clone()
    }

    async fn set_estimate(&self, estimate: MrvEstimate, at: UnixTimeMs) {
        let mut inner = self.inner.write().await;
        inner.estimate = Some(estimate);
        inner.estimate_updated_at = Some(at);
    }

    async fn set_recommendations(&self, set: RecommendationSet, at: UnixTimeMs) {
        let mut inner = self.inner.write().await;
        inner.recommendations = Some(set);
        inner.recommendations_updated_at = Some(at);
    }
}

// ============================================================================
// Completed actions
// ============================================================================

#[derive(Clone, Debug)]
pub(crate) enum Completed {
    Estimate {
        farmer_id: String,
        result: MrvEstimate,
    },
    Recommend {
        farmer_id: String,
        result: RecommendationSet,
    },
}

impl Completed {
    pub(crate) fn label(&self) -> ActionLabel {
        match self {
            Self::Estimate { .. } => ActionLabel::Estimate,
            Self::Recommend { .. } => ActionLabel::Recommend,
        }
    }

    fn archive_record(&self, created_at: UnixTimeMs) -> Result<ArchiveRecord, ArchiveError> {
        let (kind, farmer_id, result) = match self {
            Self::Estimate { farmer_id, result } => (
                ArchiveKind::MrvEstimates,
                farmer_id,
                serde_json::to_value(result),
            ),
            Self::Recommend { farmer_id, result } => (
                ArchiveKind::Recommendations,
                farmer_id,
                serde_json::to_value(result),
            ),
        };
        Ok(ArchiveRecord {
            kind,
            farmer_id: farmer_id.clone(),
            result: result.map_err(|e| ArchiveError::Encoding(e.to_string()))?,
            created_at,
        })
    }
}

#[derive(Debug, Error)]
enum ReplayError {
    #[error("payload does not decode: {0}")]
    Undecodable(#[from] serde_json::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

// ============================================================================
// Sync report
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSkipped {
    Offline,
    Empty,
    InProgress,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub synced: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub still_pending: usize,
    pub archive_warnings: usize,
    /// Outcomes that could not be written; those items keep their previous
    /// durable state.
    pub storage_warnings: usize,
    pub skipped: Option<SyncSkipped>,
}

impl SyncReport {
    fn skipped(reason: SyncSkipped, still_pending: usize) -> Self {
        Self {
            still_pending,
            skipped: Some(reason),
            ..Self::default()
        }
    }

    pub fn ran(&self) -> bool {
        self.skipped.is_none()
    }
}

struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct ReconciliationEngine {
    queue: Arc<ActionQueue>,
    service: Arc<dyn EstimationService>,
    archive: Arc<dyn ArchiveStore>,
    clock: Arc<dyn Clock>,
    monitor: Arc<ConnectivityMonitor>,
    view: ResultsView,
    events: broadcast::Sender<QueueEvent>,
    in_progress: AtomicBool,
}

impl ReconciliationEngine {
    pub fn new(
        queue: Arc<ActionQueue>,
        caps: &Capabilities,
        monitor: Arc<ConnectivityMonitor>,
        events: broadcast::Sender<QueueEvent>,
    ) -> Self {
        Self {
            queue,
            service: caps.estimation.clone(),
            archive: caps.archive.clone(),
            clock: caps.clock.clone(),
            monitor,
            view: ResultsView::default(),
            events,
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn view(&self) -> &ResultsView {
        &self.view
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Run one pass over the items pending right now. Items queued while the
    /// pass runs wait for the next one, and items removed while it runs (by
    /// `clear`, for one) are not sent. A call made during a pass returns at
    /// once with `SyncSkipped::InProgress`.
    #[instrument(skip(self))]
    pub async fn sync(&self) -> SyncReport {
        if !self.monitor.is_online() {
            debug!("offline, sync skipped");
            return SyncReport::skipped(SyncSkipped::Offline, self.queue.pending_count().await);
        }

        let Some(_guard) = PassGuard::acquire(&self.in_progress) else {
            debug!("sync already running");
            return SyncReport::skipped(SyncSkipped::InProgress, self.queue.pending_count().await);
        };

        let snapshot = self.queue.list().await;
        if snapshot.is_empty() {
            return SyncReport::skipped(SyncSkipped::Empty, 0);
        }

        let mut report = SyncReport::default();
        for item in &snapshot {
            if !self.queue.contains(&item.id).await {
                debug!(id = %item.id, "action left the queue during the pass");
                continue;
            }
            self.replay_item(item, &mut report).await;
        }
        report.still_pending = self.queue.pending_count().await;

        info!(
            attempted = snapshot.len(),
            synced = report.synced,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            still_pending = report.still_pending,
            "sync pass finished"
        );
        let _ = self.events.send(QueueEvent::SyncFinished {
            synced: report.synced,
            still_pending: report.still_pending,
            dead_lettered: report.dead_lettered,
        });
        report
    }

    #[instrument(skip(self, item, report), fields(id = %item.id, label = %item.label))]
    async fn replay_item(&self, item: &QueueItem, report: &mut SyncReport) {
        match self.replay(item).await {
            Ok(completed) => {
                if !self.queue.contains(&item.id).await {
                    debug!("action was cleared while in flight, result dropped");
                    return;
                }
                if self.deliver(&completed).await.is_err() {
                    report.archive_warnings += 1;
                }
                match self.queue.dequeue(&item.id).await {
                    Ok(true) => {
                        info!("action synced");
                        report.synced += 1;
                    }
                    Ok(false) => debug!("action already removed"),
                    Err(e) => {
                        warn!(error = %e, "could not remove synced action, it will replay");
                        report.storage_warnings += 1;
                    }
                }
            }
            Err(ReplayError::Undecodable(e)) => {
                warn!(error = %e, "queued payload is undecodable");
                self.abandon(item, DeadLetterReason::Undecodable, report)
                    .await;
            }
            Err(ReplayError::Remote(e)) if !e.is_retryable() => {
                warn!(error = %e, "service rejected action");
                self.abandon(item, DeadLetterReason::NonRetryable, report)
                    .await;
            }
            Err(ReplayError::Remote(e)) => {
                debug!(error = %e, "replay failed, will retry");
                match self.queue.bump_retry(&item.id).await {
                    Ok(RetryOutcome::Retrying { .. }) => report.retried += 1,
                    Ok(RetryOutcome::DeadLettered { .. }) => report.dead_lettered += 1,
                    Ok(RetryOutcome::Missing) => {}
                    Err(e) => {
                        warn!(error = %e, "could not record retry");
                        report.storage_warnings += 1;
                    }
                }
            }
        }
    }

    async fn abandon(&self, item: &QueueItem, reason: DeadLetterReason, report: &mut SyncReport) {
        match self.queue.dead_letter(&item.id, reason).await {
            Ok(true) => report.dead_lettered += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "could not dead-letter action");
                report.storage_warnings += 1;
            }
        }
    }

    async fn replay(&self, item: &QueueItem) -> Result<Completed, ReplayError> {
        match item.label {
            ActionLabel::Estimate => {
                let request: EstimateRequest = serde_json::from_value(item.payload.clone())?;
                let result = self.service.estimate(&request).await?;
                Ok(Completed::Estimate {
                    farmer_id: request.profile.farmer_id,
                    result,
                })
            }
            ActionLabel::Recommend => {
                let request: RecommendationRequest =
                    serde_json::from_value(item.payload.clone())?;
                let result = self.service.recommend(&request).await?;
                Ok(Completed::Recommend {
                    farmer_id: request.profile.farmer_id,
                    result,
                })
            }
        }
    }

    /// Update the results view, then archive. An archive failure is logged,
    /// announced as `ArchiveDeferred` and returned; the result stays local.
    pub(crate) async fn deliver(&self, completed: &Completed) -> Result<(), ArchiveError> {
        let now = self.clock.now();
        match completed {
            Completed::Estimate { result, .. } => self.view.set_estimate(result.clone(), now).await,
            Completed::Recommend { result, .. } => {
                self.view.set_recommendations(result.clone(), now).await
            }
        }

        let outcome = match completed.archive_record(now) {
            Ok(record) => self.archive.archive(record).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            warn!(label = %completed.label(), error = %e, "archive failed, result kept locally");
            let _ = self.events.send(QueueEvent::ArchiveDeferred {
                label: completed.label(),
            });
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{
        FixedClock, RecordingArchive, ScriptedEstimationService, SequentialIds,
    };
    use crate::capabilities::{ErrorCategory, MemoryKvStore, StaticConnectivity};
    use crate::outbox::QueueConfig;
    use serde_json::{json, Value};

    struct Harness {
        service: Arc<ScriptedEstimationService>,
        archive: Arc<RecordingArchive>,
        monitor: Arc<ConnectivityMonitor>,
        queue: Arc<ActionQueue>,
        engine: Arc<ReconciliationEngine>,
        events: broadcast::Receiver<QueueEvent>,
    }

    async fn harness_with(service: ScriptedEstimationService, config: QueueConfig) -> Harness {
        let service = Arc::new(service);
        let archive = Arc::new(RecordingArchive::default());
        let caps = Capabilities::new(
            Arc::new(MemoryKvStore::new()),
            service.clone(),
            Arc::new(StaticConnectivity::new(true)),
        )
        .with_archive(archive.clone())
        .with_ids(Arc::new(SequentialIds::default()))
        .with_clock(Arc::new(FixedClock::new(10_000)));

        let queue = Arc::new(
            ActionQueue::open(caps.kv.clone(), caps.ids.clone(), caps.clock.clone(), config)
                .await
                .unwrap(),
        );
        let monitor = Arc::new(ConnectivityMonitor::from_source(caps.connectivity.as_ref()));
        let (tx, events) = broadcast::channel(32);
        let engine = Arc::new(ReconciliationEngine::new(
            queue.clone(),
            &caps,
            monitor.clone(),
            tx,
        ));

        Harness {
            service,
            archive,
            monitor,
            queue,
            engine,
            events,
        }
    }

    async fn harness() -> Harness {
        harness_with(ScriptedEstimationService::new(), QueueConfig::default()).await
    }

    fn profile(farmer: &str) -> Value {
        json!({
            "farmer_id": farmer,
            "state": "Maharashtra",
            "district": "Pune",
            "farm_size_hectares": 1.2,
            "crop": "wheat",
            "irrigation_type": "rainfed"
        })
    }

    fn estimate(farmer: &str) -> Value {
        json!({"profile": profile(farmer), "practices": ["cover_crop"]})
    }

    fn recommend(farmer: &str) -> Value {
        json!({"profile": profile(farmer), "objective": "water"})
    }

    fn farmers(calls: &[(ActionLabel, String)]) -> Vec<&str> {
        calls.iter().map(|(_, f)| f.as_str()).collect()
    }

    #[tokio::test]
    async fn offline_pass_is_skipped() {
        let h = harness().await;
        h.queue.enqueue(ActionLabel::Estimate, estimate("a")).await.unwrap();
        h.monitor.set_online(false);

        let report = h.engine.sync().await;
        assert_eq!(report.skipped, Some(SyncSkipped::Offline));
        assert_eq!(report.still_pending, 1);
        assert!(h.service.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_queue_is_skipped() {
        let h = harness().await;
        let report = h.engine.sync().await;
        assert_eq!(report.skipped, Some(SyncSkipped::Empty));
    }

    #[tokio::test]
    async fn replays_in_queue_order() {
        let h = harness().await;
        h.queue.enqueue(ActionLabel::Estimate, estimate("a")).await.unwrap();
        h.queue.enqueue(ActionLabel::Recommend, recommend("b")).await.unwrap();
        h.queue.enqueue(ActionLabel::Estimate, estimate("c")).await.unwrap();

        let report = h.engine.sync().await;

        assert_eq!(farmers(&h.service.calls()), vec!["a", "b", "c"]);
        assert_eq!(report.synced, 3);
        assert_eq!(report.still_pending, 0);
        assert_eq!(h.queue.pending_count().await, 0);

        let kinds: Vec<_> = h.archive.records().into_iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ArchiveKind::MrvEstimates,
                ArchiveKind::Recommendations,
                ArchiveKind::MrvEstimates
            ]
        );
    }

    #[tokio::test]
    async fn failed_item_does_not_block_the_rest() {
        let h = harness().await;
        h.service.fail_farmer("b", RemoteError::from_status(503, "down"));
        h.queue.enqueue(ActionLabel::Estimate, estimate("a")).await.unwrap();
        let b = h
            .queue
            .enqueue(ActionLabel::Estimate, estimate("b"))
            .await
            .unwrap()
            .into_item();
        h.queue.enqueue(ActionLabel::Estimate, estimate("c")).await.unwrap();

        let report = h.engine.sync().await;

        assert_eq!(farmers(&h.service.calls()), vec!["a", "b", "c"]);
        assert_eq!(report.synced, 2);
        assert_eq!(report.retried, 1);
        let left = h.queue.list().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, b.id);
        assert_eq!(left[0].retry_count, 1);
    }

    #[tokio::test]
    async fn retry_count_tracks_failed_passes() {
        let h = harness().await;
        h.service
            .fail_all(Some(RemoteError::new(ErrorCategory::NetworkError, "offline")));
        h.queue.enqueue(ActionLabel::Recommend, recommend("p1")).await.unwrap();

        for _ in 0..4 {
            h.engine.sync().await;
        }
        let items = h.queue.list().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].retry_count, 4);

        h.service.fail_all(None);
        let report = h.engine.sync().await;
        assert_eq!(report.synced, 1);
        assert_eq!(h.queue.pending_count().await, 0);
    }

    #[tokio::test]
    async fn rejected_item_is_dead_lettered_at_once() {
        let h = harness().await;
        h.service
            .fail_farmer("bad", RemoteError::from_status(422, "invalid farm size"));
        h.queue.enqueue(ActionLabel::Estimate, estimate("bad")).await.unwrap();

        let report = h.engine.sync().await;

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.retried, 0);
        assert_eq!(h.queue.pending_count().await, 0);
        let dead = h.queue.dead_letters().await;
        assert_eq!(dead[0].reason, DeadLetterReason::NonRetryable);
        assert_eq!(dead[0].item.retry_count, 0);
    }

    #[tokio::test]
    async fn retry_cap_dead_letters_during_sync() {
        let h = harness_with(
            ScriptedEstimationService::new(),
            QueueConfig {
                max_retries: Some(2),
                ..QueueConfig::default()
            },
        )
        .await;
        h.service.fail_all(Some(RemoteError::from_status(500, "boom")));
        h.queue.enqueue(ActionLabel::Estimate, estimate("a")).await.unwrap();

        assert_eq!(h.engine.sync().await.retried, 1);
        assert_eq!(h.engine.sync().await.dead_lettered, 1);
        assert_eq!(
            h.queue.dead_letters().await[0].reason,
            DeadLetterReason::MaxRetriesExceeded
        );
    }

    #[tokio::test]
    async fn undecodable_payload_is_dead_lettered_without_a_call() {
        let h = harness().await;
        h.queue
            .enqueue(ActionLabel::Estimate, json!({"farmer": "f1"}))
            .await
            .unwrap();

        let report = h.engine.sync().await;

        assert_eq!(report.dead_lettered, 1);
        assert!(h.service.calls().is_empty());
        assert_eq!(
            h.queue.dead_letters().await[0].reason,
            DeadLetterReason::Undecodable
        );
    }

    #[tokio::test]
    async fn archive_failure_still_dequeues() {
        let mut h = harness().await;
        h.archive.set_failing(true);
        h.queue.enqueue(ActionLabel::Estimate, estimate("a")).await.unwrap();

        let report = h.engine.sync().await;

        assert_eq!(report.synced, 1);
        assert_eq!(report.archive_warnings, 1);
        assert_eq!(h.archive.attempts(), 1);
        assert_eq!(h.queue.pending_count().await, 0);

        let view = h.engine.view().snapshot().await;
        assert!(view.estimate.is_some());
        assert_eq!(view.estimate_updated_at, Some(UnixTimeMs(10_000)));

        assert_eq!(
            h.events.recv().await.unwrap(),
            QueueEvent::ArchiveDeferred {
                label: ActionLabel::Estimate
            }
        );
        assert!(matches!(
            h.events.recv().await.unwrap(),
            QueueEvent::SyncFinished { synced: 1, .. }
        ));
    }

    #[tokio::test]
    async fn concurrent_sync_is_skipped() {
        let h = harness_with(ScriptedEstimationService::gated(), QueueConfig::default()).await;
        h.queue.enqueue(ActionLabel::Estimate, estimate("a")).await.unwrap();

        let engine = h.engine.clone();
        let first = tokio::spawn(async move { engine.sync().await });
        h.service.wait_entered().await;
        assert!(h.engine.is_syncing());

        let second = h.engine.sync().await;
        assert_eq!(second.skipped, Some(SyncSkipped::InProgress));

        h.service.release();
        let first = first.await.unwrap();
        assert_eq!(first.synced, 1);
        assert_eq!(h.service.calls().len(), 1);
        assert!(!h.engine.is_syncing());
    }

    #[tokio::test]
    async fn clear_during_pass_stops_remaining_replays() {
        let mut h = harness_with(ScriptedEstimationService::gated(), QueueConfig::default()).await;
        for farmer in ["a", "b", "c"] {
            h.queue.enqueue(ActionLabel::Estimate, estimate(farmer)).await.unwrap();
        }

        let engine = h.engine.clone();
        let pass = tokio::spawn(async move { engine.sync().await });
        h.service.wait_entered().await;
        h.queue.clear().await.unwrap();
        h.service.release();

        let report = pass.await.unwrap();
        assert_eq!(farmers(&h.service.calls()), vec!["a"]);
        assert_eq!(report.synced, 0);
        assert_eq!(report.still_pending, 0);
        assert_eq!(h.archive.attempts(), 0);
        assert!(h.engine.view().snapshot().await.estimate.is_none());
        assert!(matches!(
            h.events.recv().await.unwrap(),
            QueueEvent::SyncFinished { synced: 0, .. }
        ));
    }

    #[tokio::test]
    async fn items_queued_mid_pass_wait_for_next_pass() {
        let h = harness_with(ScriptedEstimationService::gated(), QueueConfig::default()).await;
        h.queue.enqueue(ActionLabel::Estimate, estimate("a")).await.unwrap();

        let engine = h.engine.clone();
        let pass = tokio::spawn(async move { engine.sync().await });
        h.service.wait_entered().await;
        h.queue.enqueue(ActionLabel::Estimate, estimate("late")).await.unwrap();
        h.service.release();

        let report = pass.await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.still_pending, 1);
        assert_eq!(farmers(&h.service.calls()), vec!["a"]);
    }
}
