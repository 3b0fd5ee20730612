use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::broadcast::protocol::ServerMessage;
use crate::engine::change::ChangeDetector;
use crate::engine::matching::{MatchingEngine, MatchingOutcome};
use crate::engine::notification::{DispatchReport, NotificationDispatcher};
use crate::state::AppState;
use crate::store::StoreError;

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub matching: MatchingOutcome,
    pub dispatch: DispatchReport,
    pub broadcast: bool,
}

/// Match, notify, then detect-and-broadcast, strictly in that order.
pub struct DispatchPipeline {
    state: Arc<AppState>,
    engine: MatchingEngine,
    dispatcher: NotificationDispatcher,
    detector: ChangeDetector,
}

impl DispatchPipeline {
    pub fn new(
        state: Arc<AppState>,
        engine: MatchingEngine,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        Self {
            state,
            engine,
            dispatcher,
            detector: ChangeDetector::new(),
        }
    }

    pub async fn run_cycle(&mut self) -> Result<CycleReport, StoreError> {
        let start = Instant::now();
        let result = self.execute().await;
        let elapsed = start.elapsed().as_secs_f64();

        let outcome = if result.is_ok() { "success" } else { "error" };
        self.state.metrics.dispatch_cycle_seconds.observe(elapsed);
        self.state
            .metrics
            .dispatch_cycles_total
            .with_label_values(&[outcome])
            .inc();

        result
    }

    async fn execute(&mut self) -> Result<CycleReport, StoreError> {
        let matching = self.engine.run_matching_cycle().await?;
        self.state.metrics.record_matching(&matching);

        let dispatch = self.dispatcher.dispatch_pending().await?;
        self.state.metrics.record_dispatch(&dispatch);

        let summary = matching.summary();
        self.state.publish_summary(summary.clone());

        let broadcast = match self.detector.observe(summary) {
            Some(changed) => {
                let drivers = changed.len();
                let receivers = self.state.broadcast(ServerMessage::status_updated(changed));
                self.state.metrics.broadcasts_total.inc();
                info!(drivers, receivers, "candidate drivers changed; update broadcast");
                true
            }
            None => false,
        };

        debug!(
            created = matching.created,
            candidates = matching.candidates.len(),
            sent = dispatch.sent,
            broadcast,
            "dispatch cycle finished"
        );

        Ok(CycleReport {
            matching,
            dispatch,
            broadcast,
        })
    }
}

/// Runs one cycle per tick until `shutdown` flips. A cycle still in flight
/// when its next tick comes due makes that tick be skipped.
pub async fn run_dispatch_loop(
    mut pipeline: DispatchPipeline,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_secs = every.as_secs(), "dispatch loop started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = pipeline.run_cycle().await {
                    error!(error = %err, "dispatch cycle aborted; retrying next interval");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::DispatchPipeline;
    use crate::broadcast::protocol::{ServerEvent, ServerMessage};
    use crate::engine::matching::{DEFAULT_MATCH_RADIUS_KM, MatchingEngine};
    use crate::engine::notification::{DEFAULT_NOTIFY_WINDOW, NotificationDispatcher};
    use crate::engine::testing::{FlakyStore, ScriptedPush};
    use crate::models::ride::RideStatus;
    use crate::state::AppState;
    use crate::store::MemoryStore;
    use crate::store::memory::fixtures::{driver, ride};

    fn pipeline(state: Arc<AppState>, store: Arc<FlakyStore>) -> DispatchPipeline {
        let push = Arc::new(ScriptedPush::new());
        DispatchPipeline::new(
            state,
            MatchingEngine::new(store.clone(), DEFAULT_MATCH_RADIUS_KM),
            NotificationDispatcher::new(store, push, DEFAULT_NOTIFY_WINDOW, "New ride request"),
        )
    }

    fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.upsert_ride(ride(42, "car", 10.0, 106.0));
        store.upsert_driver(driver(7, "car", 10.05, 106.05));
        store.upsert_driver(driver(9, "car", 10.9, 107.9));
        store
    }

    #[tokio::test]
    async fn broadcasts_only_when_summary_changes() {
        let inner = seeded();
        let state = Arc::new(AppState::new(16, 8));
        let mut rx = state.events_tx.subscribe();
        let mut pipeline = pipeline(state.clone(), Arc::new(FlakyStore::new(inner.clone())));

        let first = pipeline.run_cycle().await.unwrap();
        assert!(first.broadcast);
        let update = rx.try_recv().unwrap();
        assert_eq!(
            update,
            ServerMessage::status_updated(state.current_summary())
        );
        assert_eq!(state.current_summary().requested_drivers.len(), 2);

        let second = pipeline.run_cycle().await.unwrap();
        assert!(!second.broadcast);
        assert!(rx.try_recv().is_err());

        inner.set_match_status(42, 9, RideStatus::Accepted);
        let third = pipeline.run_cycle().await.unwrap();
        assert!(third.broadcast);
        match rx.try_recv().unwrap() {
            ServerMessage::Event(ServerEvent::DriverStatusUpdated { data }) => {
                assert_eq!(data.requested_drivers, vec!["0900000007".to_string()]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_cycle_keeps_previous_snapshot() {
        let inner = seeded();
        let store = Arc::new(FlakyStore::new(inner));
        let state = Arc::new(AppState::new(16, 8));
        let mut pipeline = pipeline(state.clone(), store.clone());

        pipeline.run_cycle().await.unwrap();
        let before = state.current_summary();

        store.fail_reads(true);
        assert!(pipeline.run_cycle().await.is_err());
        assert_eq!(state.current_summary(), before);

        store.fail_reads(false);
        let recovered = pipeline.run_cycle().await.unwrap();
        assert!(!recovered.broadcast);
    }
}
