use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::broadcast::registry::SweepReport;
use crate::state::AppState;

/// Runs one liveness sweep and keeps the session metrics in step.
pub fn liveness_tick(state: &AppState, inactivity: chrono::Duration) -> SweepReport {
    let report = state.sessions.sweep(Utc::now(), inactivity);

    state
        .metrics
        .sessions_evicted_total
        .inc_by(report.evicted.len() as u64);
    state.metrics.connected_sessions.set(state.sessions.len() as i64);

    if !report.evicted.is_empty() || report.pinged > 0 {
        debug!(
            evicted = report.evicted.len(),
            pinged = report.pinged,
            remaining = state.sessions.len(),
            "liveness sweep"
        );
    }

    report
}

pub async fn run_heartbeat_loop(
    state: Arc<AppState>,
    every: Duration,
    inactivity: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let inactivity = chrono::Duration::from_std(inactivity).unwrap_or(chrono::Duration::seconds(30));

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; a fresh session gets a full period.
    interval.tick().await;

    info!(interval_secs = every.as_secs(), "heartbeat loop started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                liveness_tick(&state, inactivity);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("heartbeat loop stopped");
}
