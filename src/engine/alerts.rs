use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::gateway::ChatGateway;
use crate::models::ride::{RideId, RideRequest, RideStatus};
use crate::store::{RideStore, StoreError};

pub const DEFAULT_OVERDUE_AFTER: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertReport {
    pub new_rides: usize,
    pub canceled: usize,
    pub completed: usize,
    pub overdue: usize,
    pub failed: usize,
}

struct TrackedRide {
    ride: RideRequest,
    overdue_alerted: bool,
}

/// Posts chat alerts as rides are created, canceled, completed or left
/// waiting too long.
pub struct RideAlertMonitor {
    store: Arc<dyn RideStore>,
    chat: Arc<dyn ChatGateway>,
    overdue_after: chrono::Duration,
    tracked: HashMap<RideId, TrackedRide>,
    seen: HashMap<RideId, DateTime<Utc>>,
    last_poll: Option<DateTime<Utc>>,
}

impl RideAlertMonitor {
    pub fn new(
        store: Arc<dyn RideStore>,
        chat: Arc<dyn ChatGateway>,
        overdue_after: Duration,
    ) -> Self {
        Self {
            store,
            chat,
            overdue_after: chrono::Duration::from_std(overdue_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_OVERDUE_AFTER.as_secs() as i64)),
            tracked: HashMap::new(),
            seen: HashMap::new(),
            last_poll: None,
        }
    }

    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    /// One poll. The first call only seeds tracking with open rides from the
    /// last `overdue_after`; it never alerts. Every poll looks back
    /// `overdue_after` past the previous one, so rides that become visible
    /// late are still caught; ids already seen are never announced twice.
    /// A store error leaves the poll cursor untouched.
    pub async fn run_alert_cycle(&mut self, now: DateTime<Utc>) -> Result<AlertReport, StoreError> {
        let mut report = AlertReport::default();

        let seeding = self.last_poll.is_none();
        let since = self.last_poll.unwrap_or(now) - self.overdue_after;
        let created = self.store.rides_created_since(since).await?;

        let ids: Vec<RideId> = self
            .tracked
            .keys()
            .copied()
            .chain(created.iter().map(|ride| ride.id))
            .collect();
        let statuses: HashMap<RideId, RideStatus> = if seeding || ids.is_empty() {
            HashMap::new()
        } else {
            self.store.ride_statuses(&ids).await?.into_iter().collect()
        };

        for ride in created {
            if self.seen.insert(ride.id, ride.created_at).is_some() {
                continue;
            }
            if seeding {
                if !ride.status.is_terminal() {
                    self.track(ride);
                }
                continue;
            }

            if self.post(&new_ride_text(&ride)).await {
                report.new_rides += 1;
            } else {
                report.failed += 1;
            }
            self.track(ride);
        }

        if !seeding {
            self.check_tracked(&statuses, now, &mut report).await;
        }

        // Anything older than this poll's window can no longer be returned.
        self.seen.retain(|_, created_at| *created_at >= since);
        self.last_poll = Some(now);
        Ok(report)
    }

    fn track(&mut self, ride: RideRequest) {
        self.tracked.insert(
            ride.id,
            TrackedRide {
                ride,
                overdue_alerted: false,
            },
        );
    }

    async fn check_tracked(
        &mut self,
        statuses: &HashMap<RideId, RideStatus>,
        now: DateTime<Utc>,
        report: &mut AlertReport,
    ) {
        let mut ids: Vec<RideId> = self.tracked.keys().copied().collect();
        ids.sort_unstable();

        for ride_id in ids {
            let Some(status) = statuses.get(&ride_id).copied() else {
                warn!(ride_id, "tracked ride no longer found; dropping it");
                self.tracked.remove(&ride_id);
                continue;
            };

            match status {
                RideStatus::Canceled => {
                    if let Some(tracked) = self.tracked.remove(&ride_id) {
                        self.count(report, canceled_text(&tracked.ride), |r| &mut r.canceled)
                            .await;
                    }
                }
                RideStatus::Completed => {
                    if let Some(tracked) = self.tracked.remove(&ride_id) {
                        self.count(report, completed_text(&tracked.ride), |r| &mut r.completed)
                            .await;
                    }
                }
                RideStatus::Requested => {
                    let Some(tracked) = self.tracked.get_mut(&ride_id) else {
                        continue;
                    };
                    if tracked.overdue_alerted || now - tracked.ride.created_at <= self.overdue_after {
                        continue;
                    }
                    tracked.overdue_alerted = true;
                    let text = overdue_text(&tracked.ride, now);
                    self.count(report, text, |r| &mut r.overdue).await;
                }
                _ => {
                    if let Some(tracked) = self.tracked.get_mut(&ride_id) {
                        tracked.ride.status = status;
                    }
                }
            }
        }
    }

    async fn count(
        &self,
        report: &mut AlertReport,
        text: String,
        counter: impl FnOnce(&mut AlertReport) -> &mut usize,
    ) {
        if self.post(&text).await {
            *counter(report) += 1;
        } else {
            report.failed += 1;
        }
    }

    async fn post(&self, text: &str) -> bool {
        match self.chat.post_message(text).await {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "failed to post ride alert");
                false
            }
        }
    }
}

fn route(ride: &RideRequest) -> String {
    format!("{} -> {}", ride.pickup_address, ride.dropoff_address)
}

fn fare_suffix(ride: &RideRequest) -> String {
    ride.estimated_fare
        .map(|fare| format!(", fare {fare:.0}"))
        .unwrap_or_default()
}

fn new_ride_text(ride: &RideRequest) -> String {
    format!(
        "New ride #{} ({}): {}{}",
        ride.id,
        ride.vehicle_type,
        route(ride),
        fare_suffix(ride)
    )
}

fn canceled_text(ride: &RideRequest) -> String {
    format!("Ride #{} canceled: {}", ride.id, route(ride))
}

fn completed_text(ride: &RideRequest) -> String {
    format!("Ride #{} completed: {}{}", ride.id, route(ride), fare_suffix(ride))
}

fn overdue_text(ride: &RideRequest, now: DateTime<Utc>) -> String {
    format!(
        "Ride #{} still waiting for a driver after {} min: {}",
        ride.id,
        (now - ride.created_at).num_minutes(),
        route(ride)
    )
}

pub async fn run_alert_loop(
    mut monitor: RideAlertMonitor,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_secs = every.as_secs(), "ride alert loop started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match monitor.run_alert_cycle(Utc::now()).await {
                    Ok(report) if report != AlertReport::default() => {
                        info!(
                            new_rides = report.new_rides,
                            canceled = report.canceled,
                            completed = report.completed,
                            overdue = report.overdue,
                            failed = report.failed,
                            "ride alerts posted"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "ride alert poll failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("ride alert loop stopped");
}
