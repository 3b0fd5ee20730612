use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::geo::haversine_km;
use crate::models::driver::Driver;
use crate::models::matching::{Candidate, CandidateSummary, MatchKey, MatchRecord};
use crate::models::ride::{RequestedRide, RideId};
use crate::store::{DriverFilter, RideStore, StoreError};

pub const DEFAULT_MATCH_RADIUS_KM: f64 = 10.0;

#[derive(Debug, Clone, Default)]
pub struct MatchingOutcome {
    /// Existing and new matches on requested rides, busy drivers excluded.
    pub candidates: Vec<Candidate>,
    pub created: usize,
    pub already_matched: usize,
    pub skipped_rides: usize,
    pub skipped_drivers: usize,
}

impl MatchingOutcome {
    pub fn summary(&self) -> CandidateSummary {
        CandidateSummary::from_candidates(&self.candidates)
    }
}

pub struct MatchingEngine {
    store: Arc<dyn RideStore>,
    radius_km: f64,
}

impl MatchingEngine {
    pub fn new(store: Arc<dyn RideStore>, radius_km: f64) -> Self {
        Self { store, radius_km }
    }

    /// Creates a match record for every eligible (ride, driver) pair that does
    /// not have one yet. Any store failure aborts the whole cycle.
    pub async fn run_matching_cycle(&self) -> Result<MatchingOutcome, StoreError> {
        let rides = dedup_rides(self.store.requested_rides().await?);
        if rides.is_empty() {
            return Ok(MatchingOutcome::default());
        }

        let ride_ids: Vec<RideId> = rides.iter().map(|ride| ride.id).collect();
        let existing = self.store.existing_matches(&ride_ids).await?;
        let busy = self.store.busy_driver_ids().await?;
        let filter =
            DriverFilter::for_vehicle_types(rides.iter().map(|ride| ride.vehicle_type.clone()));
        let drivers = self.store.drivers(&filter).await?;

        let mut outcome = MatchingOutcome::default();
        let mut matched: HashSet<MatchKey> = HashSet::with_capacity(existing.len());

        for entry in existing {
            matched.insert(MatchKey {
                ride_id: entry.ride_id,
                driver_id: entry.driver_id,
            });
            if !busy.contains(&entry.driver_id) {
                outcome.candidates.push(Candidate {
                    ride_id: entry.ride_id,
                    driver_id: entry.driver_id,
                    phone_number: entry.phone_number,
                });
            }
        }

        for ride in &rides {
            let Some(pickup) = ride.pickup else {
                warn!(ride_id = ride.id, "requested ride has no usable pickup coordinate; skipping");
                outcome.skipped_rides += 1;
                continue;
            };

            let eligible: Vec<&Driver> = drivers
                .iter()
                .filter(|driver| {
                    driver.vehicle_type == ride.vehicle_type
                        && !busy.contains(&driver.id)
                        && !matched.contains(&MatchKey {
                            ride_id: ride.id,
                            driver_id: driver.id,
                        })
                })
                .collect();

            if eligible.is_empty() {
                continue;
            }

            let Some(detail) = self.store.ride_detail(ride.id).await? else {
                warn!(ride_id = ride.id, "requested ride has no detail row; skipping");
                outcome.skipped_rides += 1;
                continue;
            };

            for driver in eligible {
                let Some(location) = driver.location else {
                    warn!(
                        ride_id = ride.id,
                        driver_id = driver.id,
                        "driver has no usable coordinate; not matched"
                    );
                    outcome.skipped_drivers += 1;
                    continue;
                };

                let distance_km = haversine_km(&pickup, &location);
                let record = MatchRecord {
                    ride_id: ride.id,
                    driver_id: driver.id,
                    ride: detail.clone(),
                    driver_location: location,
                    device_id: driver.device_id,
                    distance_km,
                    within_radius: distance_km <= self.radius_km,
                    notified: false,
                    ride_status: detail.status,
                    created_at: Utc::now(),
                };

                match self.store.insert_match(&record).await {
                    Ok(()) => {
                        outcome.created += 1;
                        info!(
                            ride_id = ride.id,
                            driver_id = driver.id,
                            distance_km,
                            within_radius = record.within_radius,
                            "driver matched to ride"
                        );
                    }
                    Err(StoreError::DuplicateMatch { .. }) => {
                        outcome.already_matched += 1;
                        debug!(ride_id = ride.id, driver_id = driver.id, "pair already matched");
                    }
                    Err(err) => return Err(err),
                }

                matched.insert(record.key());
                outcome.candidates.push(Candidate {
                    ride_id: ride.id,
                    driver_id: driver.id,
                    phone_number: driver.phone_number.clone(),
                });
            }
        }

        Ok(outcome)
    }
}

/// The store may report one ride several times when its rows disagree; the
/// first occurrence wins.
fn dedup_rides(rides: Vec<RequestedRide>) -> Vec<RequestedRide> {
    let mut seen = HashSet::with_capacity(rides.len());
    rides.into_iter().filter(|ride| seen.insert(ride.id)).collect()
}
