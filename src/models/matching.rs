use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::driver::{DriverId, GeoPoint};
use crate::models::ride::{RideId, RideRequest, RideStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatchKey {
    pub ride_id: RideId,
    pub driver_id: DriverId,
}

/// "Driver X may see ride Y". `ride` is frozen at creation; `ride_status`
/// and `notified` are the only fields updated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    pub ride_id: RideId,
    pub driver_id: DriverId,
    pub ride: RideRequest,
    pub driver_location: GeoPoint,
    pub device_id: Option<i64>,
    pub distance_km: f64,
    pub within_radius: bool,
    pub notified: bool,
    pub ride_status: RideStatus,
    pub created_at: DateTime<Utc>,
}

impl MatchRecord {
    pub fn key(&self) -> MatchKey {
        MatchKey {
            ride_id: self.ride_id,
            driver_id: self.driver_id,
        }
    }
}

/// A stored match joined with the driver's phone number.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingMatch {
    pub ride_id: RideId,
    pub driver_id: DriverId,
    pub phone_number: String,
}

/// An unnotified match selected for push delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingNotification {
    pub ride_id: RideId,
    pub driver_id: DriverId,
    pub push_token: Option<String>,
    pub pickup_address: String,
    pub dropoff_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub ride_id: RideId,
    pub driver_id: DriverId,
    pub phone_number: String,
}

/// Sorted, deduplicated phone numbers of drivers currently offered a ride.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSummary {
    pub requested_drivers: Vec<String>,
}

impl CandidateSummary {
    pub fn from_candidates<'a>(candidates: impl IntoIterator<Item = &'a Candidate>) -> Self {
        let phones: BTreeSet<&str> = candidates
            .into_iter()
            .map(|candidate| candidate.phone_number.as_str())
            .filter(|phone| !phone.is_empty())
            .collect();

        Self {
            requested_drivers: phones.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.requested_drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requested_drivers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{Candidate, CandidateSummary};

    fn candidate(ride_id: i64, driver_id: i64, phone: &str) -> Candidate {
        Candidate {
            ride_id,
            driver_id,
            phone_number: phone.to_string(),
        }
    }

    #[test]
    fn summary_is_sorted_and_deduplicated() {
        let candidates = vec![
            candidate(1, 9, "0903"),
            candidate(1, 7, "0901"),
            candidate(2, 7, "0901"),
            candidate(2, 8, ""),
        ];

        let summary = CandidateSummary::from_candidates(&candidates);
        assert_eq!(summary.requested_drivers, vec!["0901", "0903"]);
    }

    #[test]
    fn summary_equality_ignores_input_order() {
        let a = [candidate(1, 7, "0901"), candidate(1, 9, "0903")];
        let b = [candidate(1, 9, "0903"), candidate(1, 7, "0901")];
        assert_eq!(
            CandidateSummary::from_candidates(&a),
            CandidateSummary::from_candidates(&b)
        );
    }
}
