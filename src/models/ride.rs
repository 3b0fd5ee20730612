use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::driver::GeoPoint;

pub type RideId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Requested,
    Accepted,
    ArrivedAtPickup,
    InProgress,
    Completed,
    Canceled,
}

impl RideStatus {
    /// A driver holding a ride in one of these states is busy.
    pub fn is_engaged(self) -> bool {
        matches!(
            self,
            RideStatus::Accepted | RideStatus::ArrivedAtPickup | RideStatus::InProgress
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RideStatus::Requested => "requested",
            RideStatus::Accepted => "accepted",
            RideStatus::ArrivedAtPickup => "arrived_at_pickup",
            RideStatus::InProgress => "in_progress",
            RideStatus::Completed => "completed",
            RideStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RideStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(RideStatus::Requested),
            "accepted" => Ok(RideStatus::Accepted),
            "arrived_at_pickup" => Ok(RideStatus::ArrivedAtPickup),
            "in_progress" => Ok(RideStatus::InProgress),
            "completed" => Ok(RideStatus::Completed),
            "canceled" | "cancelled" => Ok(RideStatus::Canceled),
            other => Err(format!("unknown ride status: {other}")),
        }
    }
}

/// Full ride row as booked. Match records carry a copy of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideRequest {
    pub id: RideId,
    pub passenger_id: Option<i64>,
    pub vehicle_type: String,
    pub pickup: Option<GeoPoint>,
    pub pickup_address: String,
    pub dropoff: Option<GeoPoint>,
    pub dropoff_address: String,
    pub status: RideStatus,
    pub estimated_fare: Option<f64>,
    pub distance_km: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// The slice of a requested ride the matching engine needs to pick drivers.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestedRide {
    pub id: RideId,
    pub vehicle_type: String,
    pub pickup: Option<GeoPoint>,
}

impl From<&RideRequest> for RequestedRide {
    fn from(ride: &RideRequest) -> Self {
        Self {
            id: ride.id,
            vehicle_type: ride.vehicle_type.clone(),
            pickup: ride.pickup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RideStatus;

    #[test]
    fn engaged_statuses_mark_driver_busy() {
        assert!(RideStatus::Accepted.is_engaged());
        assert!(RideStatus::ArrivedAtPickup.is_engaged());
        assert!(RideStatus::InProgress.is_engaged());
        assert!(!RideStatus::Requested.is_engaged());
        assert!(!RideStatus::Completed.is_engaged());
        assert!(!RideStatus::Canceled.is_engaged());
    }

    #[test]
    fn status_text_matches_stored_values() {
        for status in [
            RideStatus::Requested,
            RideStatus::Accepted,
            RideStatus::ArrivedAtPickup,
            RideStatus::InProgress,
            RideStatus::Completed,
            RideStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<RideStatus>().unwrap(), status);
        }
        assert!("pending".parse::<RideStatus>().is_err());
    }
}
