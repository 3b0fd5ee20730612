//! Store gateway: every read and write the dispatch pipeline performs against
//! ride, driver and match records goes through [`RideStore`].

pub mod memory;
pub mod mysql;

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::driver::{Driver, DriverId};
use crate::models::matching::{ExistingMatch, MatchRecord, PendingNotification};
use crate::models::ride::{RequestedRide, RideId, RideRequest, RideStatus};

pub use memory::MemoryStore;
pub use mysql::MySqlStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ride {ride_id} is already matched to driver {driver_id}")]
    DuplicateMatch { ride_id: RideId, driver_id: DriverId },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Which drivers the matching engine wants to see. Activity flags are always
/// applied by the store.
#[derive(Debug, Clone, Default)]
pub struct DriverFilter {
    pub vehicle_types: BTreeSet<String>,
}

impl DriverFilter {
    pub fn for_vehicle_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            vehicle_types: types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn accepts(&self, driver: &Driver) -> bool {
        driver.is_dispatchable() && self.vehicle_types.contains(&driver.vehicle_type)
    }
}

#[async_trait]
pub trait RideStore: Send + Sync {
    /// Rides currently waiting for a driver.
    async fn requested_rides(&self) -> Result<Vec<RequestedRide>, StoreError>;

    /// The stored detail row used to snapshot a ride into match records.
    async fn ride_detail(&self, ride_id: RideId) -> Result<Option<RideRequest>, StoreError>;

    async fn drivers(&self, filter: &DriverFilter) -> Result<Vec<Driver>, StoreError>;

    async fn existing_matches(&self, ride_ids: &[RideId]) -> Result<Vec<ExistingMatch>, StoreError>;

    async fn busy_driver_ids(&self) -> Result<HashSet<DriverId>, StoreError>;

    /// Fails with [`StoreError::DuplicateMatch`] when the pair already exists.
    async fn insert_match(&self, record: &MatchRecord) -> Result<(), StoreError>;

    /// Unnotified matches on still-requested rides, for drivers that are not
    /// busy, created no earlier than `window` ago.
    async fn pending_notifications(
        &self,
        window: Duration,
    ) -> Result<Vec<PendingNotification>, StoreError>;

    async fn mark_notified(&self, ride_id: RideId, driver_id: DriverId) -> Result<(), StoreError>;

    async fn clear_driver_token(&self, driver_id: DriverId) -> Result<(), StoreError>;

    async fn rides_created_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RideRequest>, StoreError>;

    async fn ride_statuses(
        &self,
        ride_ids: &[RideId],
    ) -> Result<Vec<(RideId, RideStatus)>, StoreError>;
}
