use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::models::driver::{Driver, DriverId};
use crate::models::matching::{ExistingMatch, MatchKey, MatchRecord, PendingNotification};
use crate::models::ride::{RequestedRide, RideId, RideRequest, RideStatus};
use crate::store::{DriverFilter, RideStore, StoreError};

/// Process-local store. The `(ride, driver)` key of `matches` is the
/// uniqueness constraint.
#[derive(Default)]
pub struct MemoryStore {
    rides: DashMap<RideId, RideRequest>,
    drivers: DashMap<DriverId, Driver>,
    matches: DashMap<MatchKey, MatchRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_ride(&self, ride: RideRequest) {
        self.rides.insert(ride.id, ride);
    }

    pub fn upsert_driver(&self, driver: Driver) {
        self.drivers.insert(driver.id, driver);
    }

    /// Moves a ride and every match record for it to `status`.
    pub fn set_ride_status(&self, ride_id: RideId, status: RideStatus) {
        if let Some(mut ride) = self.rides.get_mut(&ride_id) {
            ride.status = status;
        }
        self.matches
            .iter_mut()
            .filter(|entry| entry.key().ride_id == ride_id)
            .for_each(|mut entry| entry.ride_status = status);
    }

    /// Moves a single match record, e.g. when that driver accepts the ride.
    pub fn set_match_status(&self, ride_id: RideId, driver_id: DriverId, status: RideStatus) {
        if let Some(mut record) = self.matches.get_mut(&MatchKey { ride_id, driver_id }) {
            record.ride_status = status;
        }
    }

    pub fn set_driver_token(&self, driver_id: DriverId, token: Option<String>) {
        if let Some(mut driver) = self.drivers.get_mut(&driver_id) {
            driver.push_token = token;
        }
    }

    pub fn driver(&self, driver_id: DriverId) -> Option<Driver> {
        self.drivers.get(&driver_id).map(|entry| entry.value().clone())
    }

    pub fn match_record(&self, ride_id: RideId, driver_id: DriverId) -> Option<MatchRecord> {
        self.matches
            .get(&MatchKey { ride_id, driver_id })
            .map(|entry| entry.value().clone())
    }

    pub fn match_count(&self) -> usize {
        self.matches.len()
    }

    fn busy_set(&self) -> HashSet<DriverId> {
        self.matches
            .iter()
            .filter(|entry| entry.ride_status.is_engaged())
            .map(|entry| entry.driver_id)
            .collect()
    }
}

#[async_trait]
impl RideStore for MemoryStore {
    async fn requested_rides(&self) -> Result<Vec<RequestedRide>, StoreError> {
        let mut rides: Vec<RequestedRide> = self
            .rides
            .iter()
            .filter(|entry| entry.status == RideStatus::Requested)
            .map(|entry| RequestedRide::from(entry.value()))
            .collect();
        rides.sort_by_key(|ride| ride.id);
        Ok(rides)
    }

    async fn ride_detail(&self, ride_id: RideId) -> Result<Option<RideRequest>, StoreError> {
        Ok(self.rides.get(&ride_id).map(|entry| entry.value().clone()))
    }

    async fn drivers(&self, filter: &DriverFilter) -> Result<Vec<Driver>, StoreError> {
        let mut drivers: Vec<Driver> = self
            .drivers
            .iter()
            .filter(|entry| filter.accepts(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        drivers.sort_by_key(|driver| driver.id);
        Ok(drivers)
    }

    async fn existing_matches(&self, ride_ids: &[RideId]) -> Result<Vec<ExistingMatch>, StoreError> {
        let mut existing: Vec<ExistingMatch> = self
            .matches
            .iter()
            .filter(|entry| ride_ids.contains(&entry.key().ride_id))
            .map(|entry| ExistingMatch {
                ride_id: entry.ride_id,
                driver_id: entry.driver_id,
                phone_number: self
                    .drivers
                    .get(&entry.driver_id)
                    .map(|driver| driver.phone_number.clone())
                    .unwrap_or_default(),
            })
            .collect();
        existing.sort_by_key(|m| (m.ride_id, m.driver_id));
        Ok(existing)
    }

    async fn busy_driver_ids(&self) -> Result<HashSet<DriverId>, StoreError> {
        Ok(self.busy_set())
    }

    async fn insert_match(&self, record: &MatchRecord) -> Result<(), StoreError> {
        match self.matches.entry(record.key()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateMatch {
                ride_id: record.ride_id,
                driver_id: record.driver_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn pending_notifications(
        &self,
        window: Duration,
    ) -> Result<Vec<PendingNotification>, StoreError> {
        let window = chrono::Duration::from_std(window)
            .map_err(|err| StoreError::Backend(format!("invalid notification window: {err}")))?;
        let cutoff = Utc::now() - window;
        let busy = self.busy_set();

        let mut pending: Vec<PendingNotification> = self
            .matches
            .iter()
            .filter(|entry| {
                !entry.notified
                    && entry.ride_status == RideStatus::Requested
                    && !busy.contains(&entry.driver_id)
                    && entry.created_at >= cutoff
            })
            .map(|entry| PendingNotification {
                ride_id: entry.ride_id,
                driver_id: entry.driver_id,
                push_token: self
                    .drivers
                    .get(&entry.driver_id)
                    .and_then(|driver| driver.push_token.clone()),
                pickup_address: entry.ride.pickup_address.clone(),
                dropoff_address: entry.ride.dropoff_address.clone(),
            })
            .collect();
        pending.sort_by_key(|p| (p.ride_id, p.driver_id));
        Ok(pending)
    }

    async fn mark_notified(&self, ride_id: RideId, driver_id: DriverId) -> Result<(), StoreError> {
        if let Some(mut record) = self.matches.get_mut(&MatchKey { ride_id, driver_id }) {
            record.notified = true;
        }
        Ok(())
    }

    async fn clear_driver_token(&self, driver_id: DriverId) -> Result<(), StoreError> {
        self.set_driver_token(driver_id, None);
        Ok(())
    }

    async fn rides_created_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RideRequest>, StoreError> {
        let mut rides: Vec<RideRequest> = self
            .rides
            .iter()
            .filter(|entry| entry.created_at >= since)
            .map(|entry| entry.value().clone())
            .collect();
        rides.sort_by_key(|ride| ride.id);
        Ok(rides)
    }

    async fn ride_statuses(
        &self,
        ride_ids: &[RideId],
    ) -> Result<Vec<(RideId, RideStatus)>, StoreError> {
        Ok(ride_ids
            .iter()
            .filter_map(|id| self.rides.get(id).map(|ride| (*id, ride.status)))
            .collect())
    }
}


#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::fixtures::{driver, ride};
    use super::MemoryStore;
    use crate::models::driver::{DriverStatus, GeoPoint};
    use crate::models::matching::MatchRecord;
    use crate::models::ride::RideStatus;
    use crate::store::{DriverFilter, RideStore, StoreError};

    fn record(ride_id: i64, driver_id: i64) -> MatchRecord {
        MatchRecord {
            ride_id,
            driver_id,
            ride: ride(ride_id, "car", 10.0, 106.0),
            driver_location: GeoPoint {
                lat: 10.0,
                lng: 106.0,
            },
            device_id: None,
            distance_km: 0.0,
            within_radius: true,
            notified: false,
            ride_status: RideStatus::Requested,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = MemoryStore::new();
        store.insert_match(&record(1, 2)).await.unwrap();

        let err = store.insert_match(&record(1, 2)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::DuplicateMatch {
                ride_id: 1,
                driver_id: 2
            }
        ));
        assert_eq!(store.match_count(), 1);
    }

    #[tokio::test]
    async fn driver_filter_applies_activity_flags() {
        let store = MemoryStore::new();
        store.upsert_driver(driver(1, "car", 10.0, 106.0));

        let mut deleted = driver(2, "car", 10.0, 106.0);
        deleted.is_deleted = true;
        store.upsert_driver(deleted);

        let mut inactive = driver(3, "car", 10.0, 106.0);
        inactive.status = DriverStatus::Inactive;
        store.upsert_driver(inactive);

        store.upsert_driver(driver(4, "bike", 10.0, 106.0));

        let drivers = store
            .drivers(&DriverFilter::for_vehicle_types(["car"]))
            .await
            .unwrap();
        let ids: Vec<i64> = drivers.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn busy_drivers_come_from_engaged_matches() {
        let store = MemoryStore::new();
        store.insert_match(&record(1, 7)).await.unwrap();
        store.insert_match(&record(1, 9)).await.unwrap();
        store.set_match_status(1, 7, RideStatus::Accepted);

        let busy = store.busy_driver_ids().await.unwrap();
        assert!(busy.contains(&7));
        assert!(!busy.contains(&9));
    }
}
