//! MySQL-backed store over the booking schema (`driver_ride_location_logs`,
//! `drivers_users`, `devices`, `rides`).
//!
//! `driver_ride_location_logs` needs a unique index on `(ride_id, driver_id)`;
//! duplicate inserts surface as [`StoreError::DuplicateMatch`].

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::{FromRow, MySql, QueryBuilder};
use tracing::warn;

use crate::models::driver::{Driver, DriverId, DriverStatus, GeoPoint};
use crate::models::matching::{ExistingMatch, MatchRecord, PendingNotification};
use crate::models::ride::{RequestedRide, RideId, RideRequest, RideStatus};
use crate::store::{DriverFilter, RideStore, StoreError};

const ENGAGED_STATUSES: &str = "('accepted', 'arrived_at_pickup', 'in_progress')";

#[derive(Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct RequestedRideRow {
    ride_id: i64,
    vehicle_type: Option<String>,
    pickup_location: Option<String>,
}

#[derive(FromRow)]
struct RideRow {
    ride_id: i64,
    passenger_id: Option<i64>,
    vehicle_type: Option<String>,
    pickup_location: Option<String>,
    pickup_address: Option<String>,
    dropoff_location: Option<String>,
    dropoff_address: Option<String>,
    ride_status: String,
    estimated_fare: Option<f64>,
    distance_km: Option<f64>,
    created_at: NaiveDateTime,
}

impl RideRow {
    fn into_ride(self) -> Option<RideRequest> {
        let status = match self.ride_status.parse::<RideStatus>() {
            Ok(status) => status,
            Err(err) => {
                warn!(ride_id = self.ride_id, error = %err, "skipping ride with unknown status");
                return None;
            }
        };

        Some(RideRequest {
            id: self.ride_id,
            passenger_id: self.passenger_id,
            vehicle_type: self.vehicle_type.unwrap_or_default(),
            pickup: self.pickup_location.as_deref().and_then(GeoPoint::parse_pair),
            pickup_address: self.pickup_address.unwrap_or_default(),
            dropoff: self.dropoff_location.as_deref().and_then(GeoPoint::parse_pair),
            dropoff_address: self.dropoff_address.unwrap_or_default(),
            status,
            estimated_fare: self.estimated_fare,
            distance_km: self.distance_km,
            created_at: self.created_at.and_utc(),
        })
    }
}

#[derive(FromRow)]
struct DriverRow {
    driver_id: i64,
    phone_number: Option<String>,
    fcm_token: Option<String>,
    latitude: Option<String>,
    longitude: Option<String>,
    vehicle_type: String,
    device_id: Option<i64>,
    status: Option<String>,
    is_active: i64,
    is_delete: i64,
}

impl From<DriverRow> for Driver {
    fn from(row: DriverRow) -> Self {
        Driver {
            id: row.driver_id,
            phone_number: row.phone_number.unwrap_or_default(),
            push_token: row.fcm_token.filter(|token| !token.is_empty()),
            location: GeoPoint::from_parts(row.latitude.as_deref(), row.longitude.as_deref()),
            vehicle_type: row.vehicle_type,
            device_id: row.device_id,
            status: match row.status.as_deref() {
                Some("active") => DriverStatus::Active,
                _ => DriverStatus::Inactive,
            },
            is_active: row.is_active != 0,
            is_deleted: row.is_delete != 0,
        }
    }
}

#[derive(FromRow)]
struct ExistingMatchRow {
    ride_id: i64,
    driver_id: i64,
    phone_number: Option<String>,
}

#[derive(FromRow)]
struct PendingRow {
    ride_id: i64,
    driver_id: i64,
    fcm_token: Option<String>,
    pickup_address: Option<String>,
    dropoff_address: Option<String>,
}

#[derive(FromRow)]
struct StatusRow {
    ride_id: i64,
    status: String,
}

impl StatusRow {
    fn into_status(self) -> Option<(RideId, RideStatus)> {
        match self.status.parse::<RideStatus>() {
            Ok(status) => Some((self.ride_id, status)),
            Err(err) => {
                warn!(ride_id = self.ride_id, error = %err, "ignoring unknown ride status");
                None
            }
        }
    }
}

const RIDE_COLUMNS: &str = r#"
    CAST(ride_id AS SIGNED) AS ride_id,
    CAST(passenger_id AS SIGNED) AS passenger_id,
    vehicle_type,
    pickup_location,
    pickup_address,
    dropoff_location,
    dropoff_address,
    ride_status,
    CAST(estimated_fare AS DOUBLE) AS estimated_fare,
    CAST(distance_km AS DOUBLE) AS distance_km,
    created_at
"#;

#[async_trait]
impl RideStore for MySqlStore {
    async fn requested_rides(&self) -> Result<Vec<RequestedRide>, StoreError> {
        let rows = sqlx::query_as::<_, RequestedRideRow>(
            r#"
            SELECT DISTINCT CAST(ride_id AS SIGNED) AS ride_id, vehicle_type, pickup_location
            FROM driver_ride_location_logs
            WHERE ride_status = 'requested' AND is_delete = 0
            ORDER BY ride_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RequestedRide {
                id: row.ride_id,
                vehicle_type: row.vehicle_type.unwrap_or_default(),
                pickup: row.pickup_location.as_deref().and_then(GeoPoint::parse_pair),
            })
            .collect())
    }

    async fn ride_detail(&self, ride_id: RideId) -> Result<Option<RideRequest>, StoreError> {
        let sql = format!(
            "SELECT {RIDE_COLUMNS} FROM driver_ride_location_logs WHERE ride_id = ? ORDER BY created_at LIMIT 1"
        );
        let row = sqlx::query_as::<_, RideRow>(&sql)
            .bind(ride_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(RideRow::into_ride))
    }

    async fn drivers(&self, filter: &DriverFilter) -> Result<Vec<Driver>, StoreError> {
        if filter.vehicle_types.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<MySql>::new(
            r#"
            SELECT DISTINCT
                CAST(du.id AS SIGNED) AS driver_id,
                du.phone_number,
                du.fcm_token,
                CAST(du.latitude AS CHAR) AS latitude,
                CAST(du.longitude AS CHAR) AS longitude,
                d.name AS vehicle_type,
                CAST(du.device_id AS SIGNED) AS device_id,
                du.status,
                CAST(du.is_active AS SIGNED) AS is_active,
                CAST(du.is_delete AS SIGNED) AS is_delete
            FROM drivers_users du
            JOIN devices d ON du.device_id = d.id
            WHERE du.status = 'active' AND du.is_active = 1 AND du.is_delete = 0
              AND d.name IN (
            "#,
        );
        let mut separated = builder.separated(", ");
        for vehicle_type in &filter.vehicle_types {
            separated.push_bind(vehicle_type.as_str());
        }
        separated.push_unseparated(") ORDER BY driver_id");

        let rows = builder
            .build_query_as::<DriverRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Driver::from).collect())
    }

    async fn existing_matches(&self, ride_ids: &[RideId]) -> Result<Vec<ExistingMatch>, StoreError> {
        if ride_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<MySql>::new(
            r#"
            SELECT DISTINCT
                CAST(drll.ride_id AS SIGNED) AS ride_id,
                CAST(du.id AS SIGNED) AS driver_id,
                du.phone_number
            FROM driver_ride_location_logs drll
            JOIN drivers_users du ON du.id = drll.driver_id
            WHERE drll.ride_id IN (
            "#,
        );
        let mut separated = builder.separated(", ");
        for ride_id in ride_ids {
            separated.push_bind(*ride_id);
        }
        separated.push_unseparated(") ORDER BY ride_id, driver_id");

        let rows = builder
            .build_query_as::<ExistingMatchRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| ExistingMatch {
                ride_id: row.ride_id,
                driver_id: row.driver_id,
                phone_number: row.phone_number.unwrap_or_default(),
            })
            .collect())
    }

    async fn busy_driver_ids(&self) -> Result<HashSet<DriverId>, StoreError> {
        let sql = format!(
            "SELECT DISTINCT CAST(driver_id AS SIGNED) FROM driver_ride_location_logs \
             WHERE driver_id IS NOT NULL AND ride_status IN {ENGAGED_STATUSES}"
        );
        let ids = sqlx::query_scalar::<_, i64>(&sql).fetch_all(&self.pool).await?;
        Ok(ids.into_iter().collect())
    }

    async fn insert_match(&self, record: &MatchRecord) -> Result<(), StoreError> {
        let ride = &record.ride;
        let pickup = ride.pickup.map(|p| format!("{},{}", p.lat, p.lng));
        let dropoff = ride.dropoff.map(|p| format!("{},{}", p.lat, p.lng));

        let result = sqlx::query(
            r#"
            INSERT INTO driver_ride_location_logs
                (ride_id, passenger_id, driver_id, is_around_10km, pickup_location, pickup_address,
                 dropoff_location, dropoff_address, ride_status, distance_km, estimated_fare,
                 vehicle_type, latitude, longitude, device_id, fcm_sent, created_at, updated_at,
                 is_delete)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, 0)
            "#,
        )
        .bind(record.ride_id)
        .bind(ride.passenger_id)
        .bind(record.driver_id)
        .bind(record.within_radius)
        .bind(pickup)
        .bind(&ride.pickup_address)
        .bind(dropoff)
        .bind(&ride.dropoff_address)
        .bind(record.ride_status.as_str())
        .bind(ride.distance_km)
        .bind(ride.estimated_fare)
        .bind(&ride.vehicle_type)
        .bind(record.driver_location.lat)
        .bind(record.driver_location.lng)
        .bind(record.device_id)
        .bind(record.created_at.naive_utc())
        .bind(record.created_at.naive_utc())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::DuplicateMatch {
                    ride_id: record.ride_id,
                    driver_id: record.driver_id,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn pending_notifications(
        &self,
        window: Duration,
    ) -> Result<Vec<PendingNotification>, StoreError> {
        let sql = format!(
            r#"
            SELECT
                CAST(drll.ride_id AS SIGNED) AS ride_id,
                CAST(du.id AS SIGNED) AS driver_id,
                du.fcm_token,
                drll.pickup_address,
                drll.dropoff_address
            FROM driver_ride_location_logs drll
            JOIN drivers_users du ON du.id = drll.driver_id
            WHERE drll.ride_status = 'requested'
              AND drll.fcm_sent = 0
              AND drll.driver_id NOT IN (
                  SELECT driver_id FROM driver_ride_location_logs
                  WHERE driver_id IS NOT NULL AND ride_status IN {ENGAGED_STATUSES}
              )
              AND drll.created_at >= UTC_TIMESTAMP() - INTERVAL ? SECOND
            ORDER BY ride_id, driver_id
            "#
        );
        let rows = sqlx::query_as::<_, PendingRow>(&sql)
            .bind(window.as_secs() as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| PendingNotification {
                ride_id: row.ride_id,
                driver_id: row.driver_id,
                push_token: row.fcm_token.filter(|token| !token.is_empty()),
                pickup_address: row.pickup_address.unwrap_or_default(),
                dropoff_address: row.dropoff_address.unwrap_or_default(),
            })
            .collect())
    }

    async fn mark_notified(&self, ride_id: RideId, driver_id: DriverId) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE driver_ride_location_logs SET fcm_sent = 1 WHERE ride_id = ? AND driver_id = ?",
        )
        .bind(ride_id)
        .bind(driver_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_driver_token(&self, driver_id: DriverId) -> Result<(), StoreError> {
        sqlx::query("UPDATE drivers_users SET fcm_token = NULL WHERE id = ?")
            .bind(driver_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rides_created_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RideRequest>, StoreError> {
        let rows = sqlx::query_as::<_, RideRow>(
            r#"
            SELECT
                CAST(id AS SIGNED) AS ride_id,
                CAST(passenger_id AS SIGNED) AS passenger_id,
                vehicle_type,
                pickup_location,
                pickup_address,
                dropoff_location,
                dropoff_address,
                status AS ride_status,
                CAST(estimated_fare AS DOUBLE) AS estimated_fare,
                CAST(distance_km AS DOUBLE) AS distance_km,
                created_at
            FROM rides
            WHERE created_at >= ?
            ORDER BY ride_id
            "#,
        )
        .bind(since.naive_utc())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(RideRow::into_ride).collect())
    }

    async fn ride_statuses(
        &self,
        ride_ids: &[RideId],
    ) -> Result<Vec<(RideId, RideStatus)>, StoreError> {
        if ride_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<MySql>::new(
            "SELECT CAST(id AS SIGNED) AS ride_id, status FROM rides WHERE id IN (",
        );
        let mut separated = builder.separated(", ");
        for ride_id in ride_ids {
            separated.push_bind(*ride_id);
        }
        separated.push_unseparated(")");

        let rows = builder
            .build_query_as::<StatusRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().filter_map(StatusRow::into_status).collect())
    }
}
