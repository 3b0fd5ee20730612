use serde::{Deserialize, Serialize};

pub type DriverId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// Returns `None` for non-finite or out-of-range coordinates.
    pub fn new(lat: f64, lng: f64) -> Option<Self> {
        let valid = lat.is_finite()
            && lng.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lng);

        valid.then_some(Self { lat, lng })
    }

    /// Parses the `"lat,lng"` form used by stored pickup/dropoff locations.
    pub fn parse_pair(raw: &str) -> Option<Self> {
        let (lat, lng) = raw.split_once(',')?;
        Self::new(lat.trim().parse().ok()?, lng.trim().parse().ok()?)
    }

    pub fn from_parts(lat: Option<&str>, lng: Option<&str>) -> Option<Self> {
        Self::new(lat?.trim().parse().ok()?, lng?.trim().parse().ok()?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: DriverId,
    pub phone_number: String,
    pub push_token: Option<String>,
    pub location: Option<GeoPoint>,
    pub vehicle_type: String,
    pub device_id: Option<i64>,
    pub status: DriverStatus,
    pub is_active: bool,
    pub is_deleted: bool,
}

impl Driver {
    /// Activity flags allow the driver to be offered rides at all.
    pub fn is_dispatchable(&self) -> bool {
        self.status == DriverStatus::Active && self.is_active && !self.is_deleted
    }
}
