//! Route optimization request payload
//!
//! The gateway validates the body of `POST /optimize-route` before it spends
//! any upstream capacity on it. Only the validated form is forwarded.

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest origin to destination distance accepted, in kilometres
pub const MAX_ROUTE_KM: f64 = 1_000.0;

/// Longest accepted time window, in hours
pub const MAX_WINDOW_HOURS: i64 = 24;

const EARTH_RADIUS_KM: f64 = 6_371.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    fn validate(&self, field: &str) -> Result<(), ValidationError> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(invalid(format!("{field}.lat must be between -90 and 90")));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(invalid(format!("{field}.lng must be between -180 and 180")));
        }
        Ok(())
    }

    /// Great-circle distance in kilometres
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlng = (other.lng - self.lng).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    #[default]
    Car,
    Truck,
    Van,
    Motorcycle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationPreference {
    Distance,
    #[default]
    Time,
    Cost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteConstraints {
    #[serde(default)]
    pub avoid_traffic: bool,
    #[serde(default)]
    pub avoid_tolls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_distance_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_minutes: Option<i64>,
}

impl RouteConstraints {
    fn validate(&self) -> Result<(), ValidationError> {
        if let Some(window) = &self.time_window {
            if window.end <= window.start {
                return Err(invalid("constraints.time_window.end must be after start"));
            }
            if window.end - window.start > chrono::Duration::hours(MAX_WINDOW_HOURS) {
                return Err(invalid(format!(
                    "constraints.time_window must not exceed {MAX_WINDOW_HOURS} hours"
                )));
            }
        }
        if self
            .max_distance_km
            .is_some_and(|km| !km.is_finite() || km < 0.0)
        {
            return Err(invalid("constraints.max_distance_km must be non-negative"));
        }
        if self.max_duration_minutes.is_some_and(|m| m < 0) {
            return Err(invalid("constraints.max_duration_minutes must be non-negative"));
        }
        Ok(())
    }
}

/// Body of `POST /optimize-route`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteOptimizationRequest {
    pub origin: Coordinates,
    pub destination: Coordinates,
    #[serde(default)]
    pub vehicle_type: VehicleType,
    #[serde(default)]
    pub optimization_preference: OptimizationPreference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<RouteConstraints>,
}

impl RouteOptimizationRequest {
    /// Parse and validate a JSON body
    pub fn from_slice(body: &[u8]) -> Result<Self, ValidationError> {
        let request: Self = serde_json::from_slice(body).map_err(|e| invalid(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.origin.validate("origin")?;
        self.destination.validate("destination")?;
        if self.origin.distance_km(&self.destination) > MAX_ROUTE_KM {
            return Err(invalid(format!(
                "origin and destination must be within {MAX_ROUTE_KM} km"
            )));
        }
        if let Some(constraints) = &self.constraints {
            constraints.validate()?;
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ValidationError {
    ValidationError::InvalidPayload(msg.into())
}
