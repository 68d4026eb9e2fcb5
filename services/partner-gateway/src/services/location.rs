//! Location lookups for header-authenticated partners

use crate::errors::Result;
use crate::models::{Location, LocationDetail, NearbyLocation, NearbyLocationRequest};
use crate::repository::Store;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument};

pub const CODE_LOCATION_OK: &str = "200110";
pub const CODE_LOCATION_NOT_FOUND: &str = "404110";

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Plain JSON envelope used by the location endpoints
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocationResponse<T: Serialize> {
    pub status: bool,
    pub response_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> LocationResponse<T> {
    pub fn found(data: T) -> Self {
        Self {
            status: true,
            response_code: CODE_LOCATION_OK.to_string(),
            message: None,
            data: Some(data),
        }
    }

    pub fn failed(code: &str, message: impl Into<String>) -> Self {
        Self {
            status: false,
            response_code: code.to_string(),
            message: Some(message.into()),
            data: None,
        }
    }
}

/// Great-circle distance in kilometres
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

#[derive(Clone)]
pub struct LocationService {
    store: Arc<dyn Store>,
}

impl LocationService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn location_detail(&self, location_code: &str) -> Result<Option<LocationDetail>> {
        let Some(location) = self.store.find_location(location_code).await? else {
            return Ok(None);
        };
        let lots = self.store.location_lots(&location.location_code).await?;

        Ok(Some(LocationDetail { location, lots }))
    }

    /// Locations within `radius` km, nearest first; rows without coordinates are skipped
    #[instrument(skip(self))]
    pub async fn nearby(&self, req: &NearbyLocationRequest) -> Result<Vec<NearbyLocation>> {
        let mut within: Vec<(Location, f64)> = self
            .store
            .all_locations()
            .await?
            .into_iter()
            .filter_map(|location| {
                let (lat, lon) = (location.latitude?, location.longitude?);
                let distance = haversine_km(req.latitude, req.longitude, lat, lon);
                (distance <= req.radius).then_some((location, distance))
            })
            .collect();
        within.sort_by(|a, b| a.1.total_cmp(&b.1));
        debug!(count = within.len(), "Nearby locations");

        let mut nearby = Vec::with_capacity(within.len());
        for (location, distance_km) in within {
            let lots = self.store.location_lots(&location.location_code).await?;
            nearby.push(NearbyLocation {
                location,
                distance_km: (distance_km * 1000.0).round() / 1000.0,
                lots,
            });
        }

        Ok(nearby)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // Monas to Bundaran HI, roughly 2.2 km
        let d = haversine_km(-6.1754, 106.8272, -6.1950, 106.8230);
        assert!((d - 2.2).abs() < 0.2, "got {d}");
        assert_eq!(haversine_km(1.0, 1.0, 1.0, 1.0), 0.0);
    }

    #[test]
    fn test_response_shape() {
        let ok = serde_json::to_value(LocationResponse::found(vec![1, 2])).unwrap();
        assert_eq!(ok["ResponseCode"], CODE_LOCATION_OK);
        assert_eq!(ok["Status"], true);
        assert!(ok.get("Message").is_none());

        let missing = serde_json::to_value(LocationResponse::<()>::failed(CODE_LOCATION_NOT_FOUND, "Location Not Found")).unwrap();
        assert_eq!(missing["Status"], false);
        assert!(missing.get("Data").is_none());
    }
}
