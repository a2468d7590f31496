use geo::{Distance, Haversine, Point};
use serde::{Deserialize, Serialize};

use crate::NearbyError;

/// Kilometres spanned by one degree of latitude (and of longitude at the equator).
pub const KM_PER_DEGREE: f64 = 111.32;

/// An axis-aligned latitude/longitude rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    /// Returns true when the point lies inside the box, edges included.
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lng..=self.max_lng).contains(&lng)
    }
}

/// Rejects non-finite coordinates and coordinates outside [-90,90] / [-180,180].
pub fn validate_coordinate(lat: f64, lng: f64) -> Result<(), NearbyError> {
    if lat.is_finite()
        && lng.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lng)
    {
        Ok(())
    } else {
        Err(NearbyError::InvalidCoordinate { lat, lng })
    }
}

pub fn validate_radius(radius_km: f64) -> Result<(), NearbyError> {
    if radius_km.is_finite() && radius_km > 0.0 {
        Ok(())
    } else {
        Err(NearbyError::InvalidRadius(radius_km))
    }
}

/// Computes the box enclosing a circle of `radius_km` around a point.
///
/// Latitudes are clamped to [-90,90]. Longitudes are not wrapped at the
/// antimeridian, so a box near ±180° may extend past it. When the cosine of
/// the latitude vanishes (at or very near a pole) or the longitude span would
/// exceed a full turn, the box covers every longitude.
///
/// # Errors
///
/// Returns `NearbyError::InvalidCoordinate` or `NearbyError::InvalidRadius`
/// for out-of-range input.
pub fn bounding_box(lat: f64, lng: f64, radius_km: f64) -> Result<BoundingBox, NearbyError> {
    validate_coordinate(lat, lng)?;
    validate_radius(radius_km)?;

    let d_lat = radius_km / KM_PER_DEGREE;
    let cos_lat = lat.to_radians().cos();

    let (min_lng, max_lng) = if cos_lat.abs() < f64::EPSILON {
        (-180.0, 180.0)
    } else {
        let d_lng = radius_km / (KM_PER_DEGREE * cos_lat);
        if d_lng >= 180.0 {
            (-180.0, 180.0)
        } else {
            (lng - d_lng, lng + d_lng)
        }
    };

    Ok(BoundingBox {
        min_lat: (lat - d_lat).max(-90.0),
        max_lat: (lat + d_lat).min(90.0),
        min_lng,
        max_lng,
    })
}

/// Great-circle distance in kilometres between two points, by the haversine formula.
pub fn distance_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    Haversine::distance(Point::new(lng1, lat1), Point::new(lng2, lat2)) / 1000.0
}

/// Rounds to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
