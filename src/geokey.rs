//! Geohash keys, the sortable spatial key stored in the index.
//!
//! A key interleaves successive halvings of the longitude and latitude ranges,
//! five bits per base-32 character. Points that are close together usually
//! share a long common prefix, which lets an ordered store answer a
//! neighbourhood query with a prefix scan.
use geohash::{Coord, decode_bbox, encode};

use crate::NearbyError;
use crate::utils::{BoundingBox, KM_PER_DEGREE, validate_coordinate, validate_radius};

/// Length of the keys persisted in the index.
pub const FULL_PRECISION: usize = 12;

/// The standard geohash alphabet: digits and lowercase letters without `a`, `i`, `l`, `o`.
pub const BASE32: &str = "0123456789bcdefghjkmnpqrstuvwxyz";

/// Encodes a point into a key of `precision` characters.
///
/// # Errors
///
/// * `NearbyError::InvalidCoordinate` - latitude or longitude out of range
/// * `NearbyError::InvalidPrecision` - precision outside `1..=FULL_PRECISION`
pub fn encode_key(lat: f64, lng: f64, precision: usize) -> Result<String, NearbyError> {
    validate_coordinate(lat, lng)?;
    if !(1..=FULL_PRECISION).contains(&precision) {
        return Err(NearbyError::InvalidPrecision(precision));
    }
    let key = encode(Coord { x: lng, y: lat }, precision)?;
    Ok(key)
}

/// Decodes a key into the cell it denotes.
///
/// # Errors
///
/// Returns `NearbyError::InvalidGeoKey` when the key is empty, too long, or
/// contains a character outside [`BASE32`].
pub fn decode_key(key: &str) -> Result<BoundingBox, NearbyError> {
    if key.is_empty() || key.len() > FULL_PRECISION || !key.chars().all(|c| BASE32.contains(c)) {
        return Err(NearbyError::InvalidGeoKey(key.to_string()));
    }
    let rect = decode_bbox(key)?;
    Ok(BoundingBox {
        min_lat: rect.min().y,
        max_lat: rect.max().y,
        min_lng: rect.min().x,
        max_lng: rect.max().x,
    })
}

/// Width and height in kilometres of a cell of `precision` characters, at the equator.
///
/// Each character adds five bits, split alternately between longitude and
/// latitude starting with longitude, so every added character divides the
/// cell area by 32.
pub fn cell_size_km(precision: usize) -> (f64, f64) {
    let bits = 5 * precision as i32;
    let lng_bits = (bits + 1) / 2;
    let lat_bits = bits / 2;
    (
        360.0 / 2f64.powi(lng_bits) * KM_PER_DEGREE,
        180.0 / 2f64.powi(lat_bits) * KM_PER_DEGREE,
    )
}

/// Picks the key length used as the neighbourhood prefix for `radius_km`.
///
/// This is the longest length whose cells are still at least `radius_km`
/// wide and tall. A radius larger than a single-character cell resolves to 1.
///
/// # Errors
///
/// Returns `NearbyError::InvalidRadius` for non-finite or non-positive radii.
pub fn estimate_length_required(radius_km: f64) -> Result<usize, NearbyError> {
    validate_radius(radius_km)?;
    let precision = (1..=FULL_PRECISION)
        .rev()
        .find(|&p| {
            let (width, height) = cell_size_km(p);
            width.min(height) >= radius_km
        })
        .unwrap_or(1);
    Ok(precision)
}

/// Returns the first `precision` characters of the full-precision key of a point.
///
/// # Errors
///
/// `NearbyError::InvalidPrecision` outside `1..=FULL_PRECISION`, like `encode_key`.
pub fn prefix_for(lat: f64, lng: f64, precision: usize) -> Result<String, NearbyError> {
    if !(1..=FULL_PRECISION).contains(&precision) {
        return Err(NearbyError::InvalidPrecision(precision));
    }
    let mut key = encode_key(lat, lng, FULL_PRECISION)?;
    key.truncate(precision);
    Ok(key)
}
