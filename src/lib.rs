//! # nearby-cities
//!
//! Finds the cities around a named city or an IP address. Every city is
//! stored under a full-precision geohash key in a sled tree; a neighbourhood
//! query truncates the reference point's key to a length matching the search
//! radius and scans every key sharing that prefix, then ranks the candidates
//! by exact great-circle distance.
//!
//! ## Features
//!
//! - Geohash codec with validation and radius-to-precision estimation
//! - One-shot, transactional index build guarded by a migration marker
//! - Prefix-scan candidate retrieval with haversine ranking
//! - Name resolution through a token index, IP resolution through IP2Location ranges
//! - Read-only after build, safe to share across request handlers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use nearby_cities::{CityStore, IndexBuilder, NearbyQuery, ProximityEngine, read_cities};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = CityStore::temporary()?;
//!     let mut builder = IndexBuilder::new(store)?;
//!     builder.build(|_| {
//!         read_cities(
//!             "city,city_ascii,lat,lng,country,iso2,iso3,admin_name,capital,population,id\n\
//!              Hanoi,Hanoi,21.0283,105.8542,Vietnam,VN,VNM,Hà Nội,primary,8246600,1704413791\n"
//!                 .as_bytes(),
//!         )
//!     })?;
//!
//!     let engine = ProximityEngine::from_index(&builder)?;
//!     let nearby = engine.find_nearby(21.0278, 105.8342, &NearbyQuery::default())?;
//!     for city in &nearby.cities {
//!         println!("{} {} km", city.city.name, city.distance);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Accuracy
//!
//! Prefix matching is an approximation of a radius search: a neighbour just
//! across a cell boundary is missed, and a candidate inside the cell but
//! beyond the radius is returned. Pass `strict: true` in [`NearbyQuery`] to
//! drop the latter.
use thiserror::Error;

mod city;
mod config;
mod geokey;
mod index;
mod iplocate;
mod nearby;
mod search;
mod store;
mod utils;

pub use city::{City, NearbyResult, load_cities, read_cities};
pub use config::Config;
pub use geokey::{
    BASE32, FULL_PRECISION, cell_size_km, decode_key, encode_key, estimate_length_required,
    prefix_for,
};
pub use index::{BuildOutcome, CITIES_MIGRATION, IndexBuilder, IndexState};
pub use iplocate::{
    IpLocator, IpRange, ip_to_integer, is_private_or_reserved, load_ip_ranges, parse_ipv4,
    read_ip_ranges, resolve_ip,
};
pub use nearby::{DEFAULT_RADIUS_KM, NearbyCities, NearbyQuery, ProximityEngine};
pub use search::{
    MemoryNameSearch, NameSearch, best_match, fold_diacritics, normalize_query, tokenize,
};
pub use store::{CityStore, IndexEntry};
pub use utils::{
    BoundingBox, KM_PER_DEGREE, bounding_box, distance_km, round2, validate_coordinate,
    validate_radius,
};

#[derive(Error, Debug)]
pub enum NearbyError {
    #[error("storage error, {0:?}")]
    StorageError(#[from] sled::Error),
    #[error("geohash error, {0:?}")]
    GeohashError(#[from] geohash::GeohashError),
    #[error("bincode decode error, {0:?}")]
    BincodeDecodeError(#[from] bincode::error::DecodeError),
    #[error("bincode encode error, {0:?}")]
    BincodeEncodeError(#[from] bincode::error::EncodeError),
    #[error("csv error, {0}")]
    CsvError(#[from] csv::Error),
    #[error("io error, {0}")]
    IoError(#[from] std::io::Error),
    #[error("coordinates out of range: latitude {lat}, longitude {lng}")]
    InvalidCoordinate { lat: f64, lng: f64 },
    #[error("invalid radius: {0} km")]
    InvalidRadius(f64),
    #[error("invalid geokey precision: {0}, expected 1..=12")]
    InvalidPrecision(usize),
    #[error("invalid geokey: {0:?}")]
    InvalidGeoKey(String),
    #[error("invalid ip address: {0}")]
    InvalidIp(String),
    #[error("duplicate city id {0}")]
    DuplicateCity(u64),
    #[error("corrupt index entry, {0}")]
    CorruptIndex(String),
    #[error("index build failed, {0}")]
    BuildFailed(String),
    #[error("index is not built")]
    IndexNotBuilt,
    #[error("invalid configuration, {0}")]
    ConfigError(String),
}

impl NearbyError {
    /// True for errors caused by the caller's input rather than by storage.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            NearbyError::InvalidCoordinate { .. }
                | NearbyError::InvalidRadius(_)
                | NearbyError::InvalidPrecision(_)
                | NearbyError::InvalidGeoKey(_)
                | NearbyError::InvalidIp(_)
        )
    }
}

impl From<sled::transaction::TransactionError<NearbyError>> for NearbyError {
    fn from(err: sled::transaction::TransactionError<NearbyError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => NearbyError::StorageError(e),
        }
    }
}
