//! Service configuration, read from environment variables.
//!
//! * `NEARBY_CITIES_DB` - sled database directory (default `./db/nearby_cities`)
//! * `NEARBY_CITIES_CSV` - world cities CSV (default `./worldcities.csv`)
//! * `NEARBY_CITIES_IP2LOCATION` - IP2Location DB5-lite CSV, optional
//! * `NEARBY_CITIES_ADDR` - listen address (default `0.0.0.0:8080`)
//! * `NEARBY_CITIES_RADIUS_KM` - default search radius (default 100)
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::NearbyError;
use crate::nearby::DEFAULT_RADIUS_KM;
use crate::utils::validate_radius;

const DEFAULT_DB_PATH: &str = "./db/nearby_cities";
const DEFAULT_CITIES_CSV: &str = "./worldcities.csv";
const DEFAULT_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_path: PathBuf,
    pub cities_csv: PathBuf,
    pub ip2location_csv: Option<PathBuf>,
    pub listen_addr: SocketAddr,
    pub radius_km: f64,
}

impl Config {
    pub fn from_env() -> Result<Self, NearbyError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, NearbyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = lookup("NEARBY_CITIES_DB").unwrap_or(DEFAULT_DB_PATH.to_string());
        let cities_csv = lookup("NEARBY_CITIES_CSV").unwrap_or(DEFAULT_CITIES_CSV.to_string());
        let ip2location_csv = lookup("NEARBY_CITIES_IP2LOCATION")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let addr = lookup("NEARBY_CITIES_ADDR").unwrap_or(DEFAULT_ADDR.to_string());
        let listen_addr = addr
            .parse::<SocketAddr>()
            .map_err(|e| NearbyError::ConfigError(format!("NEARBY_CITIES_ADDR {:?}: {}", addr, e)))?;

        let radius_km = match lookup("NEARBY_CITIES_RADIUS_KM") {
            Some(radius) => radius.parse::<f64>().map_err(|e| {
                NearbyError::ConfigError(format!("NEARBY_CITIES_RADIUS_KM {:?}: {}", radius, e))
            })?,
            None => DEFAULT_RADIUS_KM,
        };
        validate_radius(radius_km)
            .map_err(|e| NearbyError::ConfigError(format!("NEARBY_CITIES_RADIUS_KM: {}", e)))?;

        Ok(Self {
            db_path: PathBuf::from(db_path),
            cities_csv: PathBuf::from(cities_csv),
            ip2location_csv,
            listen_addr,
            radius_km,
        })
    }
}
