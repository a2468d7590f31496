use std::{fs::File, io::Read, path::Path};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::NearbyError;
use crate::utils::validate_coordinate;

/// A city from the world cities dataset.
///
/// Rows are read from a CSV with the header
/// `city,city_ascii,lat,lng,country,iso2,iso3,admin_name,capital,population,id`.
#[derive(Clone, PartialEq, Debug, Encode, Decode, Deserialize, Serialize)]
pub struct City {
    #[serde(rename(deserialize = "city"))]
    pub name: String,
    #[serde(rename(deserialize = "city_ascii"))]
    pub ascii_name: String,
    pub lat: f64,
    pub lng: f64,
    pub country: String,
    pub iso2: String,
    pub iso3: String,
    pub admin_name: String,
    pub capital: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub population: Option<u64>,
    pub id: u64,
}

/// A candidate city ranked against a reference point.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct NearbyResult {
    #[serde(flatten)]
    pub city: City,
    /// Great-circle distance in kilometres, rounded to two decimals.
    pub distance: f64,
    pub geohash: String,
}

/// Reads cities from CSV, rejecting any row whose coordinates do not parse
/// or lie out of range. The result is sorted by id.
pub fn read_cities<R: Read>(reader: R) -> Result<Vec<City>, NearbyError> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut cities = vec![];
    for result in rdr.deserialize() {
        let city: City = result?;
        validate_coordinate(city.lat, city.lng)?;
        cities.push(city);
    }
    cities.sort_by_key(|c| c.id);
    debug!("read {} cities", cities.len());
    Ok(cities)
}

pub fn load_cities(path: &Path) -> Result<Vec<City>, NearbyError> {
    read_cities(File::open(path)?)
}
