//! One-shot spatial index build.
//!
//! The build is guarded by a migration marker written in the same
//! transaction as the index, so a database either holds a complete index and
//! the marker or neither. Once the marker is present the build never runs
//! again, even if the source data changed.
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::NearbyError;
use crate::city::City;
use crate::geokey::{FULL_PRECISION, encode_key};
use crate::store::{CityStore, IndexEntry};

/// Name of the marker recording that the cities index has been built.
pub const CITIES_MIGRATION: &str = "cities_table";

/// Lifecycle of the spatial index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexState {
    NotBuilt,
    Building,
    Built,
    /// The build was attempted and rolled back; the service must not start.
    BuildFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The index was written by this call.
    Built { cities: usize, elapsed: Duration },
    /// The marker was already present; nothing was read or written.
    Skipped,
}

/// Builds the spatial index once and tracks its state.
pub struct IndexBuilder {
    store: CityStore,
    state: IndexState,
}

impl IndexBuilder {
    /// Creates a builder, starting in `Built` when the marker is already present.
    pub fn new(store: CityStore) -> Result<Self, NearbyError> {
        let state = if store.migration_applied(CITIES_MIGRATION)? {
            IndexState::Built
        } else {
            IndexState::NotBuilt
        };
        Ok(Self { store, state })
    }

    pub fn state(&self) -> &IndexState {
        &self.state
    }

    pub fn store(&self) -> &CityStore {
        &self.store
    }

    /// Builds the index from the cities returned by `load`.
    ///
    /// `load` is only called when the index has not been built yet, so
    /// expensive ingestion (reading the dataset, loading IP ranges into the
    /// store) is skipped on later startups. Any failure, from `load` or from
    /// the storage layer, leaves the index unbuilt and the builder in
    /// `BuildFailed`.
    pub fn build<F>(&mut self, load: F) -> Result<BuildOutcome, NearbyError>
    where
        F: FnOnce(&CityStore) -> Result<Vec<City>, NearbyError>,
    {
        match &self.state {
            IndexState::Built => {
                info!("spatial index already built, skipping");
                return Ok(BuildOutcome::Skipped);
            }
            IndexState::BuildFailed(reason) => {
                return Err(NearbyError::BuildFailed(reason.clone()));
            }
            IndexState::Building => {
                return Err(NearbyError::BuildFailed("build already in progress".into()));
            }
            IndexState::NotBuilt => {}
        }

        self.state = IndexState::Building;
        let now = Instant::now();
        match self.run(load) {
            Ok(cities) => {
                self.state = IndexState::Built;
                let elapsed = now.elapsed();
                info!("built spatial index of {} cities in {:?}", cities, elapsed);
                Ok(BuildOutcome::Built { cities, elapsed })
            }
            Err(e) => {
                error!("spatial index build failed: {}", e);
                self.state = IndexState::BuildFailed(e.to_string());
                Err(e)
            }
        }
    }

    fn run<F>(&self, load: F) -> Result<usize, NearbyError>
    where
        F: FnOnce(&CityStore) -> Result<Vec<City>, NearbyError>,
    {
        // leftovers of an earlier failed attempt
        self.store.clear()?;

        let mut cities = load(&self.store)?;
        if cities.is_empty() {
            warn!("no cities to index");
        }
        cities.sort_by_key(|c| c.id);

        let entries = cities
            .into_iter()
            .map(|city| {
                let geohash = encode_key(city.lat, city.lng, FULL_PRECISION)?;
                Ok(IndexEntry { geohash, city })
            })
            .collect::<Result<Vec<_>, NearbyError>>()?;

        self.store.commit_index(&entries, CITIES_MIGRATION)
    }

    /// Fails unless the index is built.
    pub fn ensure_built(&self) -> Result<(), NearbyError> {
        match &self.state {
            IndexState::Built => Ok(()),
            IndexState::BuildFailed(reason) => Err(NearbyError::BuildFailed(reason.clone())),
            IndexState::NotBuilt | IndexState::Building => Err(NearbyError::IndexNotBuilt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn city(id: u64, lat: f64, lng: f64) -> City {
        City {
            name: format!("City {}", id),
            ascii_name: format!("City {}", id),
            lat,
            lng,
            country: "Testland".into(),
            iso2: "TL".into(),
            iso3: "TLD".into(),
            admin_name: String::new(),
            capital: String::new(),
            population: None,
            id,
        }
    }

    #[test]
    fn test_build_once() {
        let store = CityStore::temporary().unwrap();
        let mut builder = IndexBuilder::new(store.clone()).unwrap();
        assert_eq!(builder.state(), &IndexState::NotBuilt);
        assert!(matches!(builder.ensure_built(), Err(NearbyError::IndexNotBuilt)));

        let outcome = builder
            .build(|_| Ok(vec![city(2, 10.0, 10.0), city(1, 10.1, 10.1)]))
            .unwrap();
        assert!(matches!(outcome, BuildOutcome::Built { cities: 2, .. }));
        assert_eq!(builder.state(), &IndexState::Built);
        assert_eq!(store.index_len(), 2);

        let loads = Cell::new(0);
        let outcome = builder
            .build(|_| {
                loads.set(loads.get() + 1);
                Ok(vec![city(3, 0.0, 0.0)])
            })
            .unwrap();
        assert_eq!(outcome, BuildOutcome::Skipped);
        assert_eq!(loads.get(), 0);
        assert_eq!(store.index_len(), 2);
    }

    #[test]
    fn test_new_builder_sees_marker() {
        let store = CityStore::temporary().unwrap();
        IndexBuilder::new(store.clone())
            .unwrap()
            .build(|_| Ok(vec![city(1, 0.0, 0.0)]))
            .unwrap();

        let mut builder = IndexBuilder::new(store.clone()).unwrap();
        assert_eq!(builder.state(), &IndexState::Built);
        assert_eq!(builder.build(|_| Ok(vec![city(9, 1.0, 1.0)])).unwrap(), BuildOutcome::Skipped);
        assert_eq!(store.index_len(), 1);
    }

    #[test]
    fn test_invalid_coordinate_aborts_build() {
        let store = CityStore::temporary().unwrap();
        let mut builder = IndexBuilder::new(store.clone()).unwrap();
        let err = builder
            .build(|_| Ok(vec![city(1, 0.0, 0.0), city(2, 200.0, 0.0)]))
            .unwrap_err();
        assert!(matches!(err, NearbyError::InvalidCoordinate { .. }));
        assert!(matches!(builder.state(), IndexState::BuildFailed(_)));
        assert_eq!(store.index_len(), 0);
        assert!(!store.migration_applied(CITIES_MIGRATION).unwrap());
        assert!(matches!(builder.ensure_built(), Err(NearbyError::BuildFailed(_))));

        // a failed builder refuses to run again
        assert!(matches!(
            builder.build(|_| Ok(vec![city(1, 0.0, 0.0)])),
            Err(NearbyError::BuildFailed(_))
        ));
    }

    #[test]
    fn test_load_failure_aborts_build() {
        let store = CityStore::temporary().unwrap();
        let mut builder = IndexBuilder::new(store.clone()).unwrap();
        let err = builder
            .build(|_| Err(NearbyError::IoError(std::io::Error::other("missing dataset"))))
            .unwrap_err();
        assert!(matches!(err, NearbyError::IoError(_)));
        assert!(matches!(builder.state(), IndexState::BuildFailed(_)));
        assert!(!store.migration_applied(CITIES_MIGRATION).unwrap());
    }

    #[test]
    fn test_retry_after_failure_starts_clean() {
        let store = CityStore::temporary().unwrap();
        let mut failed = IndexBuilder::new(store.clone()).unwrap();
        let _ = failed.build(|_| Ok(vec![city(1, 0.0, 0.0), city(1, 1.0, 1.0)]));
        assert_eq!(store.index_len(), 0);

        let mut builder = IndexBuilder::new(store.clone()).unwrap();
        builder.build(|_| Ok(vec![city(1, 0.0, 0.0)])).unwrap();
        assert_eq!(store.index_len(), 1);
    }
}
