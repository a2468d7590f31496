use std::cmp::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use geojson::{Feature, FeatureCollection, Geometry, JsonValue, Value};
use serde::Serialize;
use tracing::debug;

use crate::NearbyError;
use crate::city::{City, NearbyResult};
use crate::geokey::{estimate_length_required, prefix_for};
use crate::index::IndexBuilder;
use crate::iplocate::{IpLocator, resolve_ip};
use crate::search::NameSearch;
use crate::store::CityStore;
use crate::utils::{BoundingBox, bounding_box, distance_km, round2};

pub const DEFAULT_RADIUS_KM: f64 = 100.0;

/// Options of a proximity query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearbyQuery {
    pub radius_km: f64,
    /// Drop candidates farther than `radius_km`. Prefix retrieval alone
    /// returns the whole cell, which may reach beyond the radius.
    pub strict: bool,
}

impl Default for NearbyQuery {
    fn default() -> Self {
        Self {
            radius_km: DEFAULT_RADIUS_KM,
            strict: false,
        }
    }
}

/// The answer to one proximity query.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NearbyCities {
    /// Human-readable label of the reference point.
    pub from: String,
    pub lat: f64,
    pub lng: f64,
    pub radius_km: f64,
    /// Geohash prefix the candidates share.
    pub prefix: String,
    pub bbox: BoundingBox,
    pub cities: Vec<NearbyResult>,
}

impl NearbyCities {
    /// Renders the results as GeoJSON points, nearest first.
    pub fn to_feature_collection(&self) -> FeatureCollection {
        let features = self
            .cities
            .iter()
            .map(|result| {
                let properties = match serde_json::to_value(result) {
                    Ok(JsonValue::Object(map)) => Some(map),
                    _ => None,
                };
                Feature {
                    bbox: None,
                    geometry: Some(Geometry::new(Value::Point(vec![
                        result.city.lng,
                        result.city.lat,
                    ]))),
                    id: None,
                    properties,
                    foreign_members: None,
                }
            })
            .collect();
        FeatureCollection {
            bbox: Some(vec![
                self.bbox.min_lng,
                self.bbox.min_lat,
                self.bbox.max_lng,
                self.bbox.max_lat,
            ]),
            features,
            foreign_members: None,
        }
    }
}

type Candidates = Arc<Vec<(String, City)>>;

/// Answers "which cities are near here" against a built index.
///
/// The index is read-only once built, so the candidate set of each prefix is
/// cached and shared between queries. Only prefixes no longer than the one
/// of the cache radius are kept, which caps the cache at `32^precision`
/// entries whatever radius callers ask for.
pub struct ProximityEngine {
    store: CityStore,
    names: Arc<dyn NameSearch + Send + Sync>,
    ips: Arc<dyn IpLocator + Send + Sync>,
    candidates: DashMap<String, Candidates>,
    cache_precision: usize,
}

impl ProximityEngine {
    /// Creates an engine over the builder's store.
    ///
    /// # Errors
    ///
    /// Returns `NearbyError::IndexNotBuilt` or `NearbyError::BuildFailed`
    /// unless the builder has reached `IndexState::Built`.
    pub fn from_index(builder: &IndexBuilder) -> Result<Self, NearbyError> {
        builder.ensure_built()?;
        let store = builder.store().clone();
        Ok(Self {
            names: Arc::new(store.clone()),
            ips: Arc::new(store.clone()),
            store,
            candidates: DashMap::new(),
            cache_precision: estimate_length_required(DEFAULT_RADIUS_KM)?,
        })
    }

    /// Caches candidates only for queries at least as wide as `radius_km`.
    ///
    /// # Errors
    ///
    /// `NearbyError::InvalidRadius` for a non-positive or non-finite radius.
    pub fn with_cache_radius(mut self, radius_km: f64) -> Result<Self, NearbyError> {
        self.cache_precision = estimate_length_required(radius_km)?;
        self.candidates.clear();
        Ok(self)
    }

    /// Replaces the name resolution backend.
    pub fn with_name_search(mut self, names: Arc<dyn NameSearch + Send + Sync>) -> Self {
        self.names = names;
        self
    }

    /// Replaces the IP resolution backend.
    pub fn with_ip_locator(mut self, ips: Arc<dyn IpLocator + Send + Sync>) -> Self {
        self.ips = ips;
        self
    }

    fn candidates(&self, prefix: &str) -> Result<Candidates, NearbyError> {
        if prefix.len() > self.cache_precision {
            return Ok(Arc::new(self.store.scan_prefix(prefix)?));
        }
        if let Some(cached) = self.candidates.get(prefix) {
            return Ok(Arc::clone(&cached));
        }
        let found = Arc::new(self.store.scan_prefix(prefix)?);
        self.candidates
            .entry(prefix.to_string())
            .or_insert_with(|| Arc::clone(&found));
        Ok(found)
    }

    /// Finds the indexed cities sharing the reference point's neighbourhood
    /// cell, sorted by distance.
    ///
    /// Ties in distance are broken by ascending city id.
    ///
    /// # Errors
    ///
    /// Validation errors for out-of-range coordinates or radius, storage
    /// errors from the prefix scan.
    pub fn find_nearby(
        &self,
        lat: f64,
        lng: f64,
        query: &NearbyQuery,
    ) -> Result<NearbyCities, NearbyError> {
        self.find_nearby_from(format!("{}, {}", lat, lng), lat, lng, query)
    }

    fn find_nearby_from(
        &self,
        from: String,
        lat: f64,
        lng: f64,
        query: &NearbyQuery,
    ) -> Result<NearbyCities, NearbyError> {
        let bbox = bounding_box(lat, lng, query.radius_km)?;
        let precision = estimate_length_required(query.radius_km)?;
        let prefix = prefix_for(lat, lng, precision)?;

        let candidates = self.candidates(&prefix)?;
        let mut cities: Vec<NearbyResult> = candidates
            .iter()
            .map(|(geohash, city)| (distance_km(lat, lng, city.lat, city.lng), geohash, city))
            .filter(|(distance, _, _)| !query.strict || *distance <= query.radius_km)
            .map(|(distance, geohash, city)| NearbyResult {
                distance: round2(distance),
                geohash: geohash.clone(),
                city: city.clone(),
            })
            .collect();

        cities.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.city.id.cmp(&b.city.id))
        });
        debug!(
            "{} candidates under prefix {}, {} returned",
            candidates.len(),
            prefix,
            cities.len()
        );

        Ok(NearbyCities {
            from,
            lat,
            lng,
            radius_km: query.radius_km,
            prefix,
            bbox,
            cities,
        })
    }

    /// Resolves a city name and finds the cities around it.
    ///
    /// Returns `Ok(None)` when no city matches the name.
    pub fn find_nearby_city(
        &self,
        name: &str,
        query: &NearbyQuery,
    ) -> Result<Option<NearbyCities>, NearbyError> {
        let Some(city) = self.names.find_by_name(name)? else {
            debug!("no city matches {:?}", name);
            return Ok(None);
        };
        let from = format!("{}, {}", city.name, city.country);
        self.find_nearby_from(from, city.lat, city.lng, query)
            .map(Some)
    }

    /// Resolves an IPv4 address and finds the cities around it.
    ///
    /// Returns `Ok(None)` for private or reserved addresses and for
    /// addresses without a known location.
    pub fn find_nearby_ip(
        &self,
        ip: &str,
        query: &NearbyQuery,
    ) -> Result<Option<NearbyCities>, NearbyError> {
        let Some(range) = resolve_ip(self.ips.as_ref(), ip)? else {
            return Ok(None);
        };
        let from = format!("{}, {}", range.city, range.country);
        self.find_nearby_from(from, range.lat, range.lng, query)
            .map(Some)
    }

    /// Number of prefixes whose candidates are cached.
    pub fn cached_prefixes(&self) -> usize {
        self.candidates.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::MemoryNameSearch;

    fn city(id: u64, name: &str, lat: f64, lng: f64) -> City {
        City {
            name: name.into(),
            ascii_name: name.into(),
            lat,
            lng,
            country: "Vietnam".into(),
            iso2: "VN".into(),
            iso3: "VNM".into(),
            admin_name: String::new(),
            capital: String::new(),
            population: None,
            id,
        }
    }

    fn cities() -> Vec<City> {
        vec![
            city(1, "Hanoi", 21.0283, 105.8542),
            city(2, "Hai Phong", 20.8651, 106.6838),
            city(3, "Nam Dinh", 20.4333, 106.1667),
            city(4, "Thai Nguyen", 21.5942, 105.8482),
            city(5, "Ho Chi Minh City", 10.7756, 106.7019),
            // same spot as Hanoi, to exercise the tie-break
            city(6, "Hanoi Twin", 21.0283, 105.8542),
        ]
    }

    fn engine() -> ProximityEngine {
        let store = CityStore::temporary().unwrap();
        let mut builder = IndexBuilder::new(store).unwrap();
        builder.build(|_| Ok(cities())).unwrap();
        ProximityEngine::from_index(&builder).unwrap()
    }

    #[test]
    fn test_find_nearby_sorted() {
        let engine = engine();
        let nearby = engine
            .find_nearby(21.0278, 105.8342, &NearbyQuery::default())
            .unwrap();
        assert_eq!(nearby.prefix, "w7e");
        let ids: Vec<u64> = nearby.cities.iter().map(|r| r.city.id).collect();
        assert_eq!(ids, vec![1, 6, 3, 2]);
        assert!((nearby.cities[0].distance - 2.08).abs() < 0.05);
        assert!(
            nearby
                .cities
                .windows(2)
                .all(|w| w[0].distance <= w[1].distance)
        );
        assert!(nearby.cities.iter().all(|r| r.geohash.starts_with("w7e")));
    }

    #[test]
    fn test_strict_filters_by_radius() {
        let engine = engine();
        let query = NearbyQuery {
            radius_km: 100.0,
            strict: true,
        };
        let nearby = engine.find_nearby(21.0278, 105.8342, &query).unwrap();
        assert!(nearby.cities.iter().all(|r| r.distance <= 100.0));
        // Nam Dinh is ~75 km away, Hai Phong ~90 km
        assert_eq!(nearby.cities.len(), 4);

        let query = NearbyQuery {
            radius_km: 50.0,
            strict: true,
        };
        let nearby = engine.find_nearby(21.0278, 105.8342, &query).unwrap();
        let ids: Vec<u64> = nearby.cities.iter().map(|r| r.city.id).collect();
        assert_eq!(ids, vec![1, 6]);
    }

    #[test]
    fn test_strict_uses_unrounded_distance() {
        let engine = engine();
        // a reference point whose distance to Nam Dinh rounds down
        let (lat, distance) = (0..1_000)
            .map(|k| 21.0278 + k as f64 * 0.0001)
            .map(|lat| (lat, distance_km(lat, 105.8342, 20.4333, 106.1667)))
            .find(|(_, d)| round2(*d) < *d)
            .unwrap();
        let query = NearbyQuery {
            radius_km: round2(distance),
            strict: true,
        };
        let nearby = engine.find_nearby(lat, 105.8342, &query).unwrap();
        assert_eq!(nearby.prefix, "w7e");
        let ids: Vec<u64> = nearby.cities.iter().map(|r| r.city.id).collect();
        assert!(ids.contains(&1));
        assert!(!ids.contains(&3));
    }

    #[test]
    fn test_candidates_are_cached() {
        let engine = engine();
        assert_eq!(engine.cached_prefixes(), 0);
        engine
            .find_nearby(21.0278, 105.8342, &NearbyQuery::default())
            .unwrap();
        engine
            .find_nearby(21.0283, 105.8542, &NearbyQuery::default())
            .unwrap();
        assert_eq!(engine.cached_prefixes(), 1);
    }

    #[test]
    fn test_narrow_queries_are_not_cached() {
        let engine = engine();
        let query = NearbyQuery {
            radius_km: 0.00001,
            strict: false,
        };
        for i in 0..2_000 {
            let lat = -80.0 + i as f64 * 0.08;
            engine.find_nearby(lat, 105.8342, &query).unwrap();
        }
        assert_eq!(engine.cached_prefixes(), 0);

        // wider than the cache radius still goes through the cache
        let query = NearbyQuery {
            radius_km: 2_000.0,
            strict: false,
        };
        engine.find_nearby(21.0278, 105.8342, &query).unwrap();
        assert_eq!(engine.cached_prefixes(), 1);
    }

    #[test]
    fn test_cache_radius_follows_configuration() {
        let engine = engine().with_cache_radius(10.0).unwrap();
        let query = NearbyQuery {
            radius_km: 10.0,
            strict: false,
        };
        engine.find_nearby(21.0278, 105.8342, &query).unwrap();
        assert_eq!(engine.cached_prefixes(), 1);

        assert!(matches!(
            self::engine().with_cache_radius(0.0),
            Err(NearbyError::InvalidRadius(_))
        ));
    }

    #[test]
    fn test_find_nearby_city_starts_at_zero() {
        let engine = engine();
        let nearby = engine
            .find_nearby_city("Hai Phong", &NearbyQuery::default())
            .unwrap()
            .unwrap();
        assert_eq!(nearby.from, "Hai Phong, Vietnam");
        assert_eq!(nearby.cities[0].city.id, 2);
        assert_eq!(nearby.cities[0].distance, 0.0);

        assert!(
            engine
                .find_nearby_city("Atlantis", &NearbyQuery::default())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_pluggable_name_search() {
        let engine = engine().with_name_search(Arc::new(MemoryNameSearch::new(vec![city(
            99,
            "Somewhere",
            20.4333,
            106.1667,
        )])));
        let nearby = engine
            .find_nearby_city("somewhere", &NearbyQuery::default())
            .unwrap()
            .unwrap();
        assert_eq!(nearby.cities[0].city.id, 3);
    }

    #[test]
    fn test_find_nearby_rejects_invalid_input() {
        let engine = engine();
        assert!(matches!(
            engine.find_nearby(200.0, 0.0, &NearbyQuery::default()),
            Err(NearbyError::InvalidCoordinate { .. })
        ));
        let query = NearbyQuery {
            radius_km: -5.0,
            strict: false,
        };
        assert!(matches!(
            engine.find_nearby(0.0, 0.0, &query),
            Err(NearbyError::InvalidRadius(_))
        ));
        assert!(matches!(
            engine.find_nearby_ip("not-an-ip", &NearbyQuery::default()),
            Err(NearbyError::InvalidIp(_))
        ));
    }

    #[test]
    fn test_private_ip_is_no_match() {
        let engine = engine();
        assert!(
            engine
                .find_nearby_ip("10.1.2.3", &NearbyQuery::default())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_feature_collection() {
        let engine = engine();
        let nearby = engine
            .find_nearby(21.0278, 105.8342, &NearbyQuery::default())
            .unwrap();
        let fc = nearby.to_feature_collection();
        assert_eq!(fc.features.len(), nearby.cities.len());
        let first = &fc.features[0];
        assert_eq!(
            first.geometry.as_ref().unwrap().value,
            Value::Point(vec![105.8542, 21.0283])
        );
        assert_eq!(first.properties.as_ref().unwrap()["name"], "Hanoi");
    }
}
