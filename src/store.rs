//! sled-backed storage for cities, the geohash index, name tokens and IP ranges.
//!
//! Trees:
//!
//! * `cities` - city id (big-endian) -> bincode `City`
//! * `geospatial_index` - geohash ++ city id -> empty, scanned by prefix
//! * `name_tokens` - token ++ `0x00` ++ city id -> empty
//! * `ip2location` - range end ip (big-endian) -> bincode `IpRange`
//! * `migrations` - migration name -> number of cities written
use std::collections::BTreeSet;
use std::path::Path;

use sled::Transactional;
use sled::transaction::ConflictableTransactionError;
use tracing::{debug, info};

use crate::NearbyError;
use crate::city::City;
use crate::iplocate::{IpLocator, IpRange};
use crate::search::{NameSearch, best_match, city_tokens, normalize_query, tokenize};

const CITIES_TREE: &str = "cities";
const GEO_INDEX_TREE: &str = "geospatial_index";
const NAME_TOKENS_TREE: &str = "name_tokens";
const IP2LOCATION_TREE: &str = "ip2location";
const MIGRATIONS_TREE: &str = "migrations";

const TOKEN_SEPARATOR: u8 = 0;
const EMPTY: &[u8] = &[];
const IP_BATCH_SIZE: usize = 100_000;

/// A city paired with its full-precision geohash, ready to be persisted.
#[derive(Clone, PartialEq, Debug)]
pub struct IndexEntry {
    pub geohash: String,
    pub city: City,
}

/// Handle to the sled database. Cloning is cheap and shares the same trees.
#[derive(Clone)]
pub struct CityStore {
    db: sled::Db,
    cities: sled::Tree,
    geo_index: sled::Tree,
    name_tokens: sled::Tree,
    ip_ranges: sled::Tree,
    migrations: sled::Tree,
}

fn index_key(geohash: &str, id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(geohash.len() + 8);
    key.extend_from_slice(geohash.as_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn token_key(token: &str, id: u64) -> Vec<u8> {
    let mut key = token_prefix(token);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn token_prefix(token: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(token.len() + 9);
    key.extend_from_slice(token.as_bytes());
    key.push(TOKEN_SEPARATOR);
    key
}

fn id_from_suffix(key: &[u8]) -> Result<u64, NearbyError> {
    if key.len() < 8 {
        return Err(NearbyError::CorruptIndex(format!("key too short: {:?}", key)));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&key[key.len() - 8..]);
    Ok(u64::from_be_bytes(id))
}

impl CityStore {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, NearbyError> {
        let db = sled::Config::default().path(path).open()?;
        Self::from_db(db)
    }

    /// Opens a throwaway database that is removed when dropped.
    pub fn temporary() -> Result<Self, NearbyError> {
        let db = sled::Config::default().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, NearbyError> {
        Ok(Self {
            cities: db.open_tree(CITIES_TREE)?,
            geo_index: db.open_tree(GEO_INDEX_TREE)?,
            name_tokens: db.open_tree(NAME_TOKENS_TREE)?,
            ip_ranges: db.open_tree(IP2LOCATION_TREE)?,
            migrations: db.open_tree(MIGRATIONS_TREE)?,
            db,
        })
    }

    pub fn migration_applied(&self, name: &str) -> Result<bool, NearbyError> {
        Ok(self.migrations.contains_key(name)?)
    }

    /// Removes everything a previous, uncommitted build may have left behind.
    /// The migrations tree is kept.
    pub fn clear(&self) -> Result<(), NearbyError> {
        self.cities.clear()?;
        self.geo_index.clear()?;
        self.name_tokens.clear()?;
        self.ip_ranges.clear()?;
        Ok(())
    }

    /// Writes every entry and the migration marker in a single transaction.
    ///
    /// Either all cities, index entries, name tokens and the marker are
    /// committed, or nothing is.
    ///
    /// # Errors
    ///
    /// * `NearbyError::DuplicateCity` - two entries share a city id
    /// * `NearbyError::StorageError` - sled failed; the transaction is rolled back
    pub fn commit_index(&self, entries: &[IndexEntry], migration: &str) -> Result<usize, NearbyError> {
        let config = bincode::config::standard();
        let mut rows = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = entry.city.id;
            let tokens: Vec<Vec<u8>> = city_tokens(&entry.city)
                .iter()
                .map(|t| token_key(t, id))
                .collect();
            rows.push((
                id.to_be_bytes(),
                bincode::encode_to_vec(&entry.city, config)?,
                index_key(&entry.geohash, id),
                tokens,
            ));
        }
        let count = (entries.len() as u64).to_be_bytes();

        (
            &self.cities,
            &self.geo_index,
            &self.name_tokens,
            &self.migrations,
        )
            .transaction(|(cities, geo_index, name_tokens, migrations)| {
                for (id, city, index_key, tokens) in &rows {
                    if cities.insert(&id[..], city.as_slice())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(
                            NearbyError::DuplicateCity(u64::from_be_bytes(*id)),
                        ));
                    }
                    geo_index.insert(index_key.as_slice(), EMPTY)?;
                    for token in tokens {
                        name_tokens.insert(token.as_slice(), EMPTY)?;
                    }
                }
                migrations.insert(migration, &count[..])?;
                Ok(())
            })?;

        self.db.flush()?;
        info!("committed {} index entries", entries.len());
        Ok(entries.len())
    }

    /// Returns every indexed city whose geohash starts with `prefix`, with its geohash.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, City)>, NearbyError> {
        let mut found = vec![];
        for entry in self.geo_index.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            let id = id_from_suffix(&key)?;
            let geohash = String::from_utf8(key[..key.len() - 8].to_vec())
                .map_err(|e| NearbyError::CorruptIndex(e.to_string()))?;
            let city = self
                .city(id)?
                .ok_or_else(|| NearbyError::CorruptIndex(format!("missing city {}", id)))?;
            found.push((geohash, city));
        }
        debug!("prefix {:?} matched {} entries", prefix, found.len());
        Ok(found)
    }

    pub fn city(&self, id: u64) -> Result<Option<City>, NearbyError> {
        match self.cities.get(id.to_be_bytes())? {
            Some(value) => {
                let (city, _) =
                    bincode::decode_from_slice::<City, _>(&value, bincode::config::standard())?;
                Ok(Some(city))
            }
            None => Ok(None),
        }
    }

    /// Number of entries in the spatial index.
    pub fn index_len(&self) -> usize {
        self.geo_index.len()
    }

    /// Ids of the cities carrying `token`, ascending.
    fn token_ids(&self, token: &str) -> Result<BTreeSet<u64>, NearbyError> {
        let mut ids = BTreeSet::new();
        for entry in self.name_tokens.scan_prefix(token_prefix(token)) {
            let (key, _) = entry?;
            ids.insert(id_from_suffix(&key)?);
        }
        Ok(ids)
    }

    /// Loads IP2Location ranges keyed by their end address, in batches.
    pub fn load_ip_ranges(&self, ranges: Vec<IpRange>) -> Result<usize, NearbyError> {
        let config = bincode::config::standard();
        let total = ranges.len();
        for chunk in ranges.chunks(IP_BATCH_SIZE) {
            let mut batch = sled::Batch::default();
            for range in chunk {
                batch.insert(&range.end_ip.to_be_bytes()[..], bincode::encode_to_vec(range, config)?);
            }
            self.ip_ranges.apply_batch(batch)?;
        }
        info!("loaded {} ip2location ranges", total);
        Ok(total)
    }

    pub fn flush(&self) -> Result<(), NearbyError> {
        self.db.flush()?;
        Ok(())
    }
}

impl NameSearch for CityStore {
    fn find_by_name(&self, query: &str) -> Result<Option<City>, NearbyError> {
        let tokens = tokenize(&normalize_query(query));
        let Some((first, rest)) = tokens.split_first() else {
            return Ok(None);
        };

        let mut ids = self.token_ids(first)?;
        for token in rest {
            if ids.is_empty() {
                break;
            }
            let other = self.token_ids(token)?;
            ids.retain(|id| other.contains(id));
        }

        let mut candidates = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(city) = self.city(id)? {
                candidates.push(city);
            }
        }
        Ok(best_match(&tokens, candidates))
    }
}

impl IpLocator for CityStore {
    fn locate(&self, ip: u32) -> Result<Option<IpRange>, NearbyError> {
        // the first range ending at or after `ip` is the only candidate
        let Some(entry) = self.ip_ranges.range(ip.to_be_bytes()..).next() else {
            return Ok(None);
        };
        let (_, value) = entry?;
        let (range, _) =
            bincode::decode_from_slice::<IpRange, _>(&value, bincode::config::standard())?;
        if range.start_ip <= ip {
            Ok(Some(range))
        } else {
            Ok(None)
        }
    }
}
