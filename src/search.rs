//! City name resolution.
//!
//! Queries are normalized by stripping Unicode punctuation and split into
//! lowercase alphanumeric tokens with diacritics folded away, so "Ha Noi"
//! and "Hà Nội" produce the same tokens. A city matches when every query
//! token appears among the tokens of its name, ASCII name, admin region or
//! country.
use std::collections::BTreeSet;

use lazy_static::lazy_static;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::NearbyError;
use crate::city::City;

lazy_static! {
    static ref PUNCTUATION: Regex = Regex::new(r"\p{P}").expect("punctuation pattern compiles");
}

/// Resolves a free-text city name to a single city.
pub trait NameSearch {
    /// Returns the best matching city, or `None` when nothing matches.
    fn find_by_name(&self, query: &str) -> Result<Option<City>, NearbyError>;
}

/// Removes every Unicode punctuation character.
pub fn normalize_query(query: &str) -> String {
    PUNCTUATION.replace_all(query, "").into_owned()
}

/// Lowercases a token and strips its diacritics.
///
/// Letters whose stroke is not a combining mark have no decomposition and
/// are mapped by hand.
pub fn fold_diacritics(token: &str) -> String {
    token
        .to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| match c {
            'đ' | 'ð' => 'd',
            'ø' => 'o',
            'ł' => 'l',
            'ħ' => 'h',
            'ı' => 'i',
            other => other,
        })
        .collect()
}

/// Splits text into folded alphanumeric tokens, deduplicated, in first-seen order.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(fold_diacritics)
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

/// Tokens a city is searchable by.
pub(crate) fn city_tokens(city: &City) -> BTreeSet<String> {
    [&city.name, &city.ascii_name, &city.admin_name, &city.country]
        .iter()
        .flat_map(|field| tokenize(field))
        .collect()
}

fn is_exact_name(city: &City, query_tokens: &[String]) -> bool {
    tokenize(&city.name) == query_tokens || tokenize(&city.ascii_name) == query_tokens
}

/// Picks one city among several token matches.
///
/// A city whose name or ASCII name is exactly the query wins over one that
/// only matched through its region or country. Then the larger population
/// wins, then the lower id.
pub fn best_match(query_tokens: &[String], candidates: Vec<City>) -> Option<City> {
    candidates.into_iter().min_by(|a, b| {
        let exact_a = is_exact_name(a, query_tokens);
        let exact_b = is_exact_name(b, query_tokens);
        exact_b
            .cmp(&exact_a)
            .then_with(|| b.population.cmp(&a.population))
            .then_with(|| a.id.cmp(&b.id))
    })
}

/// Linear-scan search over an in-memory list of cities.
#[derive(Debug, Clone, Default)]
pub struct MemoryNameSearch {
    cities: Vec<City>,
}

impl MemoryNameSearch {
    pub fn new(cities: Vec<City>) -> Self {
        Self { cities }
    }
}

impl NameSearch for MemoryNameSearch {
    fn find_by_name(&self, query: &str) -> Result<Option<City>, NearbyError> {
        let tokens = tokenize(&normalize_query(query));
        if tokens.is_empty() {
            return Ok(None);
        }
        let matches = self
            .cities
            .iter()
            .filter(|c| {
                let city_tokens = city_tokens(c);
                tokens.iter().all(|t| city_tokens.contains(t))
            })
            .cloned()
            .collect();
        Ok(best_match(&tokens, matches))
    }
}
