//! Cache Entry Types
//!
//! Typed cache keys following the `{category}:{query}[:{offset}:{limit}:{sort}]`
//! grammar, and the stored entry record shared by every tier.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Payload category. Drives the base TTL and warming selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Title search results
    Title,
    /// Single-edition lookups by ISBN
    Isbn,
    /// Author bibliographies
    Author,
    /// Enrichment metadata
    Enrichment,
    /// Cover image records
    Cover,
}

impl Category {
    /// Key prefix / metrics label
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Title => "title",
            Category::Isbn => "isbn",
            Category::Author => "author",
            Category::Enrichment => "enrichment",
            Category::Cover => "cover",
        }
    }

    /// All categories
    pub fn all() -> [Category; 5] {
        [
            Category::Title,
            Category::Isbn,
            Category::Author,
            Category::Enrichment,
            Category::Cover,
        ]
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "title" => Ok(Category::Title),
            "isbn" => Ok(Category::Isbn),
            "author" => Ok(Category::Author),
            "enrichment" => Ok(Category::Enrichment),
            "cover" => Ok(Category::Cover),
            other => Err(Error::InvalidKey {
                key: other.to_string(),
                reason: "unknown category".into(),
            }),
        }
    }
}

/// Pagination suffix for list-shaped queries
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Page {
    pub offset: u32,
    pub limit: u32,
    pub sort: String,
}

impl Page {
    pub fn new(offset: u32, limit: u32, sort: impl Into<String>) -> Self {
        Self {
            offset,
            limit,
            sort: sort.into().trim().to_lowercase(),
        }
    }
}

/// Cache key. Identical logical queries render to identical strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    category: Category,
    query: String,
    page: Option<Page>,
}

impl CacheKey {
    /// Create a key for an unpaged query
    pub fn new(category: Category, query: &str) -> Self {
        Self {
            category,
            query: normalize_query(category, query),
            page: None,
        }
    }

    /// Create a paged key (author bibliographies and other list queries)
    pub fn paged(category: Category, query: &str, page: Page) -> Self {
        Self {
            category,
            query: normalize_query(category, query),
            page: Some(page),
        }
    }

    pub fn title(query: &str) -> Self {
        Self::new(Category::Title, query)
    }

    pub fn isbn(isbn: &str) -> Self {
        Self::new(Category::Isbn, isbn)
    }

    pub fn author(name: &str, offset: u32, limit: u32, sort: &str) -> Self {
        Self::paged(Category::Author, name, Page::new(offset, limit, sort))
    }

    /// Parse a rendered key
    ///
    /// The trailing `:{offset}:{limit}:{sort}` triple is only recognised when
    /// offset and limit are numeric, so queries may themselves contain `:`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (category, rest) = raw.split_once(':').ok_or_else(|| Error::InvalidKey {
            key: raw.to_string(),
            reason: "missing category prefix".into(),
        })?;
        let category: Category = category.parse().map_err(|_| Error::InvalidKey {
            key: raw.to_string(),
            reason: format!("unknown category '{}'", category),
        })?;

        if rest.trim().is_empty() {
            return Err(Error::InvalidKey {
                key: raw.to_string(),
                reason: "empty query".into(),
            });
        }

        let parts: Vec<&str> = rest.rsplitn(4, ':').collect();
        if parts.len() == 4 {
            // rsplitn yields [sort, limit, offset, query]
            if let (Ok(offset), Ok(limit)) = (parts[2].parse::<u32>(), parts[1].parse::<u32>()) {
                return Ok(Self::paged(
                    category,
                    parts[3],
                    Page::new(offset, limit, parts[0]),
                ));
            }
        }

        Ok(Self::new(category, rest))
    }

    #[inline]
    pub fn category(&self) -> Category {
        self.category
    }

    /// Normalized query text (what analytics group by)
    #[inline]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[inline]
    pub fn page(&self) -> Option<&Page> {
        self.page.as_ref()
    }

    /// Canonical string form
    pub fn render(&self) -> String {
        match &self.page {
            Some(p) => format!(
                "{}:{}:{}:{}:{}",
                self.category, self.query, p.offset, p.limit, p.sort
            ),
            None => format!("{}:{}", self.category, self.query),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Lowercase, trim and collapse whitespace. ISBNs also drop separators.
pub fn normalize_query(category: Category, raw: &str) -> String {
    let collapsed = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    match category {
        Category::Isbn => collapsed
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect(),
        _ => collapsed,
    }
}

/// Entry stored in the persistent and edge tiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Rendered cache key
    pub key: String,
    pub category: Category,
    /// Opaque JSON payload (null for negative entries)
    pub payload: serde_json::Value,
    /// "No results" marker
    #[serde(default)]
    pub negative: bool,
    pub stored_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    /// Completeness heuristic, 0.0 - 1.0
    pub quality_score: f64,
}

impl CacheEntry {
    /// Create a positive entry
    pub fn positive(
        key: &CacheKey,
        payload: serde_json::Value,
        quality_score: f64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.render(),
            category: key.category(),
            payload,
            negative: false,
            stored_at: now,
            ttl_seconds: ttl.as_secs(),
            quality_score: quality_score.clamp(0.0, 1.0),
        }
    }

    /// Create a negative ("confirmed empty") entry
    pub fn negative(key: &CacheKey, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key: key.render(),
            category: key.category(),
            payload: serde_json::Value::Null,
            negative: true,
            stored_at: now,
            ttl_seconds: ttl.as_secs(),
            quality_score: 0.0,
        }
    }

    /// Age relative to `now` (zero if stored in the future)
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.stored_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now) >= self.ttl()
    }

    /// Time left before expiry
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        self.ttl().saturating_sub(self.age(now))
    }

    /// Copy restamped at `now` with a new TTL (used by rehydration)
    pub fn restamped(&self, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            stored_at: now,
            ttl_seconds: ttl.as_secs(),
            ..self.clone()
        }
    }
}

/// Marks an entity as pre-populated by the warming pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmedMarker {
    pub key: String,
    pub warmed_at: DateTime<Utc>,
}

/// Last delivery of a given set of alert types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    /// Sorted alert types joined with `,`
    pub alert_type_set_key: String,
    pub last_sent_at: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_key_rendering() {
        assert_eq!(
            CacheKey::title("  The   Hobbit ").render(),
            "title:the hobbit"
        );
        assert_eq!(
            CacheKey::isbn("978-0-451-52493-5").render(),
            "isbn:9780451524935"
        );
        assert_eq!(
            CacheKey::author("Stephen King", 0, 100, "publicationYear").render(),
            "author:stephen king:0:100:publicationyear"
        );
    }

    #[test]
    fn test_key_parse_paged() {
        let key = CacheKey::parse("author:stephen king:20:50:title").unwrap();
        assert_eq!(key.category(), Category::Author);
        assert_eq!(key.query(), "stephen king");
        assert_eq!(key.page(), Some(&Page::new(20, 50, "title")));
        assert_eq!(key.render(), "author:stephen king:20:50:title");
    }

    #[test]
    fn test_key_parse_query_with_colons() {
        let key = CacheKey::parse("title:star wars: a new hope").unwrap();
        assert_eq!(key.query(), "star wars: a new hope");
        assert!(key.page().is_none());
    }

    #[test]
    fn test_key_parse_rejects_garbage() {
        assert!(CacheKey::parse("nocategory").is_err());
        assert!(CacheKey::parse("movie:alien").is_err());
        assert!(CacheKey::parse("title:   ").is_err());
    }

    #[test]
    fn test_category_roundtrip() {
        for c in Category::all() {
            assert_eq!(c.as_str().parse::<Category>().unwrap(), c);
        }
    }

    #[test]
    fn test_entry_expiry() {
        let now = Utc::now();
        let key = CacheKey::title("dune");
        let entry = CacheEntry::positive(&key, json!({"t": 1}), 0.5, Duration::from_secs(60), now);

        assert!(!entry.is_expired(now));
        assert!(!entry.is_expired(now + chrono::Duration::seconds(59)));
        assert!(entry.is_expired(now + chrono::Duration::seconds(60)));
        assert_eq!(
            entry.remaining_ttl(now + chrono::Duration::seconds(20)),
            Duration::from_secs(40)
        );
    }

    #[test]
    fn test_negative_entry_serializes_flag() {
        let entry = CacheEntry::negative(&CacheKey::title("zzz"), Duration::from_secs(300), Utc::now());
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["negative"], json!(true));
        assert_eq!(json["ttlSeconds"], json!(300));
    }

    proptest! {
        #[test]
        fn prop_normalization_is_idempotent(raw in "[ a-zA-Z0-9-]{1,40}") {
            let once = normalize_query(Category::Title, &raw);
            let twice = normalize_query(Category::Title, &once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_case_and_spacing_do_not_change_key(word in "[a-z]{1,12}", pad in 0usize..4) {
            let padded = format!("{}{}{}", " ".repeat(pad), word.to_uppercase(), " ".repeat(pad));
            prop_assert_eq!(CacheKey::title(&padded), CacheKey::title(&word));
        }
    }
}
