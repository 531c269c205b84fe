//! TTL and Freshness Policies
//!
//! Per-category base TTLs, the payload quality heuristic that scales them,
//! and the edge fresh/stale windows used for stale-while-revalidate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entry::Category;

const DAY: u64 = 24 * 60 * 60;

/// Weights for the quality heuristic. They sum to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    /// Weight for an ISBN being present
    pub isbn: f64,
    /// Weight for a cover image URL being present
    pub cover: f64,
    /// Weight for a substantive description
    pub description: f64,
    /// Minimum description length counted as substantive
    pub min_description_chars: usize,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            isbn: 0.4,
            cover: 0.4,
            description: 0.2,
            min_description_chars: 50,
        }
    }
}

impl QualityWeights {
    /// Score a payload in 0.0 - 1.0
    ///
    /// List payloads (`items`, `works`, `results`, or a bare array) are
    /// scored per item and averaged. An empty list scores 0.
    pub fn score(&self, payload: &Value) -> f64 {
        let items = payload_items(payload);
        if items.is_empty() {
            return 0.0;
        }
        let total: f64 = items.iter().map(|item| self.score_item(item)).sum();
        (total / items.len() as f64).clamp(0.0, 1.0)
    }

    fn score_item(&self, item: &Value) -> f64 {
        let mut score = 0.0;
        if has_any(item, &["isbn", "isbn13", "isbn10", "isbns"]) {
            score += self.isbn;
        }
        if has_any(item, &["coverUrl", "cover_url", "coverImageUrl", "cover"]) {
            score += self.cover;
        }
        let described = item
            .get("description")
            .and_then(Value::as_str)
            .map(|d| d.trim().chars().count() >= self.min_description_chars)
            .unwrap_or(false);
        if described {
            score += self.description;
        }
        score
    }
}

fn payload_items(payload: &Value) -> Vec<&Value> {
    if let Value::Array(items) = payload {
        return items.iter().collect();
    }
    for field in ["items", "works", "results"] {
        if let Some(Value::Array(items)) = payload.get(field) {
            return items.iter().collect();
        }
    }
    match payload {
        Value::Object(_) => vec![payload],
        _ => Vec::new(),
    }
}

fn has_any(item: &Value, fields: &[&str]) -> bool {
    fields.iter().any(|f| match item.get(*f) {
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    })
}

/// Persistent-tier TTL policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlPolicy {
    pub title_secs: u64,
    pub isbn_secs: u64,
    pub author_secs: u64,
    pub enrichment_secs: u64,
    pub cover_secs: u64,
    /// TTL for negative ("no results") entries
    pub negative_secs: u64,
    /// TTL applied to entries promoted from cold storage
    pub rehydrated_secs: u64,
    /// Quality above this doubles the TTL
    pub high_quality: f64,
    /// Quality below this halves the TTL
    pub low_quality: f64,
    pub weights: QualityWeights,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            title_secs: 7 * DAY,
            isbn_secs: 365 * DAY,
            author_secs: 7 * DAY,
            enrichment_secs: 180 * DAY,
            cover_secs: 365 * DAY,
            negative_secs: 5 * 60,
            rehydrated_secs: 7 * DAY,
            high_quality: 0.8,
            low_quality: 0.4,
            weights: QualityWeights::default(),
        }
    }
}

impl TtlPolicy {
    /// Base TTL for a category
    pub fn base_ttl(&self, category: Category) -> Duration {
        let secs = match category {
            Category::Title => self.title_secs,
            Category::Isbn => self.isbn_secs,
            Category::Author => self.author_secs,
            Category::Enrichment => self.enrichment_secs,
            Category::Cover => self.cover_secs,
        };
        Duration::from_secs(secs)
    }

    /// Base TTL scaled by quality: >high ×2, <low ×0.5
    pub fn adjusted_ttl(&self, category: Category, quality: f64) -> Duration {
        let base = self.base_ttl(category);
        if quality > self.high_quality {
            base * 2
        } else if quality < self.low_quality {
            base / 2
        } else {
            base
        }
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_secs)
    }

    pub fn rehydrated_ttl(&self) -> Duration {
        Duration::from_secs(self.rehydrated_secs)
    }

    /// Quality of a payload
    ///
    /// A numeric `quality` or `qualityScore` field set by the enrichment
    /// pipeline wins, clamped to 0.0 - 1.0. Otherwise the payload is scored
    /// with the configured weights.
    pub fn quality_of(&self, payload: &Value) -> f64 {
        embedded_quality(payload).unwrap_or_else(|| self.weights.score(payload))
    }
}

fn embedded_quality(payload: &Value) -> Option<f64> {
    ["quality", "qualityScore"]
        .iter()
        .find_map(|field| payload.get(*field).and_then(Value::as_f64))
        .filter(|q| q.is_finite())
        .map(|q| q.clamp(0.0, 1.0))
}

/// Age classification of an edge entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `age < fresh`
    Fresh,
    /// `fresh <= age < fresh + stale`
    Stale,
    /// Treated as absent
    Expired,
}

/// Edge fresh / stale windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeWindows {
    pub fresh_secs: u64,
    pub stale_secs: u64,
}

impl Default for EdgeWindows {
    fn default() -> Self {
        Self {
            fresh_secs: 3600,
            stale_secs: 86_400,
        }
    }
}

impl EdgeWindows {
    pub fn new(fresh_secs: u64, stale_secs: u64) -> Self {
        Self {
            fresh_secs,
            stale_secs,
        }
    }

    /// Single TTL covering both windows
    pub fn total(&self) -> Duration {
        Duration::from_secs(self.fresh_secs + self.stale_secs)
    }

    /// Shrink the windows so the total never exceeds `ttl`
    pub fn capped(&self, ttl: Duration) -> Self {
        let cap = ttl.as_secs();
        let fresh = self.fresh_secs.min(cap);
        let stale = self.stale_secs.min(cap - fresh);
        Self::new(fresh, stale)
    }

    pub fn classify(&self, age: Duration) -> Freshness {
        let age = age.as_secs_f64();
        if age < self.fresh_secs as f64 {
            Freshness::Fresh
        } else if age < (self.fresh_secs + self.stale_secs) as f64 {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
