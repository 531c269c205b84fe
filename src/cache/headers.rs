//! HTTP cache headers for lookup results

use hyper::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL};

use super::policy::EdgeWindows;
use super::router::{CacheLookup, CacheSource, Resolved};

pub const X_CACHE: &str = "x-cache";
pub const X_CACHE_SOURCE: &str = "x-cache-source";

/// `X-Cache`, `X-Cache-Source` and `Cache-Control` values for one response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHeaders {
    /// HIT, MISS or STALE
    pub x_cache: &'static str,
    /// EDGE, PERSISTENT, COLD or MISS
    pub x_cache_source: &'static str,
    pub cache_control: String,
}

impl CacheHeaders {
    fn new(x_cache: &'static str, x_cache_source: &'static str, windows: EdgeWindows) -> Self {
        Self {
            x_cache,
            x_cache_source,
            cache_control: format!(
                "public, max-age={}, stale-while-revalidate={}",
                windows.fresh_secs, windows.stale_secs
            ),
        }
    }

    pub fn for_lookup(lookup: &CacheLookup, windows: EdgeWindows) -> Self {
        match lookup {
            CacheLookup::Hit(hit) => Self::for_source(hit.source, windows),
            CacheLookup::Empty { source } => Self::new("HIT", source_value(*source), windows),
            CacheLookup::Miss { cold: true } => Self::new("MISS", "COLD", windows),
            CacheLookup::Miss { cold: false } => Self::new("MISS", "MISS", windows),
        }
    }

    pub fn for_resolved(resolved: &Resolved, windows: EdgeWindows) -> Self {
        match resolved {
            Resolved::Cached(hit) => Self::for_source(hit.source, windows),
            Resolved::ConfirmedEmpty { source } => {
                Self::new("HIT", source_value(*source), windows)
            }
            Resolved::Fetched(_) | Resolved::FetchedEmpty => Self::new("MISS", "MISS", windows),
        }
    }

    fn for_source(source: CacheSource, windows: EdgeWindows) -> Self {
        let x_cache = match source {
            CacheSource::EdgeStale => "STALE",
            CacheSource::EdgeFresh | CacheSource::Persistent => "HIT",
        };
        Self::new(x_cache, source_value(source), windows)
    }

    /// Insert the headers, replacing existing values
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(
            HeaderName::from_static(X_CACHE),
            HeaderValue::from_static(self.x_cache),
        );
        headers.insert(
            HeaderName::from_static(X_CACHE_SOURCE),
            HeaderValue::from_static(self.x_cache_source),
        );
        // Built from integers only, always a valid header value
        if let Ok(value) = HeaderValue::from_str(&self.cache_control) {
            headers.insert(CACHE_CONTROL, value);
        }
    }

    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.apply(&mut headers);
        headers
    }
}

fn source_value(source: CacheSource) -> &'static str {
    match source {
        CacheSource::EdgeFresh | CacheSource::EdgeStale => "EDGE",
        CacheSource::Persistent => "PERSISTENT",
    }
}
