//! Tiered Response Cache
//!
//! Edge, persistent and cold tiers behind a single router.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            CacheRouter                               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Edge (process-local)  │ Persistent (shared KV) │ Cold (object store) │
//! │  ┌──────────────────┐  │ ┌───────────────────┐  │ ┌─────────────────┐ │
//! │  │ fresh / stale    │  │ │ quality-adjusted  │  │ │ LZ4 archives    │ │
//! │  │ windows (SWR)    │  │ │ TTL per category  │  │ │ + cold index    │ │
//! │  └──────────────────┘  │ └───────────────────┘  │ └─────────────────┘ │
//! │          │             │           │            │          │          │
//! │          └─────────────┴───────────┴────────────┴──────────┘          │
//! │                                  │                                    │
//! │        Coalescer · NegativeCache · background refresh/rehydration     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the persistent and cold tiers are shared between instances. Each
//! process owns its own edge tier and coalescer.

pub mod coalescer;
pub mod cold;
pub mod edge;
pub mod entry;
pub mod headers;
pub mod metrics;
pub mod negative;
pub mod persistent;
pub mod policy;
pub mod router;

pub use coalescer::{Coalescer, InFlightGuard};
pub use cold::{
    decode_archive, encode_archive, ColdConfig, ColdIndex, ColdIndexEntry, ColdTier,
    InMemoryObjectStore, ObjectStore, Rehydration,
};
pub use edge::{EdgeConfig, EdgeHit, EdgeStats, EdgeTier};
pub use entry::{normalize_query, AlertRecord, CacheEntry, CacheKey, Category, Page, WarmedMarker};
pub use headers::CacheHeaders;
pub use metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
pub use negative::{is_empty_result, NegativeCache};
pub use persistent::{InMemoryKvStore, KvStore, KvStoreStats, Namespace, PersistentTier};
pub use policy::{EdgeWindows, Freshness, QualityWeights, TtlPolicy};
pub use router::{
    CacheHit, CacheLookup, CacheRouter, CacheSource, CacheTiers, Resolved, RouterConfig,
};
