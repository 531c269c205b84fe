//! Error types for tomecache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache core and its jobs
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Cache Tier Errors
    // =========================================================================
    /// I/O failure talking to a tier. Recovered locally as a miss or no-op.
    #[error("{tier} tier unavailable: {reason}")]
    TierUnavailable { tier: String, reason: String },

    /// Provider-fetch collaborator failed
    #[error("Provider fetch failed for {key}: {reason}")]
    ProviderFailure { key: String, reason: String },

    /// Cold promote failed; the cold index entry is left intact
    #[error("Rehydration failed for {key}: {reason}")]
    RehydrationFailure { key: String, reason: String },

    /// A single warming candidate failed
    #[error("Warming job failed for '{query}': {reason}")]
    WarmingJobFailure { query: String, reason: String },

    /// Alert could not be delivered
    #[error("Alert delivery failed: {0}")]
    AlertDeliveryFailure(String),

    /// Cache key does not follow the key grammar
    #[error("Invalid cache key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Warming queue is closed
    #[error("Warming queue closed")]
    QueueClosed,

    // =========================================================================
    // Ambient Errors
    // =========================================================================
    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a `TierUnavailable` error
    pub fn tier(tier: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::TierUnavailable {
            tier: tier.into(),
            reason: reason.to_string(),
        }
    }

    /// Short, stable label used for metrics dimensions
    pub fn kind(&self) -> &'static str {
        match self {
            Error::TierUnavailable { .. } => "tier_unavailable",
            Error::ProviderFailure { .. } => "provider_failure",
            Error::RehydrationFailure { .. } => "rehydration_failure",
            Error::WarmingJobFailure { .. } => "warming_job_failure",
            Error::AlertDeliveryFailure(_) => "alert_delivery_failure",
            Error::InvalidKey { .. } => "invalid_key",
            Error::QueueClosed => "queue_closed",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Http(_) => "http",
            Error::Config(_) => "config",
            Error::CompressionFailed { .. } => "compression",
            Error::DecompressionFailed { .. } => "decompression",
            Error::Internal(_) => "internal",
        }
    }
}
