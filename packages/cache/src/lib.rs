#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Cache status registry with single-flight computation.
//!
//! Every cached payload in the map backend (area summaries, boundary
//! geometry) goes through a [`CacheRegistry`]. The registry tracks each
//! key through `Missing → Computing → Fresh → Stale → Computing`, hands
//! out a time-bounded lease to the first caller that misses, and makes
//! every concurrent caller for the same key wait on that one computation.
//!
//! Published entries are immutable `Arc` snapshots, so readers only take
//! a short read lock and never observe a partially written entry.

pub mod clock;
mod registry;

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum_macros::{AsRefStr, Display};

pub use registry::{CacheConfig, CacheEntry, CacheRegistry, Validator};

/// Errors produced by the registry itself.
///
/// Callers plug their own error type into [`CacheRegistry`] and convert
/// these with `From`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The upstream computation did not finish within its deadline.
    #[error("Computation for '{key}' exceeded its {deadline_ms}ms deadline")]
    ComputeTimeout {
        /// Cache key being computed.
        key: String,
        /// Deadline that was exceeded, in milliseconds.
        deadline_ms: u64,
    },

    /// The computation ended without publishing a result (its lease was
    /// taken over or its task died).
    #[error("Computation for '{key}' was abandoned before producing a result")]
    Abandoned {
        /// Cache key being computed.
        key: String,
    },

    /// The permit pool for the computation was closed.
    #[error("Compute pool '{pool}' is closed")]
    PoolClosed {
        /// Name of the pool.
        pool: Priority,
    },
}

/// Which permit pool an upstream computation runs on.
///
/// Interactive requests and bulk warming use separate pools so a large
/// warm batch cannot occupy every upstream slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Priority {
    /// Map requests issued by clients.
    Interactive,
    /// Batch cache warming.
    Background,
}

/// Lifecycle state of a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum CacheState {
    /// No entry and no computation.
    Missing,
    /// A computation holds a live lease.
    Computing,
    /// An entry exists and is within its TTL.
    Fresh,
    /// An entry exists but expired or was marked stale.
    Stale,
}

/// Point-in-time view of one key, as reported by the cache-status
/// endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    /// Current lifecycle state.
    pub state: CacheState,
    /// `true` only when a fresh entry can be served without computing.
    pub is_cached: bool,
    /// When the current entry was computed.
    pub last_updated: Option<DateTime<Utc>>,
    /// When the current entry stops being fresh.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheStatus {
    /// Status of a key with no entry.
    #[must_use]
    pub const fn missing() -> Self {
        Self {
            state: CacheState::Missing,
            is_cached: false,
            last_updated: None,
            expires_at: None,
        }
    }
}
