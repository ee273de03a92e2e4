#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Administrative boundary dataset and viewport geometry.
//!
//! Loads the province / district / neighborhood / sub-neighborhood
//! polygons from a GIS source into an [`Atlas`] (boundary tree plus
//! R-tree index), and provides the pure helpers every map request goes
//! through first: bounds validation, tile snapping, and zoom-to-level
//! resolution.

pub mod atlas;
pub mod bounds;
#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;
pub mod source;
pub mod tree;
pub mod zoom;

use medimap_cache::CacheError;
use medimap_geography_models::BoundaryType;
use thiserror::Error;

pub use atlas::{Atlas, AtlasHandle};
pub use source::{BoundaryGeometry, FileGisSource, GisFeature, GisSource, InMemoryGisSource};
pub use tree::BoundaryTree;

/// Errors shared by every map operation.
///
/// `Clone` because a single computed result, error included, is handed to
/// every caller coalesced onto the same cache key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeoError {
    /// Bounds were non-finite, out of range, or inverted.
    #[error("Invalid bounds: {message}")]
    InvalidBounds {
        /// Description of what was wrong.
        message: String,
    },

    /// No boundary matched the requested id, name, or point.
    #[error("Unknown {boundary_type} boundary: {key}")]
    UnknownBoundary {
        /// Level that was searched.
        boundary_type: BoundaryType,
        /// The id, name, or coordinate that did not resolve.
        key: String,
    },

    /// An upstream computation missed its deadline.
    #[error("Computation for '{key}' timed out after {deadline_ms}ms")]
    ComputeTimeout {
        /// Cache key being computed.
        key: String,
        /// Deadline in milliseconds.
        deadline_ms: u64,
    },

    /// An upstream source failed.
    #[error("Upstream error: {message}")]
    Upstream {
        /// Description of the failure.
        message: String,
    },

    /// The GIS dataset could not be read or parsed.
    #[error("Dataset error: {message}")]
    Dataset {
        /// Description of the failure.
        message: String,
    },
}

impl GeoError {
    /// Shorthand for [`GeoError::InvalidBounds`].
    pub fn invalid_bounds(message: impl Into<String>) -> Self {
        Self::InvalidBounds {
            message: message.into(),
        }
    }

    /// Shorthand for [`GeoError::UnknownBoundary`].
    pub fn unknown(boundary_type: BoundaryType, key: impl Into<String>) -> Self {
        Self::UnknownBoundary {
            boundary_type,
            key: key.into(),
        }
    }

    /// Shorthand for [`GeoError::Dataset`].
    pub fn dataset(message: impl Into<String>) -> Self {
        Self::Dataset {
            message: message.into(),
        }
    }
}

impl From<CacheError> for GeoError {
    fn from(value: CacheError) -> Self {
        match value {
            CacheError::ComputeTimeout { key, deadline_ms } => {
                Self::ComputeTimeout { key, deadline_ms }
            }
            other @ (CacheError::Abandoned { .. } | CacheError::PoolClosed { .. }) => {
                Self::Upstream {
                    message: other.to_string(),
                }
            }
        }
    }
}
