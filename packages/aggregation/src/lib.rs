#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Facility counts per administrative region.
//!
//! [`rollup`] attributes every facility to a leaf region and rolls counts
//! up the boundary tree, [`engine`] serves cached per-viewport summaries
//! from that rollup, and [`cluster`] turns summaries into map markers.

pub mod cluster;
pub mod engine;
pub mod rollup;

pub use cluster::{ClusterConfig, ClusterEngine};
pub use engine::{AggregationEngine, RollupSummarySource, SummarySource};
pub use rollup::{RegionCounts, RollupStore, SummaryTable};
