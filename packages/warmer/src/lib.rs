#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Batch cache warming.
//!
//! Given a list of boundary ids, prefetches each boundary's geometry and
//! its own area summary on the background permit pool, a bounded number
//! at a time. One bad id never aborts the batch; it is reported in
//! [`WarmReport::failed`] alongside the ids that succeeded.

use std::str::FromStr as _;
use std::sync::Arc;

use futures::stream::{self, StreamExt as _};
use medimap_aggregation::AggregationEngine;
use medimap_boundaries::BoundaryGeometryStore;
use medimap_cache::Priority;
use medimap_geography::GeoError;
use medimap_geography_models::BoundaryType;
use serde::Serialize;

/// Ids warmed at once unless configured otherwise.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// One id that could not be warmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmFailure {
    /// The id as requested.
    pub id: String,
    /// Why it failed.
    pub error: String,
}

/// Outcome of a warm batch. Both lists keep request order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmReport {
    /// Ids whose geometry and summary are now cached.
    pub succeeded: Vec<String>,
    /// Ids that failed, with the reason.
    pub failed: Vec<WarmFailure>,
}

/// Parses a boundary id: either `type:id` or a bare code whose level is
/// inferred from its length.
///
/// # Errors
///
/// Returns a message if the type prefix or code length is unrecognized.
pub fn parse_boundary_id(raw: &str) -> Result<(BoundaryType, String), String> {
    let raw = raw.trim();
    if let Some((prefix, id)) = raw.split_once(':') {
        let boundary_type =
            BoundaryType::from_str(prefix).map_err(|_| format!("Unknown boundary type '{prefix}'"))?;
        if id.is_empty() {
            return Err(format!("Missing id after '{prefix}:'"));
        }
        return Ok((boundary_type, id.to_string()));
    }

    BoundaryType::from_code(raw)
        .map(|boundary_type| (boundary_type, raw.to_string()))
        .ok_or_else(|| format!("Cannot infer boundary type of '{raw}'"))
}

/// Warms geometry and summary caches for batches of boundaries.
#[derive(Debug)]
pub struct BatchWarmer {
    geometry: Arc<BoundaryGeometryStore>,
    aggregation: Arc<AggregationEngine>,
    concurrency: usize,
}

impl BatchWarmer {
    /// Creates a warmer with [`DEFAULT_CONCURRENCY`].
    #[must_use]
    pub const fn new(geometry: Arc<BoundaryGeometryStore>, aggregation: Arc<AggregationEngine>) -> Self {
        Self {
            geometry,
            aggregation,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Sets how many ids are warmed at once. Zero is treated as one.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Warms every id, reporting per-id success or failure.
    pub async fn warm(&self, ids: &[String]) -> WarmReport {
        log::info!("Warming {} boundaries (concurrency={})", ids.len(), self.concurrency);

        let mut results: Vec<(usize, Result<(), String>)> = stream::iter(ids.iter().enumerate().map(
            |(index, raw)| async move { (index, self.warm_one(raw).await) },
        ))
        .buffer_unordered(self.concurrency)
        .collect()
        .await;
        results.sort_unstable_by_key(|(index, _)| *index);

        let mut report = WarmReport::default();
        for (index, result) in results {
            let id = ids[index].clone();
            match result {
                Ok(()) => report.succeeded.push(id),
                Err(error) => {
                    log::warn!("Failed to warm '{id}': {error}");
                    report.failed.push(WarmFailure { id, error });
                }
            }
        }

        log::info!(
            "Warmed {} boundaries, {} failed",
            report.succeeded.len(),
            report.failed.len()
        );
        report
    }

    async fn warm_one(&self, raw: &str) -> Result<(), String> {
        let (boundary_type, id) = parse_boundary_id(raw)?;
        self.geometry
            .get_with(boundary_type, &id, Priority::Background)
            .await
            .map_err(|e: GeoError| e.to_string())?;
        self.aggregation
            .region_summary(boundary_type, &id, Priority::Background)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}
