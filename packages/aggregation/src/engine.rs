//! Cached area summaries for map viewports.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use medimap_cache::{CacheConfig, CacheRegistry, CacheStatus, Priority};
use medimap_facility::FacilityStore;
use medimap_facility_models::ChangeBatch;
use medimap_geography::{AtlasHandle, GeoError, bounds};
use medimap_geography_models::{AreaSummary, BoundaryType, Bounds, BoundingBox, ClusterPoint, LatLng};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::cluster::ClusterEngine;
use crate::rollup::RollupStore;

/// Produces the summary rows for the regions intersecting a set of boxes.
///
/// This is the upstream computation behind every summary cache miss.
#[async_trait]
pub trait SummarySource: Send + Sync {
    /// Summaries of every `boundary_type` region intersecting any of
    /// `boxes`, in id order.
    async fn summaries(
        &self,
        boundary_type: BoundaryType,
        boxes: &[BoundingBox],
    ) -> Result<Vec<AreaSummary>, GeoError>;
}

/// Reads summary rows from the rollup table through the R-tree.
#[derive(Debug)]
pub struct RollupSummarySource {
    atlas: Arc<AtlasHandle>,
    rollup: Arc<RollupStore>,
}

impl RollupSummarySource {
    /// Creates a source over the given atlas and rollup.
    #[must_use]
    pub const fn new(atlas: Arc<AtlasHandle>, rollup: Arc<RollupStore>) -> Self {
        Self { atlas, rollup }
    }
}

#[async_trait]
impl SummarySource for RollupSummarySource {
    async fn summaries(
        &self,
        boundary_type: BoundaryType,
        boxes: &[BoundingBox],
    ) -> Result<Vec<AreaSummary>, GeoError> {
        let atlas = self.atlas.current();
        let table = self.rollup.table();

        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for bbox in boxes {
            for region in atlas.intersecting(boundary_type, bbox) {
                if seen.insert(region.id.as_str()) {
                    out.push(table.summary(region));
                }
            }
        }
        out.sort_by(|a, b| a.region_id.cmp(&b.region_id));
        Ok(out)
    }
}

type SummaryCache = CacheRegistry<Arc<Vec<AreaSummary>>, GeoError>;
type ClusterCache = CacheRegistry<Arc<Vec<ClusterPoint>>, GeoError>;

/// Serves per-region facility counts for map viewports.
///
/// Viewports are snapped outward to a per-granularity tile grid before
/// caching, so panning within a tile is a cache hit; results are then
/// trimmed to the regions intersecting the exact viewport.
pub struct AggregationEngine {
    atlas: Arc<AtlasHandle>,
    rollup: Arc<RollupStore>,
    facilities: Arc<FacilityStore>,
    source: Arc<dyn SummarySource>,
    cache: Arc<SummaryCache>,
    cluster_cache: Arc<ClusterCache>,
}

impl std::fmt::Debug for AggregationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationEngine")
            .field("cache", &self.cache)
            .field("cluster_cache", &self.cluster_cache)
            .finish_non_exhaustive()
    }
}

impl AggregationEngine {
    /// Creates an engine reading from the rollup of `facilities` over
    /// `atlas`.
    #[must_use]
    pub fn new(atlas: Arc<AtlasHandle>, facilities: Arc<FacilityStore>, config: CacheConfig) -> Self {
        let rollup = Arc::new(RollupStore::new(Arc::clone(&atlas), Arc::clone(&facilities)));
        let source = Arc::new(RollupSummarySource::new(Arc::clone(&atlas), Arc::clone(&rollup)));
        Self::with_source(
            atlas,
            facilities,
            rollup,
            source,
            SummaryCache::new("summaries", config.clone()),
        )
        .with_cluster_cache(ClusterCache::new("clusters", config))
    }

    /// Creates an engine with an explicit summary source and registry.
    #[must_use]
    pub fn with_source(
        atlas: Arc<AtlasHandle>,
        facilities: Arc<FacilityStore>,
        rollup: Arc<RollupStore>,
        source: Arc<dyn SummarySource>,
        cache: SummaryCache,
    ) -> Self {
        Self {
            atlas,
            rollup,
            facilities,
            source,
            cache: Arc::new(cache),
            cluster_cache: Arc::new(ClusterCache::new("clusters", CacheConfig::default())),
        }
    }

    /// Replaces the registry caching facility clusters.
    #[must_use]
    pub fn with_cluster_cache(mut self, cache: ClusterCache) -> Self {
        self.cluster_cache = Arc::new(cache);
        self
    }

    /// The rollup backing the engine.
    #[must_use]
    pub const fn rollup(&self) -> &Arc<RollupStore> {
        &self.rollup
    }

    /// Summaries of every `granularity` region intersecting `bounds`.
    ///
    /// # Errors
    ///
    /// * [`GeoError::InvalidBounds`] if `bounds` is invalid.
    /// * [`GeoError::ComputeTimeout`] if the summary source misses its
    ///   deadline.
    pub async fn summarize(&self, bounds: &Bounds, granularity: BoundaryType) -> Result<Vec<AreaSummary>, GeoError> {
        self.summarize_with(bounds, granularity, Priority::Interactive)
            .await
    }

    /// Like [`Self::summarize`], computing on the given permit pool on a
    /// miss.
    ///
    /// # Errors
    ///
    /// See [`Self::summarize`].
    pub async fn summarize_with(
        &self,
        bounds: &Bounds,
        granularity: BoundaryType,
        priority: Priority,
    ) -> Result<Vec<AreaSummary>, GeoError> {
        let boxes = bounds::validate(bounds)?;
        let snapped = snap_all(&boxes, granularity);
        let key = self.cache_key(granularity, &snapped);

        let source = Arc::clone(&self.source);
        let cached = self
            .cache
            .get_or_compute(&key, priority, move || async move {
                source.summaries(granularity, &snapped).await.map(Arc::new)
            })
            .await?;

        Ok(self.trim(&cached, granularity, &boxes))
    }

    /// Cache status of the entry that would serve `bounds` at `zoom`.
    ///
    /// # Errors
    ///
    /// Returns [`GeoError::InvalidBounds`] if `bounds` is invalid.
    pub fn cache_status(&self, bounds: &Bounds, zoom: f64) -> Result<CacheStatus, GeoError> {
        let granularity = medimap_geography::zoom::resolve(zoom);
        let boxes = bounds::validate(bounds)?;
        let key = self.cache_key(granularity, &snap_all(&boxes, granularity));
        Ok(self.cache.status(&key))
    }

    /// Summaries for `bounds` at `zoom` only if they are cached and fresh.
    ///
    /// # Errors
    ///
    /// Returns [`GeoError::InvalidBounds`] if `bounds` is invalid.
    pub fn cached(&self, bounds: &Bounds, zoom: f64) -> Result<Option<Vec<AreaSummary>>, GeoError> {
        let granularity = medimap_geography::zoom::resolve(zoom);
        let boxes = bounds::validate(bounds)?;
        let key = self.cache_key(granularity, &snap_all(&boxes, granularity));
        Ok(self
            .cache
            .peek(&key)
            .map(|cached| self.trim(&cached, granularity, &boxes)))
    }

    /// The summary row of one region, warming the cache entry covering
    /// its bounding box.
    ///
    /// # Errors
    ///
    /// * [`GeoError::UnknownBoundary`] if the region does not exist.
    /// * See [`Self::summarize`].
    pub async fn region_summary(
        &self,
        boundary_type: BoundaryType,
        id: &str,
        priority: Priority,
    ) -> Result<AreaSummary, GeoError> {
        let bbox = self
            .atlas
            .current()
            .region(boundary_type, id)
            .map(|region| region.bbox)
            .ok_or_else(|| GeoError::unknown(boundary_type, id))?;

        let bounds = Bounds::new(bbox.south, bbox.west, bbox.north, bbox.east);
        self.summarize_with(&bounds, boundary_type, priority)
            .await?
            .into_iter()
            .find(|summary| summary.region_id == id)
            .ok_or_else(|| GeoError::unknown(boundary_type, id))
    }

    /// Every province's summary, in id order.
    #[must_use]
    pub fn province_summary(&self) -> Vec<AreaSummary> {
        let atlas = self.atlas.current();
        let table = self.rollup.table();
        atlas
            .tree()
            .of_type(BoundaryType::Ctp)
            .map(|region| table.summary(region))
            .collect()
    }

    /// Summaries of a region's direct children.
    ///
    /// # Errors
    ///
    /// Returns [`GeoError::UnknownBoundary`] if the region does not exist.
    pub fn children(&self, region_id: &str) -> Result<Vec<AreaSummary>, GeoError> {
        let atlas = self.atlas.current();
        let Some(region) = atlas.tree().get(region_id) else {
            let level = BoundaryType::from_code(region_id).unwrap_or(BoundaryType::Ctp);
            return Err(GeoError::unknown(level, region_id));
        };
        let table = self.rollup.table();
        Ok(atlas
            .tree()
            .children(&region.id)
            .iter()
            .filter_map(|id| atlas.tree().get(id))
            .map(|child| table.summary(child))
            .collect())
    }

    /// Rebuilds the rollup from every facility record and marks cached
    /// summaries stale.
    pub fn reconcile(&self) {
        self.rollup.reconcile();
        self.cache.mark_all_stale();
    }

    /// Applies a facility change batch to the rollup and marks cached
    /// summaries stale if it changed anything.
    pub fn apply(&self, batch: &ChangeBatch) {
        if batch.is_empty() {
            return;
        }
        let before = self.rollup.table();
        let after = self.rollup.apply(batch);
        if !Arc::ptr_eq(&before, &after) {
            self.cache.mark_all_stale();
        }
    }

    /// Clusters of the facilities inside `bounds` and within `radius_m`
    /// metres of `center`, at the clustering radius for the viewport's
    /// zoom.
    ///
    /// Cached per exact viewport, centre and radius together with the
    /// facility store sequence number, so any record change yields a new
    /// key.
    ///
    /// # Errors
    ///
    /// * [`GeoError::InvalidBounds`] if `bounds`, `center` or `radius_m`
    ///   is invalid.
    /// * [`GeoError::ComputeTimeout`] if clustering misses its deadline.
    pub async fn facility_clusters(
        &self,
        clusters: &ClusterEngine,
        bounds: &Bounds,
        center: LatLng,
        radius_m: f64,
    ) -> Result<Arc<Vec<ClusterPoint>>, GeoError> {
        let boxes = bounds::validate(bounds)?;
        if !center.lat.is_finite() || !center.lng.is_finite() {
            return Err(GeoError::invalid_bounds(format!(
                "cluster centre ({}, {}) is not a coordinate",
                center.lat, center.lng
            )));
        }
        if !radius_m.is_finite() || radius_m < 0.0 {
            return Err(GeoError::invalid_bounds(format!(
                "cluster radius {radius_m} is not a non-negative distance"
            )));
        }

        let mut material = format!(
            "{}|{:.6},{:.6}|{radius_m:.1}",
            self.facilities.seq(),
            center.lat,
            center.lng
        );
        for b in &boxes {
            let _ = write!(material, "|{:.6},{:.6},{:.6},{:.6}", b.west, b.south, b.east, b.north);
        }
        let key = format!("clusters:{}", hex::encode(Sha256::digest(material.as_bytes())));

        let facilities = Arc::clone(&self.facilities);
        let engine = clusters.clone();
        self.cluster_cache
            .get_or_compute(&key, Priority::Interactive, move || async move {
                let radius = engine.radius_m(ClusterEngine::zoom_for_boxes(&boxes));
                let nearby = facilities.within_radius(center, radius_m, &boxes);
                let points = ClusterEngine::facility_points(&nearby, radius);
                Ok(Arc::new(ClusterEngine::cluster(points, radius)))
            })
            .await
    }

    /// Removes expired summary and cluster entries.
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired() + self.cluster_cache.purge_expired()
    }

    /// Keeps the rollup current by applying every change set the facility
    /// store broadcasts. A lagging receiver falls back to a full
    /// reconcile.
    pub fn spawn_updater(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut changes = self.facilities.subscribe();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(batch) => engine.apply(&batch),
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Rollup updater lagged by {skipped} change sets, reconciling");
                        engine.reconcile();
                    }
                    Err(RecvError::Closed) => {
                        log::debug!("Facility change channel closed, rollup updater exiting");
                        return;
                    }
                }
            }
        })
    }

    /// Cache key for a snapped viewport: granularity, dataset version, and
    /// the snapped boxes, hashed.
    fn cache_key(&self, granularity: BoundaryType, snapped: &[BoundingBox]) -> String {
        let mut material = format!("{granularity}|{}", self.atlas.current().version());
        for b in snapped {
            let _ = write!(material, "|{:.6},{:.6},{:.6},{:.6}", b.west, b.south, b.east, b.north);
        }
        format!("summary:{granularity}:{}", hex::encode(Sha256::digest(material.as_bytes())))
    }

    /// Keeps only the regions intersecting the exact requested boxes.
    fn trim(&self, cached: &[AreaSummary], granularity: BoundaryType, boxes: &[BoundingBox]) -> Vec<AreaSummary> {
        let atlas = self.atlas.current();
        let wanted: BTreeSet<&str> = boxes
            .iter()
            .flat_map(|bbox| atlas.intersecting(granularity, bbox))
            .map(|region| region.id.as_str())
            .collect();
        cached
            .iter()
            .filter(|summary| wanted.contains(summary.region_id.as_str()))
            .cloned()
            .collect()
    }
}

fn snap_all(boxes: &[BoundingBox], granularity: BoundaryType) -> Vec<BoundingBox> {
    boxes
        .iter()
        .map(|bbox| bounds::snap(bbox, granularity.tile_size_deg()))
        .collect()
}
