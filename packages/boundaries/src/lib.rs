#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Boundary geometry store.
//!
//! Serves boundary polygons by id, by containing point, or by name. The
//! serialized geometry is loaded from the GIS source once and cached with
//! a long TTL; every entry carries a SHA-256 digest that is re-checked on
//! read, so a corrupted payload is dropped and reloaded instead of served.

use std::sync::Arc;

use medimap_cache::{CacheConfig, CacheRegistry, CacheStatus, Priority};
use medimap_geography::{AtlasHandle, BoundaryGeometry, GeoError, GisSource};
use medimap_geography_models::BoundaryType;

/// Cache-aside store for boundary geometry.
pub struct BoundaryGeometryStore {
    source: Arc<dyn GisSource>,
    atlas: Arc<AtlasHandle>,
    cache: Arc<CacheRegistry<Arc<BoundaryGeometry>, GeoError>>,
}

impl std::fmt::Debug for BoundaryGeometryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundaryGeometryStore")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Cache key for one boundary.
fn cache_key(boundary_type: BoundaryType, id: &str) -> String {
    format!("{boundary_type}:{id}")
}

impl BoundaryGeometryStore {
    /// Creates a store over `source`, resolving ids, points, and names
    /// through `atlas`.
    #[must_use]
    pub fn new(source: Arc<dyn GisSource>, atlas: Arc<AtlasHandle>, config: CacheConfig) -> Self {
        let cache = CacheRegistry::new("boundaries", config)
            .with_validator(Arc::new(|geometry: &Arc<BoundaryGeometry>| geometry.verify()));
        Self::with_registry(source, atlas, cache)
    }

    /// Creates a store around a pre-built registry.
    #[must_use]
    pub fn with_registry(
        source: Arc<dyn GisSource>,
        atlas: Arc<AtlasHandle>,
        cache: CacheRegistry<Arc<BoundaryGeometry>, GeoError>,
    ) -> Self {
        Self {
            source,
            atlas,
            cache: Arc::new(cache),
        }
    }

    /// Geometry of one boundary.
    ///
    /// # Errors
    ///
    /// * [`GeoError::UnknownBoundary`] if the id does not exist at
    ///   `boundary_type`.
    /// * [`GeoError::ComputeTimeout`] if the source misses its deadline.
    pub async fn get(&self, boundary_type: BoundaryType, id: &str) -> Result<Arc<BoundaryGeometry>, GeoError> {
        self.get_with(boundary_type, id, Priority::Interactive).await
    }

    /// Like [`Self::get`], loading on the given permit pool on a miss.
    ///
    /// # Errors
    ///
    /// See [`Self::get`].
    pub async fn get_with(
        &self,
        boundary_type: BoundaryType,
        id: &str,
        priority: Priority,
    ) -> Result<Arc<BoundaryGeometry>, GeoError> {
        let atlas = self.atlas.current();
        // An empty atlas means the dataset has not loaded yet; let the
        // source decide.
        if !atlas.tree().is_empty() && atlas.region(boundary_type, id).is_none() {
            return Err(GeoError::unknown(boundary_type, id));
        }

        let source = Arc::clone(&self.source);
        let owned_id = id.to_string();
        self.cache
            .get_or_compute(&cache_key(boundary_type, id), priority, move || async move {
                log::debug!("Loading {boundary_type} geometry {owned_id}");
                source
                    .load_geometry(boundary_type, &owned_id)
                    .await
                    .map(Arc::new)
            })
            .await
    }

    /// Geometry of the boundary at `boundary_type` containing a point.
    ///
    /// # Errors
    ///
    /// * [`GeoError::InvalidBounds`] if the coordinate is invalid.
    /// * [`GeoError::UnknownBoundary`] if no boundary contains it.
    /// * See [`Self::get`].
    pub async fn get_by_point(
        &self,
        boundary_type: BoundaryType,
        lat: f64,
        lng: f64,
    ) -> Result<Arc<BoundaryGeometry>, GeoError> {
        if !lat.is_finite() || !lng.is_finite() || !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(GeoError::invalid_bounds(format!("invalid coordinate ({lat}, {lng})")));
        }
        let id = self
            .atlas
            .current()
            .region_at(boundary_type, lat, lng)
            .map(|region| region.id.clone())
            .ok_or_else(|| GeoError::unknown(boundary_type, format!("({lat}, {lng})")))?;
        self.get(boundary_type, &id).await
    }

    /// Geometry of the boundary at `boundary_type` with the given name.
    ///
    /// # Errors
    ///
    /// * [`GeoError::UnknownBoundary`] if no boundary has that name.
    /// * See [`Self::get`].
    pub async fn get_by_name(&self, boundary_type: BoundaryType, name: &str) -> Result<Arc<BoundaryGeometry>, GeoError> {
        let id = self
            .atlas
            .current()
            .tree()
            .find_by_name(boundary_type, name)
            .map(|region| region.id.clone())
            .ok_or_else(|| GeoError::unknown(boundary_type, name))?;
        self.get(boundary_type, &id).await
    }

    /// Cache status of one boundary.
    #[must_use]
    pub fn cache_status(&self, boundary_type: BoundaryType, id: &str) -> CacheStatus {
        self.cache.status(&cache_key(boundary_type, id))
    }

    /// Drops every cached geometry. Called after a dataset version bump.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Removes expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }
}
