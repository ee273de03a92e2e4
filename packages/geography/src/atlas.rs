//! The loaded boundary dataset.
//!
//! An [`Atlas`] bundles the boundary tree with the R-tree index built from
//! the same features and the dataset version they came from. It is
//! immutable; a dataset version bump builds a new one and swaps it into
//! the [`AtlasHandle`].

use std::sync::{Arc, PoisonError, RwLock};

use geo::Centroid;
use medimap_geography_models::{BoundaryRegion, BoundaryType, BoundingBox, LatLng};
use medimap_spatial::SpatialIndex;

use crate::source::{GisFeature, GisSource};
use crate::tree::BoundaryTree;
use crate::GeoError;

/// Boundary tree, spatial index, and dataset version.
#[derive(Debug, Default)]
pub struct Atlas {
    version: String,
    tree: BoundaryTree,
    index: SpatialIndex,
}

impl Atlas {
    /// Builds an atlas from raw features.
    ///
    /// Features with empty geometry, and features whose parent cannot be
    /// found, are skipped with a warning.
    #[must_use]
    pub fn build(version: impl Into<String>, features: Vec<GisFeature>) -> Self {
        let version = version.into();
        let mut regions = Vec::with_capacity(features.len());
        let mut polygons = Vec::with_capacity(features.len());

        for feature in features {
            let (Some(centroid), Some(bbox)) = (
                feature.geometry.centroid(),
                medimap_spatial::bounding_box(&feature.geometry),
            ) else {
                log::warn!(
                    "Skipping {} boundary {}: empty geometry",
                    feature.boundary_type,
                    feature.id
                );
                continue;
            };

            regions.push(BoundaryRegion {
                id: feature.id.clone(),
                boundary_type: feature.boundary_type,
                name: feature.name.clone(),
                parent_id: feature.resolved_parent_id(),
                centroid: LatLng::new(centroid.y(), centroid.x()),
                bbox,
            });
            polygons.push(feature);
        }

        let tree = BoundaryTree::build(regions);
        let index = SpatialIndex::build(
            polygons
                .into_iter()
                .filter(|feature| tree.get(&feature.id).is_some())
                .map(|feature| (feature.id, feature.boundary_type, feature.geometry)),
        );

        log::info!(
            "Built atlas {version}: {} boundaries ({} ctp, {} sig, {} emd, {} ri)",
            tree.len(),
            index.len(BoundaryType::Ctp),
            index.len(BoundaryType::Sig),
            index.len(BoundaryType::Emd),
            index.len(BoundaryType::Ri),
        );

        Self {
            version,
            tree,
            index,
        }
    }

    /// Loads the current dataset from `source` and builds an atlas.
    ///
    /// # Errors
    ///
    /// Propagates source errors.
    pub async fn load(source: &dyn GisSource) -> Result<Self, GeoError> {
        let version = source.dataset_version().await?;
        let features = source.load_regions().await?;
        Ok(Self::build(version, features))
    }

    /// Dataset version the atlas was built from.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The boundary hierarchy.
    #[must_use]
    pub const fn tree(&self) -> &BoundaryTree {
        &self.tree
    }

    /// Looks up a region by level and id.
    #[must_use]
    pub fn region(&self, boundary_type: BoundaryType, id: &str) -> Option<&BoundaryRegion> {
        self.tree.get_typed(boundary_type, id)
    }

    /// The region at `boundary_type` whose polygon contains the point.
    #[must_use]
    pub fn region_at(&self, boundary_type: BoundaryType, lat: f64, lng: f64) -> Option<&BoundaryRegion> {
        self.index
            .lookup(boundary_type, lng, lat)
            .and_then(|id| self.tree.get(id))
    }

    /// Regions at `boundary_type` whose polygon intersects `bbox`, in id
    /// order.
    #[must_use]
    pub fn intersecting(&self, boundary_type: BoundaryType, bbox: &BoundingBox) -> Vec<&BoundaryRegion> {
        self.index
            .intersecting(boundary_type, bbox)
            .into_iter()
            .filter_map(|id| self.tree.get(id))
            .collect()
    }

    /// Attributes a point to a leaf region.
    ///
    /// Starts from the deepest region whose polygon contains the point. If
    /// that region has children (the point falls in a gap between them),
    /// descends to the child with the nearest centroid until a leaf is
    /// reached. Returns `None` outside every province.
    #[must_use]
    pub fn leaf_for(&self, lat: f64, lng: f64) -> Option<&BoundaryRegion> {
        let mut current = BoundaryType::ALL
            .into_iter()
            .rev()
            .find_map(|level| self.region_at(level, lat, lng))?;

        loop {
            let nearest = self
                .tree
                .children(&current.id)
                .iter()
                .filter_map(|id| self.tree.get(id))
                .min_by(|a, b| {
                    squared_distance(a.centroid, lat, lng)
                        .total_cmp(&squared_distance(b.centroid, lat, lng))
                });
            match nearest {
                Some(child) => current = child,
                None => return Some(current),
            }
        }
    }
}

fn squared_distance(centroid: LatLng, lat: f64, lng: f64) -> f64 {
    let dlat = centroid.lat - lat;
    let dlng = (centroid.lng - lng) * lat.to_radians().cos();
    dlat.mul_add(dlat, dlng * dlng)
}

/// Shared, swappable reference to the current [`Atlas`].
#[derive(Debug)]
pub struct AtlasHandle {
    current: RwLock<Arc<Atlas>>,
}

impl AtlasHandle {
    /// Wraps an initial atlas.
    #[must_use]
    pub fn new(atlas: Atlas) -> Self {
        Self {
            current: RwLock::new(Arc::new(atlas)),
        }
    }

    /// The current atlas snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<Atlas> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Publishes a new atlas, returning the previous one.
    pub fn replace(&self, atlas: Atlas) -> Arc<Atlas> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, Arc::new(atlas))
    }

    /// Rebuilds the atlas if the source's dataset version differs from the
    /// current one. Returns whether a new atlas was published.
    ///
    /// # Errors
    ///
    /// Propagates source errors; the current atlas stays in place.
    pub async fn refresh(&self, source: &dyn GisSource) -> Result<bool, GeoError> {
        let version = source.dataset_version().await?;
        let current = self.current();
        if current.version() == version {
            return Ok(false);
        }

        log::info!(
            "GIS dataset version changed from '{}' to '{version}', rebuilding atlas",
            current.version()
        );
        let features = source.load_regions().await?;
        self.replace(Atlas::build(version, features));
        Ok(true)
    }
}
