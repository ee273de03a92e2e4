//! The administrative boundary hierarchy.

use std::collections::BTreeMap;

use medimap_geography_models::{BoundaryRegion, BoundaryType, sido};

/// Regions indexed by id, with parent → children links.
///
/// Every non-root region has exactly one parent of the next coarser
/// level. Regions whose parent is missing or of the wrong level are
/// dropped at build time, along with their descendants.
#[derive(Debug, Clone, Default)]
pub struct BoundaryTree {
    regions: BTreeMap<String, BoundaryRegion>,
    children: BTreeMap<String, Vec<String>>,
}

impl BoundaryTree {
    /// Builds the tree, discarding orphans.
    #[must_use]
    pub fn build(regions: Vec<BoundaryRegion>) -> Self {
        let mut by_level: BTreeMap<BoundaryType, Vec<BoundaryRegion>> = BTreeMap::new();
        for region in regions {
            by_level.entry(region.boundary_type).or_default().push(region);
        }

        let mut tree = Self::default();
        let mut dropped = 0usize;

        for (level, regions) in by_level {
            for mut region in regions {
                let attached = if let Some(parent_level) = level.coarser() {
                    region
                        .parent_id
                        .as_deref()
                        .is_some_and(|parent_id| tree.get_typed(parent_level, parent_id).is_some())
                } else {
                    region.parent_id = None;
                    true
                };

                if !attached {
                    log::warn!(
                        "Dropping {level} boundary {} ({}): parent {:?} not found",
                        region.id,
                        region.name,
                        region.parent_id
                    );
                    dropped += 1;
                    continue;
                }

                if let Some(parent_id) = &region.parent_id {
                    tree.children
                        .entry(parent_id.clone())
                        .or_default()
                        .push(region.id.clone());
                }
                tree.regions.insert(region.id.clone(), region);
            }
        }

        for children in tree.children.values_mut() {
            children.sort_unstable();
            children.dedup();
        }

        if dropped > 0 {
            log::warn!("Dropped {dropped} orphaned boundaries");
        }

        tree
    }

    /// Looks up a region by id at any level.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&BoundaryRegion> {
        self.regions.get(id)
    }

    /// Looks up a region by id, requiring it to be at `boundary_type`.
    #[must_use]
    pub fn get_typed(&self, boundary_type: BoundaryType, id: &str) -> Option<&BoundaryRegion> {
        self.regions
            .get(id)
            .filter(|region| region.boundary_type == boundary_type)
    }

    /// Ids of a region's direct children, sorted.
    #[must_use]
    pub fn children(&self, id: &str) -> &[String] {
        self.children.get(id).map_or(&[], Vec::as_slice)
    }

    /// Whether a region has no children.
    #[must_use]
    pub fn is_leaf(&self, id: &str) -> bool {
        self.children(id).is_empty()
    }

    /// All regions at one level, in id order.
    pub fn of_type(&self, boundary_type: BoundaryType) -> impl Iterator<Item = &BoundaryRegion> {
        self.regions
            .values()
            .filter(move |region| region.boundary_type == boundary_type)
    }

    /// All regions, in id order.
    pub fn iter(&self) -> impl Iterator<Item = &BoundaryRegion> {
        self.regions.values()
    }

    /// The region's ancestors, nearest first.
    #[must_use]
    pub fn ancestors(&self, id: &str) -> Vec<&BoundaryRegion> {
        let mut out = Vec::new();
        let mut current = self.get(id).and_then(|r| r.parent_id.as_deref());
        while let Some(parent_id) = current {
            let Some(parent) = self.get(parent_id) else {
                break;
            };
            out.push(parent);
            current = parent.parent_id.as_deref();
        }
        out
    }

    /// Finds a region at `boundary_type` by its name.
    ///
    /// Exact matches win over whitespace-insensitive ones; among several
    /// matches the lowest id is returned. Provinces also match their short
    /// name (`서울`, `경기`, ...).
    #[must_use]
    pub fn find_by_name(&self, boundary_type: BoundaryType, name: &str) -> Option<&BoundaryRegion> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        self.of_type(boundary_type)
            .find(|region| region.name == name)
            .or_else(|| {
                let wanted = strip_whitespace(name);
                self.of_type(boundary_type)
                    .find(|region| strip_whitespace(&region.name) == wanted)
            })
            .or_else(|| {
                if boundary_type != BoundaryType::Ctp {
                    return None;
                }
                self.of_type(BoundaryType::Ctp)
                    .find(|region| sido::sido_short_name(&region.id) == name)
            })
    }

    /// Regions whose name contains `query`, coarsest level first.
    #[must_use]
    pub fn search(&self, query: &str, limit: usize) -> Vec<&BoundaryRegion> {
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            return Vec::new();
        }
        let mut hits: Vec<&BoundaryRegion> = self
            .regions
            .values()
            .filter(|region| region.name.contains(query))
            .collect();
        hits.sort_by(|a, b| {
            a.boundary_type
                .cmp(&b.boundary_type)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        hits
    }

    /// Number of regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the tree has no regions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}
