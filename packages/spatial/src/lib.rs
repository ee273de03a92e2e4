#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! In-memory spatial index over administrative boundaries.
//!
//! One R-tree per boundary level, built once per dataset version. Used to
//! find the regions a map viewport intersects, to resolve the boundary
//! containing a point, and to attribute facilities to leaf regions.

use std::collections::BTreeMap;

use geo::{Area, BoundingRect, Contains, Intersects, MultiPolygon, Rect};
use geojson::GeoJson;
use medimap_geography_models::{BoundaryType, BoundingBox};
use rstar::{AABB, RTree, RTreeObject};

/// A boundary polygon stored in the R-tree with its metadata.
struct BoundaryEntry {
    id: String,
    area: f64,
    envelope: AABB<[f64; 2]>,
    polygon: MultiPolygon<f64>,
}

impl RTreeObject for BoundaryEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Pre-built R-trees, one per boundary level.
#[derive(Default)]
pub struct SpatialIndex {
    trees: BTreeMap<BoundaryType, RTree<BoundaryEntry>>,
}

impl std::fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sizes: BTreeMap<_, _> = self.trees.iter().map(|(t, tree)| (*t, tree.size())).collect();
        f.debug_struct("SpatialIndex").field("sizes", &sizes).finish()
    }
}

impl SpatialIndex {
    /// Bulk-loads one R-tree per level from `(id, level, polygon)` triples.
    pub fn build<I>(boundaries: I) -> Self
    where
        I: IntoIterator<Item = (String, BoundaryType, MultiPolygon<f64>)>,
    {
        let mut grouped: BTreeMap<BoundaryType, Vec<BoundaryEntry>> = BTreeMap::new();

        for (id, boundary_type, polygon) in boundaries {
            if id.is_empty() || polygon.0.is_empty() {
                continue;
            }
            grouped.entry(boundary_type).or_default().push(BoundaryEntry {
                id,
                area: polygon.unsigned_area(),
                envelope: compute_envelope(&polygon),
                polygon,
            });
        }

        let trees = grouped
            .into_iter()
            .map(|(boundary_type, entries)| {
                log::debug!(
                    "Indexed {} {boundary_type} boundaries",
                    entries.len()
                );
                (boundary_type, RTree::bulk_load(entries))
            })
            .collect();

        Self { trees }
    }

    /// Number of indexed boundaries at a level.
    #[must_use]
    pub fn len(&self, boundary_type: BoundaryType) -> usize {
        self.trees.get(&boundary_type).map_or(0, RTree::size)
    }

    /// Whether nothing at all is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trees.values().all(|tree| tree.size() == 0)
    }

    /// Looks up the boundary at `boundary_type` that contains a point.
    ///
    /// Boundaries from different sources can overlap slightly along their
    /// edges; the smallest area wins.
    #[must_use]
    pub fn lookup(&self, boundary_type: BoundaryType, lng: f64, lat: f64) -> Option<&str> {
        let tree = self.trees.get(&boundary_type)?;
        let point = geo::Point::new(lng, lat);
        let query_env = AABB::from_point([lng, lat]);

        let mut best: Option<&BoundaryEntry> = None;

        for entry in tree.locate_in_envelope_intersecting(&query_env) {
            if entry.polygon.contains(&point) {
                match best {
                    None => best = Some(entry),
                    Some(current) if entry.area < current.area => best = Some(entry),
                    _ => {}
                }
            }
        }

        best.map(|e| e.id.as_str())
    }

    /// Ids of every boundary at `boundary_type` whose polygon intersects
    /// `bbox`, in id order.
    #[must_use]
    pub fn intersecting(&self, boundary_type: BoundaryType, bbox: &BoundingBox) -> Vec<&str> {
        let Some(tree) = self.trees.get(&boundary_type) else {
            return Vec::new();
        };
        let query_env = AABB::from_corners([bbox.west, bbox.south], [bbox.east, bbox.north]);
        let rect = Rect::new((bbox.west, bbox.south), (bbox.east, bbox.north));

        let mut ids: Vec<&str> = tree
            .locate_in_envelope_intersecting(&query_env)
            .filter(|entry| entry.polygon.intersects(&rect))
            .map(|entry| entry.id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Parse a `GeoJSON` string into a [`MultiPolygon`].
/// Handles both `Polygon` and `MultiPolygon` geometry types.
#[must_use]
pub fn parse_geojson_to_multipolygon(geojson_str: &str) -> Option<MultiPolygon<f64>> {
    let geojson: GeoJson = geojson_str.parse().ok()?;
    if let GeoJson::Geometry(geom) = geojson {
        geometry_to_multipolygon(geom)
    } else {
        None
    }
}

/// Converts a `GeoJSON` geometry into a [`MultiPolygon`], or `None` for
/// non-areal geometry.
#[must_use]
pub fn geometry_to_multipolygon(geometry: geojson::Geometry) -> Option<MultiPolygon<f64>> {
    let geo_geom: geo::Geometry<f64> = geometry.try_into().ok()?;
    match geo_geom {
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        geo::Geometry::Polygon(p) => Some(MultiPolygon(vec![p])),
        _ => None,
    }
}

/// Bounding box of a [`MultiPolygon`], if it has any coordinates.
#[must_use]
pub fn bounding_box(mp: &MultiPolygon<f64>) -> Option<BoundingBox> {
    mp.bounding_rect()
        .map(|rect| BoundingBox::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y))
}

/// Compute the bounding box envelope for a [`MultiPolygon`].
fn compute_envelope(mp: &MultiPolygon<f64>) -> AABB<[f64; 2]> {
    mp.bounding_rect().map_or_else(
        || AABB::from_point([0.0, 0.0]),
        |rect| AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn square(west: f64, south: f64, east: f64, north: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![polygon![
            (x: west, y: south),
            (x: east, y: south),
            (x: east, y: north),
            (x: west, y: north),
            (x: west, y: south),
        ]])
    }

    fn index() -> SpatialIndex {
        SpatialIndex::build(vec![
            ("11".to_string(), BoundaryType::Ctp, square(126.0, 37.0, 127.0, 38.0)),
            ("26".to_string(), BoundaryType::Ctp, square(128.9, 35.0, 129.3, 35.4)),
            ("11010".to_string(), BoundaryType::Sig, square(126.0, 37.0, 126.5, 38.0)),
            ("11020".to_string(), BoundaryType::Sig, square(126.5, 37.0, 127.0, 38.0)),
            // Overlaps 11010 entirely but is much larger.
            ("99999".to_string(), BoundaryType::Sig, square(125.0, 36.0, 128.0, 39.0)),
        ])
    }

    #[test]
    fn lookup_prefers_smallest_area() {
        let index = index();
        assert_eq!(index.lookup(BoundaryType::Sig, 126.2, 37.5), Some("11010"));
        assert_eq!(index.lookup(BoundaryType::Sig, 127.5, 37.5), Some("99999"));
        assert_eq!(index.lookup(BoundaryType::Ctp, 129.0, 35.2), Some("26"));
    }

    #[test]
    fn lookup_outside_every_boundary() {
        let index = index();
        assert_eq!(index.lookup(BoundaryType::Ctp, 0.0, 0.0), None);
        assert_eq!(index.lookup(BoundaryType::Ri, 126.2, 37.5), None);
    }

    #[test]
    fn intersecting_filters_by_polygon() {
        let index = index();
        let bbox = BoundingBox::new(126.1, 37.1, 126.3, 37.2);
        assert_eq!(
            index.intersecting(BoundaryType::Sig, &bbox),
            vec!["11010", "99999"]
        );
        assert_eq!(index.intersecting(BoundaryType::Ctp, &bbox), vec!["11"]);

        let whole = BoundingBox::new(120.0, 30.0, 135.0, 40.0);
        assert_eq!(index.intersecting(BoundaryType::Ctp, &whole), vec!["11", "26"]);
    }

    #[test]
    fn counts_per_level() {
        let index = index();
        assert_eq!(index.len(BoundaryType::Ctp), 2);
        assert_eq!(index.len(BoundaryType::Sig), 3);
        assert_eq!(index.len(BoundaryType::Emd), 0);
        assert!(!index.is_empty());
        assert!(SpatialIndex::default().is_empty());
    }

    #[test]
    fn parses_polygon_and_multipolygon() {
        let polygon = r#"{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,1],[0,0]]]}"#;
        let multi = r#"{"type":"MultiPolygon","coordinates":[[[[0,0],[1,0],[1,1],[0,1],[0,0]]]]}"#;
        let point = r#"{"type":"Point","coordinates":[0,0]}"#;

        assert_eq!(parse_geojson_to_multipolygon(polygon).unwrap().0.len(), 1);
        assert_eq!(parse_geojson_to_multipolygon(multi).unwrap().0.len(), 1);
        assert!(parse_geojson_to_multipolygon(point).is_none());
        assert!(parse_geojson_to_multipolygon("not json").is_none());
    }

    #[test]
    fn bounding_box_of_square() {
        let bbox = bounding_box(&square(126.0, 37.0, 127.0, 38.0)).unwrap();
        assert_eq!(bbox, BoundingBox::new(126.0, 37.0, 127.0, 38.0));
    }
}
