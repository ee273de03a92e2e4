//! Marker clustering.
//!
//! Points are merged greedily: sorted by position, each point joins the
//! nearest existing cluster whose centroid is within the clustering radius
//! or starts a new one. Passes repeat over their own output until nothing
//! merges, which makes clustering idempotent.

use std::cmp::Ordering;

use medimap_facility_models::{Facility, FacilityKind};
use medimap_geography_models::{AreaSummary, BoundaryType, BoundingBox, ClusterPoint, LatLng};

/// Web-mercator ground resolution at zoom 0 on the equator, in metres per
/// pixel.
const EQUATOR_METERS_PER_PIXEL: f64 = 156_543.03;

/// Latitude the clustering radius is evaluated at (the middle of Korea).
const REFERENCE_LATITUDE: f64 = 36.5;

/// Highest zoom the radius policy distinguishes.
const MAX_ZOOM: f64 = 22.0;

/// Clustering policy knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterConfig {
    /// On-screen clustering radius in pixels.
    pub radius_px: f64,
    /// A region with more facilities than this is clustered even at fine
    /// zoom levels.
    pub density_threshold: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            radius_px: 80.0,
            density_threshold: 500,
        }
    }
}

/// Turns summaries and facilities into map markers.
#[derive(Debug, Clone, Default)]
pub struct ClusterEngine {
    config: ClusterConfig,
}

impl ClusterEngine {
    /// Creates an engine with the given policy.
    #[must_use]
    pub const fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    /// Ground distance covered by the clustering radius at `zoom`, in
    /// metres. Halves with every zoom level.
    #[must_use]
    pub fn radius_m(&self, zoom: f64) -> f64 {
        let zoom = if zoom.is_nan() { 0.0 } else { zoom.clamp(0.0, MAX_ZOOM) };
        self.config.radius_px * EQUATOR_METERS_PER_PIXEL * REFERENCE_LATITUDE.to_radians().cos()
            / zoom.exp2()
    }

    /// Marker radius for a cluster of `count` facilities: 30% of `radius`
    /// for a single facility, growing logarithmically to the full radius
    /// at 10 000.
    #[must_use]
    pub fn marker_radius(radius: f64, count: u64) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let density = ((count as f64) + 1.0).log10() / 4.0;
        radius * 0.7f64.mul_add(density.min(1.0), 0.3)
    }

    /// Whether summaries at `zoom` should be clustered rather than drawn
    /// one marker per region.
    #[must_use]
    pub fn needs_clustering(&self, summaries: &[AreaSummary], zoom: f64) -> bool {
        let finest_band = f64::from(BoundaryType::Ri.min_zoom());
        zoom.is_nan()
            || zoom < finest_band
            || summaries
                .iter()
                .any(|s| s.total() > self.config.density_threshold)
    }

    /// The zoom level at which `bbox` fills a typical viewport.
    #[must_use]
    pub fn zoom_for_bounds(bbox: &BoundingBox) -> f64 {
        let span = bbox.width().max(bbox.height() * 2.0);
        if span <= 0.0 || !span.is_finite() {
            return MAX_ZOOM;
        }
        (360.0 / span).log2().clamp(0.0, MAX_ZOOM)
    }

    /// The zoom level at which `boxes` fill a typical viewport. The two
    /// halves of an antimeridian split count as one contiguous span.
    #[must_use]
    pub fn zoom_for_boxes(boxes: &[BoundingBox]) -> f64 {
        let width = boxes.iter().map(BoundingBox::width).sum::<f64>();
        let south = boxes.iter().map(|b| b.south).fold(f64::INFINITY, f64::min);
        let north = boxes.iter().map(|b| b.north).fold(f64::NEG_INFINITY, f64::max);
        Self::zoom_for_bounds(&BoundingBox::new(0.0, south, width, north))
    }

    /// One marker per region with facilities.
    #[must_use]
    pub fn region_markers(summaries: &[AreaSummary], radius: f64) -> Vec<ClusterPoint> {
        summaries
            .iter()
            .filter(|s| s.total() > 0)
            .map(|s| ClusterPoint {
                lat: s.centroid.lat,
                lng: s.centroid.lng,
                count: s.total(),
                hospital_count: s.hospital_count,
                pharmacy_count: s.pharmacy_count,
                radius: Self::marker_radius(radius, s.total()),
                source_region_ids: vec![s.region_id.clone()],
            })
            .collect()
    }

    /// One single-facility point per facility.
    #[must_use]
    pub fn facility_points(facilities: &[Facility], radius: f64) -> Vec<ClusterPoint> {
        facilities
            .iter()
            .map(|f| {
                let hospital = u64::from(f.kind == FacilityKind::Hospital);
                ClusterPoint {
                    lat: f.lat,
                    lng: f.lng,
                    count: 1,
                    hospital_count: hospital,
                    pharmacy_count: 1 - hospital,
                    radius: Self::marker_radius(radius, 1),
                    source_region_ids: vec![f.id.clone()],
                }
            })
            .collect()
    }

    /// Markers for summaries at `zoom`: clustered when
    /// [`Self::needs_clustering`] says so, one per region otherwise.
    #[must_use]
    pub fn map_clusters(&self, summaries: &[AreaSummary], zoom: f64) -> Vec<ClusterPoint> {
        let radius = self.radius_m(zoom);
        let markers = Self::region_markers(summaries, radius);
        if self.needs_clustering(summaries, zoom) {
            Self::cluster(markers, radius)
        } else {
            markers
        }
    }

    /// Clusters points until no two cluster centroids are within
    /// `radius_m` of each other in processing order.
    #[must_use]
    pub fn cluster(points: Vec<ClusterPoint>, radius_m: f64) -> Vec<ClusterPoint> {
        let mut current = points;
        loop {
            let before = current.len();
            current = Self::pass(current, radius_m);
            if current.len() == before {
                return current;
            }
        }
    }

    fn pass(mut points: Vec<ClusterPoint>, radius_m: f64) -> Vec<ClusterPoint> {
        points.sort_by(compare_points);

        let mut clusters: Vec<ClusterPoint> = Vec::with_capacity(points.len());
        for point in points {
            let location = LatLng::new(point.lat, point.lng);
            let nearest = clusters
                .iter()
                .enumerate()
                .map(|(i, c)| (i, LatLng::new(c.lat, c.lng).distance_m(&location)))
                .filter(|(_, d)| *d <= radius_m)
                .min_by(|a, b| a.1.total_cmp(&b.1));

            match nearest {
                Some((i, _)) => merge(&mut clusters[i], point),
                None => clusters.push(point),
            }
        }

        for cluster in &mut clusters {
            cluster.radius = Self::marker_radius(radius_m, cluster.count);
        }
        clusters.sort_by(compare_points);
        clusters
    }
}

fn compare_points(a: &ClusterPoint, b: &ClusterPoint) -> Ordering {
    a.lat
        .total_cmp(&b.lat)
        .then_with(|| a.lng.total_cmp(&b.lng))
        .then_with(|| a.source_region_ids.cmp(&b.source_region_ids))
}

#[allow(clippy::cast_precision_loss)]
fn merge(into: &mut ClusterPoint, point: ClusterPoint) {
    let (w1, w2) = (into.count.max(1) as f64, point.count.max(1) as f64);
    let total = w1 + w2;
    into.lat = into.lat.mul_add(w1, point.lat * w2) / total;
    into.lng = into.lng.mul_add(w1, point.lng * w2) / total;
    into.count += point.count;
    into.hospital_count += point.hospital_count;
    into.pharmacy_count += point.pharmacy_count;
    into.source_region_ids.extend(point.source_region_ids);
    into.source_region_ids.sort_unstable();
    into.source_region_ids.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn point(id: &str, lat: f64, lng: f64, count: u64) -> ClusterPoint {
        ClusterPoint {
            lat,
            lng,
            count,
            hospital_count: count,
            pharmacy_count: 0,
            radius: 0.0,
            source_region_ids: vec![id.to_string()],
        }
    }

    fn summary(id: &str, lat: f64, lng: f64, hospitals: u64) -> AreaSummary {
        AreaSummary {
            region_id: id.to_string(),
            boundary_type: BoundaryType::Emd,
            name: id.to_string(),
            hospital_count: hospitals,
            pharmacy_count: 0,
            centroid: LatLng::new(lat, lng),
            last_computed_at: Utc::now(),
        }
    }

    #[test]
    fn radius_halves_per_zoom_and_clamps() {
        let engine = ClusterEngine::default();
        let r10 = engine.radius_m(10.0);
        assert!((engine.radius_m(11.0) * 2.0 - r10).abs() < 1e-6);
        assert!(engine.radius_m(8.0) > engine.radius_m(14.0));
        assert!((engine.radius_m(-4.0) - engine.radius_m(0.0)).abs() < f64::EPSILON);
        assert!((engine.radius_m(40.0) - engine.radius_m(22.0)).abs() < f64::EPSILON);
        assert!((engine.radius_m(f64::NAN) - engine.radius_m(0.0)).abs() < f64::EPSILON);
        // About 10 km at zoom 10 over Korea.
        assert!((r10 / 1000.0 - 9.8).abs() < 0.5, "got {r10}");
    }

    #[test]
    fn marker_radius_grows_with_count() {
        let small = ClusterEngine::marker_radius(100.0, 0);
        let one = ClusterEngine::marker_radius(100.0, 1);
        let many = ClusterEngine::marker_radius(100.0, 1_000_000);
        assert!((small - 30.0).abs() < 1e-9);
        assert!(one > small);
        assert!((many - 100.0).abs() < 1e-9);
    }

    #[test]
    fn merges_nearby_points() {
        let points = vec![
            point("a", 37.50, 127.00, 2),
            point("b", 37.501, 127.001, 2),
            point("c", 35.10, 129.00, 1),
        ];
        let clusters = ClusterEngine::cluster(points, 1_000.0);

        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].source_region_ids, vec!["c"]);
        assert_eq!(clusters[1].count, 4);
        assert_eq!(clusters[1].source_region_ids, vec!["a", "b"]);
        assert!((clusters[1].lat - 37.5005).abs() < 1e-9);
    }

    #[test]
    fn clustering_is_idempotent() {
        let points: Vec<ClusterPoint> = (0u32..40)
            .map(|i| {
                let f = f64::from(i);
                point(&format!("p{i}"), 37.0 + (f * 0.013) % 0.4, 126.5 + (f * 0.029) % 0.6, 1 + u64::from(i % 3))
            })
            .collect();

        let once = ClusterEngine::cluster(points, 5_000.0);
        let twice = ClusterEngine::cluster(once.clone(), 5_000.0);
        assert_eq!(once, twice);
        assert_eq!(once.iter().map(|c| c.count).sum::<u64>(), (0u32..40).map(|i| 1 + u64::from(i % 3)).sum::<u64>());
    }

    #[test]
    fn clustering_is_order_independent() {
        let points = vec![
            point("a", 37.50, 127.00, 1),
            point("b", 37.52, 127.02, 1),
            point("c", 37.54, 127.04, 1),
        ];
        let mut reversed = points.clone();
        reversed.reverse();
        assert_eq!(
            ClusterEngine::cluster(points, 3_000.0),
            ClusterEngine::cluster(reversed, 3_000.0)
        );
    }

    #[test]
    fn clustering_trigger() {
        let engine = ClusterEngine::default();
        let sparse = vec![summary("a", 37.5, 127.0, 10)];
        let dense = vec![summary("a", 37.5, 127.0, 501)];

        assert!(engine.needs_clustering(&sparse, 12.0));
        assert!(!engine.needs_clustering(&sparse, 15.0));
        assert!(engine.needs_clustering(&dense, 16.0));
    }

    #[test]
    fn fine_zoom_maps_regions_one_to_one() {
        let engine = ClusterEngine::default();
        let summaries = vec![
            summary("a", 37.5, 127.0, 3),
            summary("b", 37.5001, 127.0001, 4),
            summary("empty", 37.6, 127.1, 0),
        ];

        let markers = engine.map_clusters(&summaries, 16.0);
        assert_eq!(markers.len(), 2);

        let clustered = engine.map_clusters(&summaries, 8.0);
        assert_eq!(clustered.len(), 1);
        assert_eq!(clustered[0].count, 7);
    }

    #[test]
    fn facility_points_split_kinds() {
        let facility = Facility {
            id: "P1".to_string(),
            kind: FacilityKind::Pharmacy,
            name: "약국".to_string(),
            address: String::new(),
            lat: 37.5,
            lng: 127.0,
            category: None,
            emergency: false,
            night_service: false,
            phone: None,
        };
        let points = ClusterEngine::facility_points(&[facility], 100.0);
        assert_eq!(points[0].pharmacy_count, 1);
        assert_eq!(points[0].hospital_count, 0);
    }

    #[test]
    fn zoom_for_bounds_tracks_span() {
        let wide = ClusterEngine::zoom_for_bounds(&BoundingBox::new(124.0, 33.0, 132.0, 39.0));
        let narrow = ClusterEngine::zoom_for_bounds(&BoundingBox::new(126.9, 37.5, 127.0, 37.55));
        assert!(wide < narrow);
        assert!((ClusterEngine::zoom_for_bounds(&BoundingBox::new(0.0, 0.0, 0.0, 0.0)) - 22.0).abs() < f64::EPSILON);
    }
}
