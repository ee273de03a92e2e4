#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Administrative boundary and area summary types.
//!
//! These types describe the Korean administrative hierarchy (province,
//! district, neighborhood, sub-neighborhood), the bounding boxes clients
//! send with every map request, and the per-region facility counts the
//! aggregation layer serves. They carry no behaviour beyond simple
//! geometry helpers so every crate can share them.

pub mod sido;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Administrative boundary level, ordered coarsest to finest.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BoundaryType {
    /// Province / metropolitan city (`시도`).
    #[serde(alias = "ctprvn", alias = "sido")]
    #[strum(to_string = "ctp", serialize = "ctprvn", serialize = "sido")]
    Ctp,
    /// District (`시군구`).
    #[serde(alias = "sgg")]
    #[strum(to_string = "sig", serialize = "sgg")]
    Sig,
    /// Neighborhood (`읍면동`).
    Emd,
    /// Sub-neighborhood (`리`). Clients call this level `li`.
    #[serde(alias = "li")]
    #[strum(to_string = "ri", serialize = "li")]
    Ri,
}

impl BoundaryType {
    /// All levels, coarsest first.
    pub const ALL: [Self; 4] = [Self::Ctp, Self::Sig, Self::Emd, Self::Ri];

    /// Number of digits in an administrative code at this level.
    #[must_use]
    pub const fn code_len(self) -> usize {
        match self {
            Self::Ctp => 2,
            Self::Sig => 5,
            Self::Emd => 8,
            Self::Ri => 10,
        }
    }

    /// The next finer level, if any.
    #[must_use]
    pub const fn finer(self) -> Option<Self> {
        match self {
            Self::Ctp => Some(Self::Sig),
            Self::Sig => Some(Self::Emd),
            Self::Emd => Some(Self::Ri),
            Self::Ri => None,
        }
    }

    /// The next coarser level, if any.
    #[must_use]
    pub const fn coarser(self) -> Option<Self> {
        match self {
            Self::Ctp => None,
            Self::Sig => Some(Self::Ctp),
            Self::Emd => Some(Self::Sig),
            Self::Ri => Some(Self::Emd),
        }
    }

    /// Smallest zoom level served at this granularity.
    #[must_use]
    pub const fn min_zoom(self) -> u8 {
        match self {
            Self::Ctp => 0,
            Self::Sig => 11,
            Self::Emd => 13,
            Self::Ri => 15,
        }
    }

    /// Edge length in degrees of the tile grid that summary cache keys are
    /// snapped to at this granularity.
    #[must_use]
    pub const fn tile_size_deg(self) -> f64 {
        match self {
            Self::Ctp => 1.0,
            Self::Sig => 0.25,
            Self::Emd => 0.05,
            Self::Ri => 0.01,
        }
    }

    /// Infers the level from a bare administrative code by its length.
    ///
    /// Returns `None` for codes that are not all ASCII digits or whose
    /// length matches no level.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        if code.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Self::ALL.into_iter().find(|t| t.code_len() == code.len())
    }
}

/// A WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatLng {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
}

impl LatLng {
    /// Creates a coordinate.
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Great-circle distance to `other` in metres (haversine).
    #[must_use]
    pub fn distance_m(&self, other: &Self) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlng = (other.lng - self.lng).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
    }
}

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Raw, unvalidated viewport bounds as sent by clients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
    /// Southwest corner.
    pub sw: LatLng,
    /// Northeast corner.
    pub ne: LatLng,
}

impl Bounds {
    /// Creates bounds from the four corner values clients send as query
    /// parameters.
    #[must_use]
    pub const fn new(sw_lat: f64, sw_lng: f64, ne_lat: f64, ne_lng: f64) -> Self {
        Self {
            sw: LatLng::new(sw_lat, sw_lng),
            ne: LatLng::new(ne_lat, ne_lng),
        }
    }
}

/// A validated, non-wrapping geographic bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Western longitude boundary.
    pub west: f64,
    /// Southern latitude boundary.
    pub south: f64,
    /// Eastern longitude boundary.
    pub east: f64,
    /// Northern latitude boundary.
    pub north: f64,
}

impl BoundingBox {
    /// Creates a new bounding box from the given coordinates.
    #[must_use]
    pub const fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// Whether the two boxes share any point (edges included).
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.west <= other.east
            && other.west <= self.east
            && self.south <= other.north
            && other.south <= self.north
    }

    /// Whether the point lies inside the box (edges included).
    #[must_use]
    pub fn contains(&self, point: LatLng) -> bool {
        point.lng >= self.west
            && point.lng <= self.east
            && point.lat >= self.south
            && point.lat <= self.north
    }

    /// Geometric center of the box.
    #[must_use]
    pub fn center(&self) -> LatLng {
        LatLng::new(
            f64::midpoint(self.south, self.north),
            f64::midpoint(self.west, self.east),
        )
    }

    /// Longitude span in degrees.
    #[must_use]
    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    /// Latitude span in degrees.
    #[must_use]
    pub fn height(&self) -> f64 {
        self.north - self.south
    }
}

/// A node of the administrative boundary tree, without its polygon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryRegion {
    /// Administrative code (e.g. `"11"`, `"11110"`, `"11110101"`).
    pub id: String,
    /// Boundary level.
    #[serde(rename = "type")]
    pub boundary_type: BoundaryType,
    /// Korean display name.
    pub name: String,
    /// Parent region code; `None` only for `ctp` regions.
    pub parent_id: Option<String>,
    /// Polygon centroid.
    pub centroid: LatLng,
    /// Polygon bounding box.
    pub bbox: BoundingBox,
}

/// Hospital and pharmacy counts for one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaSummary {
    /// Region code.
    pub region_id: String,
    /// Region level.
    #[serde(rename = "type")]
    pub boundary_type: BoundaryType,
    /// Region display name.
    pub name: String,
    /// Hospitals attributed to the region and its descendants.
    pub hospital_count: u64,
    /// Pharmacies attributed to the region and its descendants.
    pub pharmacy_count: u64,
    /// Region centroid, used as the marker position.
    pub centroid: LatLng,
    /// When these counts were last changed.
    pub last_computed_at: DateTime<Utc>,
}

impl AreaSummary {
    /// Hospitals plus pharmacies.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.hospital_count + self.pharmacy_count
    }
}

/// A synthetic map marker representing one or more merged points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPoint {
    /// Count-weighted centroid latitude.
    pub lat: f64,
    /// Count-weighted centroid longitude.
    pub lng: f64,
    /// Hospitals plus pharmacies.
    pub count: u64,
    /// Hospitals merged into this marker.
    pub hospital_count: u64,
    /// Pharmacies merged into this marker.
    pub pharmacy_count: u64,
    /// Display radius in metres.
    pub radius: f64,
    /// Regions (or facilities) merged into this marker, sorted.
    pub source_region_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_distance() {
        let seoul = LatLng::new(37.5665, 126.9780);
        let busan = LatLng::new(35.1796, 129.0756);
        let km = seoul.distance_m(&busan) / 1000.0;
        assert!((km - 325.0).abs() < 5.0, "got {km}");
        assert!(seoul.distance_m(&seoul).abs() < f64::EPSILON);
    }

    #[test]
    fn boundary_type_parses_client_aliases() {
        assert_eq!("ctp".parse::<BoundaryType>().unwrap(), BoundaryType::Ctp);
        assert_eq!("ctprvn".parse::<BoundaryType>().unwrap(), BoundaryType::Ctp);
        assert_eq!("SIG".parse::<BoundaryType>().unwrap(), BoundaryType::Sig);
        assert_eq!("li".parse::<BoundaryType>().unwrap(), BoundaryType::Ri);
        assert!("county".parse::<BoundaryType>().is_err());
    }

    #[test]
    fn boundary_type_displays_canonical_name() {
        assert_eq!(BoundaryType::Ctp.to_string(), "ctp");
        assert_eq!(BoundaryType::Ri.to_string(), "ri");
        assert_eq!(BoundaryType::Ri.as_ref(), "ri");
    }

    #[test]
    fn boundary_type_serde_accepts_aliases() {
        let t: BoundaryType = serde_json::from_str("\"li\"").unwrap();
        assert_eq!(t, BoundaryType::Ri);
        assert_eq!(serde_json::to_string(&BoundaryType::Emd).unwrap(), "\"emd\"");
    }

    #[test]
    fn levels_chain_coarse_to_fine() {
        for pair in BoundaryType::ALL.windows(2) {
            assert_eq!(pair[0].finer(), Some(pair[1]));
            assert_eq!(pair[1].coarser(), Some(pair[0]));
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(BoundaryType::Ctp.coarser(), None);
        assert_eq!(BoundaryType::Ri.finer(), None);
    }

    #[test]
    fn type_is_inferred_from_code_length() {
        assert_eq!(BoundaryType::from_code("11"), Some(BoundaryType::Ctp));
        assert_eq!(BoundaryType::from_code("11110"), Some(BoundaryType::Sig));
        assert_eq!(BoundaryType::from_code("11110101"), Some(BoundaryType::Emd));
        assert_eq!(BoundaryType::from_code("4182025021"), Some(BoundaryType::Ri));
        assert_eq!(BoundaryType::from_code("111"), None);
        assert_eq!(BoundaryType::from_code("1a"), None);
        assert_eq!(BoundaryType::from_code(""), None);
    }

    #[test]
    fn bounding_box_intersection_includes_edges() {
        let a = BoundingBox::new(126.0, 37.0, 127.0, 38.0);
        let touching = BoundingBox::new(127.0, 37.5, 128.0, 38.5);
        let apart = BoundingBox::new(127.1, 37.0, 128.0, 38.0);
        assert!(a.intersects(&touching));
        assert!(touching.intersects(&a));
        assert!(!a.intersects(&apart));
    }

    #[test]
    fn bounding_box_center_and_contains() {
        let b = BoundingBox::new(126.0, 37.0, 127.0, 38.0);
        assert_eq!(b.center(), LatLng::new(37.5, 126.5));
        assert!(b.contains(LatLng::new(37.0, 126.0)));
        assert!(!b.contains(LatLng::new(36.9, 126.5)));
    }
}
