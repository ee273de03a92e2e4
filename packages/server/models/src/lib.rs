#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! API request and response types for the medimap server.
//!
//! These types are serialized to JSON for the REST API. They are separate
//! from the domain types to allow independent evolution of the API
//! contract.

use chrono::{DateTime, Utc};
use medimap_cache::{CacheState, CacheStatus};
use medimap_facility_models::{Facility, FacilityKind};
use medimap_geography_models::{
    AreaSummary, BoundaryRegion, BoundaryType, Bounds, ClusterPoint, LatLng,
};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Facilities returned by the map-data endpoints unless a limit is given.
pub const DEFAULT_FACILITY_LIMIT: usize = 100;

/// Results returned by the search endpoint.
pub const SEARCH_LIMIT: usize = 10;

/// Zoom assumed by zoom-aware endpoints when none is given.
pub const DEFAULT_ZOOM: f64 = 8.0;

/// Zoom assumed by the neighborhood summary endpoint for point queries.
pub const DEFAULT_EMD_ZOOM: f64 = 14.0;

/// Facility cluster radius in kilometres unless one is given.
pub const DEFAULT_CLUSTER_RADIUS_KM: f64 = 5.0;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiHealth {
    /// Whether the service is healthy.
    pub healthy: bool,
    /// Service version.
    pub version: String,
    /// Loaded GIS dataset version.
    pub dataset_version: String,
}

/// Error body returned with every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Human-readable description.
    pub error: String,
}

/// Per-region facility counts as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAreaSummary {
    /// Administrative code of the region.
    pub area_code: String,
    /// Display name.
    pub area_name: String,
    /// Region level.
    pub area_type: BoundaryType,
    /// Marker latitude (region centroid).
    pub latitude: f64,
    /// Marker longitude (region centroid).
    pub longitude: f64,
    /// Hospitals in the region.
    pub hospital_count: u64,
    /// Pharmacies in the region.
    pub pharmacy_count: u64,
    /// Hospitals plus pharmacies.
    pub total_count: u64,
    /// When the counts last changed.
    pub last_computed_at: DateTime<Utc>,
}

impl From<AreaSummary> for ApiAreaSummary {
    fn from(summary: AreaSummary) -> Self {
        Self {
            total_count: summary.total(),
            area_code: summary.region_id,
            area_name: summary.name,
            area_type: summary.boundary_type,
            latitude: summary.centroid.lat,
            longitude: summary.centroid.lng,
            hospital_count: summary.hospital_count,
            pharmacy_count: summary.pharmacy_count,
            last_computed_at: summary.last_computed_at,
        }
    }
}

/// A boundary with its `GeoJSON` geometry.
///
/// The geometry is embedded verbatim as cached, without re-serializing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiBoundary {
    /// Administrative code.
    pub id: String,
    /// Boundary level.
    #[serde(rename = "type")]
    pub boundary_type: BoundaryType,
    /// Display name.
    pub name: String,
    /// `GeoJSON` geometry object.
    pub geometry: Box<RawValue>,
    /// Hex SHA-256 digest of `geometry`.
    pub digest: String,
}

/// A region matched by text search.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRegion {
    /// Administrative code.
    pub id: String,
    /// Region level.
    #[serde(rename = "type")]
    pub boundary_type: BoundaryType,
    /// Display name.
    pub name: String,
    /// Code of the enclosing region.
    pub parent_id: Option<String>,
    /// Centroid latitude.
    pub latitude: f64,
    /// Centroid longitude.
    pub longitude: f64,
}

impl From<&BoundaryRegion> for ApiRegion {
    fn from(region: &BoundaryRegion) -> Self {
        Self {
            id: region.id.clone(),
            boundary_type: region.boundary_type,
            name: region.name.clone(),
            parent_id: region.parent_id.clone(),
            latitude: region.centroid.lat,
            longitude: region.centroid.lng,
        }
    }
}

/// Response of the search endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSearchResults {
    /// Matching facilities, name matches first.
    pub facilities: Vec<Facility>,
    /// Matching regions, coarsest first.
    pub regions: Vec<ApiRegion>,
}

/// Response of the base map-data endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMapData {
    /// First hospitals, in id order.
    pub hospitals: Vec<Facility>,
    /// First pharmacies, in id order.
    pub pharmacies: Vec<Facility>,
    /// Every province boundary.
    pub provinces: Vec<ApiBoundary>,
}

/// Cache status of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCacheStatus {
    /// Whether a fresh entry can be served without computing.
    pub is_cached: bool,
    /// Lifecycle state of the key.
    pub status: CacheState,
    /// When the current entry was computed.
    pub last_updated: Option<DateTime<Utc>>,
    /// When the current entry stops being fresh.
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<CacheStatus> for ApiCacheStatus {
    fn from(status: CacheStatus) -> Self {
        Self {
            is_cached: status.is_cached,
            status: status.state,
            last_updated: status.last_updated,
            expires_at: status.expires_at,
        }
    }
}

/// Response of the cached-only summary endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCachedSummaries {
    /// Whether the summaries were cached.
    pub cached: bool,
    /// The summaries, present only when cached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<ApiAreaSummary>>,
}

/// A map marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCluster {
    /// Marker latitude.
    pub latitude: f64,
    /// Marker longitude.
    pub longitude: f64,
    /// Hospitals plus pharmacies.
    pub count: u64,
    /// Hospitals merged into the marker.
    pub hospital_count: u64,
    /// Pharmacies merged into the marker.
    pub pharmacy_count: u64,
    /// Display radius in metres.
    pub radius: f64,
    /// Regions or facilities merged into the marker.
    pub source_ids: Vec<String>,
    /// Whether more than one source was merged.
    pub is_clustered: bool,
}

impl From<ClusterPoint> for ApiCluster {
    fn from(point: ClusterPoint) -> Self {
        Self {
            latitude: point.lat,
            longitude: point.lng,
            count: point.count,
            hospital_count: point.hospital_count,
            pharmacy_count: point.pharmacy_count,
            radius: point.radius,
            is_clustered: point.source_region_ids.len() > 1,
            source_ids: point.source_region_ids,
        }
    }
}

/// Query parameters carrying a required viewport.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundsParams {
    /// South-west latitude.
    pub sw_lat: f64,
    /// South-west longitude.
    pub sw_lng: f64,
    /// North-east latitude.
    pub ne_lat: f64,
    /// North-east longitude.
    pub ne_lng: f64,
}

impl BoundsParams {
    /// The viewport, unvalidated.
    #[must_use]
    pub const fn bounds(&self) -> Bounds {
        Bounds::new(self.sw_lat, self.sw_lng, self.ne_lat, self.ne_lng)
    }
}

/// Assembles a viewport from optional corner parameters.
const fn optional_bounds(
    sw_lat: Option<f64>,
    sw_lng: Option<f64>,
    ne_lat: Option<f64>,
    ne_lng: Option<f64>,
) -> Option<Bounds> {
    match (sw_lat, sw_lng, ne_lat, ne_lng) {
        (Some(sw_lat), Some(sw_lng), Some(ne_lat), Some(ne_lng)) => {
            Some(Bounds::new(sw_lat, sw_lng, ne_lat, ne_lng))
        }
        _ => None,
    }
}

/// Query parameters for `GET /api/map/map-data`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapDataParams {
    /// Facility kind to return; both when absent.
    #[serde(rename = "type")]
    pub kind: Option<FacilityKind>,
    /// South-west latitude.
    pub sw_lat: Option<f64>,
    /// South-west longitude.
    pub sw_lng: Option<f64>,
    /// North-east latitude.
    pub ne_lat: Option<f64>,
    /// North-east longitude.
    pub ne_lng: Option<f64>,
    /// Maximum number of facilities.
    pub limit: Option<usize>,
}

impl MapDataParams {
    /// The viewport, if every corner was given.
    #[must_use]
    pub const fn bounds(&self) -> Option<Bounds> {
        optional_bounds(self.sw_lat, self.sw_lng, self.ne_lat, self.ne_lng)
    }
}

/// Query parameters for `GET /api/map/search`.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchParams {
    /// Free-text query.
    pub query: String,
}

/// Query parameters for `GET /api/map/emdong-summary`: a viewport, or a
/// point and zoom to build one around.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmdongParams {
    /// South-west latitude.
    pub sw_lat: Option<f64>,
    /// South-west longitude.
    pub sw_lng: Option<f64>,
    /// North-east latitude.
    pub ne_lat: Option<f64>,
    /// North-east longitude.
    pub ne_lng: Option<f64>,
    /// Point latitude.
    pub lat: Option<f64>,
    /// Point longitude.
    pub lng: Option<f64>,
    /// Zoom level for point queries.
    pub zoom: Option<f64>,
}

impl EmdongParams {
    /// The viewport, if every corner was given.
    #[must_use]
    pub const fn bounds(&self) -> Option<Bounds> {
        optional_bounds(self.sw_lat, self.sw_lng, self.ne_lat, self.ne_lng)
    }

    /// The point, if both coordinates were given.
    #[must_use]
    pub const fn point(&self) -> Option<LatLng> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(LatLng::new(lat, lng)),
            _ => None,
        }
    }

    /// Zoom for point queries.
    #[must_use]
    pub fn zoom(&self) -> f64 {
        self.zoom.unwrap_or(DEFAULT_EMD_ZOOM)
    }
}

/// Query parameters for zoom-aware summary endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoomBoundsParams {
    /// South-west latitude.
    pub sw_lat: f64,
    /// South-west longitude.
    pub sw_lng: f64,
    /// North-east latitude.
    pub ne_lat: f64,
    /// North-east longitude.
    pub ne_lng: f64,
    /// Map zoom level.
    pub zoom_level: Option<f64>,
}

impl ZoomBoundsParams {
    /// The viewport, unvalidated.
    #[must_use]
    pub const fn bounds(&self) -> Bounds {
        Bounds::new(self.sw_lat, self.sw_lng, self.ne_lat, self.ne_lng)
    }

    /// Zoom level, [`DEFAULT_ZOOM`] when absent.
    #[must_use]
    pub fn zoom(&self) -> f64 {
        self.zoom_level.unwrap_or(DEFAULT_ZOOM)
    }
}

/// Query parameters for `GET /api/map/map-summary/clusters`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterParams {
    /// South-west latitude.
    pub sw_lat: f64,
    /// South-west longitude.
    pub sw_lng: f64,
    /// North-east latitude.
    pub ne_lat: f64,
    /// North-east longitude.
    pub ne_lng: f64,
    /// Search centre latitude; the viewport centre when absent.
    pub center_lat: Option<f64>,
    /// Search centre longitude; the viewport centre when absent.
    pub center_lng: Option<f64>,
    /// Search radius in kilometres.
    pub radius: Option<f64>,
}

impl ClusterParams {
    /// The viewport, unvalidated.
    #[must_use]
    pub const fn bounds(&self) -> Bounds {
        Bounds::new(self.sw_lat, self.sw_lng, self.ne_lat, self.ne_lng)
    }

    /// Search centre, defaulting to the middle of the viewport. A viewport
    /// with `sw_lng > ne_lng` crosses the antimeridian, so its middle is
    /// found going east from `sw_lng` and wrapped back into range.
    #[must_use]
    pub fn center(&self) -> LatLng {
        let mid_lng = || {
            if self.sw_lng > self.ne_lng {
                let mid = f64::midpoint(self.sw_lng, self.ne_lng + 360.0);
                if mid > 180.0 { mid - 360.0 } else { mid }
            } else {
                f64::midpoint(self.sw_lng, self.ne_lng)
            }
        };
        LatLng::new(
            self.center_lat.unwrap_or_else(|| f64::midpoint(self.sw_lat, self.ne_lat)),
            self.center_lng.unwrap_or_else(mid_lng),
        )
    }

    /// Search radius in metres.
    #[must_use]
    pub fn radius_m(&self) -> f64 {
        self.radius.unwrap_or(DEFAULT_CLUSTER_RADIUS_KM) * 1000.0
    }
}

/// Query parameters for `GET /api/map/map-summary/boundary-geometry`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeometryByNameParams {
    /// Boundary level; accepts the `sido` and `li` aliases.
    pub boundary_type: BoundaryType,
    /// Boundary display name.
    pub name: String,
}

/// Query parameters for `GET /api/geo/{type}/coordinates`.
#[derive(Debug, Clone, Deserialize)]
pub struct PointParams {
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lng: f64,
}

/// Body of `POST /api/boundaries/cache-batch`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheBatchRequest {
    /// Boundary ids, bare codes or `type:id`.
    pub boundary_ids: Vec<String>,
}
