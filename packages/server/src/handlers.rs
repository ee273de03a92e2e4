//! HTTP handler functions for the medimap API.

use std::str::FromStr as _;

use actix_web::{HttpResponse, web};
use medimap_facility_models::FacilityKind;
use medimap_geography::{BoundaryGeometry, GeoError, bounds, zoom};
use medimap_geography_models::{BoundaryType, Bounds};
use medimap_server_models::{
    ApiAreaSummary, ApiBoundary, ApiCacheStatus, ApiCachedSummaries, ApiCluster, ApiError,
    ApiHealth, ApiMapData, ApiRegion, ApiSearchResults, BoundsParams, CacheBatchRequest,
    ClusterParams, DEFAULT_FACILITY_LIMIT, EmdongParams, GeometryByNameParams, MapDataParams,
    PointParams, SEARCH_LIMIT, SearchParams, ZoomBoundsParams,
};
use serde::Serialize;
use serde_json::value::RawValue;

use crate::AppState;

/// Maps a domain error to its HTTP response.
fn error_response(err: &GeoError) -> HttpResponse {
    let body = ApiError {
        error: err.to_string(),
    };
    match err {
        GeoError::InvalidBounds { .. } => HttpResponse::BadRequest().json(body),
        GeoError::UnknownBoundary { .. } => HttpResponse::NotFound().json(body),
        GeoError::ComputeTimeout { .. } => {
            log::warn!("{err}");
            HttpResponse::GatewayTimeout().json(body)
        }
        GeoError::Upstream { .. } | GeoError::Dataset { .. } => {
            log::error!("{err}");
            HttpResponse::InternalServerError().json(body)
        }
    }
}

fn respond<T: Serialize>(result: Result<T, GeoError>) -> HttpResponse {
    match result {
        Ok(body) => HttpResponse::Ok().json(body),
        Err(e) => error_response(&e),
    }
}

fn parse_type(raw: &str) -> Result<BoundaryType, GeoError> {
    BoundaryType::from_str(raw)
        .map_err(|_| GeoError::invalid_bounds(format!("Unknown boundary type '{raw}'")))
}

fn api_boundary(geometry: &BoundaryGeometry) -> Result<ApiBoundary, GeoError> {
    let raw = RawValue::from_string(geometry.geojson.to_string()).map_err(|e| GeoError::Upstream {
        message: format!("Boundary {} has malformed GeoJSON: {e}", geometry.id),
    })?;
    Ok(ApiBoundary {
        id: geometry.id.clone(),
        boundary_type: geometry.boundary_type,
        name: geometry.name.clone(),
        geometry: raw,
        digest: geometry.digest.clone(),
    })
}

fn api_summaries(summaries: Vec<medimap_geography_models::AreaSummary>) -> Vec<ApiAreaSummary> {
    summaries.into_iter().map(ApiAreaSummary::from).collect()
}

/// A box with the same span as the (possibly antimeridian-split)
/// viewport, for picking a zoom level.
/// `GET /api/health`
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiHealth {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        dataset_version: state.atlas.current().version().to_string(),
    })
}

/// `GET /api/map-data`
///
/// The base dataset: the first hospitals and pharmacies plus every
/// province boundary.
pub async fn base_map_data(state: web::Data<AppState>) -> HttpResponse {
    let provinces: Vec<String> = state
        .atlas
        .current()
        .tree()
        .of_type(BoundaryType::Ctp)
        .map(|region| region.id.clone())
        .collect();

    let result = async {
        let geometries = futures::future::join_all(
            provinces
                .iter()
                .map(|id| state.geometry.get(BoundaryType::Ctp, id)),
        )
        .await;
        let provinces = geometries
            .into_iter()
            .map(|geometry| api_boundary(&*geometry?))
            .collect::<Result<Vec<_>, GeoError>>()?;

        Ok::<_, GeoError>(ApiMapData {
            hospitals: state.facilities.query(Some(FacilityKind::Hospital), &[], DEFAULT_FACILITY_LIMIT),
            pharmacies: state.facilities.query(Some(FacilityKind::Pharmacy), &[], DEFAULT_FACILITY_LIMIT),
            provinces,
        })
    }
    .await;

    respond(result)
}

/// `GET /api/map/map-data`
///
/// Facilities of a kind, optionally restricted to a viewport.
pub async fn map_data(state: web::Data<AppState>, params: web::Query<MapDataParams>) -> HttpResponse {
    let boxes = match params.bounds().as_ref().map(bounds::validate).transpose() {
        Ok(boxes) => boxes.unwrap_or_default(),
        Err(e) => return error_response(&e),
    };
    let limit = params.limit.unwrap_or(DEFAULT_FACILITY_LIMIT);
    HttpResponse::Ok().json(state.facilities.query(params.kind, &boxes, limit))
}

/// `GET /api/map/search`
///
/// Facility matches first, then regions, at most [`SEARCH_LIMIT`] in
/// total.
pub async fn search(state: web::Data<AppState>, params: web::Query<SearchParams>) -> HttpResponse {
    let facilities = state.facilities.search(&params.query, SEARCH_LIMIT);
    let atlas = state.atlas.current();
    let regions = atlas
        .tree()
        .search(&params.query, SEARCH_LIMIT - facilities.len())
        .into_iter()
        .map(ApiRegion::from)
        .collect();

    HttpResponse::Ok().json(ApiSearchResults { facilities, regions })
}

/// `GET /api/map/summary`
pub async fn province_summary(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(api_summaries(state.aggregation.province_summary()))
}

/// `GET /api/map_data/stats`
pub async fn stats(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.facilities.stats())
}

/// `GET /api/geo/{type}/coordinates`
///
/// The boundary at a level containing a point.
pub async fn boundary_at_point(
    state: web::Data<AppState>,
    path: web::Path<String>,
    params: web::Query<PointParams>,
) -> HttpResponse {
    let result = async {
        let boundary_type = parse_type(&path)?;
        let geometry = state
            .geometry
            .get_by_point(boundary_type, params.lat, params.lng)
            .await?;
        api_boundary(&geometry)
    }
    .await;
    respond(result)
}

/// `GET /api/map/emdong-summary`
///
/// Neighborhood summaries for a viewport, or for the viewport around a
/// point at a zoom level.
pub async fn emdong_summary(state: web::Data<AppState>, params: web::Query<EmdongParams>) -> HttpResponse {
    let result = async {
        let viewport = match (params.bounds(), params.point()) {
            (Some(viewport), _) => viewport,
            (None, Some(point)) => {
                let bbox = bounds::around(point, params.zoom())?;
                Bounds::new(bbox.south, bbox.west, bbox.north, bbox.east)
            }
            (None, None) => {
                return Err(GeoError::invalid_bounds(
                    "either swLat/swLng/neLat/neLng or lat/lng is required",
                ));
            }
        };
        let summaries = state.aggregation.summarize(&viewport, BoundaryType::Emd).await?;
        Ok::<_, GeoError>(api_summaries(summaries))
    }
    .await;
    respond(result)
}

/// `GET /api/map/map-summary/{areaType}`
pub async fn area_summary(
    state: web::Data<AppState>,
    path: web::Path<String>,
    params: web::Query<BoundsParams>,
) -> HttpResponse {
    let result = async {
        let granularity = parse_type(&path)?;
        let summaries = state
            .aggregation
            .summarize(&params.bounds(), granularity)
            .await?;
        Ok::<_, GeoError>(api_summaries(summaries))
    }
    .await;
    respond(result)
}

/// `GET /api/map/map-summary/cache-status`
pub async fn summary_cache_status(
    state: web::Data<AppState>,
    params: web::Query<ZoomBoundsParams>,
) -> HttpResponse {
    respond(
        state
            .aggregation
            .cache_status(&params.bounds(), params.zoom())
            .map(ApiCacheStatus::from),
    )
}

/// `GET /api/map/map-summary/cached`
///
/// Summaries only if already cached; never computes.
pub async fn cached_summary(state: web::Data<AppState>, params: web::Query<ZoomBoundsParams>) -> HttpResponse {
    respond(
        state
            .aggregation
            .cached(&params.bounds(), params.zoom())
            .map(|cached| ApiCachedSummaries {
                cached: cached.is_some(),
                data: cached.map(api_summaries),
            }),
    )
}

/// `GET /api/map/map-summary/clusters`
///
/// Clusters the facilities inside the viewport and within the radius of
/// the centre.
pub async fn facility_clusters(state: web::Data<AppState>, params: web::Query<ClusterParams>) -> HttpResponse {
    let result = state
        .aggregation
        .facility_clusters(&state.clusters, &params.bounds(), params.center(), params.radius_m())
        .await
        .map(|clusters| clusters.iter().cloned().map(ApiCluster::from).collect::<Vec<_>>());
    respond(result)
}

/// `GET /api/map/map-summary/mapCluster`
///
/// Region markers at the granularity of the zoom level, clustered when
/// zoomed out or dense.
pub async fn map_clusters(state: web::Data<AppState>, params: web::Query<ZoomBoundsParams>) -> HttpResponse {
    let zoom = params.zoom();
    let result = async {
        let summaries = state
            .aggregation
            .summarize(&params.bounds(), zoom::resolve(zoom))
            .await?;
        Ok::<_, GeoError>(state
            .clusters
            .map_clusters(&summaries, zoom)
            .into_iter()
            .map(ApiCluster::from)
            .collect::<Vec<_>>())
    }
    .await;
    respond(result)
}

/// `GET /api/map/map-summary/boundary-geometry`
pub async fn boundary_by_name(
    state: web::Data<AppState>,
    params: web::Query<GeometryByNameParams>,
) -> HttpResponse {
    let result = async {
        let geometry = state
            .geometry
            .get_by_name(params.boundary_type, &params.name)
            .await?;
        api_boundary(&geometry)
    }
    .await;
    respond(result)
}

/// `GET /api/boundaries/{type}/{id}`
pub async fn boundary(state: web::Data<AppState>, path: web::Path<(String, String)>) -> HttpResponse {
    let (raw_type, id) = path.into_inner();
    let result = async {
        let geometry = state.geometry.get(parse_type(&raw_type)?, &id).await?;
        api_boundary(&geometry)
    }
    .await;
    respond(result)
}

/// `GET /api/boundaries/cache-status/{type}/{id}`
pub async fn boundary_cache_status(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (raw_type, id) = path.into_inner();
    respond(parse_type(&raw_type).map(|boundary_type| {
        ApiCacheStatus::from(state.geometry.cache_status(boundary_type, &id))
    }))
}

/// `POST /api/boundaries/cache-batch`
///
/// Warms every listed boundary. Per-id failures are reported in the body
/// of a 200 response.
pub async fn cache_batch(state: web::Data<AppState>, body: web::Json<CacheBatchRequest>) -> HttpResponse {
    HttpResponse::Ok().json(state.warmer.warm(&body.boundary_ids).await)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::http::StatusCode;
    use actix_web::{App, test};
    use medimap_facility::FacilityStore;
    use medimap_facility_models::{Facility, MedicalStats};
    use medimap_geography::fixtures;
    use serde_json::Value;

    use super::*;
    use crate::config::ServerConfig;
    use crate::configure;

    fn facility(id: &str, kind: FacilityKind, name: &str, lat: f64, lng: f64) -> Facility {
        Facility {
            id: id.to_string(),
            kind,
            name: name.to_string(),
            address: String::new(),
            lat,
            lng,
            category: None,
            emergency: false,
            night_service: false,
            phone: None,
        }
    }

    fn state() -> web::Data<AppState> {
        let facilities = FacilityStore::from_facilities(vec![
            facility("H1", FacilityKind::Hospital, "서울대학교병원", 37.3, 126.2),
            facility("H2", FacilityKind::Hospital, "종로병원", 37.7, 126.2),
            facility("H3", FacilityKind::Hospital, "동부병원", 37.2, 126.8),
            facility("P1", FacilityKind::Pharmacy, "종로약국", 37.3, 126.4),
            facility("P2", FacilityKind::Pharmacy, "해운대약국", 35.2, 129.1),
        ]);
        web::Data::new(AppState::new(
            &ServerConfig::default(),
            Arc::new(fixtures::sample_source()),
            fixtures::sample_atlas(),
            facilities,
        ))
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(App::new().app_data($state.clone()).configure(configure)).await
        };
    }

    async fn get(state: &web::Data<AppState>, uri: &str) -> (StatusCode, Value) {
        let app = app!(state);
        let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
        let status = resp.status();
        let body: Value = test::read_body_json(resp).await;
        (status, body)
    }

    #[actix_web::test]
    async fn health_reports_dataset_version() {
        let (status, body) = get(&state(), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
        assert_eq!(body["datasetVersion"], fixtures::SAMPLE_VERSION);
    }

    #[actix_web::test]
    async fn area_summary_at_district_level() {
        let state = state();
        let (status, body) = get(
            &state,
            "/api/map/map-summary/sig?swLat=37&swLng=126&neLat=38&neLng=127",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["areaCode"], "11010");
        assert_eq!(rows[0]["hospitalCount"], 2);
        assert_eq!(rows[0]["pharmacyCount"], 1);
        assert_eq!(rows[1]["hospitalCount"], 1);
    }

    #[actix_web::test]
    async fn area_type_aliases_accepted() {
        let (status, body) = get(
            &state(),
            "/api/map/map-summary/sido?swLat=37&swLng=126&neLat=38&neLng=127",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["areaType"], "ctp");
    }

    #[actix_web::test]
    async fn status_codes() {
        let state = state();

        let (status, body) = get(
            &state,
            "/api/map/map-summary/sig?swLat=38&swLng=126&neLat=37&neLng=127",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("latitude"));

        let (status, _) = get(&state, "/api/map/map-summary/town?swLat=37&swLng=126&neLat=38&neLng=127").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get(&state, "/api/map/map-summary/sig?swLat=37").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = get(&state, "/api/boundaries/sig/99999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get(&state, "/api/geo/ctp/coordinates?lat=10&lng=10").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn timeout_maps_to_gateway_timeout() {
        let config = ServerConfig {
            compute_deadline_ms: 20,
            ..ServerConfig::default()
        };
        let state = web::Data::new(AppState::new(
            &config,
            Arc::new(fixtures::sample_source().with_delay(std::time::Duration::from_secs(5))),
            fixtures::sample_atlas(),
            FacilityStore::new(),
        ));
        let (status, body) = get(&state, "/api/boundaries/ctp/11").await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert!(body["error"].is_string());
    }

    #[actix_web::test]
    async fn boundary_geometry_and_cache_status() {
        let state = state();

        let (_, before) = get(&state, "/api/boundaries/cache-status/sig/11010").await;
        assert_eq!(before["isCached"], false);
        assert_eq!(before["status"], "missing");

        let (status, body) = get(&state, "/api/boundaries/sig/11010").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "11010");
        assert_eq!(body["type"], "sig");
        assert_eq!(body["geometry"]["type"], "MultiPolygon");

        let (_, after) = get(&state, "/api/boundaries/cache-status/sig/11010").await;
        assert_eq!(after["isCached"], true);
        assert_eq!(after["status"], "fresh");
        assert!(after["expiresAt"].is_string());
    }

    #[actix_web::test]
    async fn geometry_by_point_and_name() {
        let state = state();

        let (status, body) = get(&state, "/api/geo/li/coordinates?lat=37.3&lng=126.2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "1101010101");

        let uri = format!(
            "/api/map/map-summary/boundary-geometry?boundaryType=sido&name={}",
            "%EB%B6%80%EC%82%B0%EA%B4%91%EC%97%AD%EC%8B%9C"
        );
        let (status, body) = get(&state, &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "26");
    }

    #[actix_web::test]
    async fn summary_cache_endpoints() {
        let state = state();
        let query = "swLat=37&swLng=126&neLat=38&neLng=127&zoomLevel=12";

        let (_, miss) = get(&state, &format!("/api/map/map-summary/cached?{query}")).await;
        assert_eq!(miss, serde_json::json!({ "cached": false }));

        get(&state, "/api/map/map-summary/sig?swLat=37&swLng=126&neLat=38&neLng=127").await;

        let (_, status) = get(&state, &format!("/api/map/map-summary/cache-status?{query}")).await;
        assert_eq!(status["isCached"], true);

        let (_, hit) = get(&state, &format!("/api/map/map-summary/cached?{query}")).await;
        assert_eq!(hit["cached"], true);
        assert_eq!(hit["data"].as_array().unwrap().len(), 2);
    }

    #[actix_web::test]
    async fn emdong_summary_by_bounds_or_point() {
        let state = state();

        let (status, body) = get(
            &state,
            "/api/map/emdong-summary?swLat=37&swLng=126&neLat=38&neLng=127",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 3);

        let (status, body) = get(&state, "/api/map/emdong-summary?lat=37.3&lng=126.2&zoom=12").await;
        assert_eq!(status, StatusCode::OK);
        assert!(
            body.as_array()
                .unwrap()
                .iter()
                .any(|row| row["areaCode"] == "11010101")
        );

        let (status, _) = get(&state, "/api/map/emdong-summary").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn clusters() {
        let state = state();

        let (status, body) = get(
            &state,
            "/api/map/map-summary/mapCluster?swLat=37&swLng=126&neLat=38&neLng=127",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let total: u64 = body
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["count"].as_u64().unwrap())
            .sum();
        assert_eq!(total, 4);

        let (status, body) = get(
            &state,
            "/api/map/map-summary/clusters?swLat=37&swLng=126&neLat=38&neLng=127&centerLat=37.3&centerLng=126.3&radius=20",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let total: u64 = body
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["count"].as_u64().unwrap())
            .sum();
        // H1 and P1 are within 20 km of the centre; H2 and H3 are not.
        assert_eq!(total, 2);

        let (_, cached) = get(
            &state,
            "/api/map/map-summary/clusters?swLat=37&swLng=126&neLat=38&neLng=127&centerLat=37.3&centerLng=126.3&radius=20",
        )
        .await;
        assert_eq!(cached, body);

        let (status, across) = get(
            &state,
            "/api/map/map-summary/clusters?swLat=-10&swLng=170&neLat=10&neLng=-170",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(across, serde_json::json!([]));
    }

    #[actix_web::test]
    async fn facility_endpoints() {
        let state = state();

        let (_, pharmacies) = get(
            &state,
            "/api/map/map-data?type=pharmacy&swLat=37&swLng=126&neLat=38&neLng=127",
        )
        .await;
        assert_eq!(pharmacies.as_array().unwrap().len(), 1);
        assert_eq!(pharmacies[0]["id"], "P1");

        let (_, limited) = get(&state, "/api/map/map-data?limit=2").await;
        assert_eq!(limited.as_array().unwrap().len(), 2);

        let (_, stats) = get(&state, "/api/map_data/stats").await;
        let stats: MedicalStats = serde_json::from_value(stats).unwrap();
        assert_eq!(stats.total_hospitals, 3);
        assert_eq!(stats.total_pharmacies, 2);

        let (_, base) = get(&state, "/api/map-data").await;
        assert_eq!(base["hospitals"].as_array().unwrap().len(), 3);
        assert_eq!(base["provinces"].as_array().unwrap().len(), 2);

        let (_, summary) = get(&state, "/api/map/summary").await;
        assert_eq!(summary[0]["areaCode"], "11");
        assert_eq!(summary[0]["totalCount"], 4);
    }

    #[actix_web::test]
    async fn search_facilities_then_regions() {
        // "종로" matches two facility names and the 종로구 district.
        let (status, body) = get(&state(), "/api/map/search?query=%EC%A2%85%EB%A1%9C").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["facilities"].as_array().unwrap().len(), 2);
        assert_eq!(body["regions"][0]["id"], "11010");
    }

    #[actix_web::test]
    async fn cache_batch_reports_failures() {
        let state = state();
        let app = app!(state);
        let req = test::TestRequest::post()
            .uri("/api/boundaries/cache-batch")
            .set_json(serde_json::json!({
                "boundaryIds": ["11", "11010", "99999", "emd:11010101", "26"]
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["succeeded"].as_array().unwrap().len(), 4);
        assert_eq!(body["failed"][0]["id"], "99999");
    }
}
