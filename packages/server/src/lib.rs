#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web API server for the medimap hospital and pharmacy map.
//!
//! Serves zoom-adaptive area summaries, boundary geometry, clustering,
//! cache-status introspection and batch cache warming under `/api`. The
//! boundary dataset is read from `GeoJSON` files and the facility records
//! from a JSON export; both are re-checked by a periodic maintenance task.

pub mod config;
mod handlers;
pub mod maintenance;

use std::path::Path;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, error, middleware, web};
use medimap_aggregation::{AggregationEngine, ClusterEngine};
use medimap_boundaries::BoundaryGeometryStore;
use medimap_facility::{FacilityError, FacilityStore};
use medimap_geography::{Atlas, AtlasHandle, FileGisSource, GeoError, GisSource};
use medimap_server_models::ApiError;
use medimap_warmer::BatchWarmer;
use thiserror::Error;

use crate::config::{ConfigError, ServerConfig};
use crate::maintenance::Maintenance;

/// Errors that can stop the server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The boundary dataset could not be loaded.
    #[error(transparent)]
    Geo(#[from] GeoError),

    /// The facility records could not be loaded.
    #[error(transparent)]
    Facility(#[from] FacilityError),

    /// The HTTP server failed.
    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared application state.
pub struct AppState {
    /// The loaded boundary dataset.
    pub atlas: Arc<AtlasHandle>,
    /// Where the boundary dataset is read from.
    pub gis: Arc<dyn GisSource>,
    /// Hospital and pharmacy records.
    pub facilities: Arc<FacilityStore>,
    /// Cached boundary geometry.
    pub geometry: Arc<BoundaryGeometryStore>,
    /// Cached area summaries over the facility rollup.
    pub aggregation: Arc<AggregationEngine>,
    /// Marker clustering policy.
    pub clusters: ClusterEngine,
    /// Batch cache warming.
    pub warmer: BatchWarmer,
}

impl AppState {
    /// Wires the stores and engines together.
    #[must_use]
    pub fn new(
        config: &ServerConfig,
        gis: Arc<dyn GisSource>,
        atlas: Atlas,
        facilities: FacilityStore,
    ) -> Self {
        let atlas = Arc::new(AtlasHandle::new(atlas));
        let facilities = Arc::new(facilities);
        let geometry = Arc::new(BoundaryGeometryStore::new(
            Arc::clone(&gis),
            Arc::clone(&atlas),
            config.geometry_cache(),
        ));
        let aggregation = Arc::new(AggregationEngine::new(
            Arc::clone(&atlas),
            Arc::clone(&facilities),
            config.summary_cache(),
        ));
        let warmer = BatchWarmer::new(Arc::clone(&geometry), Arc::clone(&aggregation))
            .with_concurrency(config.warm_concurrency);

        Self {
            atlas,
            gis,
            facilities,
            geometry,
            aggregation,
            clusters: ClusterEngine::new(config.cluster()),
            warmer,
        }
    }

    /// The periodic maintenance task over this state.
    #[must_use]
    pub fn maintenance(&self, config: &ServerConfig) -> Maintenance {
        Maintenance {
            gis: Arc::clone(&self.gis),
            atlas: Arc::clone(&self.atlas),
            facilities: Arc::clone(&self.facilities),
            facilities_file: config.facilities_file(),
            geometry: Arc::clone(&self.geometry),
            aggregation: Arc::clone(&self.aggregation),
            reconcile_every: config.reconcile_every,
        }
    }
}

/// Registers every `/api` route.
///
/// Query strings that fail to deserialize get a 400 with a JSON error
/// body, like every other client error.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::QueryConfig::default().error_handler(|err, _req| {
        let body = ApiError {
            error: err.to_string(),
        };
        error::InternalError::from_response(err, HttpResponse::BadRequest().json(body)).into()
    }))
    .app_data(web::JsonConfig::default().error_handler(|err, _req| {
        let body = ApiError {
            error: err.to_string(),
        };
        error::InternalError::from_response(err, HttpResponse::BadRequest().json(body)).into()
    }))
    .service(
        web::scope("/api")
            .route("/health", web::get().to(handlers::health))
            .route("/map-data", web::get().to(handlers::base_map_data))
            .route("/map/map-data", web::get().to(handlers::map_data))
            .route("/map/search", web::get().to(handlers::search))
            .route("/map/summary", web::get().to(handlers::province_summary))
            .route("/map_data/stats", web::get().to(handlers::stats))
            .route("/geo/{type}/coordinates", web::get().to(handlers::boundary_at_point))
            .route("/map/emdong-summary", web::get().to(handlers::emdong_summary))
            // Fixed map-summary routes before the `{areaType}` catch-all.
            .route("/map/map-summary/cache-status", web::get().to(handlers::summary_cache_status))
            .route("/map/map-summary/cached", web::get().to(handlers::cached_summary))
            .route("/map/map-summary/clusters", web::get().to(handlers::facility_clusters))
            .route("/map/map-summary/mapCluster", web::get().to(handlers::map_clusters))
            .route(
                "/map/map-summary/boundary-geometry",
                web::get().to(handlers::boundary_by_name),
            )
            .route("/map/map-summary/{areaType}", web::get().to(handlers::area_summary))
            .route(
                "/boundaries/cache-status/{type}/{id}",
                web::get().to(handlers::boundary_cache_status),
            )
            .route("/boundaries/cache-batch", web::post().to(handlers::cache_batch))
            .route("/boundaries/{type}/{id}", web::get().to(handlers::boundary)),
    );
}

/// Loads facility records, starting empty if the export does not exist
/// yet.
async fn load_facilities(path: &Path) -> Result<FacilityStore, FacilityError> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        log::warn!("Facility export {} not found, starting empty", path.display());
        return Ok(FacilityStore::new());
    }
    let facilities = FacilityStore::load_json(path).await?;
    Ok(FacilityStore::from_facilities(facilities))
}

/// Starts the medimap API server.
///
/// Loads the configuration, the boundary dataset and the facility
/// records, starts the rollup updater and the maintenance task, and runs
/// the Actix-Web HTTP server. This is a regular async function; the caller
/// is responsible for providing the async runtime (e.g. via
/// `#[actix_web::main]`).
///
/// # Errors
///
/// Returns a [`ServerError`] if the configuration or boundary dataset
/// cannot be loaded, or if the HTTP server fails to bind or encounters a
/// runtime error.
#[allow(clippy::future_not_send)]
pub async fn run_server() -> Result<(), ServerError> {
    pretty_env_logger::init_custom_env("RUST_LOG");

    let config = ServerConfig::load()?;

    log::info!("Loading boundary dataset from {}...", config.gis_dir().display());
    let gis: Arc<dyn GisSource> = Arc::new(FileGisSource::new(config.gis_dir()));
    let atlas = Atlas::load(gis.as_ref()).await?;

    log::info!("Loading facility records...");
    let facilities = load_facilities(&config.facilities_file()).await?;
    log::info!("Loaded {} facilities", facilities.len());

    let state = AppState::new(&config, gis, atlas, facilities);
    let updater = state.aggregation.spawn_updater();
    let maintenance = state.maintenance(&config).spawn(config.maintenance_interval());
    let state = web::Data::new(state);

    log::info!("Starting server on {}:{}", config.bind_addr, config.port);

    let result = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(configure)
    })
    .bind((config.bind_addr.as_str(), config.port))?
    .run()
    .await;

    maintenance.abort();
    updater.abort();
    Ok(result?)
}
