//! Periodic background upkeep.
//!
//! Each pass re-reads the facility export (the resulting change set
//! reaches the rollup through the broadcast updater), rebuilds the atlas
//! if the GIS dataset version changed, purges expired cache entries, and
//! every `reconcile_every` passes rebuilds the rollup from scratch to
//! correct any drift.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use medimap_aggregation::AggregationEngine;
use medimap_boundaries::BoundaryGeometryStore;
use medimap_facility::FacilityStore;
use medimap_geography::{AtlasHandle, GisSource};
use tokio::task::JoinHandle;

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Facility changes found in the export.
    pub facility_changes: usize,
    /// Whether a new atlas was published.
    pub atlas_rebuilt: bool,
    /// Expired cache entries removed.
    pub purged: usize,
    /// Whether the rollup was rebuilt from scratch.
    pub reconciled: bool,
}

/// Handles to everything maintenance touches.
pub struct Maintenance {
    /// Where the boundary dataset is read from.
    pub gis: Arc<dyn GisSource>,
    /// The loaded boundary dataset.
    pub atlas: Arc<AtlasHandle>,
    /// Hospital and pharmacy records.
    pub facilities: Arc<FacilityStore>,
    /// Facility records export.
    pub facilities_file: PathBuf,
    /// Cached boundary geometry.
    pub geometry: Arc<BoundaryGeometryStore>,
    /// Cached area summaries.
    pub aggregation: Arc<AggregationEngine>,
    /// Passes between full rollup rebuilds.
    pub reconcile_every: u64,
}

impl Maintenance {
    /// Runs a pass every `interval`, starting one interval from now.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            let mut pass = 1u64;
            loop {
                ticker.tick().await;
                let report = self.run_pass(pass).await;
                log::debug!("Maintenance pass {pass}: {report:?}");
                pass += 1;
            }
        })
    }

    /// Runs one pass. Failures are logged and leave the current state in
    /// place.
    pub async fn run_pass(&self, pass: u64) -> PassReport {
        let mut report = PassReport::default();

        if tokio::fs::try_exists(&self.facilities_file)
            .await
            .unwrap_or(false)
        {
            match FacilityStore::load_json(&self.facilities_file).await {
                Ok(records) => {
                    report.facility_changes = self.facilities.replace_all(records).len();
                    if report.facility_changes > 0 {
                        log::info!("Facility export changed: {} records updated", report.facility_changes);
                    }
                }
                Err(e) => log::warn!("Failed to reload facility records: {e}"),
            }
        }

        match self.atlas.refresh(self.gis.as_ref()).await {
            Ok(true) => {
                self.geometry.invalidate_all();
                self.aggregation.reconcile();
                report.atlas_rebuilt = true;
                report.reconciled = true;
            }
            Ok(false) => {}
            Err(e) => log::warn!("Failed to refresh boundary dataset: {e}"),
        }

        report.purged = self.geometry.purge_expired() + self.aggregation.purge_expired();

        if !report.reconciled && pass % self.reconcile_every.max(1) == 0 {
            self.aggregation.reconcile();
            report.reconciled = true;
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use medimap_facility_models::{Facility, FacilityKind};
    use medimap_geography::fixtures;
    use medimap_geography::InMemoryGisSource;

    use super::*;
    use crate::AppState;
    use crate::config::ServerConfig;

    fn facility(id: &str, lat: f64, lng: f64) -> Facility {
        Facility {
            id: id.to_string(),
            kind: FacilityKind::Hospital,
            name: id.to_string(),
            address: String::new(),
            lat,
            lng,
            category: None,
            emergency: false,
            night_service: false,
            phone: None,
        }
    }

    fn maintenance(source: Arc<InMemoryGisSource>, facilities_file: PathBuf, reconcile_every: u64) -> (AppState, Maintenance) {
        let config = ServerConfig {
            facilities_file: Some(facilities_file),
            reconcile_every,
            ..ServerConfig::default()
        };
        let state = AppState::new(&config, source, fixtures::sample_atlas(), FacilityStore::new());
        let maintenance = state.maintenance(&config);
        (state, maintenance)
    }

    #[tokio::test]
    async fn picks_up_dataset_version_bump() {
        let source = Arc::new(fixtures::sample_source());
        let (state, maintenance) = maintenance(Arc::clone(&source), PathBuf::from("/nonexistent/facilities.json"), 100);

        assert_eq!(maintenance.run_pass(1).await, PassReport::default());

        source.replace("sample-2", fixtures::sample_features());
        let report = maintenance.run_pass(2).await;
        assert!(report.atlas_rebuilt);
        assert!(report.reconciled);
        assert_eq!(state.atlas.current().version(), "sample-2");
    }

    #[tokio::test]
    async fn reloads_facility_export() {
        let dir = std::env::temp_dir().join(format!("medimap-maintenance-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let file = dir.join("facilities.json");
        let records = vec![facility("H1", 37.3, 126.2), facility("H2", 35.2, 129.1)];
        tokio::fs::write(&file, serde_json::to_vec(&records).unwrap())
            .await
            .unwrap();

        let (state, maintenance) = maintenance(Arc::new(fixtures::sample_source()), file, 2);

        let first = maintenance.run_pass(1).await;
        assert_eq!(first.facility_changes, 2);
        assert!(!first.reconciled);
        assert_eq!(state.facilities.len(), 2);

        let second = maintenance.run_pass(2).await;
        assert_eq!(second.facility_changes, 0);
        assert!(second.reconciled);
        assert_eq!(state.aggregation.rollup().table().counts("11").hospitals, 1);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn reload_and_rebuild_in_one_pass_counts_once() {
        let dir = std::env::temp_dir().join(format!("medimap-maintenance-once-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let file = dir.join("facilities.json");
        let records = vec![facility("H1", 37.3, 126.2), facility("H2", 37.7, 126.2)];
        tokio::fs::write(&file, serde_json::to_vec(&records).unwrap())
            .await
            .unwrap();

        let (state, maintenance) = maintenance(Arc::new(fixtures::sample_source()), file, 1);
        state.aggregation.rollup().table();
        let updater = state.aggregation.spawn_updater();

        let report = maintenance.run_pass(1).await;
        assert_eq!(report.facility_changes, 2);
        assert!(report.reconciled);

        tokio::time::timeout(Duration::from_secs(1), async {
            while state.aggregation.rollup().table().facility_seq() < state.facilities.seq() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(state.aggregation.rollup().table().counts("11").hospitals, 2);

        updater.abort();
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
