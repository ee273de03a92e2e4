//! Bottom-up facility counts over the boundary tree.
//!
//! Every facility is attributed to exactly one leaf region and counted in
//! that leaf and each of its ancestors, so a parent's counts always equal
//! the sum of its children's. The table is rebuilt wholesale by
//! [`RollupStore::reconcile`] and kept current between rebuilds by
//! [`RollupStore::apply`], which only walks the affected leaf-to-root
//! paths.
//!
//! Each table records the facility store sequence number it reflects.
//! Change batches at or below that number are already counted and are
//! skipped, and a rebuild never replaces a table that has seen newer
//! changes.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use medimap_facility::FacilityStore;
use medimap_facility_models::{ChangeBatch, Facility, FacilityChange, FacilityKind};
use medimap_geography::{Atlas, AtlasHandle};
use medimap_geography_models::{AreaSummary, BoundaryRegion};

/// Facility counts for one region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionCounts {
    /// Hospitals in the region.
    pub hospitals: u64,
    /// Pharmacies in the region.
    pub pharmacies: u64,
}

impl RegionCounts {
    fn add(&mut self, kind: FacilityKind) {
        match kind {
            FacilityKind::Hospital => self.hospitals += 1,
            FacilityKind::Pharmacy => self.pharmacies += 1,
        }
    }

    fn subtract(&mut self, kind: FacilityKind) {
        match kind {
            FacilityKind::Hospital => self.hospitals = self.hospitals.saturating_sub(1),
            FacilityKind::Pharmacy => self.pharmacies = self.pharmacies.saturating_sub(1),
        }
    }

    const fn is_empty(self) -> bool {
        self.hospitals == 0 && self.pharmacies == 0
    }
}

/// An immutable snapshot of the rollup.
#[derive(Debug, Clone)]
pub struct SummaryTable {
    atlas_version: String,
    facility_seq: u64,
    computed_at: DateTime<Utc>,
    rows: BTreeMap<String, RegionCounts>,
}

impl SummaryTable {
    /// Dataset version the counts were attributed against.
    #[must_use]
    pub fn atlas_version(&self) -> &str {
        &self.atlas_version
    }

    /// Facility store sequence number of the last change set counted.
    #[must_use]
    pub const fn facility_seq(&self) -> u64 {
        self.facility_seq
    }

    /// When the table was last changed.
    #[must_use]
    pub const fn computed_at(&self) -> DateTime<Utc> {
        self.computed_at
    }

    /// Counts for a region. Regions without facilities have no row.
    #[must_use]
    pub fn counts(&self, region_id: &str) -> RegionCounts {
        self.rows.get(region_id).copied().unwrap_or_default()
    }

    /// The summary row served for `region`.
    #[must_use]
    pub fn summary(&self, region: &BoundaryRegion) -> AreaSummary {
        let counts = self.counts(&region.id);
        AreaSummary {
            region_id: region.id.clone(),
            boundary_type: region.boundary_type,
            name: region.name.clone(),
            hospital_count: counts.hospitals,
            pharmacy_count: counts.pharmacies,
            centroid: region.centroid,
            last_computed_at: self.computed_at,
        }
    }

    /// Adds or removes one facility along its leaf-to-root path. Returns
    /// `false` if the facility falls outside every region.
    fn attribute(&mut self, atlas: &Atlas, facility: &Facility, add: bool) -> bool {
        let Some(leaf) = atlas.leaf_for(facility.lat, facility.lng) else {
            return false;
        };

        let path = std::iter::once(leaf).chain(atlas.tree().ancestors(&leaf.id));
        for region in path {
            let row = self.rows.entry(region.id.clone()).or_default();
            if add {
                row.add(facility.kind);
            } else {
                row.subtract(facility.kind);
                if row.is_empty() {
                    self.rows.remove(&region.id);
                }
            }
        }
        true
    }
}

/// Holds the current [`SummaryTable`] and maintains it.
#[derive(Debug)]
pub struct RollupStore {
    atlas: Arc<AtlasHandle>,
    facilities: Arc<FacilityStore>,
    table: RwLock<Option<Arc<SummaryTable>>>,
}

impl RollupStore {
    /// Creates an empty store; the first read builds the table.
    #[must_use]
    pub const fn new(atlas: Arc<AtlasHandle>, facilities: Arc<FacilityStore>) -> Self {
        Self {
            atlas,
            facilities,
            table: RwLock::new(None),
        }
    }

    /// The current table, building it first if it was never built.
    #[must_use]
    pub fn table(&self) -> Arc<SummaryTable> {
        if let Some(table) = self.table.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            return Arc::clone(table);
        }
        self.reconcile()
    }

    /// Rebuilds the table from every facility record and publishes it.
    ///
    /// If a table against the same dataset version already counts newer
    /// facility changes than the records this rebuild read, that table is
    /// kept and returned instead.
    pub fn reconcile(&self) -> Arc<SummaryTable> {
        let atlas = self.atlas.current();
        let (facility_seq, facilities) = self.facilities.versioned_snapshot();

        let mut table = SummaryTable {
            atlas_version: atlas.version().to_string(),
            facility_seq,
            computed_at: Utc::now(),
            rows: BTreeMap::new(),
        };
        let mut unattributed = 0usize;
        for facility in facilities.values() {
            if !table.attribute(&atlas, facility, true) {
                unattributed += 1;
            }
        }

        log::info!(
            "Rollup rebuilt against atlas {} at facility seq {facility_seq}: {} facilities, {} regions with facilities, {unattributed} outside every region",
            table.atlas_version,
            facilities.len(),
            table.rows.len(),
        );
        self.publish_rebuilt(table)
    }

    fn publish_rebuilt(&self, table: SummaryTable) -> Arc<SummaryTable> {
        let mut slot = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = slot.as_ref().filter(|current| {
            current.atlas_version == table.atlas_version && current.facility_seq > table.facility_seq
        }) {
            log::debug!(
                "Discarding rollup rebuilt at facility seq {}, table already at {}",
                table.facility_seq,
                current.facility_seq
            );
            return Arc::clone(current);
        }

        let table = Arc::new(table);
        *slot = Some(Arc::clone(&table));
        table
    }

    /// Applies a facility change batch along its leaf-to-root paths and
    /// publishes the result.
    ///
    /// A batch the table already counts is skipped. Falls back to
    /// [`Self::reconcile`] if the table was never built, was attributed
    /// against a different dataset version, or is missing an earlier
    /// batch.
    pub fn apply(&self, batch: &ChangeBatch) -> Arc<SummaryTable> {
        let atlas = self.atlas.current();
        let mut slot = self.table.write().unwrap_or_else(PoisonError::into_inner);

        let current = slot
            .as_ref()
            .filter(|t| t.atlas_version == atlas.version())
            .map(Arc::clone);
        let Some(current) = current else {
            drop(slot);
            return self.reconcile();
        };

        if batch.seq <= current.facility_seq {
            log::trace!(
                "Skipping facility batch {}, table already at {}",
                batch.seq,
                current.facility_seq
            );
            return current;
        }
        if batch.seq != current.facility_seq + 1 {
            log::warn!(
                "Facility batch {} does not follow table seq {}, rebuilding",
                batch.seq,
                current.facility_seq
            );
            drop(slot);
            return self.reconcile();
        }

        let mut next = SummaryTable::clone(&current);
        for change in &batch.changes {
            match change {
                FacilityChange::Upsert { previous, current } => {
                    if let Some(previous) = previous {
                        next.attribute(&atlas, previous, false);
                    }
                    next.attribute(&atlas, current, true);
                }
                FacilityChange::Remove(previous) => {
                    next.attribute(&atlas, previous, false);
                }
            }
        }
        next.facility_seq = batch.seq;
        next.computed_at = Utc::now();

        log::debug!("Rollup applied {} facility changes (seq {})", batch.len(), batch.seq);
        let next = Arc::new(next);
        *slot = Some(Arc::clone(&next));
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medimap_geography::fixtures;
    use medimap_geography_models::BoundaryType;

    fn facility(id: &str, kind: FacilityKind, lat: f64, lng: f64) -> Facility {
        Facility {
            id: id.to_string(),
            kind,
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

    fn rollup(facilities: Vec<Facility>) -> (RollupStore, Arc<FacilityStore>, Arc<AtlasHandle>) {
        let atlas = Arc::new(AtlasHandle::new(fixtures::sample_atlas()));
        let store = Arc::new(FacilityStore::from_facilities(facilities));
        (RollupStore::new(Arc::clone(&atlas), Arc::clone(&store)), store, atlas)
    }

    fn assert_consistent(table: &SummaryTable, atlas: &Atlas) {
        for region in atlas.tree().iter() {
            let children = atlas.tree().children(&region.id);
            if children.is_empty() {
                continue;
            }
            let parent = table.counts(&region.id);
            let (h, p) = children.iter().fold((0, 0), |(h, p), id| {
                let c = table.counts(id);
                (h + c.hospitals, p + c.pharmacies)
            });
            assert_eq!((parent.hospitals, parent.pharmacies), (h, p), "region {}", region.id);
        }
    }

    #[test]
    fn counts_roll_up_to_province() {
        let (rollup, _, atlas) = rollup(vec![
            facility("H1", FacilityKind::Hospital, 37.3, 126.2),
            facility("H2", FacilityKind::Hospital, 37.7, 126.2),
            facility("P1", FacilityKind::Pharmacy, 37.3, 126.7),
            facility("P2", FacilityKind::Pharmacy, 35.2, 129.1),
            facility("X1", FacilityKind::Hospital, 10.0, 10.0),
        ]);
        let table = rollup.table();

        assert_eq!(table.counts("11"), RegionCounts { hospitals: 2, pharmacies: 1 });
        assert_eq!(table.counts("11010"), RegionCounts { hospitals: 2, pharmacies: 0 });
        assert_eq!(table.counts("1101010101"), RegionCounts { hospitals: 1, pharmacies: 0 });
        assert_eq!(table.counts("26"), RegionCounts { hospitals: 0, pharmacies: 1 });
        assert_eq!(table.counts("11020101"), RegionCounts { hospitals: 0, pharmacies: 1 });
        assert_consistent(&table, &atlas.current());
    }

    #[test]
    fn summary_row_carries_region_metadata() {
        let (rollup, _, atlas) = rollup(vec![facility("H1", FacilityKind::Hospital, 37.3, 126.2)]);
        let table = rollup.table();
        let atlas = atlas.current();
        let region = atlas.region(BoundaryType::Sig, "11010").unwrap();

        let summary = table.summary(region);
        assert_eq!(summary.name, "종로구");
        assert_eq!(summary.hospital_count, 1);
        assert_eq!(summary.total(), 1);
        assert_eq!(summary.last_computed_at, table.computed_at());
    }

    #[test]
    fn incremental_apply_matches_full_rebuild() {
        let (rollup, store, atlas) = rollup(vec![
            facility("H1", FacilityKind::Hospital, 37.3, 126.2),
            facility("H2", FacilityKind::Hospital, 37.7, 126.2),
            facility("P1", FacilityKind::Pharmacy, 37.3, 126.7),
        ]);
        rollup.table();

        let mut batches = Vec::new();
        batches.extend(store.upsert(facility("H1", FacilityKind::Hospital, 35.2, 129.1)));
        batches.extend(store.upsert(facility("P2", FacilityKind::Pharmacy, 37.3, 126.4)));
        batches.extend(store.remove("H2"));
        assert_eq!(batches.len(), 3);

        let incremental = batches.iter().map(|batch| rollup.apply(batch)).last().unwrap();
        assert_eq!(incremental.facility_seq(), store.seq());
        assert_consistent(&incremental, &atlas.current());

        let rebuilt = rollup.reconcile();
        assert_eq!(incremental.rows, rebuilt.rows);
        assert_eq!(rebuilt.counts("26"), RegionCounts { hospitals: 1, pharmacies: 0 });
        assert_eq!(rebuilt.counts("1101010102"), RegionCounts { hospitals: 0, pharmacies: 1 });
        assert!(rebuilt.rows.get("11010102").is_none());
    }

    #[test]
    fn apply_after_dataset_change_rebuilds() {
        let (rollup, store, atlas) = rollup(vec![facility("H1", FacilityKind::Hospital, 37.3, 126.2)]);
        rollup.table();

        atlas.replace(Atlas::build("sample-2", fixtures::sample_features()));
        let batch = store
            .upsert(facility("H2", FacilityKind::Hospital, 37.3, 126.2))
            .unwrap();
        let table = rollup.apply(&batch);

        assert_eq!(table.atlas_version(), "sample-2");
        assert_eq!(table.counts("11").hospitals, 2);
    }

    #[test]
    fn rebuild_then_batch_counts_once() {
        let (rollup, store, atlas) = rollup(vec![facility("H1", FacilityKind::Hospital, 37.3, 126.2)]);
        rollup.table();

        let batch = store.replace_all(vec![
            facility("H1", FacilityKind::Hospital, 37.3, 126.2),
            facility("H2", FacilityKind::Hospital, 37.7, 126.2),
        ]);
        rollup.reconcile();
        let table = rollup.apply(&batch);

        assert_eq!(table.counts("11").hospitals, 2);
        assert_eq!(table.facility_seq(), batch.seq);
        assert_consistent(&table, &atlas.current());
    }

    #[test]
    fn stale_rebuild_does_not_replace_newer_table() {
        let (rollup, store, _) = rollup(vec![facility("H1", FacilityKind::Hospital, 37.3, 126.2)]);
        rollup.table();

        // A rebuild that read the records before the batch landed.
        let atlas = rollup.atlas.current();
        let stale_seq = store.seq();
        let batch = store
            .upsert(facility("H2", FacilityKind::Hospital, 37.7, 126.2))
            .unwrap();
        let applied = rollup.apply(&batch);
        assert_eq!(applied.counts("11").hospitals, 2);

        let mut stale = SummaryTable {
            atlas_version: atlas.version().to_string(),
            facility_seq: stale_seq,
            computed_at: Utc::now(),
            rows: BTreeMap::new(),
        };
        stale.attribute(&atlas, &facility("H1", FacilityKind::Hospital, 37.3, 126.2), true);
        assert!(stale.facility_seq < applied.facility_seq());

        let kept = rollup.publish_rebuilt(stale);
        assert_eq!(kept.counts("11").hospitals, 2);
        assert_eq!(rollup.table().facility_seq(), batch.seq);
    }

    #[test]
    fn gap_in_batches_rebuilds() {
        let (rollup, store, _) = rollup(vec![facility("H1", FacilityKind::Hospital, 37.3, 126.2)]);
        rollup.table();

        let _missed = store.upsert(facility("H2", FacilityKind::Hospital, 37.7, 126.2));
        let next = store
            .upsert(facility("P1", FacilityKind::Pharmacy, 37.3, 126.7))
            .unwrap();
        let table = rollup.apply(&next);

        assert_eq!(table.counts("11"), RegionCounts { hospitals: 2, pharmacies: 1 });
        assert_eq!(table.facility_seq(), store.seq());
    }
}
