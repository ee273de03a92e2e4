#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! In-memory view of the hospital and pharmacy records.
//!
//! The authoritative record store is external. Its export is loaded into a
//! [`FacilityStore`], which serves typed map queries, text search, and
//! statistics, and broadcasts every change set so the area rollup can be
//! maintained incrementally.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use medimap_facility_models::{ChangeBatch, Facility, FacilityChange, FacilityKind, MedicalStats};
use medimap_geography_models::{BoundingBox, LatLng};
use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of the change broadcast channel.
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Errors that can occur while loading facility records.
#[derive(Debug, Error)]
pub enum FacilityError {
    /// The export file could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// Path of the export.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The export was not a JSON array of facilities.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

type Records = BTreeMap<String, Facility>;

#[derive(Debug, Default)]
struct State {
    seq: u64,
    records: Arc<Records>,
}

/// Copy-on-write facility records keyed by id.
///
/// Every change set bumps a sequence number under the same lock that
/// swaps the records, and is broadcast before that lock is released, so
/// subscribers see batches in sequence order.
#[derive(Debug)]
pub struct FacilityStore {
    state: RwLock<State>,
    changes: broadcast::Sender<Arc<ChangeBatch>>,
}

impl Default for FacilityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FacilityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            changes,
        }
    }

    /// Creates a store holding `facilities`.
    #[must_use]
    pub fn from_facilities(facilities: Vec<Facility>) -> Self {
        let store = Self::new();
        store.replace_all(facilities);
        store
    }

    /// Reads a JSON array of facilities from disk.
    ///
    /// # Errors
    ///
    /// Returns [`FacilityError`] if the file cannot be read or parsed.
    pub async fn load_json(path: &Path) -> Result<Vec<Facility>, FacilityError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| FacilityError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let facilities: Vec<Facility> = serde_json::from_str(&text)?;
        log::info!("Read {} facilities from {}", facilities.len(), path.display());
        Ok(facilities)
    }

    /// Subscribes to change sets published by this store.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ChangeBatch>> {
        self.changes.subscribe()
    }

    /// The current records.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Records> {
        self.versioned_snapshot().1
    }

    /// The current records together with the sequence number of the last
    /// change set they include.
    #[must_use]
    pub fn versioned_snapshot(&self) -> (u64, Arc<Records>) {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        (state.seq, Arc::clone(&state.records))
    }

    /// Sequence number of the last change set.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.versioned_snapshot().0
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Replaces every record, returning and broadcasting the difference.
    /// An unchanged record set yields an empty batch that is not
    /// broadcast and does not advance the sequence.
    ///
    /// Records without a valid coordinate are skipped.
    pub fn replace_all(&self, facilities: Vec<Facility>) -> ChangeBatch {
        let mut next = Records::new();
        let mut skipped = 0usize;
        for facility in facilities {
            if facility.has_valid_location() {
                next.insert(facility.id.clone(), facility);
            } else {
                skipped += 1;
            }
        }
        if skipped > 0 {
            log::warn!("Skipped {skipped} facilities without a valid location");
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let changes = diff(&state.records, &next);
        if changes.is_empty() {
            return ChangeBatch {
                seq: state.seq,
                changes,
            };
        }
        state.records = Arc::new(next);
        let batch = self.publish(&mut state, changes);
        drop(state);

        log::info!("Facility records replaced: {} changes", batch.len());
        batch
    }

    /// Adds or replaces one record. Returns `None` if nothing changed.
    pub fn upsert(&self, facility: Facility) -> Option<ChangeBatch> {
        if !facility.has_valid_location() {
            log::warn!("Ignoring facility {} without a valid location", facility.id);
            return None;
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let previous = state.records.get(&facility.id).cloned();
        if previous.as_ref() == Some(&facility) {
            return None;
        }
        Arc::make_mut(&mut state.records).insert(facility.id.clone(), facility.clone());
        let change = FacilityChange::Upsert {
            previous,
            current: facility,
        };
        Some(self.publish(&mut state, vec![change]))
    }

    /// Removes one record. Returns `None` if it did not exist.
    pub fn remove(&self, id: &str) -> Option<ChangeBatch> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if !state.records.contains_key(id) {
            return None;
        }
        let previous = Arc::make_mut(&mut state.records).remove(id)?;
        Some(self.publish(&mut state, vec![FacilityChange::Remove(previous)]))
    }

    /// Advances the sequence and broadcasts `changes`. Called with the
    /// state lock held.
    fn publish(&self, state: &mut State, changes: Vec<FacilityChange>) -> ChangeBatch {
        state.seq += 1;
        let batch = ChangeBatch {
            seq: state.seq,
            changes,
        };
        // No subscribers is fine; the periodic reconcile catches up.
        let _ = self.changes.send(Arc::new(batch.clone()));
        batch
    }

    /// Facilities of `kind` (any kind if `None`) inside any of `boxes`
    /// (anywhere if empty), in id order, at most `limit`.
    #[must_use]
    pub fn query(
        &self,
        kind: Option<FacilityKind>,
        boxes: &[BoundingBox],
        limit: usize,
    ) -> Vec<Facility> {
        self.snapshot()
            .values()
            .filter(|f| kind.is_none_or(|k| f.kind == k))
            .filter(|f| boxes.is_empty() || boxes.iter().any(|b| b.contains(f.location())))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Facilities whose name or address contains `query`, at most `limit`.
    ///
    /// Name matches come before address-only matches.
    #[must_use]
    pub fn search(&self, query: &str, limit: usize) -> Vec<Facility> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() || limit == 0 {
            return Vec::new();
        }

        let records = self.snapshot();
        let (mut by_name, by_address): (Vec<&Facility>, Vec<&Facility>) = records
            .values()
            .filter(|f| {
                f.name.to_lowercase().contains(&needle) || f.address.to_lowercase().contains(&needle)
            })
            .partition(|f| f.name.to_lowercase().contains(&needle));
        by_name.extend(by_address);
        by_name.into_iter().take(limit).cloned().collect()
    }

    /// Statistics over every record.
    #[must_use]
    pub fn stats(&self) -> MedicalStats {
        MedicalStats::from_facilities(self.snapshot().values())
    }

    /// Facilities inside any of `boxes` and within `radius_m` metres of
    /// `center`.
    #[must_use]
    pub fn within_radius(&self, center: LatLng, radius_m: f64, boxes: &[BoundingBox]) -> Vec<Facility> {
        self.snapshot()
            .values()
            .filter(|f| boxes.is_empty() || boxes.iter().any(|b| b.contains(f.location())))
            .filter(|f| center.distance_m(&f.location()) <= radius_m)
            .cloned()
            .collect()
    }
}

/// Changes that turn `before` into `after`, in id order.
fn diff(before: &Records, after: &Records) -> Vec<FacilityChange> {
    let mut changes = Vec::new();

    for (id, current) in after {
        match before.get(id) {
            Some(previous) if previous == current => {}
            previous => changes.push(FacilityChange::Upsert {
                previous: previous.cloned(),
                current: current.clone(),
            }),
        }
    }

    for (id, previous) in before {
        if !after.contains_key(id) {
            changes.push(FacilityChange::Remove(previous.clone()));
        }
    }

    changes
}
