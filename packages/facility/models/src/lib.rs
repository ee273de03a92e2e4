#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Hospital and pharmacy records.
//!
//! Facilities come from an external record store and are only read here.
//! Field aliases accept the public data portal's names (`yadmNm`, `addr`,
//! `telno`, `clCdNm`) alongside the canonical ones.

use medimap_geography_models::LatLng;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Category substring identifying public health centres (`보건소`,
/// `보건지소`, `보건진료소`).
pub const HEALTH_CENTER_MARKER: &str = "보건";

/// What kind of facility a record describes.
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
pub enum FacilityKind {
    /// Hospitals, clinics, and health centres.
    Hospital,
    /// Pharmacies.
    Pharmacy,
}

/// One hospital or pharmacy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Facility {
    /// Stable record id.
    pub id: String,
    /// Hospital or pharmacy.
    #[serde(rename = "type", alias = "kind")]
    pub kind: FacilityKind,
    /// Display name.
    #[serde(alias = "yadmNm")]
    pub name: String,
    /// Street address.
    #[serde(default, alias = "addr")]
    pub address: String,
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    #[serde(alias = "lon")]
    pub lng: f64,
    /// Institution category (`종합병원`, `의원`, `보건소`, ...).
    #[serde(default, alias = "clCdNm")]
    pub category: Option<String>,
    /// Operates an emergency room.
    #[serde(default)]
    pub emergency: bool,
    /// Open at night.
    #[serde(default)]
    pub night_service: bool,
    /// Phone number.
    #[serde(default, alias = "telno")]
    pub phone: Option<String>,
}

impl Facility {
    /// The facility's coordinate.
    #[must_use]
    pub const fn location(&self) -> LatLng {
        LatLng::new(self.lat, self.lng)
    }

    /// Whether the coordinate is a usable WGS84 point.
    #[must_use]
    pub fn has_valid_location(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Whether this is a public health centre.
    #[must_use]
    pub fn is_health_center(&self) -> bool {
        self.kind == FacilityKind::Hospital
            && self
                .category
                .as_deref()
                .is_some_and(|c| c.contains(HEALTH_CENTER_MARKER))
    }
}

/// A change to the facility record set.
#[derive(Debug, Clone, PartialEq)]
pub enum FacilityChange {
    /// A record was added (`previous` is `None`) or replaced.
    Upsert {
        /// The record before the change.
        previous: Option<Facility>,
        /// The record after the change.
        current: Facility,
    },
    /// A record was deleted.
    Remove(Facility),
}

/// Changes published together by the record store.
///
/// `seq` is the store's change sequence number once the batch is applied;
/// it grows by one per batch, so a consumer that has seen `seq - 1` can
/// apply the batch on top and anything at or below its own number is
/// already included.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    /// Store sequence number after this batch.
    pub seq: u64,
    /// The changes, in id order for bulk replacements.
    pub changes: Vec<FacilityChange>,
}

impl ChangeBatch {
    /// Number of changes in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether the batch carries no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Nationwide facility statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicalStats {
    /// Number of hospitals, health centres included.
    pub total_hospitals: u64,
    /// Number of pharmacies.
    pub total_pharmacies: u64,
    /// Number of public health centres.
    pub total_health_centers: u64,
    /// Hospitals with an emergency room.
    pub emergency_hospitals: u64,
    /// Hospitals open at night.
    pub night_service_hospitals: u64,
}

impl MedicalStats {
    /// Tallies statistics over a set of records.
    pub fn from_facilities<'a>(facilities: impl IntoIterator<Item = &'a Facility>) -> Self {
        let mut stats = Self::default();
        for facility in facilities {
            match facility.kind {
                FacilityKind::Hospital => {
                    stats.total_hospitals += 1;
                    if facility.is_health_center() {
                        stats.total_health_centers += 1;
                    }
                    if facility.emergency {
                        stats.emergency_hospitals += 1;
                    }
                    if facility.night_service {
                        stats.night_service_hospitals += 1;
                    }
                }
                FacilityKind::Pharmacy => stats.total_pharmacies += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hospital(id: &str, category: Option<&str>) -> Facility {
        Facility {
            id: id.to_string(),
            kind: FacilityKind::Hospital,
            name: format!("병원 {id}"),
            address: String::new(),
            lat: 37.5,
            lng: 127.0,
            category: category.map(str::to_string),
            emergency: false,
            night_service: false,
            phone: None,
        }
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("Hospital".parse::<FacilityKind>().unwrap(), FacilityKind::Hospital);
        assert_eq!("pharmacy".parse::<FacilityKind>().unwrap(), FacilityKind::Pharmacy);
        assert!("clinic".parse::<FacilityKind>().is_err());
        assert_eq!(FacilityKind::Pharmacy.to_string(), "pharmacy");
    }

    #[test]
    fn deserializes_portal_field_names() {
        let facility: Facility = serde_json::from_str(
            r#"{
                "id": "H1",
                "type": "hospital",
                "yadmNm": "서울보건소",
                "addr": "서울특별시 종로구",
                "lat": 37.57,
                "lon": 126.98,
                "clCdNm": "보건소",
                "telno": "02-000-0000",
                "nightService": true
            }"#,
        )
        .unwrap();

        assert_eq!(facility.name, "서울보건소");
        assert_eq!(facility.address, "서울특별시 종로구");
        assert!((facility.lng - 126.98).abs() < f64::EPSILON);
        assert_eq!(facility.phone.as_deref(), Some("02-000-0000"));
        assert!(facility.night_service);
        assert!(!facility.emergency);
        assert!(facility.is_health_center());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(hospital("H1", None)).unwrap();
        assert_eq!(json["type"], "hospital");
        assert_eq!(json["nightService"], false);
    }

    #[test]
    fn location_validity() {
        let mut facility = hospital("H1", None);
        assert!(facility.has_valid_location());
        facility.lat = f64::NAN;
        assert!(!facility.has_valid_location());
        facility.lat = 91.0;
        assert!(!facility.has_valid_location());
    }

    #[test]
    fn stats_tally() {
        let mut er = hospital("H2", Some("종합병원"));
        er.emergency = true;
        er.night_service = true;
        let pharmacy = Facility {
            kind: FacilityKind::Pharmacy,
            category: Some("보건의료".to_string()),
            ..hospital("P1", None)
        };

        let facilities = vec![hospital("H1", Some("보건지소")), er, pharmacy];
        let stats = MedicalStats::from_facilities(&facilities);

        assert_eq!(
            stats,
            MedicalStats {
                total_hospitals: 2,
                total_pharmacies: 1,
                total_health_centers: 1,
                emergency_hospitals: 1,
                night_service_hospitals: 1,
            }
        );
    }
}
