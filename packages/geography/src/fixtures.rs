//! A small synthetic boundary dataset shared by tests across the
//! workspace.
//!
//! Two provinces:
//!
//! * `11` 서울특별시, lat 37.1..37.9 × lng 126.1..126.9, split into
//!   districts `11010` (west half) and `11020` (east half). `11010` has
//!   neighborhoods `11010101` (south) and `11010102` (north); the south
//!   one has sub-neighborhoods `1101010101` (west) and `1101010102` (east).
//!   `11020` has a single neighborhood `11020101`.
//! * `26` 부산광역시, lat 35.0..35.4 × lng 128.9..129.3, with one district
//!   `26010` and one neighborhood `26010101`.

use geo::{MultiPolygon, polygon};
use medimap_geography_models::BoundaryType;

use crate::atlas::Atlas;
use crate::source::{GisFeature, InMemoryGisSource};

/// Version of the sample dataset.
pub const SAMPLE_VERSION: &str = "sample-1";

/// An axis-aligned rectangle as a polygon.
#[must_use]
pub fn rect(west: f64, south: f64, east: f64, north: f64) -> MultiPolygon<f64> {
    MultiPolygon(vec![polygon![
        (x: west, y: south),
        (x: east, y: south),
        (x: east, y: north),
        (x: west, y: north),
        (x: west, y: south),
    ]])
}

fn feature(id: &str, boundary_type: BoundaryType, name: &str, geometry: MultiPolygon<f64>) -> GisFeature {
    GisFeature {
        id: id.to_string(),
        boundary_type,
        name: name.to_string(),
        parent_id: None,
        geometry,
    }
}

/// The sample features.
#[must_use]
pub fn sample_features() -> Vec<GisFeature> {
    use BoundaryType::{Ctp, Emd, Ri, Sig};

    vec![
        feature("11", Ctp, "서울특별시", rect(126.1, 37.1, 126.9, 37.9)),
        feature("11010", Sig, "종로구", rect(126.1, 37.1, 126.5, 37.9)),
        feature("11020", Sig, "중구", rect(126.5, 37.1, 126.9, 37.9)),
        feature("11010101", Emd, "청운동", rect(126.1, 37.1, 126.5, 37.5)),
        feature("11010102", Emd, "신교동", rect(126.1, 37.5, 126.5, 37.9)),
        feature("11020101", Emd, "소공동", rect(126.5, 37.1, 126.9, 37.9)),
        feature("1101010101", Ri, "청운1리", rect(126.1, 37.1, 126.3, 37.5)),
        feature("1101010102", Ri, "청운2리", rect(126.3, 37.1, 126.5, 37.5)),
        feature("26", Ctp, "부산광역시", rect(128.9, 35.0, 129.3, 35.4)),
        feature("26010", Sig, "부산 중구", rect(128.9, 35.0, 129.3, 35.4)),
        feature("26010101", Emd, "영주동", rect(128.9, 35.0, 129.3, 35.4)),
    ]
}

/// An in-memory source serving the sample features.
#[must_use]
pub fn sample_source() -> InMemoryGisSource {
    InMemoryGisSource::new(SAMPLE_VERSION, sample_features())
}

/// An atlas built from the sample features.
#[must_use]
pub fn sample_atlas() -> Atlas {
    Atlas::build(SAMPLE_VERSION, sample_features())
}
