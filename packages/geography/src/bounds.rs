//! Viewport validation and normalization.

use medimap_geography_models::{Bounds, BoundingBox, LatLng};

use crate::GeoError;

/// Highest zoom a viewport is built for.
pub const MAX_ZOOM: f64 = 22.0;

/// Validates client bounds and converts them into one or two boxes.
///
/// A box whose south-west longitude is east of its north-east longitude
/// crosses the antimeridian and is split into `[sw.lng, 180]` and
/// `[-180, ne.lng]`.
///
/// # Errors
///
/// Returns [`GeoError::InvalidBounds`] if any coordinate is not finite or
/// out of range, or if `sw.lat >= ne.lat`.
pub fn validate(bounds: &Bounds) -> Result<Vec<BoundingBox>, GeoError> {
    check_point("sw", bounds.sw)?;
    check_point("ne", bounds.ne)?;

    if bounds.sw.lat >= bounds.ne.lat {
        return Err(GeoError::invalid_bounds(format!(
            "south-west latitude {} must be below north-east latitude {}",
            bounds.sw.lat, bounds.ne.lat
        )));
    }

    if bounds.sw.lng > bounds.ne.lng {
        return Ok(vec![
            BoundingBox::new(bounds.sw.lng, bounds.sw.lat, 180.0, bounds.ne.lat),
            BoundingBox::new(-180.0, bounds.sw.lat, bounds.ne.lng, bounds.ne.lat),
        ]);
    }

    Ok(vec![BoundingBox::new(
        bounds.sw.lng,
        bounds.sw.lat,
        bounds.ne.lng,
        bounds.ne.lat,
    )])
}

fn check_point(label: &str, point: LatLng) -> Result<(), GeoError> {
    if !point.lat.is_finite() || !point.lng.is_finite() {
        return Err(GeoError::invalid_bounds(format!(
            "{label} coordinate ({}, {}) is not finite",
            point.lat, point.lng
        )));
    }
    if !(-90.0..=90.0).contains(&point.lat) {
        return Err(GeoError::invalid_bounds(format!(
            "{label} latitude {} is outside [-90, 90]",
            point.lat
        )));
    }
    if !(-180.0..=180.0).contains(&point.lng) {
        return Err(GeoError::invalid_bounds(format!(
            "{label} longitude {} is outside [-180, 180]",
            point.lng
        )));
    }
    Ok(())
}

/// Expands a box outward to the enclosing cells of a `tile`-degree grid.
///
/// Nearby viewports snap to the same box, so they share a cache entry.
#[must_use]
pub fn snap(bbox: &BoundingBox, tile: f64) -> BoundingBox {
    let down = |v: f64| (v / tile).floor() * tile;
    let up = |v: f64| (v / tile).ceil() * tile;

    BoundingBox::new(
        down(bbox.west).max(-180.0),
        down(bbox.south).max(-90.0),
        up(bbox.east).min(180.0),
        up(bbox.north).min(90.0),
    )
}

/// Builds the viewport a client at `zoom` would see around `center`.
///
/// The box spans `360 / 2^zoom` degrees of longitude and half that of
/// latitude, clamped to valid coordinates.
///
/// # Errors
///
/// Returns [`GeoError::InvalidBounds`] if `center` is not a valid
/// coordinate.
pub fn around(center: LatLng, zoom: f64) -> Result<BoundingBox, GeoError> {
    check_point("center", center)?;

    let zoom = if zoom.is_nan() {
        0.0
    } else {
        zoom.clamp(0.0, MAX_ZOOM)
    };
    let half_lng = 180.0 / zoom.exp2();
    let half_lat = half_lng / 2.0;

    Ok(BoundingBox::new(
        (center.lng - half_lng).max(-180.0),
        (center.lat - half_lat).max(-90.0),
        (center.lng + half_lng).min(180.0),
        (center.lat + half_lat).min(90.0),
    ))
}
