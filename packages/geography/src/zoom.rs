//! Zoom level to boundary granularity.

use medimap_geography_models::BoundaryType;

/// Resolves the granularity served at a map zoom level.
///
/// `zoom < 11` is `ctp`, `[11, 13)` is `sig`, `[13, 15)` is `emd`, and
/// anything finer is `ri`. Out-of-range values clamp to the nearest band;
/// NaN resolves to `ctp`.
#[must_use]
pub fn resolve(zoom: f64) -> BoundaryType {
    if zoom.is_nan() {
        return BoundaryType::Ctp;
    }
    BoundaryType::ALL
        .into_iter()
        .rev()
        .find(|level| zoom >= f64::from(level.min_zoom()))
        .unwrap_or(BoundaryType::Ctp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_edges() {
        assert_eq!(resolve(10.0), BoundaryType::Ctp);
        assert_eq!(resolve(10.999), BoundaryType::Ctp);
        assert_eq!(resolve(11.0), BoundaryType::Sig);
        assert_eq!(resolve(12.0), BoundaryType::Sig);
        assert_eq!(resolve(13.0), BoundaryType::Emd);
        assert_eq!(resolve(14.5), BoundaryType::Emd);
        assert_eq!(resolve(15.0), BoundaryType::Ri);
        assert_eq!(resolve(18.0), BoundaryType::Ri);
    }

    #[test]
    fn clamps_extremes() {
        assert_eq!(resolve(-3.0), BoundaryType::Ctp);
        assert_eq!(resolve(f64::NEG_INFINITY), BoundaryType::Ctp);
        assert_eq!(resolve(1e9), BoundaryType::Ri);
        assert_eq!(resolve(f64::INFINITY), BoundaryType::Ri);
        assert_eq!(resolve(f64::NAN), BoundaryType::Ctp);
    }

    #[test]
    fn monotonic() {
        let mut previous = resolve(-1.0);
        let mut zoom = -1.0;
        while zoom <= 25.0 {
            let level = resolve(zoom);
            assert!(level >= previous, "zoom {zoom} went coarser");
            previous = level;
            zoom += 0.25;
        }
    }
}
