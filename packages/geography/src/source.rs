//! GIS dataset sources.
//!
//! The boundary polygons come from an external GIS dataset. Production
//! reads one `GeoJSON` feature collection per level from a directory
//! (`ctp.geojson`, `sig.geojson`, `emd.geojson`, `ri.geojson`) alongside a
//! `VERSION` file; tests use [`InMemoryGisSource`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use geo::MultiPolygon;
use geojson::GeoJson;
use medimap_geography_models::{BoundaryType, sido};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::GeoError;

/// Version reported for a dataset directory without a `VERSION` file.
pub const UNVERSIONED: &str = "unversioned";

/// One boundary as delivered by the GIS dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct GisFeature {
    /// Administrative code.
    pub id: String,
    /// Level of the boundary.
    pub boundary_type: BoundaryType,
    /// Korean display name.
    pub name: String,
    /// Explicit parent code, if the dataset carries one.
    pub parent_id: Option<String>,
    /// Boundary polygon.
    pub geometry: MultiPolygon<f64>,
}

impl GisFeature {
    /// The parent id: the explicit one, or the code prefix of the next
    /// coarser level.
    #[must_use]
    pub fn resolved_parent_id(&self) -> Option<String> {
        let coarser = self.boundary_type.coarser()?;
        if let Some(parent) = &self.parent_id {
            return Some(parent.clone());
        }
        let len = coarser.code_len();
        (self.id.len() > len && self.id.is_char_boundary(len)).then(|| self.id[..len].to_string())
    }

    /// Serializes the geometry as `GeoJSON` and wraps it with its digest.
    ///
    /// # Errors
    ///
    /// Returns [`GeoError::Dataset`] if serialization fails.
    pub fn to_boundary_geometry(&self) -> Result<BoundaryGeometry, GeoError> {
        let geometry = geojson::Geometry::new(geojson::Value::from(&self.geometry));
        let json = serde_json::to_string(&geometry)
            .map_err(|e| GeoError::dataset(format!("serializing boundary {}: {e}", self.id)))?;
        Ok(BoundaryGeometry::new(
            self.id.clone(),
            self.boundary_type,
            self.name.clone(),
            json,
        ))
    }
}

/// A boundary's serialized geometry, as cached and served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryGeometry {
    /// Administrative code.
    pub id: String,
    /// Level of the boundary.
    pub boundary_type: BoundaryType,
    /// Korean display name.
    pub name: String,
    /// `GeoJSON` geometry text.
    pub geojson: Arc<str>,
    /// Hex SHA-256 of `geojson`, taken when the geometry was loaded.
    pub digest: String,
}

impl BoundaryGeometry {
    /// Wraps geometry text, computing its digest.
    #[must_use]
    pub fn new(id: String, boundary_type: BoundaryType, name: String, geojson: String) -> Self {
        let digest = digest(&geojson);
        Self {
            id,
            boundary_type,
            name,
            geojson: geojson.into(),
            digest,
        }
    }

    /// Whether the geometry still matches the digest taken at load time.
    #[must_use]
    pub fn verify(&self) -> bool {
        digest(&self.geojson) == self.digest
    }
}

fn digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// An external GIS dataset.
#[async_trait]
pub trait GisSource: Send + Sync {
    /// Current dataset version. A change means every boundary may have
    /// changed.
    async fn dataset_version(&self) -> Result<String, GeoError>;

    /// Loads every boundary at every level.
    async fn load_regions(&self) -> Result<Vec<GisFeature>, GeoError>;

    /// Loads one boundary's geometry.
    ///
    /// Returns [`GeoError::UnknownBoundary`] if the dataset has no such
    /// boundary.
    async fn load_geometry(
        &self,
        boundary_type: BoundaryType,
        id: &str,
    ) -> Result<BoundaryGeometry, GeoError>;
}

struct LoadedDataset {
    version: String,
    features: BTreeMap<String, GisFeature>,
}

/// Reads the dataset from a directory of `GeoJSON` files.
///
/// Parsed features are kept in memory and re-read whenever the `VERSION`
/// file changes.
pub struct FileGisSource {
    dir: PathBuf,
    loaded: tokio::sync::RwLock<Option<Arc<LoadedDataset>>>,
}

impl std::fmt::Debug for FileGisSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileGisSource")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl FileGisSource {
    /// Creates a source reading from `dir`. Nothing is read until first
    /// use.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            loaded: tokio::sync::RwLock::new(None),
        }
    }

    async fn read_version(&self) -> Result<String, GeoError> {
        match tokio::fs::read_to_string(self.dir.join("VERSION")).await {
            Ok(text) => {
                let version = text.trim();
                Ok(if version.is_empty() {
                    UNVERSIONED.to_string()
                } else {
                    version.to_string()
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(UNVERSIONED.to_string()),
            Err(e) => Err(GeoError::dataset(format!(
                "reading {}: {e}",
                self.dir.join("VERSION").display()
            ))),
        }
    }

    /// Returns the parsed dataset, re-reading the files if the version
    /// changed since the last read.
    async fn dataset(&self) -> Result<Arc<LoadedDataset>, GeoError> {
        let version = self.read_version().await?;
        if let Some(loaded) = self.loaded.read().await.as_ref()
            && loaded.version == version
        {
            return Ok(Arc::clone(loaded));
        }

        let mut slot = self.loaded.write().await;
        if let Some(loaded) = slot.as_ref()
            && loaded.version == version
        {
            return Ok(Arc::clone(loaded));
        }

        let mut features = BTreeMap::new();
        let mut files_read = 0usize;
        for boundary_type in BoundaryType::ALL {
            let path = self.dir.join(format!("{boundary_type}.geojson"));
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    log::debug!("No {boundary_type} boundaries at {}", path.display());
                    continue;
                }
                Err(e) => {
                    return Err(GeoError::dataset(format!("reading {}: {e}", path.display())));
                }
            };
            files_read += 1;

            let parsed = parse_feature_collection(boundary_type, &text)
                .map_err(|message| GeoError::dataset(format!("{}: {message}", path.display())))?;
            log::info!(
                "Loaded {} {boundary_type} boundaries from {}",
                parsed.len(),
                path.display()
            );
            for feature in parsed {
                features.insert(feature.id.clone(), feature);
            }
        }

        if files_read == 0 {
            return Err(GeoError::dataset(format!(
                "no boundary files found in {}",
                self.dir.display()
            )));
        }

        let dataset = Arc::new(LoadedDataset { version, features });
        *slot = Some(Arc::clone(&dataset));
        Ok(dataset)
    }
}

#[async_trait]
impl GisSource for FileGisSource {
    async fn dataset_version(&self) -> Result<String, GeoError> {
        self.read_version().await
    }

    async fn load_regions(&self) -> Result<Vec<GisFeature>, GeoError> {
        Ok(self.dataset().await?.features.values().cloned().collect())
    }

    async fn load_geometry(
        &self,
        boundary_type: BoundaryType,
        id: &str,
    ) -> Result<BoundaryGeometry, GeoError> {
        let dataset = self.dataset().await?;
        dataset
            .features
            .get(id)
            .filter(|feature| feature.boundary_type == boundary_type)
            .ok_or_else(|| GeoError::unknown(boundary_type, id))?
            .to_boundary_geometry()
    }
}

/// Property keys holding the administrative code, in lookup order.
const fn code_keys(boundary_type: BoundaryType) -> [&'static str; 3] {
    match boundary_type {
        BoundaryType::Ctp => ["code", "CTPRVN_CD", "id"],
        BoundaryType::Sig => ["code", "SIG_CD", "id"],
        BoundaryType::Emd => ["code", "EMD_CD", "id"],
        BoundaryType::Ri => ["code", "LI_CD", "id"],
    }
}

/// Property keys holding the Korean name, in lookup order.
const fn name_keys(boundary_type: BoundaryType) -> [&'static str; 2] {
    match boundary_type {
        BoundaryType::Ctp => ["name", "CTP_KOR_NM"],
        BoundaryType::Sig => ["name", "SIG_KOR_NM"],
        BoundaryType::Emd => ["name", "EMD_KOR_NM"],
        BoundaryType::Ri => ["name", "LI_KOR_NM"],
    }
}

const PARENT_KEYS: [&str; 3] = ["parentId", "parent_id", "parent"];

/// Reads a string or number property as text.
fn property_text(feature: &geojson::Feature, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match feature.property(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn parse_feature_collection(
    boundary_type: BoundaryType,
    text: &str,
) -> Result<Vec<GisFeature>, String> {
    let geojson: GeoJson = text.parse().map_err(|e| format!("invalid GeoJSON: {e}"))?;
    let GeoJson::FeatureCollection(collection) = geojson else {
        return Err("expected a FeatureCollection".to_string());
    };

    let mut out = Vec::with_capacity(collection.features.len());
    for feature in collection.features {
        let id = property_text(&feature, &code_keys(boundary_type)).or_else(|| {
            feature.id.as_ref().map(|id| match id {
                geojson::feature::Id::String(s) => s.clone(),
                geojson::feature::Id::Number(n) => n.to_string(),
            })
        });
        let Some(id) = id else {
            log::warn!("Skipping {boundary_type} feature without a code");
            continue;
        };

        let name = property_text(&feature, &name_keys(boundary_type)).unwrap_or_else(|| {
            match boundary_type {
                BoundaryType::Ctp if sido::SIDO_CODES.contains(&id.as_str()) => sido::sido_name(&id).to_string(),
                _ => id.clone(),
            }
        });
        let parent_id = property_text(&feature, &PARENT_KEYS);

        let Some(geometry) = feature
            .geometry
            .and_then(medimap_spatial::geometry_to_multipolygon)
        else {
            log::warn!("Failed to parse GeoJSON for boundary {id}");
            continue;
        };

        out.push(GisFeature {
            id,
            boundary_type,
            name,
            parent_id,
            geometry,
        });
    }

    Ok(out)
}

/// An in-memory dataset for tests and embedding.
#[derive(Debug)]
pub struct InMemoryGisSource {
    version: RwLock<String>,
    features: RwLock<Vec<GisFeature>>,
    delay: Duration,
    geometry_loads: AtomicUsize,
}

impl InMemoryGisSource {
    /// Creates a source serving `features` at `version`.
    #[must_use]
    pub fn new(version: impl Into<String>, features: Vec<GisFeature>) -> Self {
        Self {
            version: RwLock::new(version.into()),
            features: RwLock::new(features),
            delay: Duration::ZERO,
            geometry_loads: AtomicUsize::new(0),
        }
    }

    /// Makes every geometry load sleep first.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Replaces the dataset and its version.
    pub fn replace(&self, version: impl Into<String>, features: Vec<GisFeature>) {
        *self.features.write().unwrap_or_else(PoisonError::into_inner) = features;
        *self.version.write().unwrap_or_else(PoisonError::into_inner) = version.into();
    }

    /// How many times [`GisSource::load_geometry`] has been called.
    #[must_use]
    pub fn geometry_loads(&self) -> usize {
        self.geometry_loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GisSource for InMemoryGisSource {
    async fn dataset_version(&self) -> Result<String, GeoError> {
        Ok(self
            .version
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn load_regions(&self) -> Result<Vec<GisFeature>, GeoError> {
        Ok(self
            .features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn load_geometry(
        &self,
        boundary_type: BoundaryType,
        id: &str,
    ) -> Result<BoundaryGeometry, GeoError> {
        self.geometry_loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let feature = self
            .features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|f| f.boundary_type == boundary_type && f.id == id)
            .cloned()
            .ok_or_else(|| GeoError::unknown(boundary_type, id))?;
        feature.to_boundary_geometry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIG_COLLECTION: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "properties": { "SIG_CD": "11010", "SIG_KOR_NM": "종로구" },
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[126.1,37.1],[126.5,37.1],[126.5,37.9],[126.1,37.9],[126.1,37.1]]]
                }
            },
            {
                "type": "Feature",
                "properties": { "code": 11020, "name": "중구", "parentId": "11" },
                "geometry": {
                    "type": "MultiPolygon",
                    "coordinates": [[[[126.5,37.1],[126.9,37.1],[126.9,37.9],[126.5,37.9],[126.5,37.1]]]]
                }
            },
            {
                "type": "Feature",
                "properties": { "SIG_KOR_NM": "코드 없음" },
                "geometry": { "type": "Point", "coordinates": [126.0, 37.0] }
            },
            {
                "type": "Feature",
                "properties": { "SIG_CD": "11030" },
                "geometry": { "type": "Point", "coordinates": [126.0, 37.0] }
            }
        ]
    }"#;

    #[test]
    fn parses_codes_names_and_parents() {
        let features = parse_feature_collection(BoundaryType::Sig, SIG_COLLECTION).unwrap();
        assert_eq!(features.len(), 2);

        assert_eq!(features[0].id, "11010");
        assert_eq!(features[0].name, "종로구");
        assert_eq!(features[0].parent_id, None);
        assert_eq!(features[0].resolved_parent_id().as_deref(), Some("11"));

        assert_eq!(features[1].id, "11020");
        assert_eq!(features[1].name, "중구");
        assert_eq!(features[1].parent_id.as_deref(), Some("11"));
    }

    #[test]
    fn unnamed_province_uses_official_name() {
        let collection = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": { "CTPRVN_CD": "26" },
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[128.9,35.0],[129.3,35.0],[129.3,35.4],[128.9,35.4],[128.9,35.0]]]
                }
            }]
        }"#;
        let features = parse_feature_collection(BoundaryType::Ctp, collection).unwrap();
        assert_eq!(features[0].name, "부산광역시");
    }

    #[test]
    fn rejects_non_collections() {
        assert!(parse_feature_collection(BoundaryType::Ctp, r#"{"type":"Point","coordinates":[0,0]}"#).is_err());
        assert!(parse_feature_collection(BoundaryType::Ctp, "garbage").is_err());
    }

    #[test]
    fn root_has_no_parent() {
        let features = crate::fixtures::sample_features();
        let ctp = features.iter().find(|f| f.id == "11").unwrap();
        assert_eq!(ctp.resolved_parent_id(), None);
    }

    #[test]
    fn digest_detects_tampering() {
        let mut geometry = BoundaryGeometry::new(
            "11".to_string(),
            BoundaryType::Ctp,
            "서울특별시".to_string(),
            r#"{"type":"Point","coordinates":[0,0]}"#.to_string(),
        );
        assert!(geometry.verify());
        geometry.geojson = Arc::from(r#"{"type":"Point","coordinates":[1,1]}"#);
        assert!(!geometry.verify());
    }

    #[tokio::test]
    async fn file_source_reads_directory() {
        let dir = std::env::temp_dir().join(format!("medimap-gis-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("sig.geojson"), SIG_COLLECTION).await.unwrap();
        tokio::fs::write(dir.join("VERSION"), "2024-01\n").await.unwrap();

        let source = FileGisSource::new(&dir);
        assert_eq!(source.dataset_version().await.unwrap(), "2024-01");
        assert_eq!(source.load_regions().await.unwrap().len(), 2);

        let geometry = source.load_geometry(BoundaryType::Sig, "11010").await.unwrap();
        assert_eq!(geometry.name, "종로구");
        assert!(geometry.geojson.contains("Polygon"));
        assert!(matches!(
            source.load_geometry(BoundaryType::Emd, "11010").await,
            Err(GeoError::UnknownBoundary { .. })
        ));

        tokio::fs::write(dir.join("VERSION"), "2024-02").await.unwrap();
        assert_eq!(source.dataset_version().await.unwrap(), "2024-02");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn file_source_requires_some_file() {
        let source = FileGisSource::new("/nonexistent/medimap");
        assert_eq!(source.dataset_version().await.unwrap(), UNVERSIONED);
        assert!(matches!(
            source.load_regions().await,
            Err(GeoError::Dataset { .. })
        ));
    }

    #[tokio::test]
    async fn in_memory_source_counts_loads() {
        let source = crate::fixtures::sample_source();
        source.load_geometry(BoundaryType::Ctp, "11").await.unwrap();
        assert!(source.load_geometry(BoundaryType::Ctp, "99").await.is_err());
        assert_eq!(source.geometry_loads(), 2);
    }
}
