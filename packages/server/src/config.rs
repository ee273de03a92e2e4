//! Server configuration.
//!
//! Read from an optional TOML file, then overridden by a few environment
//! variables. Every field has a default, so an empty (or missing) file is
//! a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use medimap_aggregation::ClusterConfig;
use medimap_cache::CacheConfig;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "MEDIMAP_CONFIG";

/// Configuration file read when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "medimap.toml";

/// Errors that can occur while loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// Path of the file.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file was not valid TOML for [`ServerConfig`].
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value was out of range.
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue {
        /// Offending field.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

/// Server settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind_addr: String,
    /// Port to bind.
    pub port: u16,
    /// Root of the data directory.
    pub data_dir: PathBuf,
    /// Directory holding the boundary `GeoJSON` files. Defaults to
    /// `{data_dir}/gis`.
    pub gis_dir: Option<PathBuf>,
    /// JSON export of the facility records. Defaults to
    /// `{data_dir}/facilities.json`.
    pub facilities_file: Option<PathBuf>,
    /// Freshness of cached area summaries, in seconds.
    pub summary_ttl_secs: u64,
    /// Freshness of cached boundary geometry, in seconds.
    pub geometry_ttl_secs: u64,
    /// How long a computation may hold a key before another caller takes
    /// it over, in seconds.
    pub lease_timeout_secs: u64,
    /// Deadline for one upstream computation, in milliseconds.
    pub compute_deadline_ms: u64,
    /// Concurrent computations for map requests.
    pub interactive_permits: usize,
    /// Concurrent computations for cache warming.
    pub background_permits: usize,
    /// Boundaries warmed at once per batch.
    pub warm_concurrency: usize,
    /// On-screen clustering radius in pixels.
    pub cluster_radius_px: f64,
    /// Region count above which summaries are always clustered.
    pub cluster_density_threshold: u64,
    /// Seconds between maintenance passes.
    pub maintenance_interval_secs: u64,
    /// Maintenance passes between full rollup rebuilds.
    pub reconcile_every: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let cache = CacheConfig::default();
        let cluster = ClusterConfig::default();
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 8080,
            data_dir: PathBuf::from("data"),
            gis_dir: None,
            facilities_file: None,
            summary_ttl_secs: cache.ttl.as_secs(),
            geometry_ttl_secs: 24 * 60 * 60,
            lease_timeout_secs: cache.lease_timeout.as_secs(),
            compute_deadline_ms: u64::try_from(cache.compute_deadline.as_millis()).unwrap_or(u64::MAX),
            interactive_permits: cache.interactive_permits,
            background_permits: cache.background_permits,
            warm_concurrency: medimap_warmer::DEFAULT_CONCURRENCY,
            cluster_radius_px: cluster.radius_px,
            cluster_density_threshold: cluster.density_threshold,
            maintenance_interval_secs: 60,
            reconcile_every: 60,
        }
    }
}

impl ServerConfig {
    /// Loads the configuration file named by [`CONFIG_ENV`] (or
    /// [`DEFAULT_CONFIG_PATH`] if it exists) and applies environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// * [`ConfigError::Io`] if an explicitly named file cannot be read.
    /// * [`ConfigError::Parse`] if the file is not valid.
    /// * [`ConfigError::InvalidValue`] if a value is out of range.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_path(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_path(Path::new(DEFAULT_CONFIG_PATH))?
            }
            Err(_) => {
                log::info!("No {DEFAULT_CONFIG_PATH} found, using default configuration");
                Self::default()
            }
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Parse`].
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        log::info!("Loading configuration from {}", path.display());
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    /// Applies the `BIND_ADDR`, `PORT` and `MEDIMAP_DATA_DIR` overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `PORT` is not a port
    /// number.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(bind_addr) = lookup("BIND_ADDR") {
            self.bind_addr = bind_addr;
        }
        if let Some(port) = lookup("PORT") {
            self.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: "port",
                reason: format!("'{port}' is not a port number"),
            })?;
        }
        if let Some(data_dir) = lookup("MEDIMAP_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }
        Ok(())
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("summary_ttl_secs", self.summary_ttl_secs),
            ("geometry_ttl_secs", self.geometry_ttl_secs),
            ("lease_timeout_secs", self.lease_timeout_secs),
            ("compute_deadline_ms", self.compute_deadline_ms),
            ("maintenance_interval_secs", self.maintenance_interval_secs),
            ("reconcile_every", self.reconcile_every),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be > 0".to_string(),
                });
            }
        }
        for (field, value) in [
            ("interactive_permits", self.interactive_permits),
            ("background_permits", self.background_permits),
            ("warm_concurrency", self.warm_concurrency),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be > 0".to_string(),
                });
            }
        }
        if !self.cluster_radius_px.is_finite() || self.cluster_radius_px <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "cluster_radius_px",
                reason: format!("{} is not a positive number", self.cluster_radius_px),
            });
        }
        Ok(())
    }

    /// Directory holding the boundary `GeoJSON` files.
    #[must_use]
    pub fn gis_dir(&self) -> PathBuf {
        self.gis_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("gis"))
    }

    /// Facility records export.
    #[must_use]
    pub fn facilities_file(&self) -> PathBuf {
        self.facilities_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("facilities.json"))
    }

    /// Registry settings for area summaries.
    #[must_use]
    pub const fn summary_cache(&self) -> CacheConfig {
        self.cache_config(self.summary_ttl_secs)
    }

    /// Registry settings for boundary geometry.
    #[must_use]
    pub const fn geometry_cache(&self) -> CacheConfig {
        self.cache_config(self.geometry_ttl_secs)
    }

    const fn cache_config(&self, ttl_secs: u64) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(ttl_secs),
            lease_timeout: Duration::from_secs(self.lease_timeout_secs),
            compute_deadline: Duration::from_millis(self.compute_deadline_ms),
            interactive_permits: self.interactive_permits,
            background_permits: self.background_permits,
        }
    }

    /// Clustering policy.
    #[must_use]
    pub const fn cluster(&self) -> ClusterConfig {
        ClusterConfig {
            radius_px: self.cluster_radius_px,
            density_threshold: self.cluster_density_threshold,
        }
    }

    /// Time between maintenance passes.
    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}
