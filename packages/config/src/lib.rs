#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Service configuration.
//!
//! Defaults are embedded from `config/default.toml`. A TOML file given at
//! start-up is merged over them table by table, then environment
//! overrides are applied:
//!
//! | Variable                | Field                     |
//! |-------------------------|---------------------------|
//! | `URBAN_API_URL`         | `urban_api.base_url`      |
//! | `CACHE_DIR`             | `cache.root`              |
//! | `CACHE_ACTUALITY_HOURS` | `cache.actuality_hours`   |
//! | `BIND_ADDR`             | `server.bind_addr`        |
//! | `PORT`                  | `server.port`             |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_TOML: &str = include_str!("../config/default.toml");

/// Errors while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// TOML syntax or shape error.
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override could not be parsed.
    #[error("Invalid value {value:?} for {name}: {reason}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
        /// Parse error.
        reason: String,
    },

    /// A profile key is not an integer id.
    #[error("Profile key {0:?} is not an integer id")]
    InvalidProfileId(String),

    /// A value is out of range.
    #[error("Invalid config value {field}: {reason}")]
    Invalid {
        /// Dotted field path.
        field: &'static str,
        /// What is wrong.
        reason: &'static str,
    },
}

/// Upstream urban data API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UrbanApiConfig {
    /// Base URL without trailing slash.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Retries after the first attempt on transient failures.
    pub max_retries: u32,
}

impl UrbanApiConfig {
    /// Per-request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Constants used to derive population, capacity and radii.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ParsingConfig {
    /// Floors assumed when no building reports any.
    pub default_floors: f64,
    /// Share of gross floor area that is living area.
    pub living_area_coef: f64,
    /// Living area per resident, m².
    pub metres_per_human: f64,
    /// Average travel speed used to turn minutes into meters, km/h.
    pub travel_speed_kmh: f64,
    /// Buffer radius for non-polygonal physical objects, m.
    pub non_poly_objects_buffer_m: f64,
}

/// File cache.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CacheConfig {
    /// Cache root directory.
    pub root: PathBuf,
    /// Maximum age of a servable entry, hours.
    pub actuality_hours: u64,
    /// Period of the background sweep, minutes.
    pub sweep_interval_minutes: u64,
}

impl CacheConfig {
    /// Period of the background sweep.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_minutes * 60)
    }
}

/// HTTP listener.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind.
    pub bind_addr: String,
    /// TCP port.
    pub port: u16,
}

/// Profile id to ordered physical object type ids (highest priority
/// first).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "BTreeMap<String, Vec<i64>>")]
pub struct ProfileMap(BTreeMap<i64, Vec<i64>>);

impl TryFrom<BTreeMap<String, Vec<i64>>> for ProfileMap {
    type Error = ConfigError;

    fn try_from(raw: BTreeMap<String, Vec<i64>>) -> Result<Self, Self::Error> {
        raw.into_iter()
            .map(|(key, types)| {
                key.trim()
                    .parse::<i64>()
                    .map(|id| (id, types))
                    .map_err(|_| ConfigError::InvalidProfileId(key))
            })
            .collect::<Result<_, _>>()
            .map(Self)
    }
}

impl ProfileMap {
    /// Priority list of a profile.
    #[must_use]
    pub fn get(&self, profile_id: i64) -> Option<&[i64]> {
        self.0.get(&profile_id).map(Vec::as_slice)
    }

    /// Whether the profile is configured.
    #[must_use]
    pub fn contains(&self, profile_id: i64) -> bool {
        self.0.contains_key(&profile_id)
    }

    /// Configured profile ids, ascending.
    pub fn ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.0.keys().copied()
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SirtepConfig {
    /// Upstream API.
    pub urban_api: UrbanApiConfig,
    /// Parsing constants.
    pub parsing: ParsingConfig,
    /// File cache.
    pub cache: CacheConfig,
    /// HTTP listener.
    pub server: ServerConfig,
    /// Profile priorities.
    pub profiles: ProfileMap,
}

impl SirtepConfig {
    /// The embedded defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the embedded file is malformed.
    pub fn embedded() -> Result<Self, ConfigError> {
        Self::from_toml_str("")
    }

    /// Defaults merged with `overrides`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if either document is malformed or the
    /// result fails validation.
    pub fn from_toml_str(overrides: &str) -> Result<Self, ConfigError> {
        let mut table: toml::Table = toml::from_str(DEFAULT_TOML)?;
        let overrides: toml::Table = toml::from_str(overrides)?;
        merge(&mut table, overrides);

        let config: Self = toml::Value::Table(table).try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults merged with the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads `path` (or the defaults) and applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on any read, parse or validation failure.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                log::info!("Loading config from {}", path.display());
                Self::from_file(path)?
            }
            None => Self::embedded()?,
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides from `lookup` (the process environment in
    /// [`Self::load`]).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] for unparsable numbers.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup("URBAN_API_URL") {
            self.urban_api.base_url = url;
        }
        if let Some(dir) = lookup("CACHE_DIR") {
            self.cache.root = PathBuf::from(dir);
        }
        if let Some(hours) = lookup("CACHE_ACTUALITY_HOURS") {
            self.cache.actuality_hours = parse_env("CACHE_ACTUALITY_HOURS", hours)?;
        }
        if let Some(addr) = lookup("BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = parse_env("PORT", port)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.parsing;
        let positive = [
            ("parsing.default_floors", p.default_floors),
            ("parsing.living_area_coef", p.living_area_coef),
            ("parsing.metres_per_human", p.metres_per_human),
            ("parsing.travel_speed_kmh", p.travel_speed_kmh),
        ];
        for (field, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be a positive number",
                });
            }
        }
        if !(p.non_poly_objects_buffer_m.is_finite() && p.non_poly_objects_buffer_m >= 0.0) {
            return Err(ConfigError::Invalid {
                field: "parsing.non_poly_objects_buffer_m",
                reason: "must be a non-negative number",
            });
        }
        if self.cache.actuality_hours == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.actuality_hours",
                reason: "must be at least 1",
            });
        }
        if self.cache.sweep_interval_minutes == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.sweep_interval_minutes",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(name: &'static str, value: String) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        name,
        reason: e.to_string(),
        value,
    })
}

/// Recursively merges `overrides` into `base`; non-table values replace.
fn merge(base: &mut toml::Table, overrides: toml::Table) {
    for (key, value) in overrides {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
