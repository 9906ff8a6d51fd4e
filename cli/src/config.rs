//! Layered CLI configuration.
//!
//! Sources, later layers winning:
//! 1. Built-in defaults
//! 2. `ctxpack.toml` in the working directory, else
//!    `<config dir>/ctxpack/config.toml`, or an explicit `--config` file
//! 3. `CTXPACK_*` environment variables, `__` separating nested keys
//!    (e.g. `CTXPACK_GATE__MODE=enforce`)

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use ctxpack_core::assemble::EstimatorKind;
use ctxpack_core::gate::GateMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_PREFIX: &str = "CTXPACK";
pub const LOCAL_CONFIG_FILE: &str = "ctxpack.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("configuration file not found at path: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to serialize default configuration: {0}")]
    Defaults(#[from] serde_json::Error),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        Self::Load(err.to_string())
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CtxpackConfig {
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub assemble: AssembleConfig,
    #[serde(default)]
    pub validate: ValidateConfig,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Mode used when `gate` is run without `--mode`.
    #[serde(default)]
    pub mode: GateMode,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AssembleConfig {
    /// Assemble twice and compare manifest hashes.
    #[serde(default = "default_true")]
    pub determinism_check: bool,

    /// Model used when `--model` is omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    #[serde(default)]
    pub estimator: EstimatorKind,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ValidateConfig {
    /// Accept packs whose version shares the major version but differs in
    /// minor or patch, with a warning.
    #[serde(default)]
    pub allow_minor_version: bool,
}

fn default_true() -> bool {
    true
}

impl Default for AssembleConfig {
    fn default() -> Self {
        Self {
            determinism_check: default_true(),
            default_model: None,
            estimator: EstimatorKind::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn load(&self) -> Result<CtxpackConfig, ConfigError> {
        let defaults = serde_json::to_string(&CtxpackConfig::default())?;
        let mut builder =
            Config::builder().add_source(File::from_str(&defaults, FileFormat::Json));

        if let Some(path) = &self.config_path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            builder = builder.add_source(File::from(path.as_path()));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// First existing config file: `./ctxpack.toml`, then
    /// `<config dir>/ctxpack/config.toml`.
    pub fn find_config_file() -> Option<PathBuf> {
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("ctxpack").join("config.toml"))
            .filter(|path| path.exists())
    }

    /// Load from `explicit` when given, else from the default locations.
    pub fn load_default(explicit: Option<&Path>) -> Result<CtxpackConfig, ConfigError> {
        let loader = match explicit.map(Path::to_path_buf).or_else(Self::find_config_file) {
            Some(path) => Self::new().with_file(path),
            None => Self::new(),
        };
        loader.load()
    }
}
