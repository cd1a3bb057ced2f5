//! # Run Configuration
//!
//! Everything a run needs, loaded from a JSON or YAML file. Every section is
//! optional and falls back to the operational defaults, so an empty file
//! (`{}`) describes the standard AIFS initialisation from the latest
//! available analysis.
//!
//! ## Example
//!
//! ```yaml
//! date: 2025-03-01T00:00:00Z
//! source:
//!   base_url: https://data.ecmwf.int/forecasts
//! grid:
//!   target: N320
//! runner:
//!   checkpoint: persistence
//!   device: cpu
//!   lead_time_hours: 12
//! output:
//!   results_dir: results
//!   write_states: true
//! ```
//!
//! ```rust,no_run
//! use aifs_init::input::RunConfig;
//!
//! let config = RunConfig::from_file("run.yaml")?;
//! # Ok::<(), aifs_init::input::ConfigError>(())
//! ```

use crate::assemble::{AssemblyError, expected_fields};
use crate::catalog::{CatalogError, ParameterCatalog};
use crate::grid::{GridError, RegularLatLonGrid, TargetGridSpec};
use crate::model::RunnerConfig;
use crate::opendata::SourceConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Grid the feed publishes on
    pub source: RegularLatLonGrid,
    /// Grid the model runs on
    pub target: TargetGridSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory or `s3://bucket/prefix` receiving Parquet files
    pub results_dir: String,
    /// Label used in output file names
    pub experiment: String,
    /// Where to write the assembled input state, if anywhere
    pub input_state: Option<String>,
    /// Write each forecast step to `results_dir`
    pub write_states: bool,
    /// Maximum number of fields listed when printing a state
    pub max_lines: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_dir: "results".to_string(),
            experiment: "aifs-single-v1".to_string(),
            input_state: None,
            write_states: false,
            max_lines: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Analysis time; the latest available one when absent
    pub date: Option<DateTime<Utc>>,
    pub source: SourceConfig,
    pub catalog: ParameterCatalog,
    pub grid: GridConfig,
    pub runner: RunnerConfig,
    pub output: OutputConfig,
}

impl RunConfig {
    /// Loads a configuration, YAML for `.yaml`/`.yml` files and JSON otherwise.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&content),
            _ => Self::from_json(&content),
        }
    }

    pub fn from_json(json_str: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(json_str)?)
    }

    pub fn from_yaml(yaml_str: &str) -> ConfigResult<Self> {
        Ok(serde_yaml::from_str(yaml_str)?)
    }

    pub fn to_json(&self) -> ConfigResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Checks the parts that can be checked without network access.
    pub fn validate(&self) -> ConfigResult<()> {
        self.catalog.validate()?;
        self.grid.source.validate()?;
        self.grid.target.build()?;
        expected_fields(&self.catalog)?;

        if self.runner.lead_time_hours <= 0 {
            return Err(ConfigError::Invalid(format!(
                "lead_time_hours must be positive, got {}",
                self.runner.lead_time_hours
            )));
        }
        if self.source.latest_lookback == 0 {
            return Err(ConfigError::Invalid(
                "latest_lookback must be at least 1".to_string(),
            ));
        }
        if self.output.experiment.trim().is_empty() {
            return Err(ConfigError::Invalid("experiment must not be empty".to_string()));
        }
        Ok(())
    }
}
