//! # CLI Module
//!
//! Command-line interface for aifs-init:
//! - argument parsing with clap, every option also readable from an
//!   `AIFS_INIT_` environment variable
//! - configuration file loading (JSON/YAML) with command-line overrides
//! - subcommands for running, fetching, inspecting grids and devices
//! - configuration templates and shell completions

use crate::grid::TargetGridSpec;
use crate::input::{ConfigResult, RunConfig};
use crate::model::{Checkpoint, Device};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Initial conditions for data-driven forecasts from ECMWF open data
#[derive(Parser, Debug)]
#[command(name = "aifs-init")]
#[command(about = "Build AIFS initial conditions from ECMWF open data and run a forecast")]
#[command(version)]
#[command(long_about = "
aifs-init downloads the latest (or a chosen) ECMWF analysis from the open-data
feed, regrids it onto the reduced Gaussian grid of the AIFS model, assembles
the two-time input state and hands it to a model runner.

EXAMPLES:
  # Forecast from the latest analysis with default settings
  aifs-init run

  # Chosen analysis time, 24 h lead time, steps written to Parquet
  aifs-init run --date 2025-03-01T00 --lead-time 24 --write-states

  # Only assemble and export the input state
  aifs-init fetch --date 2025030112 --output state.parquet

  # Latest published analysis time
  aifs-init latest

  # Inspect the target grid
  aifs-init grid --target O96 --detailed

  # Generate a configuration template
  aifs-init template s3 --format yaml > run.yaml
")]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode - suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Output format for structured data
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Human)]
    pub output_format: OutputFormat,

    /// Configuration file path (JSON or YAML)
    #[arg(short, long, global = true, env = "AIFS_INIT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options that override the configuration file
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct RunOverrides {
    /// Analysis time (e.g. 2025-03-01T06:00:00Z, 2025-03-01T06, 2025030106)
    #[arg(short, long, value_parser = parse_date, env = "AIFS_INIT_DATE")]
    pub date: Option<DateTime<Utc>>,

    /// Target grid name (N320, O96, ...)
    #[arg(long, env = "AIFS_INIT_TARGET_GRID")]
    pub target_grid: Option<String>,

    /// Base URL of the open-data feed
    #[arg(long, env = "AIFS_INIT_BASE_URL")]
    pub base_url: Option<String>,

    /// Disable progress bars
    #[arg(long, env = "AIFS_INIT_NO_PROGRESS")]
    pub no_progress: bool,
}

impl RunOverrides {
    pub fn apply(&self, config: &mut RunConfig) {
        if let Some(date) = self.date {
            config.date = Some(date);
        }
        if let Some(target) = &self.target_grid {
            config.grid.target = TargetGridSpec::Named(target.clone());
        }
        if let Some(base_url) = &self.base_url {
            config.source.base_url = base_url.clone();
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Assemble the input state and run a forecast
    #[command(long_about = "
Assemble the input state for the reference time and run the configured model.

Each forecast step is printed; with --write-states it is also written as a
Parquet file named {experiment}_{YYYYMMDDHH}_+{HHH}h.parquet in the results
location (a directory or an s3:// prefix).

EXAMPLES:
  aifs-init run
  aifs-init run --date 2025-03-01T00 --lead-time 24
  aifs-init run --config run.yaml --results-dir s3://bucket/aifs --write-states
")]
    Run {
        #[command(flatten)]
        overrides: RunOverrides,

        /// Forecast lead time in hours
        #[arg(short, long, env = "AIFS_INIT_LEAD_TIME")]
        lead_time: Option<i64>,

        /// Device the model runs on
        #[arg(long, value_enum, env = "AIFS_INIT_DEVICE")]
        device: Option<Device>,

        /// Use the persistence runner regardless of the configured checkpoint
        #[arg(long)]
        persistence: bool,

        /// Results location for Parquet output
        #[arg(long, env = "AIFS_INIT_RESULTS_DIR")]
        results_dir: Option<String>,

        /// Write every forecast step to the results location
        #[arg(long, env = "AIFS_INIT_WRITE_STATES")]
        write_states: bool,

        /// Also write the input state to this location
        #[arg(long, env = "AIFS_INIT_INPUT_STATE")]
        input_state: Option<String>,

        /// Validate configuration without downloading anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Assemble the input state only
    #[command(long_about = "
Fetch, regrid and assemble the input state without running a model.

EXAMPLES:
  aifs-init fetch
  aifs-init fetch --date 2025030112 --output state.parquet
  aifs-init fetch --output s3://bucket/aifs/
")]
    Fetch {
        #[command(flatten)]
        overrides: RunOverrides,

        /// Write the input state to this file or location
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Print the latest analysis time published by the feed
    Latest {
        /// Base URL of the open-data feed
        #[arg(long, env = "AIFS_INIT_BASE_URL")]
        base_url: Option<String>,
    },

    /// Describe the target grid
    Grid {
        /// Grid name (defaults to the configured target)
        #[arg(long)]
        target: Option<String>,

        /// List every latitude band
        #[arg(long)]
        detailed: bool,
    },

    /// List the fields the model receives
    Catalog,

    /// Report visible CUDA devices
    Devices,

    /// Generate configuration templates
    #[command(long_about = "
Generate configuration file templates.

Available templates:
- basic: latest analysis, persistence runner, default catalog
- archive: fixed analysis time, input state and steps written locally
- s3: results written to an S3 prefix

EXAMPLES:
  aifs-init template basic
  aifs-init template s3 --format yaml -o run.yaml
")]
    Template {
        /// Template type to generate
        #[arg(value_enum)]
        template_type: TemplateType,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Configuration format
        #[arg(long, value_enum, default_value_t = ConfigFormat::Json)]
        format: ConfigFormat,
    },

    /// Generate shell completions
    #[command(long_about = "
Generate shell completion scripts.

INSTALLATION:
  aifs-init completions bash > ~/.bash_completion.d/aifs-init
  aifs-init completions zsh > ~/.zsh/completions/_aifs-init
  aifs-init completions fish > ~/.config/fish/completions/aifs-init.fish
")]
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON structured output
    Json,
    /// YAML structured output
    Yaml,
    /// CSV output (where applicable)
    Csv,
}

#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
pub enum TemplateType {
    /// Latest analysis with defaults
    Basic,
    /// Fixed date, local Parquet export
    Archive,
    /// Results written to S3
    S3,
}

#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    /// JSON configuration format
    Json,
    /// YAML configuration format
    Yaml,
}

/// Parses an analysis time. Accepted forms: RFC 3339,
/// `YYYY-MM-DDTHH`, `YYYY-MM-DD HH`, `YYYYMMDDHH` and `YYYY-MM-DD` (00 UTC).
/// The hour must be a synoptic hour (00, 06, 12 or 18).
pub fn parse_date(s: &str) -> Result<DateTime<Utc>, String> {
    let s = s.trim();
    let date = if let Ok(date) = DateTime::parse_from_rfc3339(s) {
        date.with_timezone(&Utc)
    } else if let Ok(naive) = NaiveDateTime::parse_from_str(&format!("{}:00:00", s), "%Y-%m-%dT%H:%M:%S") {
        naive.and_utc()
    } else if let Ok(naive) = NaiveDateTime::parse_from_str(&format!("{}:00:00", s), "%Y-%m-%d %H:%M:%S") {
        naive.and_utc()
    } else if let Ok(naive) = NaiveDateTime::parse_from_str(&format!("{}0000", s), "%Y%m%d%H%M%S") {
        naive.and_utc()
    } else if let Ok(day) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        day.and_time(NaiveTime::MIN).and_utc()
    } else {
        return Err(format!(
            "Invalid date '{}': expected e.g. 2025-03-01T06:00:00Z, 2025-03-01T06 or 2025030106",
            s
        ));
    };

    if date.hour() % 6 != 0 || date.minute() != 0 || date.second() != 0 {
        return Err(format!(
            "Date {} is not a synoptic time (00, 06, 12 or 18 UTC)",
            date.format("%Y-%m-%dT%H:%M:%SZ")
        ));
    }
    Ok(date)
}

pub fn generate_template(template_type: &TemplateType) -> RunConfig {
    let mut config = RunConfig::default();
    match template_type {
        TemplateType::Basic => {}
        TemplateType::Archive => {
            config.date = parse_date("2025-01-01T00").ok();
            config.runner.device = Device::Cpu;
            config.runner.lead_time_hours = 24;
            config.output.input_state = Some("results".to_string());
            config.output.write_states = true;
        }
        TemplateType::S3 => {
            config.runner.checkpoint = Checkpoint::Persistence;
            config.output.results_dir = "s3://my-bucket/aifs".to_string();
            config.output.write_states = true;
        }
    }
    config
}

pub fn render_config(config: &RunConfig, format: &ConfigFormat) -> ConfigResult<String> {
    match format {
        ConfigFormat::Json => config.to_json(),
        ConfigFormat::Yaml => config.to_yaml(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_date_forms() {
        let expected = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap();
        assert_eq!(parse_date("2025-03-01T06:00:00Z").unwrap(), expected);
        assert_eq!(parse_date("2025-03-01T06").unwrap(), expected);
        assert_eq!(parse_date("2025-03-01 06").unwrap(), expected);
        assert_eq!(parse_date("2025030106").unwrap(), expected);
        assert_eq!(
            parse_date("2025-03-01").unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_date_rejects_non_synoptic_and_garbage() {
        assert!(parse_date("2025-03-01T07").is_err());
        assert!(parse_date("2025-03-01T06:30:00Z").is_err());
        assert!(parse_date("yesterday").is_err());
        assert!(parse_date("2025-13-01T00").is_err());
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = RunConfig::default();
        let overrides = RunOverrides {
            date: parse_date("2025030112").ok(),
            target_grid: Some("O96".to_string()),
            base_url: Some("http://localhost:8080".to_string()),
            no_progress: true,
        };
        overrides.apply(&mut config);
        assert_eq!(config.date, Some(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()));
        assert_eq!(config.grid.target, TargetGridSpec::Named("O96".to_string()));
        assert_eq!(config.source.base_url, "http://localhost:8080");

        let mut untouched = RunConfig::default();
        RunOverrides::default().apply(&mut untouched);
        assert_eq!(untouched, RunConfig::default());
    }

    #[test]
    fn test_templates_are_valid() {
        for template in [TemplateType::Basic, TemplateType::Archive, TemplateType::S3] {
            let config = generate_template(&template);
            config.validate().unwrap();
            for format in [ConfigFormat::Json, ConfigFormat::Yaml] {
                let text = render_config(&config, &format).unwrap();
                let parsed = match format {
                    ConfigFormat::Json => RunConfig::from_json(&text).unwrap(),
                    ConfigFormat::Yaml => RunConfig::from_yaml(&text).unwrap(),
                };
                assert_eq!(parsed, config);
            }
        }
        assert!(generate_template(&TemplateType::Archive).date.is_some());
        assert!(generate_template(&TemplateType::S3).output.results_dir.starts_with("s3://"));
    }
}
