//! # Model Runners
//!
//! The forecast model is reached through [`ModelRunner`]: it receives the
//! assembled [`InputState`] and a lead time and yields one [`OutputState`]
//! per forecast step, lazily. The sequence is finite and can be consumed
//! once.
//!
//! Network weights are executed outside this crate. The built-in
//! [`PersistenceRunner`] carries the latest analysis forward unchanged, which
//! exercises the whole pipeline and serves as the trivial baseline forecast.

use crate::grid::ReducedGaussianGrid;
use crate::state::InputState;
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Time step of the model, in hours.
pub const MODEL_STEP_HOURS: i64 = 6;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Checkpoint {0} cannot be executed by this build; use the 'persistence' checkpoint or an external runner")]
    UnsupportedCheckpoint(String),

    #[error("Lead time of {0} hours is not a positive multiple of the 6 h model step")]
    InvalidLeadTime(i64),

    #[error("Input state has no fields")]
    EmptyInput,

    #[error("Field '{field}' has {actual} points, the model grid has {expected}")]
    GridMismatch {
        field: String,
        expected: usize,
        actual: usize,
    },

    #[error("Device query failed: {0}")]
    DeviceQuery(#[from] std::io::Error),
}

pub type ModelResult<T> = Result<T, ModelError>;

/// Where the model weights come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    /// Hugging Face repository, e.g. `ecmwf/aifs-single-1.0`
    Huggingface(String),
    /// Local checkpoint file
    Path(PathBuf),
    /// Carry the latest analysis forward
    Persistence,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::Huggingface(repo) => write!(f, "huggingface:{}", repo),
            Checkpoint::Path(path) => write!(f, "{}", path.display()),
            Checkpoint::Persistence => write!(f, "persistence"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cuda => write!(f, "cuda"),
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub checkpoint: Checkpoint,
    pub device: Device,
    pub lead_time_hours: i64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            checkpoint: Checkpoint::Persistence,
            device: Device::Cuda,
            lead_time_hours: 12,
        }
    }
}

impl RunnerConfig {
    pub fn lead_time(&self) -> Duration {
        Duration::hours(self.lead_time_hours)
    }
}

/// One forecast step on the model grid.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputState {
    pub date: DateTime<Utc>,
    pub step: Duration,
    pub latitudes: Array1<f64>,
    pub longitudes: Array1<f64>,
    pub fields: BTreeMap<String, Array1<f64>>,
}

impl OutputState {
    pub fn step_hours(&self) -> i64 {
        self.step.num_hours()
    }
}

pub type OutputStates<'a> = Box<dyn Iterator<Item = ModelResult<OutputState>> + 'a>;

pub trait ModelRunner {
    fn name(&self) -> &str;

    fn run<'a>(&'a self, input: &'a InputState, lead_time: Duration) -> ModelResult<OutputStates<'a>>;
}

/// Number of model steps in `lead_time`.
pub fn step_count(lead_time: Duration) -> ModelResult<i64> {
    let hours = lead_time.num_hours();
    if hours <= 0 || hours % MODEL_STEP_HOURS != 0 || lead_time != Duration::hours(hours) {
        return Err(ModelError::InvalidLeadTime(hours));
    }
    Ok(hours / MODEL_STEP_HOURS)
}

pub struct PersistenceRunner {
    latitudes: Array1<f64>,
    longitudes: Array1<f64>,
}

impl PersistenceRunner {
    pub fn new(grid: &ReducedGaussianGrid) -> Self {
        let (latitudes, longitudes) = grid.latlons();
        Self {
            latitudes: Array1::from(latitudes),
            longitudes: Array1::from(longitudes),
        }
    }

    fn check_input(&self, input: &InputState) -> ModelResult<()> {
        if input.is_empty() {
            return Err(ModelError::EmptyInput);
        }
        let expected = self.latitudes.len();
        for (name, tensor) in &input.fields {
            if tensor.ncols() != expected || tensor.nrows() == 0 {
                return Err(ModelError::GridMismatch {
                    field: name.clone(),
                    expected,
                    actual: tensor.ncols(),
                });
            }
        }
        Ok(())
    }
}

impl ModelRunner for PersistenceRunner {
    fn name(&self) -> &str {
        "persistence"
    }

    fn run<'a>(&'a self, input: &'a InputState, lead_time: Duration) -> ModelResult<OutputStates<'a>> {
        let steps = step_count(lead_time)?;
        self.check_input(input)?;
        debug!(
            "Persistence forecast from {} over {} steps",
            input.date, steps
        );

        Ok(Box::new((1..=steps).map(move |k| {
            let step = Duration::hours(k * MODEL_STEP_HOURS);
            let fields = input
                .fields
                .iter()
                .map(|(name, tensor)| (name.clone(), tensor.row(tensor.nrows() - 1).to_owned()))
                .collect();
            Ok(OutputState {
                date: input.date.date() + step,
                step,
                latitudes: self.latitudes.clone(),
                longitudes: self.longitudes.clone(),
                fields,
            })
        })))
    }
}

pub fn create_runner(
    config: &RunnerConfig,
    grid: &ReducedGaussianGrid,
) -> ModelResult<Box<dyn ModelRunner>> {
    match &config.checkpoint {
        Checkpoint::Persistence => {
            if config.device == Device::Cuda {
                debug!("Persistence runner ignores device '{}'", config.device);
            }
            Ok(Box::new(PersistenceRunner::new(grid)))
        }
        other => Err(ModelError::UnsupportedCheckpoint(other.to_string())),
    }
}

/// A CUDA device as listed by `nvidia-smi`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuDevice {
    pub index: u32,
    pub name: String,
    pub memory_mib: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceleratorReport {
    /// Value of `CUDA_VISIBLE_DEVICES`, if set
    pub visible_devices: Option<String>,
    pub devices: Vec<GpuDevice>,
}

impl AcceleratorReport {
    pub fn has_cuda(&self) -> bool {
        !self.devices.is_empty()
    }
}

/// Parses `nvidia-smi --query-gpu=index,name,memory.total --format=csv,noheader,nounits`.
pub fn parse_device_listing(listing: &str) -> Vec<GpuDevice> {
    listing
        .lines()
        .filter_map(|line| {
            let mut parts = line.split(',').map(str::trim);
            let index = parts.next()?.parse().ok()?;
            let name = parts.next()?.to_string();
            let memory_mib = parts.next().and_then(|m| m.parse().ok());
            Some(GpuDevice {
                index,
                name,
                memory_mib,
            })
        })
        .collect()
}

/// Lists CUDA devices. A machine without `nvidia-smi` reports no devices.
pub async fn accelerator_report() -> ModelResult<AcceleratorReport> {
    let visible_devices = std::env::var("CUDA_VISIBLE_DEVICES").ok();
    let output = tokio::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .await;

    let devices = match output {
        Ok(output) if output.status.success() => {
            parse_device_listing(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(output) => {
            warn!(
                "nvidia-smi exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            Vec::new()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("nvidia-smi not found");
            Vec::new()
        }
        Err(e) => return Err(ModelError::DeviceQuery(e)),
    };

    Ok(AcceleratorReport {
        visible_devices,
        devices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceTime;
    use crate::state::FieldMap;
    use chrono::TimeZone;
    use ndarray::Array2;

    fn input(grid: &ReducedGaussianGrid) -> InputState {
        let mut fields = FieldMap::new();
        let n = grid.size();
        fields.insert(
            "2t".to_string(),
            Array2::from_shape_fn((2, n), |(row, _)| 270.0 + row as f64),
        );
        InputState::new(
            ReferenceTime::new(Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap()),
            fields,
        )
    }

    #[test]
    fn test_persistence_steps() {
        let grid = ReducedGaussianGrid::octahedral(4).unwrap();
        let runner = PersistenceRunner::new(&grid);
        let input = input(&grid);

        let states: Vec<OutputState> = runner
            .run(&input, Duration::hours(12))
            .unwrap()
            .collect::<ModelResult<_>>()
            .unwrap();

        assert_eq!(states.len(), 2);
        assert_eq!(states[0].step_hours(), 6);
        assert_eq!(states[1].date, Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).unwrap());
        assert_eq!(states[1].latitudes.len(), grid.size());
        assert!(states[1].fields["2t"].iter().all(|&v| v == 271.0));
    }

    #[test]
    fn test_runner_config_checkpoint_forms() {
        let config: RunnerConfig =
            serde_yaml::from_str("checkpoint:\n  huggingface: ecmwf/aifs-single-1.0\n").unwrap();
        assert_eq!(
            config.checkpoint,
            Checkpoint::Huggingface("ecmwf/aifs-single-1.0".to_string())
        );

        let config: RunnerConfig = serde_yaml::from_str("checkpoint: persistence\n").unwrap();
        assert_eq!(config.checkpoint, Checkpoint::Persistence);

        let config: RunnerConfig =
            serde_json::from_str(r#"{"checkpoint": {"path": "/models/aifs.ckpt"}}"#).unwrap();
        assert_eq!(config.checkpoint, Checkpoint::Path(PathBuf::from("/models/aifs.ckpt")));

        let yaml = serde_yaml::to_string(&RunnerConfig {
            checkpoint: Checkpoint::Huggingface("ecmwf/aifs-single-1.0".to_string()),
            ..RunnerConfig::default()
        })
        .unwrap();
        assert!(yaml.contains("huggingface: ecmwf/aifs-single-1.0"));
    }

    #[test]
    fn test_lead_time_must_be_whole_steps() {
        assert_eq!(step_count(Duration::hours(12)).unwrap(), 2);
        assert!(matches!(step_count(Duration::hours(9)), Err(ModelError::InvalidLeadTime(9))));
        assert!(step_count(Duration::hours(0)).is_err());
        assert!(step_count(Duration::minutes(370)).is_err());
    }

    #[test]
    fn test_persistence_rejects_wrong_grid() {
        let grid = ReducedGaussianGrid::octahedral(4).unwrap();
        let other = ReducedGaussianGrid::octahedral(8).unwrap();
        let runner = PersistenceRunner::new(&grid);
        assert!(matches!(
            runner.run(&input(&other), Duration::hours(6)),
            Err(ModelError::GridMismatch { .. })
        ));
    }

    #[test]
    fn test_neural_checkpoints_are_unsupported() {
        let grid = ReducedGaussianGrid::octahedral(4).unwrap();
        let config = RunnerConfig {
            checkpoint: Checkpoint::Huggingface("ecmwf/aifs-single-1.0".to_string()),
            ..RunnerConfig::default()
        };
        assert!(matches!(
            create_runner(&config, &grid),
            Err(ModelError::UnsupportedCheckpoint(_))
        ));
        assert_eq!(
            create_runner(&RunnerConfig::default(), &grid).unwrap().name(),
            "persistence"
        );
    }

    #[test]
    fn test_checkpoint_serialization() {
        let hf: Checkpoint = serde_json::from_str(r#"{"huggingface": "ecmwf/aifs-single-1.0"}"#).unwrap();
        assert_eq!(hf, Checkpoint::Huggingface("ecmwf/aifs-single-1.0".to_string()));
        let persistence: Checkpoint = serde_json::from_str(r#""persistence""#).unwrap();
        assert_eq!(persistence, Checkpoint::Persistence);
        let config: RunnerConfig = serde_json::from_str(r#"{"device": "cpu"}"#).unwrap();
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.lead_time_hours, 12);
    }

    #[test]
    fn test_parse_device_listing() {
        let listing = "0, NVIDIA A100-SXM4-40GB, 40960\n1, NVIDIA A100-SXM4-40GB, 40960\n\nbogus line\n";
        let devices = parse_device_listing(listing);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].index, 1);
        assert_eq!(devices[0].name, "NVIDIA A100-SXM4-40GB");
        assert_eq!(devices[0].memory_mib, Some(40960));
    }
}
