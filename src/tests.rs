use crate::assemble::{AssemblyError, ProcessorConfig, STANDARD_GRAVITY};
use crate::catalog::{FieldGroup, ParameterCatalog, field_name};
use crate::fetch::FetchError;
use crate::grid::{RegularLatLonGrid, TargetGridSpec};
use crate::input::{GridConfig, RunConfig};
use crate::model::{Checkpoint, ModelError};
use crate::reference::{FixedClock, ReferenceTime};
use crate::source::{MemorySource, RawField};
use crate::{PipelineError, build_regridder, prepare_input_state, run};
use chrono::{DateTime, TimeZone, Utc};
use ndarray::Array2;
use std::collections::BTreeMap;

/// 90° feed grid: 3 x 4 points.
fn feed_grid() -> RegularLatLonGrid {
    RegularLatLonGrid {
        dlat: 90.0,
        dlon: 90.0,
    }
}

/// Two Gaussian latitudes with four points each.
fn grid_config() -> GridConfig {
    GridConfig {
        source: feed_grid(),
        target: TargetGridSpec::Table {
            pl: vec![4, 4],
            half: false,
        },
    }
}

fn reference() -> ReferenceTime {
    ReferenceTime::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap())
}

/// Surface, soil and pressure groups shaped like the default catalog but
/// with a handful of fields.
fn small_catalog() -> ParameterCatalog {
    let soil_mappings: BTreeMap<String, String> = [
        ("sot_1", "stl1"),
        ("sot_2", "stl2"),
        ("vsw_1", "swvl1"),
        ("vsw_2", "swvl2"),
    ]
    .iter()
    .map(|(from, to)| (from.to_string(), to.to_string()))
    .collect();

    ParameterCatalog {
        groups: vec![
            FieldGroup {
                name: "surface".to_string(),
                params: vec!["2t".to_string(), "msl".to_string()],
                levels: vec![],
                processors: vec![],
            },
            FieldGroup {
                name: "soil".to_string(),
                params: vec!["vsw".to_string(), "sot".to_string()],
                levels: vec![1, 2],
                processors: vec![ProcessorConfig::RenameFields {
                    mappings: soil_mappings,
                    strict: true,
                }],
            },
            FieldGroup {
                name: "pressure".to_string(),
                params: vec!["gh".to_string(), "t".to_string()],
                levels: vec![850, 500],
                processors: vec![ProcessorConfig::GeopotentialFromHeight {
                    levels: vec![850, 500],
                }],
            },
        ],
    }
}

/// Value of a raw field at a time; distinct per field, level and time.
fn value_for(param: &str, level: Option<u32>, date: DateTime<Utc>) -> f64 {
    let base = match param {
        "2t" => 280.0,
        "msl" => 101_000.0,
        "gh" => 5_000.0,
        "t" => 250.0,
        "sot" => 275.0,
        "vsw" => 0.3,
        _ => 1.0,
    };
    let offset = if date == reference().date() { 1.0 } else { 0.0 };
    base + level.unwrap_or(0) as f64 / 100.0 + offset
}

fn raw(param: &str, level: Option<u32>, date: DateTime<Utc>) -> RawField {
    RawField::new(
        param,
        level,
        Array2::from_elem(feed_grid().shape(), value_for(param, level, date)),
    )
}

/// Every raw field of `catalog` at both query times, inserted in the given
/// time order.
fn populated_source(catalog: &ParameterCatalog, times: &[DateTime<Utc>]) -> MemorySource {
    let mut source = MemorySource::new();
    for &date in times {
        for group in &catalog.groups {
            for param in &group.params {
                if group.levels.is_empty() {
                    source.insert(date, raw(param, None, date));
                } else {
                    for &level in &group.levels {
                        source.insert(date, raw(param, Some(level), date));
                    }
                }
            }
        }
    }
    source
}

#[cfg(test)]
mod input_state_tests {
    use super::*;

    #[tokio::test]
    async fn test_input_state_has_model_field_names() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = small_catalog();
        let source = populated_source(&catalog, &reference().query_times());
        let (target, regridder) = build_regridder(&grid_config())?;

        let state = prepare_input_state(&source, &catalog, &regridder, reference(), false).await?;

        let names: Vec<&str> = state.names().collect();
        assert_eq!(
            names,
            vec![
                "2t", "msl", "stl1", "stl2", "swvl1", "swvl2", "t_500", "t_850", "z_500", "z_850"
            ]
        );
        assert_eq!(state.grid_size(), Some(target.size()));
        assert_eq!(state.date, reference());
        Ok(())
    }

    #[tokio::test]
    async fn test_surface_tensor_rows_are_previous_then_current() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = small_catalog();
        let source = populated_source(&catalog, &reference().query_times());
        let (_, regridder) = build_regridder(&grid_config())?;

        let state = prepare_input_state(&source, &catalog, &regridder, reference(), false).await?;
        let t2m = state.field("2t").ok_or("missing 2t")?;

        assert_eq!(t2m.dim(), (2, 8));
        assert!(t2m.row(0).iter().all(|v| (v - 280.0).abs() < 1e-9));
        assert!(t2m.row(1).iter().all(|v| (v - 281.0).abs() < 1e-9));
        Ok(())
    }

    #[tokio::test]
    async fn test_geopotential_replaces_height() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = small_catalog();
        let source = populated_source(&catalog, &reference().query_times());
        let (_, regridder) = build_regridder(&grid_config())?;

        let state = prepare_input_state(&source, &catalog, &regridder, reference(), false).await?;

        assert!(state.names().all(|name| !name.starts_with("gh_")));
        let z500 = state.field("z_500").ok_or("missing z_500")?;
        let previous = value_for("gh", Some(500), reference().previous()) * STANDARD_GRAVITY;
        let current = value_for("gh", Some(500), reference().date()) * STANDARD_GRAVITY;
        assert!(z500.row(0).iter().all(|v| (v - previous).abs() < 1e-6));
        assert!(z500.row(1).iter().all(|v| (v - current).abs() < 1e-6));

        // Temperature passes through unchanged
        let t850 = state.field("t_850").ok_or("missing t_850")?;
        assert!((t850[[1, 0]] - value_for("t", Some(850), reference().date())).abs() < 1e-9);
        Ok(())
    }

    #[tokio::test]
    async fn test_soil_fields_are_renamed() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = small_catalog();
        let source = populated_source(&catalog, &reference().query_times());
        let (_, regridder) = build_regridder(&grid_config())?;

        let state = prepare_input_state(&source, &catalog, &regridder, reference(), false).await?;

        assert!(state.field(&field_name("sot", Some(1))).is_none());
        let swvl2 = state.field("swvl2").ok_or("missing swvl2")?;
        assert!((swvl2[[0, 3]] - value_for("vsw", Some(2), reference().previous())).abs() < 1e-9);
        Ok(())
    }

    #[tokio::test]
    async fn test_retrieval_order_does_not_matter() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = small_catalog();
        let [previous, current] = reference().query_times();
        let forward = populated_source(&catalog, &[previous, current]);
        let backward = populated_source(&catalog, &[current, previous]);
        let (_, regridder) = build_regridder(&grid_config())?;

        let a = prepare_input_state(&forward, &catalog, &regridder, reference(), false).await?;
        let b = prepare_input_state(&backward, &catalog, &regridder, reference(), false).await?;
        assert_eq!(a, b);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_current_sample_fails() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = ParameterCatalog {
            groups: vec![small_catalog().groups.remove(0)],
        };
        let [previous, current] = reference().query_times();
        let source = MemorySource::new()
            .with_field(previous, raw("2t", None, previous))
            .with_field(previous, raw("msl", None, previous))
            .with_field(current, raw("2t", None, current));
        let (_, regridder) = build_regridder(&grid_config())?;

        let result = prepare_input_state(&source, &catalog, &regridder, reference(), false).await;
        match result {
            Err(PipelineError::Assembly(AssemblyError::IncompleteSamples { field, missing })) => {
                assert_eq!(field, "msl");
                assert_eq!(missing, vec![current]);
            }
            other => panic!("Expected IncompleteSamples, got {:?}", other.map(|s| s.len())),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_wrong_feed_shape_fails() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = ParameterCatalog {
            groups: vec![small_catalog().groups.remove(0)],
        };
        let [previous, current] = reference().query_times();
        let mut source = populated_source(&catalog, &[current]);
        source.insert(previous, RawField::new("2t", None, Array2::zeros((2, 4))));
        let (_, regridder) = build_regridder(&grid_config())?;

        let result = prepare_input_state(&source, &catalog, &regridder, reference(), false).await;
        assert!(matches!(
            result,
            Err(PipelineError::Fetch(FetchError::UnexpectedGridShape { .. }))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_unmapped_soil_level_fails_before_retrieval() -> Result<(), Box<dyn std::error::Error>> {
        let mut catalog = small_catalog();
        catalog.groups[1].levels.push(3);
        let source = populated_source(&catalog, &reference().query_times());
        let (_, regridder) = build_regridder(&grid_config())?;

        let result = prepare_input_state(&source, &catalog, &regridder, reference(), false).await;
        match result {
            Err(PipelineError::Assembly(AssemblyError::UnmappedField(name))) => {
                assert_eq!(name, "sot_3");
            }
            other => panic!("Expected UnmappedField, got {:?}", other.map(|s| s.len())),
        }
        assert!(source.requests().is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod run_tests {
    use super::*;
    use polars::prelude::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn run_config(dir: &TempDir) -> RunConfig {
        let mut config = RunConfig::default();
        config.date = Some(reference().date());
        config.catalog = small_catalog();
        config.grid = grid_config();
        config.runner.lead_time_hours = 12;
        config.output.results_dir = dir.path().join("states").to_string_lossy().to_string();
        config.output.input_state = Some(dir.path().join("input").to_string_lossy().to_string());
        config.output.write_states = true;
        config.output.experiment = "test".to_string();
        config
    }

    #[tokio::test]
    async fn test_run_writes_input_and_steps() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let config = run_config(&dir);
        let source = populated_source(&config.catalog, &reference().query_times());
        let clock = FixedClock(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        let summary = run(&config, &source, &clock, false).await?;

        assert_eq!(summary.reference, reference());
        assert_eq!(summary.input_fields, 10);
        assert_eq!(summary.steps, 2);
        assert_eq!(summary.artifacts.len(), 3);
        assert!(summary.artifacts[0].ends_with("test_2025030112_input.parquet"));
        assert!(summary.artifacts[1].ends_with("test_2025030112_+006h.parquet"));
        assert!(summary.artifacts[2].ends_with("test_2025030112_+012h.parquet"));

        let input = ParquetReader::new(File::open(&summary.artifacts[0])?).finish()?;
        assert_eq!(input.height(), 16);
        assert_eq!(input.width(), 13);

        let last = ParquetReader::new(File::open(&summary.artifacts[2])?).finish()?;
        assert_eq!(last.height(), 8);
        let z500: Vec<Option<f64>> = last.column("z_500")?.f64()?.into_iter().collect();
        let expected = value_for("gh", Some(500), reference().date()) * STANDARD_GRAVITY;
        assert!(z500.iter().all(|v| v.is_some_and(|v| (v - expected).abs() < 1e-6)));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_uses_clock_without_date() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let mut config = run_config(&dir);
        config.date = None;
        config.output.write_states = false;
        config.output.input_state = None;
        let source = populated_source(&config.catalog, &reference().query_times());

        let summary = run(&config, &source, &FixedClock(reference().date()), false).await?;
        assert_eq!(summary.reference, reference());
        assert_eq!(summary.steps, 2);
        assert!(summary.artifacts.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_unsupported_checkpoint_fails_before_retrieval() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let mut config = run_config(&dir);
        config.runner.checkpoint = Checkpoint::Huggingface("ecmwf/aifs-single-1.0".to_string());
        let source = populated_source(&config.catalog, &reference().query_times());

        let result = run(&config, &source, &FixedClock(reference().date()), false).await;
        assert!(matches!(
            result,
            Err(PipelineError::Model(ModelError::UnsupportedCheckpoint(_)))
        ));
        assert!(source.requests().is_empty());
        Ok(())
    }
}
