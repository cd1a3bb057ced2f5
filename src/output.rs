//! # Parquet Export
//!
//! Writes input and output states as Parquet tables, one row per grid point
//! (and per time for input states), one column per field:
//!
//! | valid_time | latitude | longitude | 2t | msl | ... |
//! |------------|----------|-----------|----|-----|-----|
//!
//! Output states additionally carry a `step_hours` column. Locations may be
//! local paths or `s3://` keys; S3 uploads go through a temporary file.

use crate::model::OutputState;
use crate::reference::ReferenceTime;
use crate::state::InputState;
use crate::storage::{ArtifactStore, Store, StorageError, is_s3_location};
use chrono::{DateTime, Duration, Utc};
use log::debug;
use polars::prelude::*;
use std::fs::{self, File};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Column '{column}' has {actual} values, expected {expected}")]
    Length {
        column: String,
        expected: usize,
        actual: usize,
    },
}

pub type OutputResult<T> = Result<T, OutputError>;

/// `{experiment}_{YYYYMMDDHH}_+{HHH}h.parquet`
pub fn output_file_name(experiment: &str, reference: &ReferenceTime, step: Duration) -> String {
    format!(
        "{}_{}_+{:03}h.parquet",
        experiment,
        reference.date().format("%Y%m%d%H"),
        step.num_hours()
    )
}

/// `{experiment}_{YYYYMMDDHH}_input.parquet`
pub fn input_file_name(experiment: &str, reference: &ReferenceTime) -> String {
    format!(
        "{}_{}_input.parquet",
        experiment,
        reference.date().format("%Y%m%d%H")
    )
}

fn time_column(name: &str, times: Vec<i64>) -> OutputResult<Column> {
    let series = Series::new(name.into(), times)
        .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?;
    Ok(series.into())
}

fn check_length(column: &str, expected: usize, actual: usize) -> OutputResult<()> {
    if expected != actual {
        return Err(OutputError::Length {
            column: column.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Input state as a table of `2 x N` rows, the `T - 6h` rows first.
pub fn input_state_frame(
    state: &InputState,
    latitudes: &[f64],
    longitudes: &[f64],
) -> OutputResult<DataFrame> {
    let points = latitudes.len();
    check_length("longitude", points, longitudes.len())?;

    let times: Vec<DateTime<Utc>> = state.date.query_times().to_vec();
    let valid_times: Vec<i64> = times
        .iter()
        .flat_map(|time| std::iter::repeat_n(time.timestamp_millis(), points))
        .collect();

    let mut columns: Vec<Column> = vec![
        time_column("valid_time", valid_times)?,
        Series::new("latitude".into(), latitudes.repeat(times.len())).into(),
        Series::new("longitude".into(), longitudes.repeat(times.len())).into(),
    ];

    for (name, tensor) in &state.fields {
        check_length(name, points, tensor.ncols())?;
        check_length(name, times.len(), tensor.nrows())?;
        let values: Vec<f64> = tensor.iter().copied().collect();
        columns.push(Series::new(name.as_str().into(), values).into());
    }

    Ok(DataFrame::new(columns)?)
}

/// One forecast step as a table of `N` rows.
pub fn output_state_frame(state: &OutputState) -> OutputResult<DataFrame> {
    let points = state.latitudes.len();
    check_length("longitude", points, state.longitudes.len())?;

    let mut columns: Vec<Column> = vec![
        time_column("valid_time", vec![state.date.timestamp_millis(); points])?,
        Series::new("step_hours".into(), vec![state.step_hours(); points]).into(),
        Series::new("latitude".into(), state.latitudes.to_vec()).into(),
        Series::new("longitude".into(), state.longitudes.to_vec()).into(),
    ];

    for (name, values) in &state.fields {
        check_length(name, points, values.len())?;
        columns.push(Series::new(name.as_str().into(), values.to_vec()).into());
    }

    Ok(DataFrame::new(columns)?)
}

/// Writes a frame to a local Parquet file, creating parent directories.
pub fn write_parquet_file(df: &mut DataFrame, path: &Path) -> OutputResult<()> {
    debug!(
        "Writing {} rows x {} columns to {}",
        df.height(),
        df.width(),
        path.display()
    );
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    ParquetWriter::new(file).finish(df)?;
    Ok(())
}

/// Writes a frame to a local path or an `s3://` location.
pub async fn write_parquet(df: &mut DataFrame, location: &str) -> OutputResult<()> {
    if is_s3_location(location) {
        let temp_file = tempfile::NamedTempFile::new()?;
        write_parquet_file(df, temp_file.path())?;

        let data = tokio::fs::read(temp_file.path()).await?;
        Store::for_location(location).await.put(location, &data).await?;
        debug!("Uploaded {} bytes to {}", data.len(), location);
    } else {
        write_parquet_file(df, Path::new(location))?;
    }
    Ok(())
}
