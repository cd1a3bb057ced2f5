//! # aifs-init
//!
//! Builds initial conditions for the AIFS data-driven forecast model from
//! the ECMWF open-data feed and hands them to a model runner.
//!
//! ## Pipeline
//!
//! 1. Resolve the reference time `T` (latest published analysis, or a fixed
//!    date) and derive the query times `T - 6h` and `T`.
//! 2. For every catalog group, retrieve its fields at both times, check the
//!    0.25° grid shape, re-centre longitudes and regrid onto the reduced
//!    Gaussian grid of the model.
//! 3. Stack each field into a `(2, N)` tensor, derive geopotential from
//!    geopotential height, rename soil fields and verify the field set.
//! 4. Run the model and print (and optionally export) each forecast step.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use aifs_init::input::RunConfig;
//! use aifs_init::opendata::OpenDataClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunConfig::from_file("run.yaml")?;
//! let client = OpenDataClient::new(config.source.clone())?;
//! let summary = aifs_init::run(&config, &client, &client, true).await?;
//! println!("{} steps from {}", summary.steps, summary.reference);
//! # Ok(())
//! # }
//! ```

pub mod assemble;
pub mod catalog;
pub mod cli;
pub mod fetch;
pub mod grid;
pub mod info;
pub mod input;
pub mod log;
pub mod model;
pub mod opendata;
pub mod output;
pub mod reference;
pub mod regrid;
pub mod source;
pub mod state;
pub mod storage;

#[cfg(test)]
mod tests;

use crate::assemble::{AssemblyError, assemble_group, check_field_set, expected_fields, merge_fields};
use crate::catalog::{CatalogError, ParameterCatalog};
use crate::fetch::{FetchError, FieldFetcher};
use crate::grid::{GridError, ReducedGaussianGrid};
use crate::input::{GridConfig, RunConfig};
use crate::model::{ModelError, create_runner};
use crate::output::{
    OutputError, input_file_name, input_state_frame, output_file_name, output_state_frame,
    write_parquet,
};
use crate::reference::{AnalysisClock, FixedClock, ReferenceTime};
use crate::regrid::Regridder;
use crate::source::{FieldSource, SourceError};
use crate::state::{FieldMap, InputState};
use crate::storage::join_location;
use thiserror::Error;

/// Any failure of a run; nothing is retried or salvaged.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Output(#[from] OutputError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Target grid and the regridder onto it.
pub fn build_regridder(config: &GridConfig) -> Result<(ReducedGaussianGrid, Regridder), GridError> {
    config.source.validate()?;
    let target = config.target.build()?;
    let regridder = Regridder::new(&config.source, &target);
    Ok((target, regridder))
}

/// Fetches and assembles every catalog group for `reference`.
///
/// Groups are processed in catalog order, one retrieval at a time. The
/// resulting field set must be exactly the one the catalog promises.
pub async fn prepare_input_state(
    source: &dyn FieldSource,
    catalog: &ParameterCatalog,
    regridder: &Regridder,
    reference: ReferenceTime,
    show_progress: bool,
) -> PipelineResult<InputState> {
    catalog.validate()?;
    let expected = expected_fields(catalog)?;
    let fetcher = FieldFetcher::new(source, regridder).with_progress(show_progress);

    let mut fields = FieldMap::new();
    for group in &catalog.groups {
        ::log::info!("Preparing field group '{}'", group.name);
        let fetched = fetcher.fetch(&reference, &group.request()).await?;
        let assembled = assemble_group(group, fetched, &reference)?;
        merge_fields(&mut fields, assembled)?;
    }

    check_field_set(&fields, &expected)?;
    Ok(InputState::new(reference, fields))
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub reference: ReferenceTime,
    pub input_fields: usize,
    pub steps: usize,
    /// Locations of written Parquet files
    pub artifacts: Vec<String>,
}

/// Runs the whole pipeline: reference time, input state, forecast,
/// presentation and optional export.
pub async fn run(
    config: &RunConfig,
    source: &dyn FieldSource,
    clock: &dyn AnalysisClock,
    show_progress: bool,
) -> PipelineResult<RunSummary> {
    let reference = match config.date {
        Some(date) => ReferenceTime::resolve(&FixedClock(date)).await?,
        None => ReferenceTime::resolve(clock).await?,
    };
    crate::log::show_reference(&reference);

    let (target, regridder) = build_regridder(&config.grid)?;
    let runner = create_runner(&config.runner, &target)?;

    let input = prepare_input_state(source, &config.catalog, &regridder, reference, show_progress).await?;
    crate::log::show_input_summary(&input);

    let mut artifacts = Vec::new();
    if let Some(location) = &config.output.input_state {
        let location = if location.ends_with(".parquet") {
            location.clone()
        } else {
            join_location(location, &input_file_name(&config.output.experiment, &reference))
        };
        let (latitudes, longitudes) = target.latlons();
        let mut df = input_state_frame(&input, &latitudes, &longitudes)?;
        write_parquet(&mut df, &location).await?;
        artifacts.push(location);
    }

    let mut steps = 0;
    for state in runner.run(&input, config.runner.lead_time())? {
        let state = state?;
        crate::log::print_state(&state, config.output.max_lines);
        if config.output.write_states {
            let location = join_location(
                &config.output.results_dir,
                &output_file_name(&config.output.experiment, &reference, state.step),
            );
            let mut df = output_state_frame(&state)?;
            write_parquet(&mut df, &location).await?;
            artifacts.push(location);
        }
        steps += 1;
    }

    Ok(RunSummary {
        reference,
        input_fields: input.len(),
        steps,
        artifacts,
    })
}
