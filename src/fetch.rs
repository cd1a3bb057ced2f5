//! # Field Fetcher
//!
//! Drives one [`FieldSource`] for both query times of a run and turns every
//! returned field into a sample on the model grid:
//!
//! 1. check the raw shape against the source grid,
//! 2. re-centre longitudes with [`roll_longitude`],
//! 3. interpolate with the shared [`Regridder`],
//! 4. key the sample by field name and tag it with its query time.
//!
//! Retrievals run one after another; any failure aborts the fetch.

use crate::catalog::{FieldRequest, field_name};
use crate::reference::ReferenceTime;
use crate::regrid::{RegridError, Regridder, roll_longitude};
use crate::source::{FieldSource, RawField, RetrievalRequest, SourceError};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use ndarray::Array1;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Field '{name}' at {date} has shape {actual:?}, expected {expected:?}")]
    UnexpectedGridShape {
        name: String,
        date: DateTime<Utc>,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Field '{param}' at {date} carries no level but levels were requested")]
    MissingLevel { param: String, date: DateTime<Utc> },

    #[error(transparent)]
    Regrid(#[from] RegridError),
}

pub type FetchResult<T> = Result<T, FetchError>;

/// One regridded field at one query time.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedSample {
    pub date: DateTime<Utc>,
    pub values: Array1<f64>,
}

/// Samples per field name, in arrival order.
pub type FetchedFields = BTreeMap<String, Vec<TimedSample>>;

pub struct FieldFetcher<'a> {
    source: &'a dyn FieldSource,
    regridder: &'a Regridder,
    show_progress: bool,
}

impl<'a> FieldFetcher<'a> {
    pub fn new(source: &'a dyn FieldSource, regridder: &'a Regridder) -> Self {
        Self {
            source,
            regridder,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Fetches every field of `request` at `T - 6h` and `T`.
    pub async fn fetch(
        &self,
        reference: &ReferenceTime,
        request: &FieldRequest,
    ) -> FetchResult<FetchedFields> {
        let mut fetched = FetchedFields::new();

        for date in reference.query_times() {
            let retrieval = RetrievalRequest {
                date,
                params: request.params.clone(),
                levels: request.levels.clone(),
            };
            info!(
                "Retrieving {:?} (levels {:?}) for {}",
                retrieval.params, retrieval.levels, date
            );

            let fields = self.source.retrieve(&retrieval).await?;
            let progress = self.progress_bar(fields.len() as u64, date);

            for field in fields {
                let name = self.name_of(&field, &retrieval)?;
                progress.set_message(name.clone());
                let values = self.reshape(&name, date, &field)?;
                fetched
                    .entry(name)
                    .or_default()
                    .push(TimedSample { date, values });
                progress.inc(1);
            }
            progress.finish_and_clear();
        }

        debug!("Fetched {} distinct fields", fetched.len());
        Ok(fetched)
    }

    fn name_of(&self, field: &RawField, retrieval: &RetrievalRequest) -> FetchResult<String> {
        if retrieval.levels.is_empty() {
            return Ok(field_name(&field.param, None));
        }
        match field.levelist {
            Some(level) => Ok(field_name(&field.param, Some(level))),
            None => Err(FetchError::MissingLevel {
                param: field.param.clone(),
                date: retrieval.date,
            }),
        }
    }

    fn reshape(
        &self,
        name: &str,
        date: DateTime<Utc>,
        field: &RawField,
    ) -> FetchResult<Array1<f64>> {
        let expected = self.regridder.source().shape();
        if field.shape() != expected {
            return Err(FetchError::UnexpectedGridShape {
                name: name.to_string(),
                date,
                expected,
                actual: field.shape(),
            });
        }

        let rolled = roll_longitude(field.values.view());
        let values = self.regridder.interpolate(rolled.view())?;
        debug!(
            "Regridded {} at {} onto {} ({} points)",
            name,
            date,
            self.regridder.target_name(),
            values.len()
        );
        Ok(values)
    }

    fn progress_bar(&self, length: u64, date: DateTime<Utc>) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(length);
        let style = ProgressStyle::default_bar()
            .template("{prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        bar.set_style(style);
        bar.set_prefix(date.format("%Y-%m-%d %HZ").to_string());
        bar
    }
}
