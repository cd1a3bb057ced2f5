//! # Field Sources
//!
//! The [`FieldSource`] trait is the seam between the pipeline and wherever
//! gridded analysis fields come from. A retrieval is scoped to one analysis
//! time, a set of parameter codes and an optional set of levels, and returns
//! every matching field with its `param`/`levelist` metadata.
//!
//! - [`crate::opendata::OpenDataClient`] talks to the ECMWF open-data feed.
//! - [`MemorySource`] serves fields held in memory; used for tests and for
//!   replaying data obtained elsewhere.

use chrono::{DateTime, Utc};
use ndarray::Array2;
use std::sync::Mutex;
use thiserror::Error;

/// Errors that can occur while retrieving fields
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request to {url} failed with status {status}")]
    Status { url: String, status: u16 },

    #[error("Malformed index line {line}: {message}")]
    Index { line: usize, message: String },

    #[error("No data for {missing:?} at {date}")]
    MissingEntries {
        date: DateTime<Utc>,
        missing: Vec<String>,
    },

    #[error("GRIB decoding error: {0}")]
    Decode(String),

    #[error("No analysis found in the last {attempts} synoptic times")]
    NoRecentAnalysis { attempts: u32 },
}

/// Result type for source operations
pub type SourceResult<T> = Result<T, SourceError>;

/// One retrieval: an analysis time, parameter codes and levels. An empty
/// level list asks for single-level (surface) fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalRequest {
    pub date: DateTime<Utc>,
    pub params: Vec<String>,
    pub levels: Vec<u32>,
}

impl RetrievalRequest {
    /// Whether a field with this metadata belongs to the request.
    pub fn matches(&self, param: &str, levelist: Option<u32>) -> bool {
        if !self.params.iter().any(|p| p == param) {
            return false;
        }
        match levelist {
            None => self.levels.is_empty(),
            Some(level) => self.levels.contains(&level),
        }
    }
}

/// A decoded field as delivered by the source, before any reshaping.
#[derive(Debug, Clone, PartialEq)]
pub struct RawField {
    pub param: String,
    pub levelist: Option<u32>,
    pub values: Array2<f64>,
}

impl RawField {
    pub fn new(param: &str, levelist: Option<u32>, values: Array2<f64>) -> Self {
        Self {
            param: param.to_string(),
            levelist,
            values,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }
}

/// Trait defining the interface for field sources
#[async_trait::async_trait]
pub trait FieldSource: Send + Sync {
    /// Retrieves every field matching the request. Fields may come back in
    /// any order.
    async fn retrieve(&self, request: &RetrievalRequest) -> SourceResult<Vec<RawField>>;
}

/// In-memory source keyed by analysis time.
#[derive(Debug, Default)]
pub struct MemorySource {
    fields: Vec<(DateTime<Utc>, RawField)>,
    requests: Mutex<Vec<RetrievalRequest>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, date: DateTime<Utc>, field: RawField) {
        self.fields.push((date, field));
    }

    pub fn with_field(mut self, date: DateTime<Utc>, field: RawField) -> Self {
        self.insert(date, field);
        self
    }

    /// Requests served so far, in call order.
    pub fn requests(&self) -> Vec<RetrievalRequest> {
        match self.requests.lock() {
            Ok(log) => log.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait::async_trait]
impl FieldSource for MemorySource {
    async fn retrieve(&self, request: &RetrievalRequest) -> SourceResult<Vec<RawField>> {
        match self.requests.lock() {
            Ok(mut log) => log.push(request.clone()),
            Err(poisoned) => poisoned.into_inner().push(request.clone()),
        }

        Ok(self
            .fields
            .iter()
            .filter(|(date, field)| {
                *date == request.date && request.matches(&field.param, field.levelist)
            })
            .map(|(_, field)| field.clone())
            .collect())
    }
}
