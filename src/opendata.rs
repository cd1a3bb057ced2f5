//! # ECMWF Open Data Client
//!
//! Retrieves analysis fields (step 0 of the high-resolution forecast) from
//! the ECMWF open-data feed.
//!
//! Each forecast run publishes one GRIB2 file per step plus a `.index`
//! sidecar listing every message as a JSON line with its `param`,
//! `levelist`, byte `_offset` and `_length`. A retrieval downloads the index,
//! selects the requested messages, merges contiguous byte ranges and fetches
//! them with HTTP `Range` requests, so only the requested fields cross the
//! network.
//!
//! ## URL layout
//!
//! ```text
//! {base}/{YYYYMMDD}/{HH}z/{model}/{resolution}/{stream}/{YYYYMMDD}{HH}0000-0h-{stream}-fc.grib2
//! ```
//!
//! The 00 and 12 UTC runs are published in the `oper` stream, the 06 and 18
//! UTC runs in `scda`.

use crate::reference::AnalysisClock;
use crate::source::{FieldSource, RawField, RetrievalRequest, SourceError, SourceResult};
use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use log::{debug, info};
use ndarray::Array2;
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Cursor;

pub const DEFAULT_BASE_URL: &str = "https://data.ecmwf.int/forecasts";

/// Connection settings for the open-data feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Root of the feed
    pub base_url: String,
    /// Producing model
    pub model: String,
    /// Resolution directory
    pub resolution: String,
    /// HTTP request timeout in seconds
    pub timeout_secs: u64,
    /// Number of synoptic times probed when looking for the latest analysis
    pub latest_lookback: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: "ifs".to_string(),
            resolution: "0p25".to_string(),
            timeout_secs: 300,
            latest_lookback: 8,
        }
    }
}

/// One line of a `.index` sidecar.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IndexEntry {
    pub param: String,
    #[serde(default)]
    pub levelist: Option<String>,
    #[serde(default)]
    pub levtype: Option<String>,
    #[serde(rename = "_offset")]
    pub offset: u64,
    #[serde(rename = "_length")]
    pub length: u64,
}

impl IndexEntry {
    pub fn level(&self) -> Option<u32> {
        self.levelist.as_deref().and_then(|l| l.trim().parse().ok())
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// A contiguous byte span covering one or more consecutive index entries.
#[derive(Debug, Clone, PartialEq)]
pub struct ByteSpan<'a> {
    pub start: u64,
    pub end: u64,
    pub entries: Vec<&'a IndexEntry>,
}

impl ByteSpan<'_> {
    /// Value for an HTTP `Range` header (inclusive end).
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end - 1)
    }
}

/// Parses the JSON-lines body of an index file. Blank lines are skipped.
pub fn parse_index(body: &str) -> SourceResult<Vec<IndexEntry>> {
    body.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            serde_json::from_str(line).map_err(|e| SourceError::Index {
                line: number + 1,
                message: e.to_string(),
            })
        })
        .collect()
}

/// Picks the index entries a request asks for, sorted by offset.
///
/// Every requested parameter (and level, when levels are given) must be
/// present, otherwise the retrieval fails with the missing combinations.
pub fn select_entries<'a>(
    entries: &'a [IndexEntry],
    request: &RetrievalRequest,
) -> SourceResult<Vec<&'a IndexEntry>> {
    let mut selected: Vec<&IndexEntry> = entries
        .iter()
        .filter(|entry| request.matches(&entry.param, entry.level()))
        .collect();
    selected.sort_by_key(|entry| entry.offset);

    let found: BTreeSet<(String, Option<u32>)> = selected
        .iter()
        .map(|entry| (entry.param.clone(), entry.level()))
        .collect();

    let mut missing = Vec::new();
    for param in &request.params {
        if request.levels.is_empty() {
            if !found.contains(&(param.clone(), None)) {
                missing.push(param.clone());
            }
        } else {
            for level in &request.levels {
                if !found.contains(&(param.clone(), Some(*level))) {
                    missing.push(format!("{}_{}", param, level));
                }
            }
        }
    }

    if !missing.is_empty() {
        return Err(SourceError::MissingEntries {
            date: request.date,
            missing,
        });
    }

    Ok(selected)
}

/// Merges offset-sorted entries into contiguous spans.
pub fn merge_spans<'a>(entries: &[&'a IndexEntry]) -> Vec<ByteSpan<'a>> {
    let mut spans: Vec<ByteSpan<'a>> = Vec::new();
    for &entry in entries {
        match spans.last_mut() {
            Some(span) if span.end == entry.offset => {
                span.end = entry.end();
                span.entries.push(entry);
            }
            _ => spans.push(ByteSpan {
                start: entry.offset,
                end: entry.end(),
                entries: vec![entry],
            }),
        }
    }
    spans
}

/// Product stream for an analysis time.
pub fn stream_for(date: &DateTime<Utc>) -> &'static str {
    match date.hour() {
        0 | 12 => "oper",
        _ => "scda",
    }
}

/// Synoptic times to probe for the latest analysis, newest first.
pub fn latest_candidates(now: DateTime<Utc>, attempts: u32) -> Vec<DateTime<Utc>> {
    let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    let synoptic = midnight + Duration::hours(i64::from(now.hour() - now.hour() % 6));
    (0..attempts)
        .map(|k| synoptic - Duration::hours(6 * i64::from(k)))
        .collect()
}

/// Decodes every GRIB2 message in a buffer into `(rows, columns)` arrays,
/// rows running north to south.
pub fn decode_messages(bytes: Vec<u8>) -> SourceResult<Vec<Array2<f64>>> {
    let grib2 =
        grib::from_reader(Cursor::new(bytes)).map_err(|e| SourceError::Decode(e.to_string()))?;

    let mut arrays = Vec::new();
    for (_index, submessage) in grib2.iter() {
        let (ni, nj) = submessage
            .grid_shape()
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        let decoder = grib::Grib2SubmessageDecoder::from(submessage)
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        let values: Vec<f64> = decoder
            .dispatch()
            .map_err(|e| SourceError::Decode(e.to_string()))?
            .map(f64::from)
            .collect();
        let array = Array2::from_shape_vec((nj, ni), values)
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        arrays.push(array);
    }
    if arrays.is_empty() {
        return Err(SourceError::Decode("no GRIB2 messages found".to_string()));
    }
    Ok(arrays)
}

/// HTTP client for the open-data feed.
#[derive(Debug, Clone)]
pub struct OpenDataClient {
    client: Client,
    config: SourceConfig,
}

impl OpenDataClient {
    pub fn new(config: SourceConfig) -> SourceResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// URL of the step-0 GRIB2 file for an analysis time.
    pub fn data_url(&self, date: &DateTime<Utc>) -> String {
        let day = date.format("%Y%m%d");
        let hour = date.format("%H");
        let stream = stream_for(date);
        format!(
            "{}/{}/{}z/{}/{}/{}/{}{}0000-0h-{}-fc.grib2",
            self.config.base_url.trim_end_matches('/'),
            day,
            hour,
            self.config.model,
            self.config.resolution,
            stream,
            day,
            hour,
            stream
        )
    }

    pub fn index_url(&self, date: &DateTime<Utc>) -> String {
        let data_url = self.data_url(date);
        match data_url.strip_suffix(".grib2") {
            Some(stem) => format!("{}.index", stem),
            None => format!("{}.index", data_url),
        }
    }

    /// Whether the feed has published the analysis for `date`.
    pub async fn exists(&self, date: &DateTime<Utc>) -> SourceResult<bool> {
        let url = self.index_url(date);
        let response = self.client.head(&url).send().await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Ok(false),
            status => Err(SourceError::Status {
                url,
                status: status.as_u16(),
            }),
        }
    }

    async fn fetch_index(&self, date: &DateTime<Utc>) -> SourceResult<Vec<IndexEntry>> {
        let url = self.index_url(date);
        debug!("Downloading index {}", url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(SourceError::Status {
                url,
                status: response.status().as_u16(),
            });
        }
        parse_index(&response.text().await?)
    }

    async fn fetch_span(&self, url: &str, span: &ByteSpan<'_>) -> SourceResult<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .header(header::RANGE, span.range_header())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SourceError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait::async_trait]
impl FieldSource for OpenDataClient {
    async fn retrieve(&self, request: &RetrievalRequest) -> SourceResult<Vec<RawField>> {
        let index = self.fetch_index(&request.date).await?;
        let selected = select_entries(&index, request)?;
        let spans = merge_spans(&selected);
        let url = self.data_url(&request.date);

        info!(
            "Retrieving {} fields in {} ranges from {}",
            selected.len(),
            spans.len(),
            url
        );

        let mut fields = Vec::with_capacity(selected.len());
        for span in &spans {
            let bytes = self.fetch_span(&url, span).await?;
            let arrays = decode_messages(bytes)?;
            if arrays.len() != span.entries.len() {
                return Err(SourceError::Decode(format!(
                    "expected {} messages in {}, found {}",
                    span.entries.len(),
                    span.range_header(),
                    arrays.len()
                )));
            }
            for (entry, values) in span.entries.iter().zip(arrays) {
                fields.push(RawField::new(&entry.param, entry.level(), values));
            }
        }

        Ok(fields)
    }
}

#[async_trait::async_trait]
impl AnalysisClock for OpenDataClient {
    async fn latest(&self) -> SourceResult<DateTime<Utc>> {
        for candidate in latest_candidates(Utc::now(), self.config.latest_lookback) {
            if self.exists(&candidate).await? {
                debug!("Latest analysis available: {}", candidate);
                return Ok(candidate);
            }
            debug!("No analysis published yet for {}", candidate);
        }
        Err(SourceError::NoRecentAnalysis {
            attempts: self.config.latest_lookback,
        })
    }
}
