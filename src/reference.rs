//! # Reference Time
//!
//! Every run is anchored on one analysis time `T`, resolved once. The model
//! takes two consecutive analyses as input, so each field is fetched at
//! `T - 6h` and at `T`.

use crate::source::SourceResult;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;

/// Hours between the two analyses handed to the model.
pub const INPUT_SPACING_HOURS: i64 = 6;

/// Anything that can tell which analysis time is the most recent one.
#[async_trait::async_trait]
pub trait AnalysisClock: Send + Sync {
    async fn latest(&self) -> SourceResult<DateTime<Utc>>;
}

/// Clock pinned to a given analysis time.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

#[async_trait::async_trait]
impl AnalysisClock for FixedClock {
    async fn latest(&self) -> SourceResult<DateTime<Utc>> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ReferenceTime(DateTime<Utc>);

impl ReferenceTime {
    pub fn new(date: DateTime<Utc>) -> Self {
        Self(date)
    }

    /// Asks the clock once; errors propagate unchanged.
    pub async fn resolve(clock: &dyn AnalysisClock) -> SourceResult<Self> {
        Ok(Self(clock.latest().await?))
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn previous(&self) -> DateTime<Utc> {
        self.0 - Duration::hours(INPUT_SPACING_HOURS)
    }

    /// `[T - 6h, T]`, earlier first.
    pub fn query_times(&self) -> [DateTime<Utc>; 2] {
        [self.previous(), self.0]
    }
}

impl fmt::Display for ReferenceTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%SZ"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_query_times_are_chronological() {
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let reference = ReferenceTime::new(t);
        let [earlier, later] = reference.query_times();
        assert_eq!(earlier, Utc.with_ymd_and_hms(2024, 12, 31, 18, 0, 0).unwrap());
        assert_eq!(later, t);
        assert!(earlier < later);
    }

    #[test]
    fn test_resolve_from_fixed_clock() {
        let t = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let reference = tokio_test::block_on(ReferenceTime::resolve(&FixedClock(t))).unwrap();
        assert_eq!(reference.date(), t);
        assert_eq!(reference.to_string(), "2025-06-15T12:00:00Z");
    }
}
