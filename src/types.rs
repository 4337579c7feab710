//! Core types for the actisleep engine
//!
//! This module defines the data that flows through each stage: epoch series,
//! classification output, periods with stable identity, and computed metrics.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{AlgorithmConfig, AlgorithmId};
use crate::error::ComputeError;

/// One aggregated activity sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Epoch {
    /// Start of the epoch
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub axis_x: f64,
    #[serde(default)]
    pub axis_y: f64,
    #[serde(default)]
    pub axis_z: f64,
    #[serde(default)]
    pub vector_magnitude: f64,
}

impl Epoch {
    /// Read one activity channel, with NaN, infinite and negative values treated as zero
    pub fn count(&self, channel: ActivityChannel) -> f64 {
        let raw = match channel {
            ActivityChannel::AxisX => self.axis_x,
            ActivityChannel::AxisY => self.axis_y,
            ActivityChannel::AxisZ => self.axis_z,
            ActivityChannel::VectorMagnitude => self.vector_magnitude,
        };
        sanitize_count(raw)
    }
}

/// Activity channel a component reads counts from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityChannel {
    AxisX,
    AxisY,
    AxisZ,
    VectorMagnitude,
}

pub(crate) fn sanitize_count(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Ordered epochs at a single fixed duration.
///
/// Timestamps strictly increase and every step is a whole number of epochs.
/// A step longer than one epoch is a coverage gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEpochSeries")]
pub struct EpochSeries {
    epoch_duration_seconds: u32,
    epochs: Vec<Epoch>,
}

#[derive(Deserialize)]
struct RawEpochSeries {
    epoch_duration_seconds: u32,
    epochs: Vec<Epoch>,
}

impl TryFrom<RawEpochSeries> for EpochSeries {
    type Error = ComputeError;

    fn try_from(raw: RawEpochSeries) -> Result<Self, Self::Error> {
        EpochSeries::new(raw.epoch_duration_seconds, raw.epochs)
    }
}

impl EpochSeries {
    /// Build a series, rejecting zero durations, unordered timestamps and
    /// spacing that is not a multiple of the epoch duration.
    pub fn new(epoch_duration_seconds: u32, epochs: Vec<Epoch>) -> Result<Self, ComputeError> {
        if epoch_duration_seconds == 0 {
            return Err(ComputeError::Validation(
                "epoch duration must be positive".to_string(),
            ));
        }

        let step_ms = i64::from(epoch_duration_seconds) * 1000;
        for pair in epochs.windows(2) {
            let delta = pair[1].timestamp - pair[0].timestamp;
            if delta <= Duration::zero() {
                return Err(ComputeError::Validation(format!(
                    "epoch timestamps must strictly increase ({} then {})",
                    pair[0].timestamp, pair[1].timestamp
                )));
            }
            let delta_ms = delta.num_milliseconds();
            if delta != Duration::milliseconds(delta_ms) || delta_ms % step_ms != 0 {
                return Err(ComputeError::Validation(format!(
                    "mixed epoch durations: {}ms step at {} in a {}s series",
                    delta_ms, pair[1].timestamp, epoch_duration_seconds
                )));
            }
        }

        Ok(Self {
            epoch_duration_seconds,
            epochs,
        })
    }

    pub fn epochs(&self) -> &[Epoch] {
        &self.epochs
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn epoch_duration_seconds(&self) -> u32 {
        self.epoch_duration_seconds
    }

    pub fn epoch_duration(&self) -> Duration {
        Duration::seconds(i64::from(self.epoch_duration_seconds))
    }

    /// Epoch length in minutes, used for every duration metric
    pub fn epoch_minutes(&self) -> f64 {
        f64::from(self.epoch_duration_seconds) / 60.0
    }

    /// Convert a span in minutes to a whole number of epochs (rounded up)
    pub fn minutes_to_epochs(&self, minutes: u32) -> usize {
        let seconds = u64::from(minutes) * 60;
        let step = u64::from(self.epoch_duration_seconds);
        seconds.div_ceil(step) as usize
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.epochs.first().map(|e| e.timestamp)
    }

    /// End of the last epoch
    pub fn end_timestamp(&self) -> Option<DateTime<Utc>> {
        self.epochs
            .last()
            .map(|e| e.timestamp + self.epoch_duration())
    }

    /// Index of the epoch starting exactly at `timestamp`
    pub fn index_of(&self, timestamp: DateTime<Utc>) -> Option<usize> {
        self.epochs
            .binary_search_by_key(&timestamp, |e| e.timestamp)
            .ok()
    }

    /// Sanitized counts for one channel
    pub fn counts(&self, channel: ActivityChannel) -> Vec<f64> {
        self.epochs.iter().map(|e| e.count(channel)).collect()
    }

    /// Whether epochs `start..end` follow each other without a gap
    pub fn is_contiguous(&self, start: usize, end: usize) -> bool {
        if start >= end || end > self.epochs.len() {
            return start == end;
        }
        let span = self.epochs[end - 1].timestamp - self.epochs[start].timestamp;
        span == self.epoch_duration() * (end - 1 - start) as i32
    }

    /// Epochs whose start falls inside `window`
    pub fn restricted_to(&self, window: &AnalysisWindow) -> EpochSeries {
        let epochs = self
            .epochs
            .iter()
            .filter(|e| window.contains(e.timestamp))
            .copied()
            .collect();
        EpochSeries {
            epoch_duration_seconds: self.epoch_duration_seconds,
            epochs,
        }
    }
}

/// Per-epoch sleep/wake score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepState {
    Sleep,
    Wake,
}

/// Per-epoch wear/nonwear flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WearState {
    Wear,
    Nonwear,
}

/// Sleep/wake scores parallel to an epoch series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub algorithm: AlgorithmId,
    /// Channel the states were scored on
    pub channel: ActivityChannel,
    pub epoch_duration_seconds: u32,
    pub states: Vec<SleepState>,
}

impl ClassificationResult {
    /// Algorithm settings that produced these states
    pub fn algorithm_config(&self) -> AlgorithmConfig {
        AlgorithmConfig {
            algorithm: self.algorithm,
            channel: self.channel,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn is_sleep(&self, idx: usize) -> bool {
        matches!(self.states.get(idx), Some(SleepState::Sleep))
    }

    pub fn is_wake(&self, idx: usize) -> bool {
        matches!(self.states.get(idx), Some(SleepState::Wake))
    }
}

/// Identifier assigned once per period, never reused within a file+date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(pub u32);

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Role of a sleep period within its date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepKind {
    MainSleep,
    Nap,
}

impl SleepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SleepKind::MainSleep => "main_sleep",
            SleepKind::Nap => "nap",
        }
    }
}

/// How a nonwear period came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonwearSource {
    #[default]
    Manual,
    Detected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepPeriod {
    pub id: StableId,
    pub onset: Option<DateTime<Utc>>,
    pub offset: Option<DateTime<Utc>>,
    pub kind: SleepKind,
}

impl SleepPeriod {
    pub fn is_complete(&self) -> bool {
        self.onset.is_some() && self.offset.is_some()
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.onset, self.offset) {
            (Some(onset), Some(offset)) => Some(offset - onset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonwearPeriod {
    pub id: StableId,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: NonwearSource,
}

impl NonwearPeriod {
    pub fn is_complete(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }
}

/// A period is always exactly one of these
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Period {
    Sleep(SleepPeriod),
    Nonwear(NonwearPeriod),
}

impl Period {
    /// New sleep period; the store assigns the id and kind on insert
    pub fn sleep(onset: Option<DateTime<Utc>>, offset: Option<DateTime<Utc>>) -> Self {
        Period::Sleep(SleepPeriod {
            id: StableId(0),
            onset,
            offset,
            kind: SleepKind::Nap,
        })
    }

    /// New manual nonwear period; the store assigns the id on insert
    pub fn nonwear(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Period::Nonwear(NonwearPeriod {
            id: StableId(0),
            start,
            end,
            source: NonwearSource::Manual,
        })
    }

    pub fn id(&self) -> StableId {
        match self {
            Period::Sleep(p) => p.id,
            Period::Nonwear(p) => p.id,
        }
    }

    pub(crate) fn set_id(&mut self, id: StableId) {
        match self {
            Period::Sleep(p) => p.id = id,
            Period::Nonwear(p) => p.id = id,
        }
    }

    /// Onset for sleep, start for nonwear
    pub fn begin(&self) -> Option<DateTime<Utc>> {
        match self {
            Period::Sleep(p) => p.onset,
            Period::Nonwear(p) => p.start,
        }
    }

    /// Offset for sleep, end for nonwear
    pub fn finish(&self) -> Option<DateTime<Utc>> {
        match self {
            Period::Sleep(p) => p.offset,
            Period::Nonwear(p) => p.end,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.begin().is_some() && self.finish().is_some()
    }

    pub fn as_sleep(&self) -> Option<&SleepPeriod> {
        match self {
            Period::Sleep(p) => Some(p),
            Period::Nonwear(_) => None,
        }
    }

    pub fn as_nonwear(&self) -> Option<&NonwearPeriod> {
        match self {
            Period::Nonwear(p) => Some(p),
            Period::Sleep(_) => None,
        }
    }
}

/// Boundary changes applied by [`crate::store::PeriodStore::update`].
///
/// `begin` is onset/start and `finish` is offset/end. `None` leaves a boundary as is.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeriodPatch {
    pub begin: Option<DateTime<Utc>>,
    pub finish: Option<DateTime<Utc>>,
}

/// Everything besides the boundaries that a [`SleepMetrics`] value depends on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsBasis {
    /// Scoring settings behind the sleep/wake states
    pub algorithm: AlgorithmConfig,
    /// Channel read for the movement index and activity totals
    pub movement_channel: ActivityChannel,
    pub epoch_duration_seconds: u32,
}

impl MetricsBasis {
    pub fn new(classification: &ClassificationResult, movement_channel: ActivityChannel) -> Self {
        Self {
            algorithm: classification.algorithm_config(),
            movement_channel,
            epoch_duration_seconds: classification.epoch_duration_seconds,
        }
    }
}

/// Standard sleep-quality metrics for one complete sleep period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepMetrics {
    /// Onset these metrics were computed for
    pub onset: DateTime<Utc>,
    /// Offset these metrics were computed for
    pub offset: DateTime<Utc>,
    pub basis: MetricsBasis,
    pub time_in_bed_minutes: f64,
    pub total_sleep_time_minutes: f64,
    pub sleep_onset_latency_minutes: f64,
    pub waso_minutes: f64,
    pub number_of_awakenings: u32,
    pub average_awakening_length_minutes: f64,
    /// Total sleep time / time in bed (percent)
    pub sleep_efficiency: f64,
    /// Epochs with non-zero activity (percent)
    pub movement_index: f64,
    /// One-epoch sleep bouts / all sleep bouts (percent)
    pub fragmentation_index: f64,
    pub sleep_fragmentation_index: f64,
    pub total_activity: f64,
    pub nonzero_epochs: u32,
}

impl SleepMetrics {
    /// Whether these metrics still describe the given boundaries and inputs
    pub fn matches(
        &self,
        onset: DateTime<Utc>,
        offset: DateTime<Utc>,
        basis: &MetricsBasis,
    ) -> bool {
        self.onset == onset && self.offset == offset && self.basis == *basis
    }
}

/// Time span the engine loads for one analysis date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnalysisWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AnalysisWindow {
    /// The 24 hours starting at `day_start_hour` on `date`
    pub fn for_date(date: NaiveDate, day_start_hour: u32) -> Result<Self, ComputeError> {
        let start = date
            .and_hms_opt(day_start_hour, 0, 0)
            .ok_or_else(|| {
                ComputeError::Validation(format!("invalid day start hour {day_start_hour}"))
            })?
            .and_utc();
        Ok(Self {
            start,
            end: start + Duration::hours(24),
        })
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

/// Inclusive range of analysis dates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ComputeError> {
        if end < start {
            return Err(ComputeError::Validation(format!(
                "date range ends ({end}) before it starts ({start})"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d <= self.end)
    }
}

/// Which boundary an edit moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Onset,
    Offset,
    Start,
    End,
}

impl Edge {
    /// Onset and start open a period; offset and end close it
    pub fn is_opening(&self) -> bool {
        matches!(self, Edge::Onset | Edge::Start)
    }

    pub fn is_sleep_edge(&self) -> bool {
        matches!(self, Edge::Onset | Edge::Offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditTarget {
    Existing(StableId),
    New,
}

/// Boundary edit produced by the editing surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryEdit {
    pub file_id: String,
    pub date: NaiveDate,
    pub target: EditTarget,
    pub edge: Edge,
    pub proposed_timestamp_ms: i64,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, 0).unwrap()
    }

    /// Series of one-minute epochs starting at `start` with the given VM/Y counts
    pub fn series_from_counts(start: DateTime<Utc>, counts: &[f64]) -> EpochSeries {
        let epochs = counts
            .iter()
            .enumerate()
            .map(|(i, &c)| Epoch {
                timestamp: start + Duration::minutes(i as i64),
                axis_x: 0.0,
                axis_y: c,
                axis_z: 0.0,
                vector_magnitude: c,
            })
            .collect();
        EpochSeries::new(60, epochs).unwrap()
    }

    /// Basis of the default config on one-minute epochs
    pub fn default_basis() -> MetricsBasis {
        MetricsBasis {
            algorithm: AlgorithmConfig::default(),
            movement_channel: ActivityChannel::VectorMagnitude,
            epoch_duration_seconds: 60,
        }
    }

    /// Metrics stub matching `(onset, offset)`, with `total_sleep_time_minutes` as a marker
    pub fn metrics_for(onset: DateTime<Utc>, offset: DateTime<Utc>, tst: f64) -> SleepMetrics {
        SleepMetrics {
            onset,
            offset,
            basis: default_basis(),
            time_in_bed_minutes: (offset - onset).num_minutes() as f64,
            total_sleep_time_minutes: tst,
            sleep_onset_latency_minutes: 0.0,
            waso_minutes: 0.0,
            number_of_awakenings: 0,
            average_awakening_length_minutes: 0.0,
            sleep_efficiency: 0.0,
            movement_index: 0.0,
            fragmentation_index: 0.0,
            sleep_fragmentation_index: 0.0,
            total_activity: 0.0,
            nonzero_epochs: 0,
        }
    }

    pub fn states(pattern: &[(SleepState, usize)]) -> Vec<SleepState> {
        pattern
            .iter()
            .flat_map(|&(s, n)| std::iter::repeat(s).take(n))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_series_rejects_mixed_durations() {
        let mut epochs = series_from_counts(at(0, 0), &[1.0, 2.0]).epochs().to_vec();
        epochs.push(Epoch {
            timestamp: epochs[1].timestamp + Duration::seconds(30),
            axis_x: 0.0,
            axis_y: 0.0,
            axis_z: 0.0,
            vector_magnitude: 0.0,
        });
        let result = EpochSeries::new(60, epochs);
        assert!(matches!(result, Err(ComputeError::Validation(_))));
    }

    #[test]
    fn test_series_rejects_sub_second_drift() {
        let first = series_from_counts(at(0, 0), &[1.0]).epochs()[0];
        let drifted = Epoch {
            timestamp: at(0, 1) + Duration::milliseconds(500),
            ..first
        };
        let result = EpochSeries::new(60, vec![first, drifted]);
        assert!(matches!(result, Err(ComputeError::Validation(_))));

        // A whole-epoch gap is still accepted
        let gap = Epoch {
            timestamp: at(0, 2),
            ..first
        };
        assert!(EpochSeries::new(60, vec![first, gap]).is_ok());
    }

    #[test]
    fn test_series_allows_gaps_but_reports_them() {
        let mut epochs = series_from_counts(at(0, 0), &[1.0, 2.0]).epochs().to_vec();
        epochs.push(Epoch {
            timestamp: at(0, 5),
            ..epochs[0]
        });
        let series = EpochSeries::new(60, epochs).unwrap();
        assert!(series.is_contiguous(0, 2));
        assert!(!series.is_contiguous(0, 3));
    }

    #[test]
    fn test_count_sanitizes_invalid_values() {
        let epoch = Epoch {
            timestamp: at(0, 0),
            axis_x: f64::NAN,
            axis_y: -4.0,
            axis_z: f64::INFINITY,
            vector_magnitude: 12.0,
        };
        assert_eq!(epoch.count(ActivityChannel::AxisX), 0.0);
        assert_eq!(epoch.count(ActivityChannel::AxisY), 0.0);
        assert_eq!(epoch.count(ActivityChannel::AxisZ), 0.0);
        assert_eq!(epoch.count(ActivityChannel::VectorMagnitude), 12.0);
    }

    #[test]
    fn test_series_deserialization_validates() {
        let json = r#"{
            "epoch_duration_seconds": 60,
            "epochs": [
                {"timestamp": "2024-01-15T00:01:00Z", "axis_y": 3.0},
                {"timestamp": "2024-01-15T00:00:00Z", "axis_y": 1.0}
            ]
        }"#;
        assert!(serde_json::from_str::<EpochSeries>(json).is_err());
    }

    #[test]
    fn test_analysis_window_noon_to_noon() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let window = AnalysisWindow::for_date(date, 12).unwrap();
        assert!(window.contains(at(23, 0)));
        assert!(!window.contains(at(11, 59)));
        assert_eq!(window.end - window.start, Duration::hours(24));
    }

    #[test]
    fn test_date_range_days() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 30).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 2, 2).unwrap();
        let range = DateRange::new(start, end).unwrap();
        assert_eq!(range.days().count(), 4);
        assert!(DateRange::new(end, start).is_err());
    }
}
