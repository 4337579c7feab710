//! Export rows for complete sleep periods
//!
//! Rows are keyed by stable id and follow the store's canonical order. A period
//! whose metrics are missing or stale still gets a row, plus a warning.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ComputeError;
use crate::store::PeriodStore;
use crate::types::{SleepKind, SleepMetrics, StableId};

/// Namespace for content-derived period keys
const PERIOD_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x5b3c_9a41_7e2d_4f08_a1c6_0d9e_8f27_b3a4);

/// Metric column available for export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportColumn {
    TimeInBed,
    TotalSleepTime,
    SleepOnsetLatency,
    Waso,
    NumberOfAwakenings,
    AverageAwakeningLength,
    SleepEfficiency,
    MovementIndex,
    FragmentationIndex,
    SleepFragmentationIndex,
    TotalActivity,
    NonzeroEpochs,
}

impl ExportColumn {
    pub const ALL: [ExportColumn; 12] = [
        ExportColumn::TimeInBed,
        ExportColumn::TotalSleepTime,
        ExportColumn::SleepOnsetLatency,
        ExportColumn::Waso,
        ExportColumn::NumberOfAwakenings,
        ExportColumn::AverageAwakeningLength,
        ExportColumn::SleepEfficiency,
        ExportColumn::MovementIndex,
        ExportColumn::FragmentationIndex,
        ExportColumn::SleepFragmentationIndex,
        ExportColumn::TotalActivity,
        ExportColumn::NonzeroEpochs,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ExportColumn::TimeInBed => "time_in_bed",
            ExportColumn::TotalSleepTime => "total_sleep_time",
            ExportColumn::SleepOnsetLatency => "sleep_onset_latency",
            ExportColumn::Waso => "waso",
            ExportColumn::NumberOfAwakenings => "number_of_awakenings",
            ExportColumn::AverageAwakeningLength => "average_awakening_length",
            ExportColumn::SleepEfficiency => "sleep_efficiency",
            ExportColumn::MovementIndex => "movement_index",
            ExportColumn::FragmentationIndex => "fragmentation_index",
            ExportColumn::SleepFragmentationIndex => "sleep_fragmentation_index",
            ExportColumn::TotalActivity => "total_activity",
            ExportColumn::NonzeroEpochs => "nonzero_epochs",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    pub fn value(&self, metrics: &SleepMetrics) -> f64 {
        match self {
            ExportColumn::TimeInBed => metrics.time_in_bed_minutes,
            ExportColumn::TotalSleepTime => metrics.total_sleep_time_minutes,
            ExportColumn::SleepOnsetLatency => metrics.sleep_onset_latency_minutes,
            ExportColumn::Waso => metrics.waso_minutes,
            ExportColumn::NumberOfAwakenings => f64::from(metrics.number_of_awakenings),
            ExportColumn::AverageAwakeningLength => metrics.average_awakening_length_minutes,
            ExportColumn::SleepEfficiency => metrics.sleep_efficiency,
            ExportColumn::MovementIndex => metrics.movement_index,
            ExportColumn::FragmentationIndex => metrics.fragmentation_index,
            ExportColumn::SleepFragmentationIndex => metrics.sleep_fragmentation_index,
            ExportColumn::TotalActivity => metrics.total_activity,
            ExportColumn::NonzeroEpochs => f64::from(metrics.nonzero_epochs),
        }
    }
}

/// Ordered selection of metric columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSet {
    columns: Vec<ExportColumn>,
}

impl Default for ColumnSet {
    fn default() -> Self {
        Self::all()
    }
}

impl ColumnSet {
    pub fn all() -> Self {
        Self {
            columns: ExportColumn::ALL.to_vec(),
        }
    }

    /// Select columns by name, keeping the given order and dropping repeats
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ComputeError> {
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref().trim();
            let column = ExportColumn::from_name(name).ok_or_else(|| {
                ComputeError::Validation(format!("unknown export column '{name}'"))
            })?;
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[ExportColumn] {
        &self.columns
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnValue {
    pub column: ExportColumn,
    pub value: f64,
}

/// One exported sleep period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    pub file_id: String,
    pub date: NaiveDate,
    pub stable_id: StableId,
    pub period_key: Uuid,
    pub kind: SleepKind,
    pub onset: DateTime<Utc>,
    pub offset: DateTime<Utc>,
    /// Empty when the period has no valid metrics
    pub values: Vec<ColumnValue>,
}

impl ExportRow {
    pub fn value(&self, column: ExportColumn) -> Option<f64> {
        self.values.iter().find(|v| v.column == column).map(|v| v.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum ProjectionWarning {
    MissingMetrics {
        file_id: String,
        date: NaiveDate,
        stable_id: StableId,
    },
}

impl ProjectionWarning {
    pub fn message(&self) -> String {
        match self {
            ProjectionWarning::MissingMetrics {
                file_id,
                date,
                stable_id,
            } => format!("{file_id} {date}: sleep period {stable_id} has no valid metrics"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub rows: Vec<ExportRow>,
    pub warnings: Vec<ProjectionWarning>,
}

pub struct ExportProjection;

impl ExportProjection {
    /// Rows for every complete sleep period in the store
    pub fn project(store: &PeriodStore, columns: &ColumnSet) -> Projection {
        let mut projection = Projection::default();

        for period in store.list_complete(None) {
            let (onset, offset) = match (period.onset, period.offset) {
                (Some(onset), Some(offset)) => (onset, offset),
                _ => continue,
            };

            let values = match store.metrics(period.id) {
                Some(metrics) => columns
                    .columns()
                    .iter()
                    .map(|&column| ColumnValue {
                        column,
                        value: column.value(metrics),
                    })
                    .collect(),
                None => {
                    projection.warnings.push(ProjectionWarning::MissingMetrics {
                        file_id: store.file_id().to_string(),
                        date: store.date(),
                        stable_id: period.id,
                    });
                    Vec::new()
                }
            };

            projection.rows.push(ExportRow {
                file_id: store.file_id().to_string(),
                date: store.date(),
                stable_id: period.id,
                period_key: period_key(store.file_id(), store.date(), onset, offset, period.kind),
                kind: period.kind,
                onset,
                offset,
                values,
            });
        }

        projection
    }
}

/// Content-derived key for a period, stable across stores that do not share ids
pub fn period_key(
    file_id: &str,
    date: NaiveDate,
    onset: DateTime<Utc>,
    offset: DateTime<Utc>,
    kind: SleepKind,
) -> Uuid {
    let name = format!(
        "{}|{}|{}|{}|{}",
        file_id,
        date,
        onset.timestamp_millis(),
        offset.timestamp_millis(),
        kind.as_str()
    );
    Uuid::new_v5(&PERIOD_KEY_NAMESPACE, name.as_bytes())
}
