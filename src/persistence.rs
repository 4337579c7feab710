//! Storage seams
//!
//! The engine reads epochs through [`EpochProvider`] and persists periods and
//! metrics through [`RowStore`]. In-memory implementations are provided for
//! tests and embedding.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::HashMap;

use crate::error::ComputeError;
use crate::store::MAX_STABLE_ID;
use crate::types::{AnalysisWindow, EpochSeries, Period, SleepMetrics, StableId};

/// Source of epoch data
pub trait EpochProvider {
    /// Load every epoch of `file_id` that starts inside `window`.
    ///
    /// Implementations must not truncate the window.
    fn load(&self, file_id: &str, window: &AnalysisWindow) -> Result<EpochSeries, ComputeError>;
}

/// Persisted periods and metrics, one record per file+date
pub trait RowStore {
    fn read(&self, file_id: &str, date: NaiveDate) -> Result<Option<PersistedDay>, ComputeError>;

    /// Replace the record for `file_id`+`date` as a whole
    fn write(
        &mut self,
        file_id: &str,
        date: NaiveDate,
        day: PersistedDay,
    ) -> Result<(), ComputeError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRow {
    pub stable_id: StableId,
    pub period: Period,
    #[serde(default)]
    pub metrics: Option<SleepMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDay {
    pub epoch_duration_seconds: u32,
    /// Lowest id not yet handed out, so deleted ids stay retired after reload
    #[serde(default)]
    pub next_stable_id: u32,
    pub rows: Vec<PersistedRow>,
}

impl PersistedDay {
    pub fn from_json(json: &str) -> Result<Self, ComputeError> {
        let day: PersistedDay = serde_json::from_str(json)?;
        if let Some(row) = day.rows.iter().find(|r| r.stable_id != r.period.id()) {
            return Err(ComputeError::Validation(format!(
                "row key {} does not match period id {}",
                row.stable_id,
                row.period.id()
            )));
        }
        if let Some(row) = day
            .rows
            .iter()
            .find(|r| r.stable_id.0 == 0 || r.stable_id.0 > MAX_STABLE_ID)
        {
            return Err(ComputeError::Validation(format!(
                "row id {} is outside 1..={MAX_STABLE_ID}",
                row.stable_id
            )));
        }
        if day.next_stable_id > MAX_STABLE_ID + 1 {
            return Err(ComputeError::Validation(format!(
                "next_stable_id {} exceeds the limit of {MAX_STABLE_ID}",
                day.next_stable_id
            )));
        }
        Ok(day)
    }

    pub fn to_json(&self) -> Result<String, ComputeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Epoch series held in memory, keyed by file id
#[derive(Debug, Default)]
pub struct MemoryEpochProvider {
    files: HashMap<String, EpochSeries>,
    loads: Cell<usize>,
}

impl MemoryEpochProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(mut self, file_id: impl Into<String>, series: EpochSeries) -> Self {
        self.insert(file_id, series);
        self
    }

    pub fn insert(&mut self, file_id: impl Into<String>, series: EpochSeries) {
        self.files.insert(file_id.into(), series);
    }

    /// Number of `load` calls served so far
    pub fn load_count(&self) -> usize {
        self.loads.get()
    }
}

impl EpochProvider for MemoryEpochProvider {
    fn load(&self, file_id: &str, window: &AnalysisWindow) -> Result<EpochSeries, ComputeError> {
        self.loads.set(self.loads.get() + 1);
        self.files
            .get(file_id)
            .map(|series| series.restricted_to(window))
            .ok_or_else(|| ComputeError::Storage(format!("no epoch data for file '{file_id}'")))
    }
}

/// Row store that keeps each day as serialized JSON
#[derive(Debug, Default)]
pub struct MemoryRowStore {
    days: HashMap<(String, NaiveDate), String>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

impl RowStore for MemoryRowStore {
    fn read(&self, file_id: &str, date: NaiveDate) -> Result<Option<PersistedDay>, ComputeError> {
        self.days
            .get(&(file_id.to_string(), date))
            .map(|json| PersistedDay::from_json(json.as_str()))
            .transpose()
    }

    fn write(
        &mut self,
        file_id: &str,
        date: NaiveDate,
        day: PersistedDay,
    ) -> Result<(), ComputeError> {
        let json = day.to_json()?;
        self.days.insert((file_id.to_string(), date), json);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::{at, metrics_for, series_from_counts};
    use pretty_assertions::assert_eq;

    fn day() -> PersistedDay {
        let mut period = Period::sleep(Some(at(22, 0)), Some(at(23, 0)));
        period.set_id(StableId(2));
        PersistedDay {
            epoch_duration_seconds: 60,
            next_stable_id: 4,
            rows: vec![PersistedRow {
                stable_id: StableId(2),
                period,
                metrics: Some(metrics_for(at(22, 0), at(23, 0), 55.0)),
            }],
        }
    }

    #[test]
    fn test_row_store_round_trip() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let mut store = MemoryRowStore::new();
        assert_eq!(store.read("a", date).unwrap(), None);

        store.write("a", date, day()).unwrap();
        assert_eq!(store.read("a", date).unwrap(), Some(day()));
        assert_eq!(store.read("b", date).unwrap(), None);
    }

    #[test]
    fn test_mismatched_row_key_rejected() {
        let mut day = day();
        day.rows[0].stable_id = StableId(3);
        let json = serde_json::to_string(&day).unwrap();
        assert!(matches!(
            PersistedDay::from_json(&json),
            Err(ComputeError::Validation(_))
        ));
    }

    #[test]
    fn test_out_of_range_ids_rejected() {
        let mut huge_row = day();
        huge_row.rows[0].stable_id = StableId(u32::MAX);
        huge_row.rows[0].period.set_id(StableId(u32::MAX));

        let huge_next = PersistedDay {
            next_stable_id: u32::MAX,
            ..day()
        };

        for bad in [huge_row, huge_next] {
            let json = serde_json::to_string(&bad).unwrap();
            assert!(matches!(
                PersistedDay::from_json(&json),
                Err(ComputeError::Validation(_))
            ));
        }
    }

    #[test]
    fn test_provider_returns_whole_window() {
        let series = series_from_counts(at(10, 0), &vec![1.0; 240]);
        let provider = MemoryEpochProvider::new().with_series("a", series);
        let window = AnalysisWindow {
            start: at(12, 0),
            end: at(13, 0),
        };

        let loaded = provider.load("a", &window).unwrap();
        assert_eq!(loaded.len(), 60);
        assert_eq!(loaded.first_timestamp(), Some(at(12, 0)));
        assert!(matches!(
            provider.load("missing", &window),
            Err(ComputeError::Storage(_))
        ));
        assert_eq!(provider.load_count(), 2);
    }
}
