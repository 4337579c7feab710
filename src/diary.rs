//! Sleep diary import
//!
//! A diary entry lists the self-reported main sleep, naps and nonwear for one
//! file and date. Entries become periods through the same boundary resolution
//! as interactive edits.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ComputeError;
use crate::types::{Period, StableId};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiaryInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiaryEntry {
    pub file_id: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub sleep_onset: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sleep_offset: Option<DateTime<Utc>>,
    #[serde(default)]
    pub naps: Vec<DiaryInterval>,
    #[serde(default)]
    pub nonwear: Vec<DiaryInterval>,
}

impl DiaryEntry {
    pub fn applies_to(&self, file_id: &str, date: NaiveDate) -> bool {
        self.file_id == file_id && self.date == date
    }

    /// Unresolved periods described by this entry, main sleep first
    pub fn periods(&self) -> Vec<Period> {
        let mut periods = Vec::with_capacity(1 + self.naps.len() + self.nonwear.len());
        if self.sleep_onset.is_some() || self.sleep_offset.is_some() {
            periods.push(Period::sleep(self.sleep_onset, self.sleep_offset));
        }
        periods.extend(
            self.naps
                .iter()
                .map(|nap| Period::sleep(Some(nap.start), Some(nap.end))),
        );
        periods.extend(
            self.nonwear
                .iter()
                .map(|nw| Period::nonwear(Some(nw.start), Some(nw.end))),
        );
        periods
    }
}

/// Parse a JSON array of diary entries
pub fn parse_diary(json: &str) -> Result<Vec<DiaryEntry>, ComputeError> {
    Ok(serde_json::from_str(json)?)
}

/// Outcome of importing diary entries into one day
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiaryImport {
    pub created: Vec<StableId>,
    /// Stored periods that already had the resolved boundaries of an entry
    #[serde(default)]
    pub existing: Vec<StableId>,
    /// Periods that could not be placed, with the reason
    pub skipped: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::at;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_and_expand_entry() {
        let json = r#"[{
            "file_id": "subject-01",
            "date": "2024-01-15",
            "sleep_onset": "2024-01-15T22:00:00Z",
            "naps": [{"start": "2024-01-15T14:00:00Z", "end": "2024-01-15T14:30:00Z"}],
            "nonwear": [{"start": "2024-01-15T17:00:00Z", "end": "2024-01-15T19:00:00Z"}]
        }]"#;
        let entries = parse_diary(json).unwrap();
        assert_eq!(entries.len(), 1);

        let entry = &entries[0];
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert!(entry.applies_to("subject-01", date));
        assert!(!entry.applies_to("subject-02", date));

        let periods = entry.periods();
        assert_eq!(periods.len(), 3);
        assert_eq!(periods[0], Period::sleep(Some(at(22, 0)), None));
        assert_eq!(periods[1].begin(), Some(at(14, 0)));
        assert!(periods[2].as_nonwear().is_some());
    }

    #[test]
    fn test_malformed_diary_is_json_error() {
        assert!(matches!(
            parse_diary(r#"[{"file_id": 3}]"#),
            Err(ComputeError::Json(_))
        ));
    }
}
