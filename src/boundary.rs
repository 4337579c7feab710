//! Period boundary resolution
//!
//! Edited timestamps are snapped to the nearest epoch boundary and, for sleep
//! periods, moved onto the consecutive-epoch rule:
//! - onset: first epoch beginning N consecutive sleep epochs (default 3)
//! - offset: first epoch after the last sleep epoch that begins M consecutive
//!   wake epochs (default 5)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::config::BoundaryRuleConfig;
use crate::error::ComputeError;
use crate::types::{ClassificationResult, Edge, EpochSeries};

/// A boundary placed on the epoch grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedBoundary {
    pub timestamp: DateTime<Utc>,
    /// Epoch index; for closing edges this is one past the last included epoch
    pub epoch_index: usize,
    /// Whether the consecutive-epoch rule located this boundary
    pub confirmed: bool,
}

/// Turns tentative timestamps into accepted boundaries
pub struct PeriodBoundaryResolver;

impl PeriodBoundaryResolver {
    /// Snap a timestamp to the nearest epoch boundary and return its index.
    ///
    /// Opening edges land on an epoch start (`0..n`); closing edges may also land
    /// on the end of the data (`n`).
    pub fn snap(
        series: &EpochSeries,
        timestamp: DateTime<Utc>,
        edge: Edge,
    ) -> Result<usize, ComputeError> {
        let (first, end) = match (series.first_timestamp(), series.end_timestamp()) {
            (Some(first), Some(end)) => (first, end),
            _ => {
                return Err(ComputeError::IncompleteData(
                    "no epochs available for boundary placement".to_string(),
                ))
            }
        };
        let out_of_range = || ComputeError::OutOfRangeBoundary {
            timestamp,
            first,
            last: end,
        };
        if timestamp < first || timestamp > end {
            return Err(out_of_range());
        }

        let step_ms = series.epoch_duration().num_milliseconds();
        let offset_ms = (timestamp - first).num_milliseconds();
        let steps = (offset_ms + step_ms / 2) / step_ms;
        let snapped = first + series.epoch_duration() * steps as i32;

        if let Some(idx) = series.index_of(snapped) {
            return Ok(idx);
        }
        let prev = series.index_of(snapped - series.epoch_duration());
        if edge.is_opening() {
            // Rounded up past the end of the epoch the timestamp lies in
            if let Some(prev) = prev.filter(|_| timestamp < snapped) {
                return Ok(prev);
            }
            if snapped >= end {
                return Err(out_of_range());
            }
        } else if let Some(prev) = prev {
            return Ok(prev + 1);
        }

        Err(ComputeError::IncompleteData(format!(
            "no epoch data at {snapped}"
        )))
    }

    /// Snap a boundary and, for sleep edges, apply the consecutive-epoch rule.
    ///
    /// When no qualifying run exists the snapped boundary is returned unconfirmed.
    pub fn resolve(
        series: &EpochSeries,
        classification: &ClassificationResult,
        timestamp: DateTime<Utc>,
        edge: Edge,
        rules: &BoundaryRuleConfig,
    ) -> Result<ResolvedBoundary, ComputeError> {
        Self::resolve_within(
            series,
            classification,
            timestamp,
            edge,
            rules,
            0..classification.len(),
        )
    }

    /// Resolve both edges of a sleep period and require `onset < offset`
    pub fn resolve_pair(
        series: &EpochSeries,
        classification: &ClassificationResult,
        onset: DateTime<Utc>,
        offset: DateTime<Utc>,
        rules: &BoundaryRuleConfig,
    ) -> Result<(ResolvedBoundary, ResolvedBoundary), ComputeError> {
        if offset <= onset {
            return Err(ComputeError::Validation(format!(
                "offset {offset} must be after onset {onset}"
            )));
        }
        // The onset search may not run past the offset, nor the offset search before the onset
        let ceiling = Self::snap(series, offset, Edge::Offset)?;
        let onset = Self::resolve_within(
            series,
            classification,
            onset,
            Edge::Onset,
            rules,
            0..ceiling,
        )?;
        let offset = Self::resolve_within(
            series,
            classification,
            offset,
            Edge::Offset,
            rules,
            onset.epoch_index + 1..classification.len(),
        )?;
        if offset.epoch_index <= onset.epoch_index {
            return Err(ComputeError::Validation(format!(
                "resolved offset {} is not after resolved onset {}",
                offset.timestamp, onset.timestamp
            )));
        }
        Ok((onset, offset))
    }

    /// Resolve with the confirmation search limited to epochs in `bounds`
    fn resolve_within(
        series: &EpochSeries,
        classification: &ClassificationResult,
        timestamp: DateTime<Utc>,
        edge: Edge,
        rules: &BoundaryRuleConfig,
        bounds: Range<usize>,
    ) -> Result<ResolvedBoundary, ComputeError> {
        if classification.len() != series.len() {
            return Err(ComputeError::Validation(format!(
                "classification covers {} epochs but series has {}",
                classification.len(),
                series.len()
            )));
        }

        let snapped = Self::snap(series, timestamp, edge)?;
        let confirmed = if rules.enabled {
            match edge {
                Edge::Onset => confirm_onset(
                    series,
                    classification,
                    snapped,
                    bounds.end,
                    rules.onset_sleep_epochs,
                ),
                Edge::Offset => confirm_offset(
                    series,
                    classification,
                    snapped,
                    bounds.start,
                    rules.offset_wake_epochs,
                ),
                Edge::Start | Edge::End => None,
            }
        } else {
            None
        };

        let epoch_index = confirmed.unwrap_or(snapped);
        Ok(ResolvedBoundary {
            timestamp: boundary_timestamp(series, epoch_index, edge),
            epoch_index,
            confirmed: confirmed.is_some(),
        })
    }
}

/// First index at or after `from` that begins `run` contiguous sleep epochs
/// ending no later than `ceiling`
fn confirm_onset(
    series: &EpochSeries,
    classification: &ClassificationResult,
    from: usize,
    ceiling: usize,
    run: usize,
) -> Option<usize> {
    let limit = ceiling.min(classification.len());
    (from..limit)
        .take_while(|i| i + run <= limit)
        .find(|&i| {
            (i..i + run).all(|k| classification.is_sleep(k)) && series.is_contiguous(i, i + run)
        })
}

/// Nearest index at or before `from` (and not below `floor`) where the previous
/// epoch is sleep and `run` contiguous wake epochs begin
fn confirm_offset(
    series: &EpochSeries,
    classification: &ClassificationResult,
    from: usize,
    floor: usize,
    run: usize,
) -> Option<usize> {
    let n = classification.len();
    (floor.max(1)..=from.min(n)).rev().find(|&j| {
        j + run <= n
            && classification.is_sleep(j - 1)
            && (j..j + run).all(|k| classification.is_wake(k))
            && series.is_contiguous(j - 1, j + run)
    })
}

/// Timestamp of a boundary index: epoch start for opening edges, end of the
/// previous epoch for closing edges
fn boundary_timestamp(series: &EpochSeries, idx: usize, edge: Edge) -> DateTime<Utc> {
    let epochs = series.epochs();
    if edge.is_opening() || idx == 0 {
        epochs[idx].timestamp
    } else {
        epochs[idx - 1].timestamp + series.epoch_duration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlgorithmId;
    use crate::types::fixtures::{at, series_from_counts, states};
    use crate::types::{ActivityChannel, Epoch, SleepState::*};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn classified(
        pattern: &[(crate::types::SleepState, usize)],
    ) -> (EpochSeries, ClassificationResult) {
        let states = states(pattern);
        let series = series_from_counts(at(22, 0), &vec![0.0; states.len()]);
        let classification = ClassificationResult {
            algorithm: AlgorithmId::SadehActiLife,
            channel: ActivityChannel::AxisY,
            epoch_duration_seconds: 60,
            states,
        };
        (series, classification)
    }

    #[test]
    fn test_snap_rounds_to_nearest_epoch() {
        let (series, _) = classified(&[(Wake, 60)]);
        let just_under = at(22, 10) + Duration::seconds(29);
        let just_over = at(22, 10) + Duration::seconds(31);
        assert_eq!(PeriodBoundaryResolver::snap(&series, just_under, Edge::Onset).unwrap(), 10);
        assert_eq!(PeriodBoundaryResolver::snap(&series, just_over, Edge::Onset).unwrap(), 11);
    }

    #[test]
    fn test_snap_end_of_data_only_for_closing_edges() {
        let (series, _) = classified(&[(Wake, 60)]);
        assert_eq!(PeriodBoundaryResolver::snap(&series, at(23, 0), Edge::Offset).unwrap(), 60);
        assert!(matches!(
            PeriodBoundaryResolver::snap(&series, at(23, 0), Edge::Onset),
            Err(ComputeError::OutOfRangeBoundary { .. })
        ));
    }

    #[test]
    fn test_opening_edge_in_last_half_of_final_epoch() {
        let (series, _) = classified(&[(Wake, 60)]);
        let late = at(22, 59) + Duration::seconds(45);
        assert_eq!(PeriodBoundaryResolver::snap(&series, late, Edge::Onset).unwrap(), 59);
        assert_eq!(PeriodBoundaryResolver::snap(&series, late, Edge::Start).unwrap(), 59);
        assert_eq!(PeriodBoundaryResolver::snap(&series, late, Edge::Offset).unwrap(), 60);
    }

    #[test]
    fn test_out_of_range_is_rejected_not_clamped() {
        let (series, classification) = classified(&[(Sleep, 60)]);
        let rules = BoundaryRuleConfig::default();
        for ts in [at(21, 59), at(23, 1)] {
            let result =
                PeriodBoundaryResolver::resolve(&series, &classification, ts, Edge::Offset, &rules);
            assert!(matches!(result, Err(ComputeError::OutOfRangeBoundary { .. })));
        }
    }

    #[test]
    fn test_onset_moves_to_first_sleep_run() {
        let (series, classification) =
            classified(&[(Wake, 2), (Sleep, 1), (Wake, 1), (Sleep, 2), (Wake, 1), (Sleep, 10)]);
        let resolved = PeriodBoundaryResolver::resolve(
            &series,
            &classification,
            at(22, 0),
            Edge::Onset,
            &BoundaryRuleConfig::default(),
        )
        .unwrap();
        assert_eq!(resolved.epoch_index, 7);
        assert_eq!(resolved.timestamp, at(22, 7));
        assert!(resolved.confirmed);
    }

    #[test]
    fn test_offset_moves_to_start_of_wake_run() {
        // Sleep 0..10, short wake 10..12, sleep 12..15, long wake 15..25
        let (series, classification) =
            classified(&[(Sleep, 10), (Wake, 2), (Sleep, 3), (Wake, 10)]);
        let resolved = PeriodBoundaryResolver::resolve(
            &series,
            &classification,
            at(22, 20),
            Edge::Offset,
            &BoundaryRuleConfig::default(),
        )
        .unwrap();
        assert_eq!(resolved.epoch_index, 15);
        assert_eq!(resolved.timestamp, at(22, 15));
        assert!(resolved.confirmed);
    }

    #[test]
    fn test_unconfirmed_when_no_run_exists() {
        let (series, classification) = classified(&[(Wake, 30)]);
        let resolved = PeriodBoundaryResolver::resolve(
            &series,
            &classification,
            at(22, 5),
            Edge::Onset,
            &BoundaryRuleConfig::default(),
        )
        .unwrap();
        assert_eq!(resolved.epoch_index, 5);
        assert!(!resolved.confirmed);
    }

    #[test]
    fn test_rule_disabled_only_snaps() {
        let (series, classification) = classified(&[(Wake, 5), (Sleep, 20)]);
        let rules = BoundaryRuleConfig {
            enabled: false,
            ..BoundaryRuleConfig::default()
        };
        let resolved = PeriodBoundaryResolver::resolve(
            &series,
            &classification,
            at(22, 1),
            Edge::Onset,
            &rules,
        )
        .unwrap();
        assert_eq!(resolved.epoch_index, 1);
        assert!(!resolved.confirmed);
    }

    #[test]
    fn test_pair_rejects_inverted_boundaries() {
        let (series, classification) = classified(&[(Sleep, 60)]);
        let rules = BoundaryRuleConfig::default();
        let result = PeriodBoundaryResolver::resolve_pair(
            &series,
            &classification,
            at(22, 30),
            at(22, 10),
            &rules,
        );
        assert!(matches!(result, Err(ComputeError::Validation(_))));
    }

    #[test]
    fn test_pair_offset_search_stays_after_onset() {
        // Wake run at 3..9 precedes the onset; only the run at 30.. may close the period
        let (series, classification) =
            classified(&[(Sleep, 3), (Wake, 6), (Sleep, 21), (Wake, 10)]);
        let (onset, offset) = PeriodBoundaryResolver::resolve_pair(
            &series,
            &classification,
            at(22, 9),
            at(22, 35),
            &BoundaryRuleConfig::default(),
        )
        .unwrap();
        assert_eq!(onset.epoch_index, 9);
        assert_eq!(offset.epoch_index, 30);
    }

    #[test]
    fn test_pair_onset_search_stays_before_offset() {
        // Nap placed in a wake stretch must not jump to the night's sleep
        let (series, classification) = classified(&[(Wake, 40), (Sleep, 20)]);
        let (onset, offset) = PeriodBoundaryResolver::resolve_pair(
            &series,
            &classification,
            at(22, 5),
            at(22, 20),
            &BoundaryRuleConfig::default(),
        )
        .unwrap();
        assert_eq!((onset.epoch_index, onset.confirmed), (5, false));
        assert_eq!((offset.epoch_index, offset.confirmed), (20, false));
    }

    #[test]
    fn test_snap_into_gap_is_incomplete() {
        let mut epochs = series_from_counts(at(22, 0), &[0.0; 10]).epochs().to_vec();
        epochs.push(Epoch {
            timestamp: at(22, 30),
            ..epochs[0]
        });
        let series = EpochSeries::new(60, epochs).unwrap();
        let result = PeriodBoundaryResolver::snap(&series, at(22, 20), Edge::Onset);
        assert!(matches!(result, Err(ComputeError::IncompleteData(_))));
        // Closing edge right after the last epoch before the gap is fine
        assert_eq!(
            PeriodBoundaryResolver::snap(&series, at(22, 10), Edge::Offset).unwrap(),
            10
        );
    }
}
