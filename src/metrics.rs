//! Sleep-quality metrics for one complete sleep period
//!
//! Follows the Tudor-Locke definitions. The metrics window is the half-open
//! epoch range `[onset, offset)` and must be covered by contiguous epochs.

use log::debug;

use crate::config::EngineConfig;
use crate::error::ComputeError;
use crate::types::{
    ClassificationResult, EpochSeries, MetricsBasis, SleepMetrics, SleepPeriod, SleepState,
};

/// Computes [`SleepMetrics`] from classified epochs
pub struct MetricsEngine;

impl MetricsEngine {
    pub fn compute(
        period: &SleepPeriod,
        classification: &ClassificationResult,
        series: &EpochSeries,
        config: &EngineConfig,
    ) -> Result<SleepMetrics, ComputeError> {
        let (onset, offset) = match (period.onset, period.offset) {
            (Some(onset), Some(offset)) => (onset, offset),
            _ => {
                return Err(ComputeError::IncompleteData(format!(
                    "sleep period {} has no onset or offset",
                    period.id
                )))
            }
        };
        if offset <= onset {
            return Err(ComputeError::Validation(format!(
                "offset {offset} must be after onset {onset}"
            )));
        }
        if classification.len() != series.len() {
            return Err(ComputeError::Validation(format!(
                "classification covers {} epochs but series has {}",
                classification.len(),
                series.len()
            )));
        }

        let epochs = series.epochs();
        let not_covered = || {
            ComputeError::IncompleteData(format!(
                "{onset} to {offset} is not covered by contiguous epochs"
            ))
        };
        let start = series.index_of(onset).ok_or_else(not_covered)?;
        let end = epochs.partition_point(|e| e.timestamp < offset);
        if end <= start
            || epochs[end - 1].timestamp + series.epoch_duration() != offset
            || !series.is_contiguous(start, end)
        {
            return Err(not_covered());
        }

        let dur = series.epoch_minutes();
        let window = &classification.states[start..end];
        let counts: Vec<f64> = epochs[start..end]
            .iter()
            .map(|e| e.count(config.movement_channel))
            .collect();

        let epochs_in_bed = window.len();
        let time_in_bed = epochs_in_bed as f64 * dur;
        let sleep_epochs = window.iter().filter(|s| **s == SleepState::Sleep).count();

        let first_sleep = window.iter().position(|s| *s == SleepState::Sleep);
        let last_sleep = window.iter().rposition(|s| *s == SleepState::Sleep);
        let (latency, waso_epochs, awakenings) = match (first_sleep, last_sleep) {
            (Some(first), Some(last)) => {
                let between = &window[first..=last];
                let wake = between.iter().filter(|s| **s == SleepState::Wake).count();
                let awakenings = run_lengths(between, SleepState::Wake).len();
                (first as f64 * dur, wake, awakenings)
            }
            _ => (time_in_bed, 0, 0),
        };

        let waso = waso_epochs as f64 * dur;
        let average_awakening = if awakenings > 0 {
            waso / awakenings as f64
        } else {
            0.0
        };

        let sleep_runs = run_lengths(window, SleepState::Sleep);
        let fragmentation_index = if sleep_runs.is_empty() {
            0.0
        } else {
            let single = sleep_runs.iter().filter(|len| **len == 1).count();
            single as f64 / sleep_runs.len() as f64 * 100.0
        };

        let nonzero_epochs = counts.iter().filter(|c| **c > 0.0).count();
        let movement_index = nonzero_epochs as f64 / epochs_in_bed as f64 * 100.0;
        let total_sleep_time = sleep_epochs as f64 * dur;

        let metrics = SleepMetrics {
            onset,
            offset,
            basis: MetricsBasis::new(classification, config.movement_channel),
            time_in_bed_minutes: time_in_bed,
            total_sleep_time_minutes: total_sleep_time,
            sleep_onset_latency_minutes: latency,
            waso_minutes: waso,
            number_of_awakenings: awakenings as u32,
            average_awakening_length_minutes: average_awakening,
            sleep_efficiency: total_sleep_time / time_in_bed * 100.0,
            movement_index,
            fragmentation_index,
            sleep_fragmentation_index: movement_index + fragmentation_index,
            total_activity: counts.iter().sum(),
            nonzero_epochs: nonzero_epochs as u32,
        };

        debug!(
            "metrics for {}: tib={} tst={} waso={} awakenings={}",
            period.id,
            metrics.time_in_bed_minutes,
            metrics.total_sleep_time_minutes,
            metrics.waso_minutes,
            metrics.number_of_awakenings
        );
        Ok(metrics)
    }
}

/// Lengths of the maximal runs of `target` in `states`
fn run_lengths(states: &[SleepState], target: SleepState) -> Vec<usize> {
    let mut runs = Vec::new();
    let mut current = 0;
    for state in states {
        if *state == target {
            current += 1;
        } else if current > 0 {
            runs.push(current);
            current = 0;
        }
    }
    if current > 0 {
        runs.push(current);
    }
    runs
}
