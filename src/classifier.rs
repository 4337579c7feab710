//! Sleep/wake epoch classification
//!
//! Implements the two published actigraphy scoring families:
//! - Sadeh (1994): 11-epoch centred window, logistic-style score
//! - Cole-Kripke (1992): weighted sum over 4 preceding and 2 following epochs
//!
//! Each comes in its original form and the ActiLife-scaled form. Windows that
//! reach past either end of the series read the missing epochs as zero counts.

use log::{debug, warn};

use crate::config::{AlgorithmConfig, AlgorithmId};
use crate::types::{ClassificationResult, EpochSeries, SleepState};

/// Epoch length the published coefficients were validated on
const VALIDATED_EPOCH_SECONDS: u32 = 60;

/// ActiLife caps counts at this value before scoring
const ACTILIFE_COUNT_CAP: f64 = 300.0;

const SADEH_HALF_WINDOW: i64 = 5;
const SADEH_SD_WINDOW: i64 = 6;
const SADEH_NATS_RANGE: (f64, f64) = (50.0, 100.0);

/// (offset from current epoch, weight) for the original one-minute model
const COLE_KRIPKE_WEIGHTS: [(i64, f64); 7] = [
    (-4, 404.0),
    (-3, 598.0),
    (-2, 326.0),
    (-1, 441.0),
    (0, 1408.0),
    (1, 508.0),
    (2, 350.0),
];
const COLE_KRIPKE_SCALE: f64 = 0.00001;

const COLE_KRIPKE_ACTILIFE_WEIGHTS: [(i64, f64); 7] = [
    (-4, 106.0),
    (-3, 54.0),
    (-2, 58.0),
    (-1, 76.0),
    (0, 230.0),
    (1, 74.0),
    (2, 67.0),
];
const COLE_KRIPKE_ACTILIFE_SCALE: f64 = 0.001;

/// Scores every epoch of a series as sleep or wake
pub struct EpochClassifier;

impl EpochClassifier {
    /// Classify a series with the configured algorithm and channel
    pub fn score(series: &EpochSeries, config: &AlgorithmConfig) -> ClassificationResult {
        if series.epoch_duration_seconds() != VALIDATED_EPOCH_SECONDS {
            warn!(
                "{} is validated on {}s epochs; scoring {}s epochs as-is",
                config.algorithm.as_str(),
                VALIDATED_EPOCH_SECONDS,
                series.epoch_duration_seconds()
            );
        }

        let counts = prepare_counts(series.counts(config.channel), config.algorithm);
        let states = (0..counts.len())
            .map(|i| {
                let asleep = match config.algorithm {
                    AlgorithmId::Sadeh => sadeh_score(&counts, i) >= 0.0,
                    AlgorithmId::SadehActiLife => sadeh_score(&counts, i) > -4.0,
                    AlgorithmId::ColeKripke => {
                        cole_kripke_score(&counts, i, &COLE_KRIPKE_WEIGHTS, COLE_KRIPKE_SCALE)
                            < 1.0
                    }
                    AlgorithmId::ColeKripkeActiLife => {
                        cole_kripke_score(
                            &counts,
                            i,
                            &COLE_KRIPKE_ACTILIFE_WEIGHTS,
                            COLE_KRIPKE_ACTILIFE_SCALE,
                        ) < 1.0
                    }
                };
                if asleep {
                    SleepState::Sleep
                } else {
                    SleepState::Wake
                }
            })
            .collect::<Vec<_>>();

        debug!(
            "scored {} epochs with {} ({} sleep)",
            states.len(),
            config.algorithm.as_str(),
            states.iter().filter(|s| **s == SleepState::Sleep).count()
        );

        ClassificationResult {
            algorithm: config.algorithm,
            channel: config.channel,
            epoch_duration_seconds: series.epoch_duration_seconds(),
            states,
        }
    }
}

/// Apply the per-variant count scaling; inputs are already sanitized
fn prepare_counts(counts: Vec<f64>, algorithm: AlgorithmId) -> Vec<f64> {
    match algorithm {
        AlgorithmId::Sadeh | AlgorithmId::ColeKripke => counts,
        AlgorithmId::SadehActiLife => counts
            .into_iter()
            .map(|c| c.min(ACTILIFE_COUNT_CAP))
            .collect(),
        AlgorithmId::ColeKripkeActiLife => counts
            .into_iter()
            .map(|c| (c / 100.0).min(ACTILIFE_COUNT_CAP))
            .collect(),
    }
}

/// Count at `idx + offset`, zero outside the series
fn count_at(counts: &[f64], idx: usize, offset: i64) -> f64 {
    let pos = idx as i64 + offset;
    if pos < 0 {
        return 0.0;
    }
    counts.get(pos as usize).copied().unwrap_or(0.0)
}

/// Sadeh probability-of-sleep score
///
/// `PS = 7.601 - 0.065*AVG - 1.08*NATS - 0.056*SD - 0.703*LG`
pub(crate) fn sadeh_score(counts: &[f64], idx: usize) -> f64 {
    let window_len = (2 * SADEH_HALF_WINDOW + 1) as f64;
    let mut sum = 0.0;
    let mut nats = 0u32;
    for offset in -SADEH_HALF_WINDOW..=SADEH_HALF_WINDOW {
        let c = count_at(counts, idx, offset);
        sum += c;
        if c >= SADEH_NATS_RANGE.0 && c < SADEH_NATS_RANGE.1 {
            nats += 1;
        }
    }
    let avg = sum / window_len;

    // Sample standard deviation over the current and five preceding epochs
    let sd_values: Vec<f64> = (1 - SADEH_SD_WINDOW..=0)
        .map(|offset| count_at(counts, idx, offset))
        .collect();
    let sd_mean = sd_values.iter().sum::<f64>() / SADEH_SD_WINDOW as f64;
    let variance = sd_values
        .iter()
        .map(|v| (v - sd_mean).powi(2))
        .sum::<f64>()
        / (SADEH_SD_WINDOW - 1) as f64;
    let sd = variance.sqrt();

    let lg = (count_at(counts, idx, 0) + 1.0).ln();

    7.601 - 0.065 * avg - 1.08 * f64::from(nats) - 0.056 * sd - 0.703 * lg
}

/// Cole-Kripke activity index `D`; the epoch is sleep when `D < 1`
pub(crate) fn cole_kripke_score(
    counts: &[f64],
    idx: usize,
    weights: &[(i64, f64)],
    scale: f64,
) -> f64 {
    scale
        * weights
            .iter()
            .map(|&(offset, w)| w * count_at(counts, idx, offset))
            .sum::<f64>()
}
