//! Nonwear detection
//!
//! A run of near-zero epochs lasting at least the configured minimum (90 minutes
//! by default) is flagged as nonwear. Short spikes of activity inside the run are
//! tolerated when they are no longer than the spike tolerance and are surrounded
//! by a full window of zeros on both sides.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::NonwearConfig;
use crate::types::{EpochSeries, WearState};

/// Contiguous run of epochs, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRegion {
    pub start_idx: usize,
    pub end_idx: usize,
}

impl EpochRegion {
    pub fn epoch_count(&self) -> usize {
        (self.end_idx + 1).saturating_sub(self.start_idx)
    }
}

/// Flags device-not-worn epochs
pub struct NonwearDetector;

impl NonwearDetector {
    /// Compute the wear/nonwear mask for a series
    pub fn detect(series: &EpochSeries, config: &NonwearConfig) -> Vec<WearState> {
        let counts = series.counts(config.channel);
        let min_len = series.minutes_to_epochs(config.min_duration_minutes);
        let tolerance = series.minutes_to_epochs(config.spike_tolerance_minutes);
        let spike_window = series.minutes_to_epochs(config.spike_window_minutes);

        let is_zero = |i: usize| counts[i] <= config.zero_threshold;
        // Epoch `j` directly follows `j - 1`; a coverage gap ends any run
        let follows = |j: usize| series.is_contiguous(j - 1, j + 1);
        let mut mask = vec![WearState::Wear; counts.len()];

        let mut i = 0;
        while i < counts.len() {
            if !is_zero(i) {
                i += 1;
                continue;
            }

            let start = i;
            let mut end;
            let mut j = i;
            loop {
                while j < counts.len() && is_zero(j) && (j == start || follows(j)) {
                    j += 1;
                }
                end = j - 1;
                if j >= counts.len() || !follows(j) {
                    break;
                }

                // j begins a spike; measure it
                let spike_start = j;
                while j < counts.len() && !is_zero(j) {
                    j += 1;
                }
                let spike_end = j - 1;
                let spike_len = spike_end - spike_start + 1;

                let within_tolerance = spike_len <= tolerance;
                let within_magnitude = config.spike_max_count.map_or(true, |max| {
                    counts[spike_start..=spike_end].iter().all(|c| *c <= max)
                });
                let upstream_clear = spike_start >= start + spike_window
                    && (spike_start - spike_window..spike_start).all(is_zero);
                let downstream_clear = spike_end + spike_window < counts.len()
                    && series.is_contiguous(start, spike_end + spike_window + 1)
                    && (spike_end + 1..=spike_end + spike_window).all(is_zero);

                if !(within_tolerance && within_magnitude && upstream_clear && downstream_clear) {
                    break;
                }
            }

            if end + 1 - start >= min_len {
                for state in &mut mask[start..=end] {
                    *state = WearState::Nonwear;
                }
            }
            i = end + 1;
        }

        debug!(
            "nonwear: {} of {} epochs flagged",
            mask.iter().filter(|m| **m == WearState::Nonwear).count(),
            mask.len()
        );
        mask
    }

    /// Detected nonwear runs as `(start, end)` timestamps.
    ///
    /// `end` is the end of the last flagged epoch.
    pub fn detect_periods(
        series: &EpochSeries,
        config: &NonwearConfig,
    ) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let mask = Self::detect(series, config);
        let epochs = series.epochs();
        mask_to_regions(&mask)
            .into_iter()
            .map(|r| {
                (
                    epochs[r.start_idx].timestamp,
                    epochs[r.end_idx].timestamp + series.epoch_duration(),
                )
            })
            .collect()
    }
}

/// Collapse a mask into its maximal nonwear runs
pub fn mask_to_regions(mask: &[WearState]) -> Vec<EpochRegion> {
    let mut regions = Vec::new();
    let mut open: Option<usize> = None;

    for (i, state) in mask.iter().enumerate() {
        match (state, open) {
            (WearState::Nonwear, None) => open = Some(i),
            (WearState::Wear, Some(start)) => {
                regions.push(EpochRegion {
                    start_idx: start,
                    end_idx: i - 1,
                });
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        regions.push(EpochRegion {
            start_idx: start,
            end_idx: mask.len() - 1,
        });
    }

    regions
}

/// Expand regions into a mask of length `len`.
///
/// Indices past `len` and inverted regions are ignored.
pub fn regions_to_mask(regions: &[EpochRegion], len: usize) -> Vec<WearState> {
    let mut mask = vec![WearState::Wear; len];
    for region in regions {
        if region.start_idx >= len || region.end_idx < region.start_idx {
            continue;
        }
        let end = region.end_idx.min(len - 1);
        for state in &mut mask[region.start_idx..=end] {
            *state = WearState::Nonwear;
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::{at, series_from_counts};
    use pretty_assertions::assert_eq;

    fn padded(zero_run: usize) -> Vec<f64> {
        let mut counts = vec![25.0; 10];
        counts.extend(std::iter::repeat(0.0).take(zero_run));
        counts.extend(std::iter::repeat(25.0).take(10));
        counts
    }

    fn nonwear_count(mask: &[WearState]) -> usize {
        mask.iter().filter(|m| **m == WearState::Nonwear).count()
    }

    #[test]
    fn test_89_zero_epochs_is_wear() {
        let series = series_from_counts(at(8, 0), &padded(89));
        let mask = NonwearDetector::detect(&series, &NonwearConfig::default());
        assert_eq!(nonwear_count(&mask), 0);
    }

    #[test]
    fn test_90_zero_epochs_is_nonwear() {
        let series = series_from_counts(at(8, 0), &padded(90));
        let mask = NonwearDetector::detect(&series, &NonwearConfig::default());
        assert_eq!(nonwear_count(&mask), 90);
        assert_eq!(
            mask_to_regions(&mask),
            vec![EpochRegion {
                start_idx: 10,
                end_idx: 99
            }]
        );
    }

    #[test]
    fn test_tolerated_spike_does_not_break_run() {
        // 45 zeros, 2-epoch spike, 45 zeros: 92 epochs in one run
        let mut counts = vec![25.0; 5];
        counts.extend(vec![0.0; 45]);
        counts.extend(vec![40.0, 40.0]);
        counts.extend(vec![0.0; 45]);
        counts.extend(vec![25.0; 5]);
        let series = series_from_counts(at(8, 0), &counts);

        let mask = NonwearDetector::detect(&series, &NonwearConfig::default());
        assert_eq!(
            mask_to_regions(&mask),
            vec![EpochRegion {
                start_idx: 5,
                end_idx: 96
            }]
        );
    }

    #[test]
    fn test_long_spike_breaks_run() {
        let mut counts = vec![0.0; 60];
        counts.extend(vec![40.0; 3]);
        counts.extend(vec![0.0; 60]);
        let series = series_from_counts(at(8, 0), &counts);

        let mask = NonwearDetector::detect(&series, &NonwearConfig::default());
        assert_eq!(nonwear_count(&mask), 0);
    }

    #[test]
    fn test_spike_without_clear_upstream_breaks_run() {
        // Only 20 zeros before the spike: upstream window of 30 is not clear
        let mut counts = vec![0.0; 20];
        counts.push(40.0);
        counts.extend(vec![0.0; 80]);
        let series = series_from_counts(at(8, 0), &counts);

        let mask = NonwearDetector::detect(&series, &NonwearConfig::default());
        assert_eq!(nonwear_count(&mask), 0);
    }

    #[test]
    fn test_spike_magnitude_limit() {
        let mut counts = vec![0.0; 45];
        counts.push(500.0);
        counts.extend(vec![0.0; 45]);
        let series = series_from_counts(at(8, 0), &counts);

        let lenient = NonwearDetector::detect(&series, &NonwearConfig::default());
        assert_eq!(nonwear_count(&lenient), 91);

        let strict = NonwearConfig {
            spike_max_count: Some(100.0),
            ..NonwearConfig::default()
        };
        let mask = NonwearDetector::detect(&series, &strict);
        assert_eq!(nonwear_count(&mask), 0);
    }

    #[test]
    fn test_coverage_gap_splits_zero_run() {
        // 60 zeros, 30 missing minutes, 60 zeros
        let mut epochs = series_from_counts(at(8, 0), &padded(60)[..70])
            .epochs()
            .to_vec();
        let after_gap = series_from_counts(at(9, 40), &[vec![0.0; 60], vec![25.0; 10]].concat());
        epochs.extend_from_slice(after_gap.epochs());
        let series = EpochSeries::new(60, epochs).unwrap();

        let mask = NonwearDetector::detect(&series, &NonwearConfig::default());
        assert_eq!(nonwear_count(&mask), 0);
    }

    #[test]
    fn test_near_zero_threshold() {
        let series = series_from_counts(at(8, 0), &vec![3.0; 95]);
        let config = NonwearConfig {
            zero_threshold: 5.0,
            ..NonwearConfig::default()
        };
        assert_eq!(nonwear_count(&NonwearDetector::detect(&series, &config)), 95);
    }

    #[test]
    fn test_detect_is_deterministic() {
        let counts: Vec<f64> = (0..400)
            .map(|i| if (i / 100) % 2 == 0 { 0.0 } else { (i % 7) as f64 })
            .collect();
        let series = series_from_counts(at(0, 0), &counts);
        let config = NonwearConfig::default();
        assert_eq!(
            NonwearDetector::detect(&series, &config),
            NonwearDetector::detect(&series, &config)
        );
    }

    #[test]
    fn test_detect_periods_timestamps() {
        let series = series_from_counts(at(8, 0), &padded(90));
        let periods = NonwearDetector::detect_periods(&series, &NonwearConfig::default());
        assert_eq!(periods, vec![(at(8, 10), at(9, 40))]);
    }

    #[test]
    fn test_region_mask_round_trip() {
        let regions = vec![
            EpochRegion {
                start_idx: 0,
                end_idx: 0,
            },
            EpochRegion {
                start_idx: 3,
                end_idx: 7,
            },
            EpochRegion {
                start_idx: 9,
                end_idx: 11,
            },
        ];
        let mask = regions_to_mask(&regions, 12);
        assert_eq!(mask_to_regions(&mask), regions);
    }

    #[test]
    fn test_inverted_region_ignored() {
        let regions = vec![
            EpochRegion {
                start_idx: 5,
                end_idx: 2,
            },
            EpochRegion {
                start_idx: 1,
                end_idx: 1,
            },
        ];
        assert_eq!(regions[0].epoch_count(), 0);
        assert_eq!(
            mask_to_regions(&regions_to_mask(&regions, 8)),
            vec![regions[1]]
        );
    }

    #[test]
    fn test_mask_region_round_trip() {
        use WearState::{Nonwear as N, Wear as W};
        let mask = vec![N, N, W, W, N, W, N, N, N];
        let regions = mask_to_regions(&mask);
        assert_eq!(regions_to_mask(&regions, mask.len()), mask);
        assert!(mask_to_regions(&[]).is_empty());
    }
}
