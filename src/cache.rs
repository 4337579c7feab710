//! Per-run analysis cache
//!
//! Owned by one batch run and dropped with it. Epoch windows are keyed by file
//! and the full analysis window; classifications additionally by epoch duration
//! and algorithm fingerprint.

use log::debug;
use std::collections::HashMap;

use crate::classifier::EpochClassifier;
use crate::config::AlgorithmConfig;
use crate::error::ComputeError;
use crate::persistence::EpochProvider;
use crate::types::{AnalysisWindow, ClassificationResult, EpochSeries};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClassificationKey {
    file_id: String,
    window: AnalysisWindow,
    epoch_duration_seconds: u32,
    fingerprint: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub window_hits: usize,
    pub window_misses: usize,
    pub classification_hits: usize,
    pub classification_misses: usize,
}

#[derive(Debug, Default)]
pub struct AnalysisCache {
    windows: HashMap<(String, AnalysisWindow), EpochSeries>,
    classifications: HashMap<ClassificationKey, ClassificationResult>,
    stats: CacheStats,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Epochs for `file_id` over the whole `window`, loaded at most once per run
    pub fn epochs(
        &mut self,
        provider: &dyn EpochProvider,
        file_id: &str,
        window: &AnalysisWindow,
    ) -> Result<EpochSeries, ComputeError> {
        let key = (file_id.to_string(), *window);
        if let Some(series) = self.windows.get(&key) {
            self.stats.window_hits += 1;
            return Ok(series.clone());
        }

        self.stats.window_misses += 1;
        // Providers may hand back more than asked for; keep exactly the window
        let series = provider.load(file_id, window)?.restricted_to(window);
        debug!(
            "cached {} epochs for {} from {} to {}",
            series.len(),
            file_id,
            window.start,
            window.end
        );
        self.windows.insert(key, series.clone());
        Ok(series)
    }

    /// Classification of `series`, scored at most once per key
    pub fn classification(
        &mut self,
        file_id: &str,
        window: &AnalysisWindow,
        series: &EpochSeries,
        config: &AlgorithmConfig,
    ) -> ClassificationResult {
        let key = ClassificationKey {
            file_id: file_id.to_string(),
            window: *window,
            epoch_duration_seconds: series.epoch_duration_seconds(),
            fingerprint: config.fingerprint(),
        };
        if let Some(result) = self.classifications.get(&key) {
            self.stats.classification_hits += 1;
            return result.clone();
        }

        self.stats.classification_misses += 1;
        let result = EpochClassifier::score(series, config);
        self.classifications.insert(key, result.clone());
        result
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlgorithmId;
    use crate::persistence::MemoryEpochProvider;
    use crate::types::fixtures::{at, series_from_counts};
    use crate::types::ActivityChannel;
    use chrono::{Duration, NaiveDate};
    use pretty_assertions::assert_eq;

    fn provider() -> MemoryEpochProvider {
        // Two full days of data from noon on the 15th
        let counts: Vec<f64> = (0..2880).map(|i| (i % 5) as f64 * 20.0).collect();
        MemoryEpochProvider::new()
            .with_series("a", series_from_counts(at(12, 0), &counts))
            .with_series("b", series_from_counts(at(12, 0), &counts))
    }

    fn window(day: u32) -> AnalysisWindow {
        AnalysisWindow::for_date(NaiveDate::from_ymd_opt(2024, 1, day).unwrap(), 12).unwrap()
    }

    #[test]
    fn test_window_loaded_once_and_complete() {
        let provider = provider();
        let mut cache = AnalysisCache::new();

        let first = cache.epochs(&provider, "a", &window(15)).unwrap();
        let second = cache.epochs(&provider, "a", &window(15)).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 1440);
        assert_eq!(first.end_timestamp(), Some(at(12, 0) + Duration::hours(24)));
        assert_eq!(provider.load_count(), 1);
    }

    #[test]
    fn test_windows_keyed_by_file_and_range() {
        let provider = provider();
        let mut cache = AnalysisCache::new();

        cache.epochs(&provider, "a", &window(15)).unwrap();
        let next_day = cache.epochs(&provider, "a", &window(16)).unwrap();
        cache.epochs(&provider, "b", &window(15)).unwrap();

        assert_eq!(provider.load_count(), 3);
        assert_eq!(next_day.first_timestamp(), Some(at(12, 0) + Duration::hours(24)));
        assert_eq!(
            cache.stats(),
            CacheStats {
                window_hits: 0,
                window_misses: 3,
                classification_hits: 0,
                classification_misses: 0,
            }
        );
    }

    #[test]
    fn test_classification_keyed_by_fingerprint() {
        let provider = provider();
        let mut cache = AnalysisCache::new();
        let w = window(15);
        let series = cache.epochs(&provider, "a", &w).unwrap();

        let y = AlgorithmConfig::default();
        let vm = AlgorithmConfig {
            channel: ActivityChannel::VectorMagnitude,
            ..AlgorithmConfig::default()
        };
        let ck = AlgorithmConfig {
            algorithm: AlgorithmId::ColeKripke,
            ..AlgorithmConfig::default()
        };

        cache.classification("a", &w, &series, &y);
        cache.classification("a", &w, &series, &y);
        cache.classification("a", &w, &series, &vm);
        let scored = cache.classification("a", &w, &series, &ck);

        assert_eq!(scored.algorithm, AlgorithmId::ColeKripke);
        assert_eq!(cache.stats().classification_hits, 1);
        assert_eq!(cache.stats().classification_misses, 3);
    }
}
