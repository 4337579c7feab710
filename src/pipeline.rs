//! Pipeline orchestration
//!
//! This module provides the public API for actisleep. A [`DaySession`] owns the
//! state for one file+date: its epochs, classification and periods. The
//! [`SleepEngine`] opens sessions through an [`EpochProvider`] and [`RowStore`]
//! and runs batch exports.

use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::boundary::PeriodBoundaryResolver;
use crate::cache::AnalysisCache;
use crate::classifier::EpochClassifier;
use crate::config::EngineConfig;
use crate::diary::{DiaryEntry, DiaryImport};
use crate::error::ComputeError;
use crate::export::{ColumnSet, ExportProjection, ExportRow, Projection, ProjectionWarning};
use crate::metrics::MetricsEngine;
use crate::nonwear::NonwearDetector;
use crate::persistence::{EpochProvider, PersistedDay, PersistedRow, RowStore};
use crate::store::PeriodStore;
use crate::types::{
    AnalysisWindow, BoundaryEdit, ClassificationResult, DateRange, Edge, EditTarget,
    EpochSeries, MetricsBasis, NonwearPeriod, NonwearSource, Period, PeriodPatch, SleepMetrics,
    StableId, WearState,
};

/// Editing state for one file+date.
///
/// A session has a single owner; mutations go through `&mut self`.
#[derive(Debug, Clone)]
pub struct DaySession {
    config: EngineConfig,
    window: AnalysisWindow,
    series: EpochSeries,
    classification: ClassificationResult,
    store: PeriodStore,
}

impl DaySession {
    /// Create an empty session from already loaded epochs and their classification
    pub fn new(
        file_id: impl Into<String>,
        date: NaiveDate,
        series: EpochSeries,
        classification: ClassificationResult,
        config: EngineConfig,
    ) -> Result<Self, ComputeError> {
        config.validate()?;
        if classification.len() != series.len()
            || classification.epoch_duration_seconds != series.epoch_duration_seconds()
        {
            return Err(ComputeError::Validation(format!(
                "classification ({} epochs of {}s) does not match series ({} epochs of {}s)",
                classification.len(),
                classification.epoch_duration_seconds,
                series.len(),
                series.epoch_duration_seconds()
            )));
        }

        let window = AnalysisWindow::for_date(date, config.day_start_hour)?;
        let basis = MetricsBasis::new(&classification, config.movement_channel);
        Ok(Self {
            store: PeriodStore::new(file_id, date, basis),
            config,
            window,
            series,
            classification,
        })
    }

    /// Score `series` with the configured algorithm and create a session
    pub fn from_series(
        file_id: impl Into<String>,
        date: NaiveDate,
        series: EpochSeries,
        config: EngineConfig,
    ) -> Result<Self, ComputeError> {
        let classification = EpochClassifier::score(&series, &config.algorithm);
        Self::new(file_id, date, series, classification, config)
    }

    pub fn file_id(&self) -> &str {
        self.store.file_id()
    }

    pub fn date(&self) -> NaiveDate {
        self.store.date()
    }

    pub fn window(&self) -> &AnalysisWindow {
        &self.window
    }

    pub fn series(&self) -> &EpochSeries {
        &self.series
    }

    pub fn classification(&self) -> &ClassificationResult {
        &self.classification
    }

    pub fn store(&self) -> &PeriodStore {
        &self.store
    }

    /// All periods, complete and incomplete, in canonical order
    pub fn periods(&self) -> Vec<Period> {
        self.store.list_all().into_iter().cloned().collect()
    }

    pub fn nonwear_mask(&self) -> Vec<WearState> {
        NonwearDetector::detect(&self.series, &self.config.nonwear)
    }

    /// Apply one boundary edit and return the id of the affected period.
    ///
    /// On error the session is unchanged.
    pub fn apply_edit(&mut self, edit: &BoundaryEdit) -> Result<StableId, ComputeError> {
        if edit.file_id != self.file_id() || edit.date != self.date() {
            return Err(ComputeError::Validation(format!(
                "edit for {} {} sent to session {} {}",
                edit.file_id,
                edit.date,
                self.file_id(),
                self.date()
            )));
        }
        let timestamp = DateTime::<Utc>::from_timestamp_millis(edit.proposed_timestamp_ms)
            .ok_or_else(|| {
                ComputeError::Validation(format!(
                    "invalid timestamp {}ms",
                    edit.proposed_timestamp_ms
                ))
            })?;

        match edit.target {
            EditTarget::New => {
                let resolved = PeriodBoundaryResolver::resolve(
                    &self.series,
                    &self.classification,
                    timestamp,
                    edit.edge,
                    &self.config.boundary,
                )?;
                let at = Some(resolved.timestamp);
                let period = match edit.edge {
                    Edge::Onset => Period::sleep(at, None),
                    Edge::Offset => Period::sleep(None, at),
                    Edge::Start => Period::nonwear(at, None),
                    Edge::End => Period::nonwear(None, at),
                };
                let id = self.store.add(period)?;
                info!(
                    "{} {}: new period {} from {:?} at {}",
                    self.file_id(),
                    self.date(),
                    id,
                    edit.edge,
                    resolved.timestamp
                );
                Ok(id)
            }
            EditTarget::Existing(id) => {
                let patch = self.patch_for(id, edit.edge, timestamp)?;
                self.store.update(id, patch)?;
                info!(
                    "{} {}: moved {:?} of {} to {:?}",
                    self.file_id(),
                    self.date(),
                    edit.edge,
                    id,
                    patch.begin.or(patch.finish)
                );
                Ok(id)
            }
        }
    }

    fn patch_for(
        &self,
        id: StableId,
        edge: Edge,
        timestamp: DateTime<Utc>,
    ) -> Result<PeriodPatch, ComputeError> {
        let period = self.store.get(id).ok_or(ComputeError::UnknownPeriod(id))?;
        if edge.is_sleep_edge() != period.as_sleep().is_some() {
            return Err(ComputeError::Validation(format!(
                "{edge:?} does not apply to period {id}"
            )));
        }

        let rules = &self.config.boundary;
        let resolved = match (edge, period.begin(), period.finish()) {
            (Edge::Onset, _, Some(offset)) => {
                PeriodBoundaryResolver::resolve_pair(
                    &self.series,
                    &self.classification,
                    timestamp,
                    offset,
                    rules,
                )?
                .0
            }
            (Edge::Offset, Some(onset), _) => {
                PeriodBoundaryResolver::resolve_pair(
                    &self.series,
                    &self.classification,
                    onset,
                    timestamp,
                    rules,
                )?
                .1
            }
            _ => PeriodBoundaryResolver::resolve(
                &self.series,
                &self.classification,
                timestamp,
                edge,
                rules,
            )?,
        };

        Ok(if edge.is_opening() {
            PeriodPatch {
                begin: Some(resolved.timestamp),
                finish: None,
            }
        } else {
            PeriodPatch {
                begin: None,
                finish: Some(resolved.timestamp),
            }
        })
    }

    /// Add a whole period, resolving its boundaries first
    pub fn add_period(&mut self, period: Period) -> Result<StableId, ComputeError> {
        let resolved = self.resolve_period(&period)?;
        self.store.add(resolved)
    }

    fn resolve_period(&self, period: &Period) -> Result<Period, ComputeError> {
        let resolved = match (period, period.begin(), period.finish()) {
            (Period::Sleep(_), Some(onset), Some(offset)) => {
                let (onset, offset) = PeriodBoundaryResolver::resolve_pair(
                    &self.series,
                    &self.classification,
                    onset,
                    offset,
                    &self.config.boundary,
                )?;
                Period::sleep(Some(onset.timestamp), Some(offset.timestamp))
            }
            (Period::Sleep(_), onset, offset) => Period::sleep(
                self.resolve_edge(onset, Edge::Onset)?,
                self.resolve_edge(offset, Edge::Offset)?,
            ),
            (Period::Nonwear(p), start, end) => Period::Nonwear(NonwearPeriod {
                start: self.resolve_edge(start, Edge::Start)?,
                end: self.resolve_edge(end, Edge::End)?,
                ..p.clone()
            }),
        };
        Ok(resolved)
    }

    /// Id of a stored period of the same type with the same boundaries
    fn find_same(&self, period: &Period) -> Option<StableId> {
        self.store
            .list_all()
            .into_iter()
            .find(|p| {
                p.as_sleep().is_some() == period.as_sleep().is_some()
                    && p.begin() == period.begin()
                    && p.finish() == period.finish()
            })
            .map(Period::id)
    }

    fn resolve_edge(
        &self,
        timestamp: Option<DateTime<Utc>>,
        edge: Edge,
    ) -> Result<Option<DateTime<Utc>>, ComputeError> {
        timestamp
            .map(|ts| {
                PeriodBoundaryResolver::resolve(
                    &self.series,
                    &self.classification,
                    ts,
                    edge,
                    &self.config.boundary,
                )
                .map(|r| r.timestamp)
            })
            .transpose()
    }

    pub fn remove_period(&mut self, id: StableId) -> Result<Period, ComputeError> {
        let removed = self.store.remove(id)?;
        info!("{} {}: deleted period {}", self.file_id(), self.date(), id);
        Ok(removed)
    }

    /// Create periods from the diary entries for this file+date.
    ///
    /// Periods that cannot be placed are reported in `skipped` and do not stop the import.
    /// A period whose resolved boundaries are already stored is reported in `existing`.
    pub fn import_diary(&mut self, entries: &[DiaryEntry]) -> DiaryImport {
        let mut import = DiaryImport::default();
        let (file_id, date) = (self.file_id().to_string(), self.date());

        for entry in entries.iter().filter(|e| e.applies_to(&file_id, date)) {
            for period in entry.periods() {
                let added = self.resolve_period(&period).and_then(|resolved| {
                    if let Some(id) = self.find_same(&resolved) {
                        import.existing.push(id);
                        return Ok(None);
                    }
                    self.store.add(resolved).map(Some)
                });
                match added {
                    Ok(Some(id)) => import.created.push(id),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("{file_id} {date}: skipped diary period: {e}");
                        import.skipped.push(format!(
                            "{:?} to {:?}: {}",
                            period.begin(),
                            period.finish(),
                            e
                        ));
                    }
                }
            }
        }

        info!(
            "{} {}: diary import created {} periods, {} already present, skipped {}",
            file_id,
            date,
            import.created.len(),
            import.existing.len(),
            import.skipped.len()
        );
        import
    }

    /// Add a `Detected` nonwear period for each detected run not already recorded
    pub fn import_detected_nonwear(&mut self) -> Result<Vec<StableId>, ComputeError> {
        let detected = NonwearDetector::detect_periods(&self.series, &self.config.nonwear);
        let mut created = Vec::new();

        for (start, end) in detected {
            let known = self
                .store
                .list_complete_nonwear()
                .iter()
                .any(|p| p.start == Some(start) && p.end == Some(end));
            if known {
                continue;
            }
            let id = self.store.add(Period::Nonwear(NonwearPeriod {
                id: StableId(0),
                start: Some(start),
                end: Some(end),
                source: NonwearSource::Detected,
            }))?;
            created.push(id);
        }

        debug!(
            "{} {}: {} detected nonwear periods added",
            self.file_id(),
            self.date(),
            created.len()
        );
        Ok(created)
    }

    /// Metrics for a sleep period, recomputed when its boundaries changed.
    ///
    /// Returns `None` for nonwear and incomplete periods.
    pub fn get_metrics(&mut self, id: StableId) -> Result<Option<SleepMetrics>, ComputeError> {
        let period = self.store.get(id).ok_or(ComputeError::UnknownPeriod(id))?;
        let sleep = match period.as_sleep() {
            Some(sleep) if sleep.is_complete() => sleep.clone(),
            _ => return Ok(None),
        };
        if let Some(metrics) = self.store.metrics(id) {
            return Ok(Some(metrics.clone()));
        }

        let metrics =
            MetricsEngine::compute(&sleep, &self.classification, &self.series, &self.config)?;
        self.store.set_metrics(id, metrics.clone())?;
        Ok(Some(metrics))
    }

    /// Compute metrics for every complete sleep period that lacks them.
    ///
    /// Failures are returned and leave the period without metrics.
    pub fn refresh_metrics(&mut self) -> Vec<(StableId, ComputeError)> {
        let ids: Vec<StableId> = self.store.list_complete(None).iter().map(|p| p.id).collect();
        ids.into_iter()
            .filter_map(|id| self.get_metrics(id).err().map(|e| (id, e)))
            .collect()
    }

    /// Export rows for this day with metrics brought up to date
    pub fn project(&mut self, columns: &ColumnSet) -> Projection {
        for (id, e) in self.refresh_metrics() {
            warn!("{} {}: metrics for {} unavailable: {}", self.file_id(), self.date(), id, e);
        }
        ExportProjection::project(&self.store, columns)
    }

    /// Load persisted periods and metrics into this session.
    ///
    /// Fails when the day was saved with a different epoch duration.
    pub fn restore(&mut self, day: PersistedDay) -> Result<(), ComputeError> {
        if day.epoch_duration_seconds != self.series.epoch_duration_seconds() {
            return Err(ComputeError::EpochDurationMismatch {
                persisted: day.epoch_duration_seconds,
                current: self.series.epoch_duration_seconds(),
            });
        }

        for row in day.rows {
            let id = row.stable_id;
            self.store.restore(row.period)?;
            if let Some(metrics) = row.metrics {
                if let Err(e) = self.store.set_metrics(id, metrics) {
                    debug!("dropping persisted metrics for {id}: {e}");
                }
            }
        }
        self.store.reserve_ids(StableId(day.next_stable_id))?;
        Ok(())
    }

    pub fn to_persisted(&self) -> PersistedDay {
        PersistedDay {
            epoch_duration_seconds: self.series.epoch_duration_seconds(),
            next_stable_id: self.store.next_id().0,
            rows: self
                .store
                .list_all()
                .into_iter()
                .map(|period| PersistedRow {
                    stable_id: period.id(),
                    period: period.clone(),
                    metrics: self.store.metrics(period.id()).cloned(),
                })
                .collect(),
        }
    }

    /// Refresh metrics and write the whole day
    pub fn save(&mut self, rows: &mut dyn RowStore) -> Result<(), ComputeError> {
        for (id, e) in self.refresh_metrics() {
            warn!("{} {}: saving {} without metrics: {}", self.file_id(), self.date(), id, e);
        }
        let day = self.to_persisted();
        let count = day.rows.len();
        rows.write(self.file_id(), self.date(), day)?;
        info!("{} {}: saved {} periods", self.file_id(), self.date(), count);
        Ok(())
    }
}

/// A file+date that could not be exported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub file_id: String,
    pub date: NaiveDate,
    pub error: String,
}

/// Result of one batch export run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchExport {
    pub run_id: Uuid,
    pub rows: Vec<ExportRow>,
    pub warnings: Vec<ProjectionWarning>,
    pub failed_units: Vec<FailedUnit>,
    pub succeeded_units: usize,
}

impl BatchExport {
    pub fn failed_count(&self) -> usize {
        self.failed_units.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_units.is_empty()
    }
}

/// Diary import outcome for one file+date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayImport {
    pub file_id: String,
    pub date: NaiveDate,
    pub diary: DiaryImport,
    pub detected_nonwear: Vec<StableId>,
}

/// Result of importing a diary across many file+dates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkImport {
    pub days: Vec<DayImport>,
    pub failed_units: Vec<FailedUnit>,
}

impl BulkImport {
    pub fn failed_count(&self) -> usize {
        self.failed_units.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_units.is_empty()
    }
}

/// Engine over an epoch source and a row store
pub struct SleepEngine<P, R> {
    provider: P,
    rows: R,
    config: EngineConfig,
}

impl<P: EpochProvider, R: RowStore> SleepEngine<P, R> {
    pub fn new(provider: P, rows: R, config: EngineConfig) -> Result<Self, ComputeError> {
        config.validate()?;
        Ok(Self {
            provider,
            rows,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn rows(&self) -> &R {
        &self.rows
    }

    /// Load epochs, classify and restore any persisted periods for one day
    pub fn open_day(&self, file_id: &str, date: NaiveDate) -> Result<DaySession, ComputeError> {
        let window = AnalysisWindow::for_date(date, self.config.day_start_hour)?;
        let series = self.provider.load(file_id, &window)?.restricted_to(&window);
        let mut session = DaySession::from_series(file_id, date, series, self.config.clone())?;
        self.restore_into(&mut session)?;
        Ok(session)
    }

    fn open_day_cached(
        &self,
        cache: &mut AnalysisCache,
        file_id: &str,
        date: NaiveDate,
    ) -> Result<DaySession, ComputeError> {
        let window = AnalysisWindow::for_date(date, self.config.day_start_hour)?;
        let series = cache.epochs(&self.provider, file_id, &window)?;
        let classification =
            cache.classification(file_id, &window, &series, &self.config.algorithm);
        let mut session =
            DaySession::new(file_id, date, series, classification, self.config.clone())?;
        self.restore_into(&mut session)?;
        Ok(session)
    }

    fn restore_into(&self, session: &mut DaySession) -> Result<(), ComputeError> {
        if let Some(day) = self.rows.read(session.file_id(), session.date())? {
            session.restore(day)?;
        }
        Ok(())
    }

    pub fn save(&mut self, session: &mut DaySession) -> Result<(), ComputeError> {
        session.save(&mut self.rows)
    }

    /// Periods for one day, complete and incomplete
    pub fn get_periods(&self, file_id: &str, date: NaiveDate) -> Result<Vec<Period>, ComputeError> {
        Ok(self.open_day(file_id, date)?.periods())
    }

    pub fn get_metrics(
        &self,
        file_id: &str,
        date: NaiveDate,
        id: StableId,
    ) -> Result<Option<SleepMetrics>, ComputeError> {
        self.open_day(file_id, date)?.get_metrics(id)
    }

    /// Import diary entries into every file+date they name and save each day.
    ///
    /// A day that cannot be opened, imported or saved is recorded in
    /// `failed_units`; the remaining days are still imported.
    pub fn import_diary(&mut self, entries: &[DiaryEntry], detect_nonwear: bool) -> BulkImport {
        let mut units: Vec<(String, NaiveDate)> = entries
            .iter()
            .map(|e| (e.file_id.clone(), e.date))
            .collect();
        units.sort();
        units.dedup();

        let mut import = BulkImport::default();
        for (file_id, date) in units {
            match self.import_day(&file_id, date, entries, detect_nonwear) {
                Ok((diary, detected_nonwear)) => import.days.push(DayImport {
                    file_id,
                    date,
                    diary,
                    detected_nonwear,
                }),
                Err(e) => {
                    warn!("diary import: {} {} failed: {}", file_id, date, e);
                    import.failed_units.push(FailedUnit {
                        file_id,
                        date,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "diary import: {} days saved, {} failed",
            import.days.len(),
            import.failed_count()
        );
        import
    }

    fn import_day(
        &mut self,
        file_id: &str,
        date: NaiveDate,
        entries: &[DiaryEntry],
        detect_nonwear: bool,
    ) -> Result<(DiaryImport, Vec<StableId>), ComputeError> {
        let mut session = self.open_day(file_id, date)?;
        let diary = session.import_diary(entries);
        let detected = if detect_nonwear {
            session.import_detected_nonwear()?
        } else {
            Vec::new()
        };
        self.save(&mut session)?;
        Ok((diary, detected))
    }

    /// Export every file over every date in `range`.
    ///
    /// Each file+date is processed on its own; a failing unit is recorded in
    /// `failed_units` and the run continues.
    pub fn export_rows<S: AsRef<str>>(
        &self,
        file_ids: &[S],
        range: DateRange,
        columns: &ColumnSet,
    ) -> BatchExport {
        let mut cache = AnalysisCache::new();
        let mut export = BatchExport {
            run_id: Uuid::new_v4(),
            rows: Vec::new(),
            warnings: Vec::new(),
            failed_units: Vec::new(),
            succeeded_units: 0,
        };

        for file_id in file_ids {
            let file_id: &str = file_id.as_ref();
            for date in range.days() {
                match self.open_day_cached(&mut cache, file_id, date) {
                    Ok(mut session) => {
                        let projection = session.project(columns);
                        export.rows.extend(projection.rows);
                        export.warnings.extend(projection.warnings);
                        export.succeeded_units += 1;
                    }
                    Err(e) => {
                        warn!("export {}: {} {} failed: {}", export.run_id, file_id, date, e);
                        export.failed_units.push(FailedUnit {
                            file_id: file_id.to_string(),
                            date,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        info!(
            "export {}: {} rows, {} warnings, {} units ok, {} failed",
            export.run_id,
            export.rows.len(),
            export.warnings.len(),
            export.succeeded_units,
            export.failed_count()
        );
        export
    }
}
