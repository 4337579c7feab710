//! Identity-stable period storage for one file+date
//!
//! Periods live in an arena indexed by [`StableId`]. Slots are never compacted,
//! so an id keeps pointing at the same period no matter what is deleted around it.

use chrono::{DateTime, NaiveDate, Utc};
use log::debug;
use std::cmp::Reverse;
use std::collections::HashMap;

use crate::error::ComputeError;
use crate::types::{
    MetricsBasis, NonwearPeriod, Period, PeriodPatch, SleepKind, SleepMetrics, SleepPeriod,
    StableId,
};

/// Upper bound on ids a store hands out or accepts from disk
pub const MAX_STABLE_ID: u32 = 100_000;

#[derive(Debug, Clone)]
pub struct PeriodStore {
    file_id: String,
    date: NaiveDate,
    basis: MetricsBasis,
    /// Slot `i` holds the period with id `i + 1`
    slots: Vec<Option<Period>>,
    metrics: HashMap<StableId, SleepMetrics>,
}

impl PeriodStore {
    pub fn new(file_id: impl Into<String>, date: NaiveDate, basis: MetricsBasis) -> Self {
        Self {
            file_id: file_id.into(),
            date,
            basis,
            slots: Vec::new(),
            metrics: HashMap::new(),
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// Inputs that stored metrics must have been computed from
    pub fn basis(&self) -> &MetricsBasis {
        &self.basis
    }

    /// Switch scoring inputs; metrics computed under the old ones are dropped
    pub fn set_basis(&mut self, basis: MetricsBasis) {
        if basis != self.basis {
            self.basis = basis;
            self.invalidate_all_metrics();
        }
    }

    /// Number of live periods
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id the next `add` will assign
    pub fn next_id(&self) -> StableId {
        StableId(self.slots.len() as u32 + 1)
    }

    /// Make sure ids below `next` are never handed out again
    pub fn reserve_ids(&mut self, next: StableId) -> Result<(), ComputeError> {
        if next.0 > MAX_STABLE_ID + 1 {
            return Err(ComputeError::Validation(format!(
                "next id {next} exceeds the limit of {MAX_STABLE_ID}"
            )));
        }
        let len = (next.0 as usize).saturating_sub(1);
        if len > self.slots.len() {
            self.slots.resize(len, None);
        }
        Ok(())
    }

    /// Insert a new period and assign it the next id
    pub fn add(&mut self, mut period: Period) -> Result<StableId, ComputeError> {
        validate_order(period.begin(), period.finish())?;
        let id = self.next_id();
        if id.0 > MAX_STABLE_ID {
            return Err(ComputeError::Validation(format!(
                "{} {} has used all {MAX_STABLE_ID} period ids",
                self.file_id, self.date
            )));
        }
        period.set_id(id);
        self.slots.push(Some(period));
        self.recompute_kinds();
        debug!("{} {}: added period {}", self.file_id, self.date, id);
        Ok(id)
    }

    /// Re-insert a period under its persisted id
    pub fn restore(&mut self, period: Period) -> Result<(), ComputeError> {
        let id = period.id();
        let idx = slot_index(id)
            .filter(|_| id.0 <= MAX_STABLE_ID)
            .ok_or_else(|| {
                ComputeError::Validation(format!("persisted period has invalid id {id}"))
            })?;
        validate_order(period.begin(), period.finish())?;
        if self.slots.get(idx).is_some_and(Option::is_some) {
            return Err(ComputeError::Validation(format!(
                "duplicate persisted period id {id}"
            )));
        }

        if idx >= self.slots.len() {
            self.slots.resize(idx + 1, None);
        }
        self.slots[idx] = Some(period);
        self.recompute_kinds();
        Ok(())
    }

    pub fn get(&self, id: StableId) -> Option<&Period> {
        slot_index(id).and_then(|idx| self.slots.get(idx)).and_then(Option::as_ref)
    }

    /// Move one or both boundaries of a period.
    ///
    /// The stored period is untouched when the result would be invalid.
    pub fn update(&mut self, id: StableId, patch: PeriodPatch) -> Result<(), ComputeError> {
        let current = self.get(id).ok_or(ComputeError::UnknownPeriod(id))?;
        let mut updated = current.clone();
        match &mut updated {
            Period::Sleep(p) => {
                p.onset = patch.begin.or(p.onset);
                p.offset = patch.finish.or(p.offset);
            }
            Period::Nonwear(p) => {
                p.start = patch.begin.or(p.start);
                p.end = patch.finish.or(p.end);
            }
        }
        validate_order(updated.begin(), updated.finish())?;

        let moved = updated.begin() != current.begin() || updated.finish() != current.finish();
        if let Some(slot) = slot_index(id).and_then(|idx| self.slots.get_mut(idx)) {
            *slot = Some(updated);
        }
        if moved {
            self.metrics.remove(&id);
        }
        self.recompute_kinds();
        Ok(())
    }

    /// Delete a period and its metrics
    pub fn remove(&mut self, id: StableId) -> Result<Period, ComputeError> {
        let removed = slot_index(id)
            .and_then(|idx| self.slots.get_mut(idx))
            .and_then(Option::take)
            .ok_or(ComputeError::UnknownPeriod(id))?;
        self.metrics.remove(&id);
        self.recompute_kinds();
        debug!("{} {}: removed period {}", self.file_id, self.date, id);
        Ok(removed)
    }

    /// Every period in canonical order: by begin, then id, incomplete last
    pub fn list_all(&self) -> Vec<&Period> {
        let mut periods: Vec<&Period> = self.slots.iter().flatten().collect();
        periods.sort_by_key(|p| (!p.is_complete(), p.begin(), p.id()));
        periods
    }

    /// Complete sleep periods in canonical order, optionally of one kind
    pub fn list_complete(&self, kind: Option<SleepKind>) -> Vec<&SleepPeriod> {
        self.list_all()
            .into_iter()
            .filter_map(Period::as_sleep)
            .filter(|p| p.is_complete() && kind.map_or(true, |k| p.kind == k))
            .collect()
    }

    pub fn list_complete_nonwear(&self) -> Vec<&NonwearPeriod> {
        self.list_all()
            .into_iter()
            .filter_map(Period::as_nonwear)
            .filter(|p| p.is_complete())
            .collect()
    }

    pub fn get_main_sleep(&self) -> Option<&SleepPeriod> {
        self.list_complete(Some(SleepKind::MainSleep)).into_iter().next()
    }

    /// Metrics for a period, only while they match its current boundaries
    pub fn metrics(&self, id: StableId) -> Option<&SleepMetrics> {
        let period = self.get(id)?.as_sleep()?;
        let metrics = self.metrics.get(&id)?;
        match (period.onset, period.offset) {
            (Some(onset), Some(offset)) if metrics.matches(onset, offset, &self.basis) => {
                Some(metrics)
            }
            _ => None,
        }
    }

    /// Attach metrics computed for the period's current boundaries
    pub fn set_metrics(&mut self, id: StableId, metrics: SleepMetrics) -> Result<(), ComputeError> {
        let period = self
            .get(id)
            .ok_or(ComputeError::UnknownPeriod(id))?
            .as_sleep()
            .ok_or_else(|| {
                ComputeError::Validation(format!("period {id} is not a sleep period"))
            })?;
        let current = match (period.onset, period.offset) {
            (Some(onset), Some(offset)) => metrics.matches(onset, offset, &self.basis),
            _ => false,
        };
        if !current {
            return Err(ComputeError::Validation(format!(
                "metrics for {id} do not match its current boundaries and inputs"
            )));
        }
        self.metrics.insert(id, metrics);
        Ok(())
    }

    pub fn invalidate_all_metrics(&mut self) {
        self.metrics.clear();
    }

    fn recompute_kinds(&mut self) {
        let main = self
            .slots
            .iter()
            .flatten()
            .filter_map(Period::as_sleep)
            .filter_map(|p| Some((p.duration()?, p.onset?, p.id)))
            .min_by_key(|&(duration, onset, id)| (Reverse(duration), onset, id))
            .map(|(_, _, id)| id);

        for period in self.slots.iter_mut().flatten() {
            if let Period::Sleep(p) = period {
                p.kind = if Some(p.id) == main {
                    SleepKind::MainSleep
                } else {
                    SleepKind::Nap
                };
            }
        }
    }
}

fn slot_index(id: StableId) -> Option<usize> {
    (id.0 as usize).checked_sub(1)
}

fn validate_order(
    begin: Option<DateTime<Utc>>,
    finish: Option<DateTime<Utc>>,
) -> Result<(), ComputeError> {
    match (begin, finish) {
        (Some(begin), Some(finish)) if finish <= begin => Err(ComputeError::Validation(format!(
            "period end {finish} must be after its start {begin}"
        ))),
        _ => Ok(()),
    }
}
