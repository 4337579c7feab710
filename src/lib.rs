//! actisleep - Sleep-period detection and sleep-quality metrics for actigraphy
//!
//! actisleep scores per-epoch activity counts as sleep or wake, detects periods
//! where the device was not worn, and turns edited period boundaries into
//! validated sleep and nonwear periods with standard sleep-quality metrics.
//!
//! ## Stages
//!
//! - **Classification**: Sadeh and Cole-Kripke, original and ActiLife-scaled
//! - **Nonwear**: Choi-style zero-run detection with spike tolerance
//! - **Boundaries**: epoch snapping and the consecutive-epoch onset/offset rule
//! - **Periods**: identity-stable storage with deterministic main-sleep selection
//! - **Metrics and export**: Tudor-Locke metrics, rows keyed by stable id

pub mod boundary;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod diary;
pub mod error;
pub mod export;
pub mod metrics;
pub mod nonwear;
pub mod persistence;
pub mod pipeline;
pub mod store;
pub mod types;

pub use boundary::{PeriodBoundaryResolver, ResolvedBoundary};
pub use cache::AnalysisCache;
pub use classifier::EpochClassifier;
pub use config::{AlgorithmConfig, AlgorithmId, BoundaryRuleConfig, EngineConfig, NonwearConfig};
pub use diary::{parse_diary, DiaryEntry, DiaryImport};
pub use error::ComputeError;
pub use export::{ColumnSet, ExportColumn, ExportProjection, ExportRow, ProjectionWarning};
pub use metrics::MetricsEngine;
pub use nonwear::{mask_to_regions, regions_to_mask, EpochRegion, NonwearDetector};
pub use persistence::{EpochProvider, PersistedDay, PersistedRow, RowStore};
pub use pipeline::{BatchExport, BulkImport, DayImport, DaySession, FailedUnit, SleepEngine};
pub use store::PeriodStore;
pub use types::{Epoch, EpochSeries, MetricsBasis, Period, SleepKind, SleepMetrics, StableId};

/// actisleep version
pub const ACTISLEEP_VERSION: &str = env!("CARGO_PKG_VERSION");
