//! Engine configuration
//!
//! All settings deserialize from JSON with per-field defaults, so a config file
//! only needs the values it changes.

use serde::{Deserialize, Serialize};

use crate::error::ComputeError;
use crate::types::ActivityChannel;

/// Default window for the consecutive-sleep onset rule (epochs)
pub const DEFAULT_ONSET_SLEEP_EPOCHS: usize = 3;

/// Default window for the consecutive-wake offset rule (epochs)
pub const DEFAULT_OFFSET_WAKE_EPOCHS: usize = 5;

/// Published minimum nonwear duration (minutes)
pub const DEFAULT_NONWEAR_MIN_MINUTES: u32 = 90;

/// Sleep/wake scoring algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmId {
    /// Sadeh (1994), raw counts, sleep when PS >= 0
    Sadeh,
    /// Sadeh as scaled by ActiLife: counts capped at 300, sleep when PS > -4
    SadehActiLife,
    /// Cole-Kripke (1992) one-minute coefficients on raw counts
    ColeKripke,
    /// Cole-Kripke as scaled by ActiLife: counts / 100 capped at 300
    ColeKripkeActiLife,
}

impl AlgorithmId {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmId::Sadeh => "sadeh",
            AlgorithmId::SadehActiLife => "sadeh_actilife",
            AlgorithmId::ColeKripke => "cole_kripke",
            AlgorithmId::ColeKripkeActiLife => "cole_kripke_actilife",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmConfig {
    pub algorithm: AlgorithmId,
    /// Channel the algorithm scores
    pub channel: ActivityChannel,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            algorithm: AlgorithmId::SadehActiLife,
            channel: ActivityChannel::AxisY,
        }
    }
}

impl AlgorithmConfig {
    /// Key identifying every setting that changes classification output
    pub fn fingerprint(&self) -> String {
        let channel = match self.channel {
            ActivityChannel::AxisX => "x",
            ActivityChannel::AxisY => "y",
            ActivityChannel::AxisZ => "z",
            ActivityChannel::VectorMagnitude => "vm",
        };
        format!("{}:{}", self.algorithm.as_str(), channel)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NonwearConfig {
    pub channel: ActivityChannel,
    /// Counts at or below this are "near zero"
    pub zero_threshold: f64,
    pub min_duration_minutes: u32,
    /// Longest run of non-zero epochs tolerated inside a nonwear run
    pub spike_tolerance_minutes: u32,
    /// Zero-count window required on both sides of a tolerated spike
    pub spike_window_minutes: u32,
    /// Spikes with any count above this break the run
    pub spike_max_count: Option<f64>,
}

impl Default for NonwearConfig {
    fn default() -> Self {
        Self {
            channel: ActivityChannel::VectorMagnitude,
            zero_threshold: 0.0,
            min_duration_minutes: DEFAULT_NONWEAR_MIN_MINUTES,
            spike_tolerance_minutes: 2,
            spike_window_minutes: 30,
            spike_max_count: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryRuleConfig {
    /// Move edited boundaries onto the consecutive-epoch rule
    pub enabled: bool,
    pub onset_sleep_epochs: usize,
    pub offset_wake_epochs: usize,
}

impl Default for BoundaryRuleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            onset_sleep_epochs: DEFAULT_ONSET_SLEEP_EPOCHS,
            offset_wake_epochs: DEFAULT_OFFSET_WAKE_EPOCHS,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub algorithm: AlgorithmConfig,
    pub nonwear: NonwearConfig,
    pub boundary: BoundaryRuleConfig,
    /// Channel used for the movement index and activity totals
    pub movement_channel: ActivityChannel,
    /// Hour at which an analysis date begins (noon-to-noon by default)
    pub day_start_hour: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            algorithm: AlgorithmConfig::default(),
            nonwear: NonwearConfig::default(),
            boundary: BoundaryRuleConfig::default(),
            movement_channel: ActivityChannel::VectorMagnitude,
            day_start_hour: 12,
        }
    }
}

impl EngineConfig {
    /// Load and validate a config from JSON
    pub fn from_json(json: &str) -> Result<Self, ComputeError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ComputeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ComputeError> {
        if self.day_start_hour > 23 {
            return Err(ComputeError::Validation(format!(
                "day_start_hour must be 0-23, got {}",
                self.day_start_hour
            )));
        }
        if self.boundary.onset_sleep_epochs == 0 || self.boundary.offset_wake_epochs == 0 {
            return Err(ComputeError::Validation(
                "boundary rule windows must be at least one epoch".to_string(),
            ));
        }
        if self.nonwear.min_duration_minutes == 0 {
            return Err(ComputeError::Validation(
                "nonwear min_duration_minutes must be positive".to_string(),
            ));
        }
        if !self.nonwear.zero_threshold.is_finite() || self.nonwear.zero_threshold < 0.0 {
            return Err(ComputeError::Validation(
                "nonwear zero_threshold must be a non-negative number".to_string(),
            ));
        }
        Ok(())
    }
}
