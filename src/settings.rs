//! Noise-reduction configuration: enumerations, numeric ranges, validation,
//! and key/value persistence.
//!
//! Settings are plain data. `validate()` enforces the consistency rules
//! between window type, window size, steps per window, and discrimination
//! method before any processing begins; numeric fields carry fixed permitted
//! ranges. The key/value surface uses the historical preference names and
//! encodings, so stored configurations from the original effect remain
//! readable.

use crate::windows::WindowType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Constants
// ============================================================================

/// Smallest supported window size
pub const MIN_WINDOW_SIZE: usize = 8;

/// Largest supported window size
pub const MAX_WINDOW_SIZE: usize = 16384;

/// Smallest supported steps per window
pub const MIN_STEPS_PER_WINDOW: usize = 2;

/// Largest supported steps per window
pub const MAX_STEPS_PER_WINDOW: usize = 64;

/// The median method is only defined for neighborhoods of three or five
/// frames, which correspond to at most this many steps per window
pub const MAX_MEDIAN_STEPS_PER_WINDOW: usize = 4;

/// Noise attenuation range in positive dB
pub const NOISE_GAIN_DB_RANGE: (f64, f64) = (0.0, 48.0);

/// Old-method sensitivity range in dB
pub const SENSITIVITY_DB_RANGE: (f64, f64) = (-20.0, 20.0);

/// New-method sensitivity range (negative log10 probability)
pub const NEW_SENSITIVITY_RANGE: (f64, f64) = (1.0, 24.0);

/// Frequency smoothing range in Hz
pub const FREQ_SMOOTHING_HZ_RANGE: (f64, f64) = (0.0, 1000.0);

/// Attack and release time range in seconds
pub const TIME_RANGE: (f64, f64) = (0.0, 1.0);

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SettingsError {
    /// Steps per window below the window type's minimum
    StepsTooFew { steps: usize, min: usize },

    /// Steps per window above the window size
    StepsExceedWindow { steps: usize, window_size: usize },

    /// Median method with more steps than its defined neighborhoods allow
    MedianStepsTooMany { steps: usize },

    /// Window size outside the power-of-two ladder
    InvalidWindowSize { size: usize },

    /// Steps per window outside the power-of-two ladder
    InvalidStepsPerWindow { steps: usize },

    /// A persisted field was present but blank
    EmptyValue { key: &'static str },

    /// A persisted field did not parse as a number
    MalformedNumber { key: &'static str },

    /// A numeric field fell outside its permitted range
    NotInRange { key: &'static str, min: f64, max: f64 },
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::StepsTooFew { steps, min } => write!(
                f,
                "Steps per block are too few for the window types: {} given, {} required",
                steps, min
            ),
            SettingsError::StepsExceedWindow { steps, window_size } => write!(
                f,
                "Steps per block cannot exceed the window size: {} steps, window {}",
                steps, window_size
            ),
            SettingsError::MedianStepsTooMany { steps } => write!(
                f,
                "Median method is not implemented for more than four steps per window: {} given",
                steps
            ),
            SettingsError::InvalidWindowSize { size } => write!(
                f,
                "Window size {} must be a power of two between {} and {}",
                size, MIN_WINDOW_SIZE, MAX_WINDOW_SIZE
            ),
            SettingsError::InvalidStepsPerWindow { steps } => write!(
                f,
                "Steps per window {} must be a power of two between {} and {}",
                steps, MIN_STEPS_PER_WINDOW, MAX_STEPS_PER_WINDOW
            ),
            SettingsError::EmptyValue { key } => write!(f, "Empty value: {}", key),
            SettingsError::MalformedNumber { key } => write!(f, "Malformed number: {}", key),
            SettingsError::NotInRange { key, min, max } => {
                write!(f, "Not in range: {} must be between {} and {}", key, min, max)
            }
        }
    }
}

impl std::error::Error for SettingsError {}

// ============================================================================
// Choice Enumerations
// ============================================================================

/// What the reduction pass writes back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReductionChoice {
    /// Attenuate bands classified as noise
    ReduceNoise,
    /// Keep only bands classified as noise
    IsolateNoise,
    /// Output what reduction would have removed
    LeaveResidue,
}

impl ReductionChoice {
    #[inline]
    pub fn index(self) -> usize {
        match self {
            ReductionChoice::ReduceNoise => 0,
            ReductionChoice::IsolateNoise => 1,
            ReductionChoice::LeaveResidue => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<ReductionChoice> {
        match index {
            0 => Some(ReductionChoice::ReduceNoise),
            1 => Some(ReductionChoice::IsolateNoise),
            2 => Some(ReductionChoice::LeaveResidue),
            _ => None,
        }
    }
}

impl Default for ReductionChoice {
    fn default() -> Self {
        ReductionChoice::ReduceNoise
    }
}

/// How a band of the center frame is decided to be noise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscriminationMethod {
    /// Median over the overlapping neighborhood; robust to excursions in
    /// both directions
    Median,
    /// Second greatest over the neighborhood; throws out one high outlier
    SecondGreatest,
    /// Original statistic: minimum against a max-of-min threshold
    Old,
}

impl DiscriminationMethod {
    #[inline]
    pub fn index(self) -> usize {
        match self {
            DiscriminationMethod::Median => 0,
            DiscriminationMethod::SecondGreatest => 1,
            DiscriminationMethod::Old => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<DiscriminationMethod> {
        match index {
            0 => Some(DiscriminationMethod::Median),
            1 => Some(DiscriminationMethod::SecondGreatest),
            2 => Some(DiscriminationMethod::Old),
            _ => None,
        }
    }
}

impl Default for DiscriminationMethod {
    fn default() -> Self {
        DiscriminationMethod::SecondGreatest
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Configuration for one profiling or reduction run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseReductionSettings {
    /// Noise attenuation in positive dB
    pub noise_gain_db: f64,

    /// Old-method sensitivity in dB, applied to power
    pub sensitivity_db: f64,

    /// New-method sensitivity: negative log10 of the probability that noise
    /// strays above the threshold
    pub new_sensitivity: f64,

    /// Half-width of the gain frequency smoothing in Hz
    pub freq_smoothing_hz: f64,

    /// Attack time in seconds
    pub attack_time: f64,

    /// Release time in seconds
    pub release_time: f64,

    /// What the reduction pass writes back
    pub reduction_choice: ReductionChoice,

    /// Analysis/synthesis window pairing
    pub window_type: WindowType,

    /// Window size in samples; a power of two
    pub window_size: usize,

    /// Analysis steps per window; a power of two
    pub steps_per_window: usize,

    /// Band classification method
    pub method: DiscriminationMethod,

    /// Optional [low, high] band in Hz restricting the affected bins
    pub frequency_band: Option<(f64, f64)>,
}

impl Default for NoiseReductionSettings {
    fn default() -> Self {
        Self {
            noise_gain_db: 24.0,
            sensitivity_db: 0.0,
            new_sensitivity: 6.0,
            freq_smoothing_hz: 150.0,
            attack_time: 0.15,
            release_time: 0.15,
            reduction_choice: ReductionChoice::default(),
            window_type: WindowType::default(),
            window_size: 2048,
            steps_per_window: 4,
            method: DiscriminationMethod::default(),
            frequency_band: None,
        }
    }
}

impl NoiseReductionSettings {
    /// Hop between consecutive analysis frames in samples
    #[inline]
    pub fn step_size(&self) -> usize {
        self.window_size / self.steps_per_window
    }

    /// Number of distinct bins of the real spectrum
    #[inline]
    pub fn spectrum_size(&self) -> usize {
        self.window_size / 2 + 1
    }

    /// Check all consistency rules and numeric ranges
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !self.window_size.is_power_of_two()
            || self.window_size < MIN_WINDOW_SIZE
            || self.window_size > MAX_WINDOW_SIZE
        {
            return Err(SettingsError::InvalidWindowSize { size: self.window_size });
        }

        if !self.steps_per_window.is_power_of_two()
            || self.steps_per_window < MIN_STEPS_PER_WINDOW
            || self.steps_per_window > MAX_STEPS_PER_WINDOW
        {
            return Err(SettingsError::InvalidStepsPerWindow { steps: self.steps_per_window });
        }

        let min_steps = self.window_type.min_steps_per_window();
        if self.steps_per_window < min_steps {
            return Err(SettingsError::StepsTooFew {
                steps: self.steps_per_window,
                min: min_steps,
            });
        }

        if self.steps_per_window > self.window_size {
            return Err(SettingsError::StepsExceedWindow {
                steps: self.steps_per_window,
                window_size: self.window_size,
            });
        }

        if self.method == DiscriminationMethod::Median
            && self.steps_per_window > MAX_MEDIAN_STEPS_PER_WINDOW
        {
            return Err(SettingsError::MedianStepsTooMany { steps: self.steps_per_window });
        }

        check_range("Gain", self.noise_gain_db, NOISE_GAIN_DB_RANGE)?;
        check_range("Sensitivity", self.sensitivity_db, SENSITIVITY_DB_RANGE)?;
        check_range("NewSensitivity", self.new_sensitivity, NEW_SENSITIVITY_RANGE)?;
        check_range("FreqSmoothing", self.freq_smoothing_hz, FREQ_SMOOTHING_HZ_RANGE)?;
        check_range("AttackTime", self.attack_time, TIME_RANGE)?;
        check_range("ReleaseTime", self.release_time, TIME_RANGE)?;

        if let Some((f0, f1)) = self.frequency_band {
            if f0 < 0.0 || f1 < f0 {
                return Err(SettingsError::NotInRange {
                    key: "FrequencyBand",
                    min: 0.0,
                    max: f64::INFINITY,
                });
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Key/value persistence
    // ------------------------------------------------------------------------

    /// Encode as string key/value pairs under the historical preference
    /// names. Window size and steps per window are stored as ladder choice
    /// indices, enumerations as integer indices.
    pub fn to_key_values(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("Sensitivity".into(), self.sensitivity_db.to_string());
        map.insert("FreqSmoothing".into(), self.freq_smoothing_hz.to_string());
        map.insert("Gain".into(), self.noise_gain_db.to_string());
        map.insert("AttackTime".into(), self.attack_time.to_string());
        map.insert("ReleaseTime".into(), self.release_time.to_string());
        map.insert("NewSensitivity".into(), self.new_sensitivity.to_string());
        map.insert(
            "ReductionChoice".into(),
            self.reduction_choice.index().to_string(),
        );
        map.insert("WindowTypes".into(), self.window_type.index().to_string());
        map.insert(
            "WindowSize".into(),
            (self.window_size.trailing_zeros() as usize).saturating_sub(3).to_string(),
        );
        map.insert(
            "StepsPerWindow".into(),
            (self.steps_per_window.trailing_zeros() as usize).saturating_sub(1).to_string(),
        );
        map.insert("Method".into(), self.method.index().to_string());
        map
    }

    /// Decode from string key/value pairs. Missing keys keep their default
    /// values; unknown enumeration or ladder indices fall back to defaults;
    /// blank, malformed, or out-of-range numeric fields are errors.
    pub fn from_key_values(map: &BTreeMap<String, String>) -> Result<Self, SettingsError> {
        let defaults = Self::default();
        let mut settings = defaults.clone();

        if let Some(v) = map.get("Sensitivity") {
            settings.sensitivity_db = parse_field("Sensitivity", v, SENSITIVITY_DB_RANGE)?;
        }
        if let Some(v) = map.get("FreqSmoothing") {
            settings.freq_smoothing_hz = parse_field("FreqSmoothing", v, FREQ_SMOOTHING_HZ_RANGE)?;
        }
        if let Some(v) = map.get("Gain") {
            settings.noise_gain_db = parse_field("Gain", v, NOISE_GAIN_DB_RANGE)?;
        }
        if let Some(v) = map.get("AttackTime") {
            settings.attack_time = parse_field("AttackTime", v, TIME_RANGE)?;
        }
        if let Some(v) = map.get("ReleaseTime") {
            settings.release_time = parse_field("ReleaseTime", v, TIME_RANGE)?;
        }
        if let Some(v) = map.get("NewSensitivity") {
            settings.new_sensitivity = parse_field("NewSensitivity", v, NEW_SENSITIVITY_RANGE)?;
        }

        if let Some(v) = map.get("ReductionChoice") {
            settings.reduction_choice = parse_index("ReductionChoice", v)?
                .and_then(ReductionChoice::from_index)
                .unwrap_or(defaults.reduction_choice);
        }
        if let Some(v) = map.get("WindowTypes") {
            settings.window_type = parse_index("WindowTypes", v)?
                .and_then(WindowType::from_index)
                .unwrap_or(defaults.window_type);
        }
        if let Some(v) = map.get("WindowSize") {
            // Ladder choices 0..=11 cover sizes 8 through 16384
            settings.window_size = parse_index("WindowSize", v)?
                .filter(|&choice| choice <= 11)
                .map(|choice| 1usize << (3 + choice))
                .unwrap_or(defaults.window_size);
        }
        if let Some(v) = map.get("StepsPerWindow") {
            // Ladder choices 0..=5 cover steps 2 through 64
            settings.steps_per_window = parse_index("StepsPerWindow", v)?
                .filter(|&choice| choice <= 5)
                .map(|choice| 1usize << (1 + choice))
                .unwrap_or(defaults.steps_per_window);
        }
        if let Some(v) = map.get("Method") {
            settings.method = parse_index("Method", v)?
                .and_then(DiscriminationMethod::from_index)
                .unwrap_or(defaults.method);
        }

        Ok(settings)
    }
}

fn check_range(key: &'static str, value: f64, (min, max): (f64, f64)) -> Result<(), SettingsError> {
    if value < min || value > max {
        Err(SettingsError::NotInRange { key, min, max })
    } else {
        Ok(())
    }
}

/// Parse one persisted numeric field, reporting blank and malformed values
/// distinctly and enforcing the field's range.
fn parse_field(
    key: &'static str,
    value: &str,
    range: (f64, f64),
) -> Result<f64, SettingsError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SettingsError::EmptyValue { key });
    }
    let parsed: f64 = trimmed
        .parse()
        .map_err(|_| SettingsError::MalformedNumber { key })?;
    check_range(key, parsed, range)?;
    Ok(parsed)
}

/// Parse a persisted enumeration or ladder index. Negative or non-numeric
/// text is malformed; an unrecognized index is reported as `None` so the
/// caller can fall back to the default.
fn parse_index(key: &'static str, value: &str) -> Result<Option<usize>, SettingsError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SettingsError::EmptyValue { key });
    }
    trimmed
        .parse::<usize>()
        .map(Some)
        .map_err(|_| SettingsError::MalformedNumber { key })
}
