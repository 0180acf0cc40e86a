//! Level buffer and reading computation
//!
//! Collects samples delivered by a source, computes RMS or peak amplitude
//! over a sliding window, applies EMA smoothing and converts the result
//! to the configured scale.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::source::SourceInfo;

/// Lowest reading reported in decibel scale (silence)
pub const MIN_DECIBELS: f64 = -160.0;

/// Default EMA smoothing factor (0.3 = 30% new value, 70% previous)
pub const DEFAULT_SMOOTHING: f64 = 0.3;

/// Longest stretch of audio a single reading covers. Longer windows,
/// including ones derived from a long sample period, are clamped to this.
pub const MAX_WINDOW: Duration = Duration::from_secs(10);

/// Samples reserved up front; the buffer grows towards its capacity on demand
const INITIAL_ALLOCATION: usize = 8_192;

/// Scale of the values handed to the level callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelScale {
    /// dBFS, from the floor up to 0.0
    #[default]
    Decibels,
    /// Amplitude from 0.0 to 1.0
    Linear,
}

/// Which amplitude statistic a reading is based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelMode {
    /// Root mean square of the window
    #[default]
    Average,
    /// Largest absolute sample in the window
    Peak,
}

impl FromStr for LevelScale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "decibels" | "db" => Ok(LevelScale::Decibels),
            "linear" => Ok(LevelScale::Linear),
            other => Err(format!("unknown level scale '{}'", other)),
        }
    }
}

impl fmt::Display for LevelScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LevelScale::Decibels => write!(f, "decibels"),
            LevelScale::Linear => write!(f, "linear"),
        }
    }
}

impl FromStr for LevelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "average" | "rms" => Ok(LevelMode::Average),
            "peak" => Ok(LevelMode::Peak),
            other => Err(format!("unknown level mode '{}'", other)),
        }
    }
}

impl fmt::Display for LevelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LevelMode::Average => write!(f, "average"),
            LevelMode::Peak => write!(f, "peak"),
        }
    }
}

/// How readings are computed for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelSettings {
    pub scale: LevelScale,
    pub mode: LevelMode,
    /// EMA factor in (0, 1]; 1.0 disables smoothing
    pub smoothing: f64,
    /// Analysis window; the sample period is used when unset
    pub window: Option<Duration>,
    /// Floor for decibel readings
    pub floor_db: f64,
}

impl Default for LevelSettings {
    fn default() -> Self {
        Self {
            scale: LevelScale::Decibels,
            mode: LevelMode::Average,
            smoothing: DEFAULT_SMOOTHING,
            window: None,
            floor_db: MIN_DECIBELS,
        }
    }
}

/// Convert a linear amplitude to dBFS, floored at `floor_db`.
pub fn linear_to_decibels(amplitude: f64, floor_db: f64) -> f64 {
    if !amplitude.is_finite() || amplitude <= 0.0 {
        return floor_db;
    }
    (20.0 * amplitude.min(1.0).log10()).max(floor_db)
}

/// Ring buffer of the most recent samples
pub struct LevelBuffer {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl LevelBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity.min(INITIAL_ALLOCATION)),
            capacity,
        }
    }

    /// Capacity needed to hold `window` of interleaved audio described by `info`,
    /// with the window clamped to `MAX_WINDOW`.
    pub fn capacity_for(window: Duration, info: SourceInfo) -> usize {
        let window = window.min(MAX_WINDOW);
        let per_second = info.sample_rate as f64 * info.channels.max(1) as f64;
        ((window.as_secs_f64() * per_second).round() as usize).max(1)
    }

    /// Add samples to the buffer, removing oldest samples if at capacity
    pub fn push_samples(&mut self, samples: &[f32]) {
        let len = samples.len();

        if len >= self.capacity {
            self.samples.clear();
            self.samples.extend(&samples[len - self.capacity..]);
            return;
        }

        let to_remove = (self.samples.len() + len).saturating_sub(self.capacity);
        if to_remove > 0 {
            self.samples.drain(0..to_remove);
        }

        self.samples.extend(samples);
    }

    pub fn rms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_squares: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let s = s as f64;
                s * s
            })
            .sum();
        (sum_squares / self.samples.len() as f64).sqrt()
    }

    pub fn peak(&self) -> f64 {
        self.samples
            .iter()
            .fold(0.0f64, |peak, &s| peak.max((s as f64).abs()))
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// EMA (Exponential Moving Average) smoothing state
///
/// smoothed = alpha * current + (1 - alpha) * previous
pub(crate) struct EmaState {
    alpha: f64,
    prev: f64,
    initialized: bool,
}

impl EmaState {
    pub(crate) fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::MIN_POSITIVE, 1.0),
            prev: 0.0,
            initialized: false,
        }
    }

    pub(crate) fn apply(&mut self, value: f64) -> f64 {
        if !self.initialized {
            // First reading passes through as the initial state
            self.prev = value;
            self.initialized = true;
            return value;
        }

        self.prev = self.alpha * value + (1.0 - self.alpha) * self.prev;
        self.prev
    }

    pub(crate) fn reset(&mut self) {
        self.prev = 0.0;
        self.initialized = false;
    }
}

/// Turns raw sample chunks into one reading per tick.
pub struct LevelProcessor {
    buffer: LevelBuffer,
    ema: EmaState,
    scale: LevelScale,
    mode: LevelMode,
    floor_db: f64,
}

impl LevelProcessor {
    pub fn new(settings: &LevelSettings, sample_period: Duration, info: SourceInfo) -> Self {
        let window = settings.window.unwrap_or(sample_period).min(MAX_WINDOW);
        let capacity = LevelBuffer::capacity_for(window, info);

        log::debug!(
            "Level processor: window {:?} ({} samples at {} Hz x {}), {} / {}",
            window,
            capacity,
            info.sample_rate,
            info.channels,
            settings.mode,
            settings.scale
        );

        Self {
            buffer: LevelBuffer::new(capacity),
            ema: EmaState::new(settings.smoothing),
            scale: settings.scale,
            mode: settings.mode,
            floor_db: settings.floor_db,
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.buffer.push_samples(samples);
    }

    /// Compute the reading for the current window.
    pub fn reading(&mut self) -> f64 {
        let amplitude = match self.mode {
            LevelMode::Average => self.buffer.rms(),
            LevelMode::Peak => self.buffer.peak(),
        };
        let smoothed = self.ema.apply(amplitude.clamp(0.0, 1.0));

        match self.scale {
            LevelScale::Decibels => linear_to_decibels(smoothed, self.floor_db),
            LevelScale::Linear => smoothed,
        }
    }

    /// Drop buffered audio and smoothing history.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.ema.reset();
    }
}
