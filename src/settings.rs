use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{LevelMode, LevelScale, LevelSettings, MIN_DECIBELS};
use crate::error::{MeterError, Result};
use crate::meter::MAX_SAMPLE_PERIOD;

const SETTINGS_DIR_NAME: &str = "sound-meter";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterSettings {
    /// Time between level readings.
    pub sample_period_ms: u64,

    /// Scale of the emitted value: "decibels" (dBFS) or "linear" (0.0-1.0).
    pub scale: LevelScale,

    /// "average" for RMS readings, "peak" for the largest sample in the window.
    pub mode: LevelMode,

    /// EMA factor applied to successive readings. 1.0 disables smoothing.
    pub smoothing: f64,

    /// Length of audio each reading covers. Defaults to the sample period.
    pub window_ms: Option<u64>,

    /// Lowest decibel reading; silence reports this value.
    pub floor_db: f64,

    /// Input device name. The host default is used when unset.
    pub input_device: Option<String>,
}

impl Default for MeterSettings {
    fn default() -> Self {
        Self {
            sample_period_ms: 100,
            scale: LevelScale::Decibels,
            mode: LevelMode::Average,
            smoothing: crate::audio::level::DEFAULT_SMOOTHING,
            window_ms: None,
            floor_db: MIN_DECIBELS,
            input_device: None,
        }
    }
}

impl MeterSettings {
    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_period_ms)
    }

    pub fn level_settings(&self) -> LevelSettings {
        LevelSettings {
            scale: self.scale,
            mode: self.mode,
            smoothing: self.smoothing,
            window: self.window_ms.map(Duration::from_millis),
            floor_db: self.floor_db,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_period_ms == 0 {
            return Err(MeterError::InvalidSamplePeriod);
        }
        if self.sample_period() > MAX_SAMPLE_PERIOD {
            return Err(MeterError::SamplePeriodTooLong(self.sample_period()));
        }
        if !(self.smoothing > 0.0 && self.smoothing <= 1.0) {
            return Err(MeterError::InvalidSettings(format!(
                "smoothing must be in (0, 1], got {}",
                self.smoothing
            )));
        }
        if !self.floor_db.is_finite() || self.floor_db >= 0.0 {
            return Err(MeterError::InvalidSettings(format!(
                "floor_db must be a negative number, got {}",
                self.floor_db
            )));
        }
        if self.window_ms == Some(0) {
            return Err(MeterError::InvalidSettings(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default location: <config dir>/sound-meter/settings.json
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings, falling back to defaults when the file is missing or unreadable.
pub fn load_settings(path: &Path) -> MeterSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<MeterSettings>(&contents) {
            Ok(settings) => match settings.validate() {
                Ok(()) => settings,
                Err(e) => {
                    log::warn!("Settings: ignoring invalid {:?}: {}", path, e);
                    MeterSettings::default()
                }
            },
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                MeterSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => MeterSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            MeterSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &MeterSettings) -> Result<()> {
    settings.validate()?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write to a temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)?;

    // rename fails on Windows when the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
    }

    std::fs::rename(&tmp_path, path)?;
    log::debug!("Settings: saved {:?}", path);
    Ok(())
}
