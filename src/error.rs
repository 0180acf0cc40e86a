//! Error type shared by the meter, its sample sources and the settings layer.

use thiserror::Error;

/// Errors that can occur while configuring or running a meter.
#[derive(Error, Debug)]
pub enum MeterError {
    #[error("Sample period must be greater than zero")]
    InvalidSamplePeriod,

    #[error("Sample period {0:?} exceeds the maximum of {max:?}", max = crate::meter::MAX_SAMPLE_PERIOD)]
    SamplePeriodTooLong(std::time::Duration),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Audio input device not found: {0}")]
    DeviceNotFound(String),

    #[error("No supported audio configuration")]
    NoSupportedConfig,

    #[error("Unsupported sample format: {0}")]
    UnsupportedSampleFormat(String),

    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),

    #[error("WAV: {0}")]
    Wav(#[from] hound::Error),

    #[error("Capture thread exited before reporting readiness")]
    SourceThread,

    #[error("No tokio runtime available to drive metering")]
    NoRuntime,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Settings: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MeterError>;
