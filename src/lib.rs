//! Periodic audio level metering.
//!
//! A [`Meter`] is constructed with a sample period and a [`SampleSource`].
//! `begin_metering` starts capture and delivers one level reading per period
//! to a callback; `end_metering` stops it.
//!
//! ```no_run
//! use std::time::Duration;
//! use sound_meter::{AudioMeter, Meter};
//!
//! # #[tokio::main]
//! # async fn main() -> sound_meter::Result<()> {
//! let mut meter = Meter::default_input(Duration::from_millis(100))?;
//! meter.begin_metering(Box::new(|db| println!("{:.1} dBFS", db)))?;
//! tokio::time::sleep(Duration::from_secs(2)).await;
//! meter.end_metering();
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod error;
pub mod meter;
pub mod metrics;
pub mod settings;
pub mod state_machine;

pub use audio::{
    list_input_devices, CpalSource, InputDeviceInfo, LevelCallback, LevelMode, LevelScale,
    LevelSettings, SampleSource, SignalSource, SourceInfo, WavFileSource, Waveform,
};
pub use error::{MeterError, Result};
pub use meter::{AudioMeter, Meter, MAX_SAMPLE_PERIOD};
pub use metrics::{ErrorRecord, MetricsSummary, SessionMetrics};
pub use settings::{default_settings_path, load_settings, save_settings, MeterSettings};
pub use state_machine::MeterState;
