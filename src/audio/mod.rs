//! Audio side of the meter
//!
//! Sample sources (CPAL input, WAV playback, synthetic signals), the level
//! computation and the emitter task that turns samples into readings.

mod capture;
pub mod emitter;
pub mod level;
pub mod signal;
pub mod source;
mod wav;

pub use capture::{list_input_devices, CpalSource, InputDeviceInfo};
pub use emitter::{CallbackSlot, CounterSnapshot, LevelCallback, SessionCounters};
pub use level::{
    linear_to_decibels, LevelBuffer, LevelMode, LevelProcessor, LevelScale, LevelSettings,
    MIN_DECIBELS,
};
pub use signal::{SignalSource, Waveform};
pub use source::{CaptureHandle, SampleSender, SampleSource, SourceInfo, StopSignal};
pub use wav::{read_wav_samples, WavFileSource};
