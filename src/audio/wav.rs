//! WAV file playback source
//!
//! Streams a WAV file into the meter at real-time pace, as if it were a
//! live input. Useful for metering recordings and for reproducible runs.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use hound::{SampleFormat, WavReader, WavSpec};

use super::source::{CaptureHandle, SampleSender, SampleSource, SourceInfo};
use crate::error::{MeterError, Result};

/// Length of each chunk pushed to the meter
const CHUNK_MS: u64 = 10;

/// Plays a WAV file into the meter.
#[derive(Debug, Clone)]
pub struct WavFileSource {
    path: PathBuf,
    looping: bool,
}

impl WavFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            looping: false,
        }
    }

    /// Restart from the beginning at end of file instead of ending.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Decode a whole WAV file to interleaved f32 samples.
pub fn read_wav_samples(path: &Path) -> Result<(WavSpec, Vec<f32>)> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();

    log::debug!(
        "WAV {:?}: channels={}, sample_rate={}Hz, bits_per_sample={}, format={:?}",
        path,
        spec.channels,
        spec.sample_rate,
        spec.bits_per_sample,
        spec.sample_format
    );

    let samples = decode_samples(&mut reader, spec)?;
    Ok((spec, samples))
}

fn decode_samples(reader: &mut WavReader<BufReader<File>>, spec: WavSpec) -> Result<Vec<f32>> {
    match spec.sample_format {
        SampleFormat::Float => {
            if spec.bits_per_sample != 32 {
                return Err(MeterError::UnsupportedSampleFormat(format!(
                    "{}-bit float WAV",
                    spec.bits_per_sample
                )));
            }
            Ok(reader.samples::<f32>().collect::<std::result::Result<_, _>>()?)
        }
        SampleFormat::Int => {
            if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                return Err(MeterError::UnsupportedSampleFormat(format!(
                    "{}-bit integer WAV",
                    spec.bits_per_sample
                )));
            }
            let scale = (1u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale).map_err(MeterError::from))
                .collect()
        }
    }
}

impl SampleSource for WavFileSource {
    fn describe(&self) -> String {
        format!("WAV file {:?}", self.path)
    }

    fn start(&mut self, tx: SampleSender) -> Result<CaptureHandle> {
        let (spec, samples) = read_wav_samples(&self.path)?;
        let looping = self.looping;
        let path = self.path.clone();
        let info = SourceInfo {
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        };

        let frames_per_chunk = ((spec.sample_rate as u64 * CHUNK_MS) / 1000).max(1) as usize;
        let chunk_len = frames_per_chunk * spec.channels.max(1) as usize;
        let chunk_duration = Duration::from_millis(CHUNK_MS);

        CaptureHandle::spawn("sound-meter-wav", move |ready, stop| {
            ready.ready(info);
            log::info!("Playing {:?} into meter ({} samples)", path, samples.len());

            if samples.is_empty() {
                return;
            }

            let mut deadline = Instant::now();
            let mut pos = 0;
            loop {
                if pos >= samples.len() {
                    if !looping {
                        log::info!("Reached end of {:?}", path);
                        return;
                    }
                    pos = 0;
                }

                let end = (pos + chunk_len).min(samples.len());
                if !tx.send(samples[pos..end].to_vec()) {
                    return;
                }
                pos = end;

                deadline += chunk_duration;
                if stop.wait_until(deadline) {
                    return;
                }
            }
        })
    }
}
