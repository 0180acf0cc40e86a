//! Synthetic signal source
//!
//! Generates silence, a constant level or a sine tone at real-time pace.
//! Stands in for hardware in tests and demos.

use std::f32::consts::TAU;
use std::time::{Duration, Instant};

use super::source::{CaptureHandle, SampleSender, SampleSource, SourceInfo};
use crate::error::Result;

const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Length of each generated chunk
const CHUNK_MS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Waveform {
    Silence,
    /// Every sample has this value
    Constant(f32),
    Sine { frequency: f32, amplitude: f32 },
}

/// Mono generator feeding the meter.
#[derive(Debug, Clone)]
pub struct SignalSource {
    waveform: Waveform,
    sample_rate: u32,
}

impl SignalSource {
    pub fn new(waveform: Waveform) -> Self {
        Self {
            waveform,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }

    pub fn silence() -> Self {
        Self::new(Waveform::Silence)
    }

    pub fn constant(amplitude: f32) -> Self {
        Self::new(Waveform::Constant(amplitude))
    }

    pub fn sine(frequency: f32, amplitude: f32) -> Self {
        Self::new(Waveform::Sine {
            frequency,
            amplitude,
        })
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate.max(1);
        self
    }

    pub fn waveform(&self) -> Waveform {
        self.waveform
    }
}

/// Stateful oscillator producing successive chunks of a waveform.
struct Oscillator {
    waveform: Waveform,
    sample_rate: f32,
    phase: f32,
}

impl Oscillator {
    fn new(waveform: Waveform, sample_rate: u32) -> Self {
        Self {
            waveform,
            sample_rate: sample_rate as f32,
            phase: 0.0,
        }
    }

    fn fill(&mut self, len: usize) -> Vec<f32> {
        match self.waveform {
            Waveform::Silence => vec![0.0; len],
            Waveform::Constant(value) => vec![value; len],
            Waveform::Sine {
                frequency,
                amplitude,
            } => {
                let step = frequency / self.sample_rate;
                (0..len)
                    .map(|_| {
                        let sample = amplitude * (TAU * self.phase).sin();
                        self.phase = (self.phase + step).fract();
                        sample
                    })
                    .collect()
            }
        }
    }
}

impl SampleSource for SignalSource {
    fn describe(&self) -> String {
        match self.waveform {
            Waveform::Silence => "silence".to_string(),
            Waveform::Constant(v) => format!("constant {:.3}", v),
            Waveform::Sine {
                frequency,
                amplitude,
            } => format!("sine {:.1} Hz at {:.3}", frequency, amplitude),
        }
    }

    fn start(&mut self, tx: SampleSender) -> Result<CaptureHandle> {
        let info = SourceInfo {
            sample_rate: self.sample_rate,
            channels: 1,
        };
        let chunk_len = ((self.sample_rate as u64 * CHUNK_MS) / 1000).max(1) as usize;
        let chunk_duration = Duration::from_millis(CHUNK_MS);
        let mut oscillator = Oscillator::new(self.waveform, self.sample_rate);

        CaptureHandle::spawn("sound-meter-signal", move |ready, stop| {
            ready.ready(info);

            let mut deadline = Instant::now();
            loop {
                if !tx.send(oscillator.fill(chunk_len)) {
                    return;
                }
                deadline += chunk_duration;
                if stop.wait_until(deadline) {
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn test_sine_rms() {
        let mut osc = Oscillator::new(
            Waveform::Sine {
                frequency: 1_000.0,
                amplitude: 0.5,
            },
            48_000,
        );
        // Whole number of periods
        let samples = osc.fill(4_800);
        let expected = 0.5 / 2f32.sqrt();
        assert!((rms(&samples) - expected).abs() < 1e-3);
        assert!(samples.iter().all(|s| s.abs() <= 0.5 + 1e-6));
    }

    #[test]
    fn test_phase_continues_across_chunks() {
        let waveform = Waveform::Sine {
            frequency: 440.0,
            amplitude: 1.0,
        };
        let mut split = Oscillator::new(waveform, 48_000);
        let mut whole = Oscillator::new(waveform, 48_000);

        let mut joined = split.fill(100);
        joined.extend(split.fill(100));
        let single = whole.fill(200);

        for (a, b) in joined.iter().zip(single.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_constant_and_silence() {
        assert_eq!(Oscillator::new(Waveform::Constant(0.25), 8_000).fill(3), vec![0.25; 3]);
        assert_eq!(Oscillator::new(Waveform::Silence, 8_000).fill(2), vec![0.0; 2]);
    }

    #[test]
    fn test_describe() {
        assert_eq!(SignalSource::silence().describe(), "silence");
        assert_eq!(SignalSource::sine(440.0, 0.5).describe(), "sine 440.0 Hz at 0.500");
    }
}
