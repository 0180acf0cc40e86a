//! Microphone input using CPAL
//!
//! The cpal stream is built, played and dropped on a dedicated capture
//! thread, so the meter itself never holds a `cpal::Stream`.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use std::time::Duration;

use super::source::{CaptureHandle, SampleSender, SampleSource, SourceInfo};
use crate::error::{MeterError, Result};

/// How often the capture thread checks for a stop request
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An input device as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InputDeviceInfo {
    pub name: String,
    pub is_default: bool,
}

/// List the input devices of the default host.
pub fn list_input_devices() -> Result<Vec<InputDeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = host
        .input_devices()
        .map_err(|e| MeterError::StreamCreationFailed(e.to_string()))?;

    Ok(devices
        .filter_map(|d| d.name().ok())
        .map(|name| InputDeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
        })
        .collect())
}

/// Captures from a cpal input device.
#[derive(Debug, Clone, Default)]
pub struct CpalSource {
    device_name: Option<String>,
}

impl CpalSource {
    /// Use the host's default input device.
    pub fn default_input() -> Self {
        Self { device_name: None }
    }

    /// Use the input device with the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }
}

impl SampleSource for CpalSource {
    fn describe(&self) -> String {
        match &self.device_name {
            Some(name) => format!("input device '{}'", name),
            None => "default input device".to_string(),
        }
    }

    fn start(&mut self, tx: SampleSender) -> Result<CaptureHandle> {
        let device_name = self.device_name.clone();

        CaptureHandle::spawn("sound-meter-capture", move |ready, stop| {
            let (stream, info) = match open_stream(device_name.as_deref(), tx) {
                Ok(opened) => opened,
                Err(e) => {
                    ready.fail(e);
                    return;
                }
            };

            if let Err(e) = stream.play() {
                ready.fail(MeterError::StreamCreationFailed(format!(
                    "Failed to start stream: {}",
                    e
                )));
                return;
            }

            ready.ready(info);
            while !stop.wait_timeout(STOP_POLL_INTERVAL) {}

            drop(stream);
            log::info!("Input capture stopped");
        })
    }
}

fn find_device(host: &cpal::Host, name: Option<&str>) -> Result<Device> {
    match name {
        None => host.default_input_device().ok_or(MeterError::NoInputDevice),
        Some(wanted) => host
            .input_devices()
            .map_err(|e| MeterError::StreamCreationFailed(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| MeterError::DeviceNotFound(wanted.to_string())),
    }
}

fn open_stream(device_name: Option<&str>, tx: SampleSender) -> Result<(Stream, SourceInfo)> {
    let host = cpal::default_host();
    let device = find_device(&host, device_name)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = device
        .default_input_config()
        .map_err(|_| MeterError::NoSupportedConfig)?;

    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let info = SourceInfo {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, tx)?,
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, tx)?,
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, tx)?,
        other => {
            return Err(MeterError::UnsupportedSampleFormat(format!("{:?}", other)));
        }
    };

    Ok((stream, info))
}

fn build_stream_typed<T>(device: &Device, config: &StreamConfig, tx: SampleSender) -> Result<Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let error_tx = tx.clone();
    let err_fn = move |err: cpal::StreamError| {
        log::error!("Audio stream error: {}", err);
        error_tx.report_error(err.to_string());
    };

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if tx.is_closed() {
                    return;
                }
                tx.send(to_f32_chunk(data));
            },
            err_fn,
            None,
        )
        .map_err(|e| MeterError::StreamCreationFailed(e.to_string()))
}

/// Convert any cpal sample type to f32 in [-1.0, 1.0].
fn to_f32_chunk<T>(data: &[T]) -> Vec<f32>
where
    T: Sample,
    f32: FromSample<T>,
{
    data.iter().map(|&s| s.to_sample::<f32>()).collect()
}
