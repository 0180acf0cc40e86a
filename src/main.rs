use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use sound_meter::{
    default_settings_path, list_input_devices, load_settings, save_settings, AudioMeter,
    CpalSource, LevelMode, LevelScale, Meter, MeterSettings, SampleSource, SignalSource,
    WavFileSource,
};

const BAR_WIDTH: usize = 40;

#[derive(Parser, Debug)]
#[command(name = "sound-meter", about = "Print live audio levels")]
struct Args {
    /// Settings file (defaults to <config dir>/sound-meter/settings.json)
    #[arg(long, env = "SOUND_METER_CONFIG")]
    config: Option<PathBuf>,

    /// Time between readings in milliseconds
    #[arg(long)]
    period_ms: Option<u64>,

    /// decibels or linear
    #[arg(long)]
    scale: Option<LevelScale>,

    /// average (RMS) or peak
    #[arg(long)]
    mode: Option<LevelMode>,

    /// Input device name (see --list-devices)
    #[arg(long)]
    device: Option<String>,

    /// Meter a WAV file instead of an input device
    #[arg(long, conflicts_with_all = ["device", "sine"])]
    wav: Option<PathBuf>,

    /// Loop the WAV file
    #[arg(long = "loop", requires = "wav")]
    looping: bool,

    /// Meter a generated sine tone of this frequency (Hz)
    #[arg(long, conflicts_with = "device")]
    sine: Option<f32>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    duration_secs: Option<u64>,

    /// List input devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    save_config: bool,
}

fn apply_overrides(settings: &mut MeterSettings, args: &Args) {
    if let Some(period_ms) = args.period_ms {
        settings.sample_period_ms = period_ms;
    }
    if let Some(scale) = args.scale {
        settings.scale = scale;
    }
    if let Some(mode) = args.mode {
        settings.mode = mode;
    }
    if let Some(device) = &args.device {
        settings.input_device = Some(device.clone());
    }
}

fn build_source(args: &Args, settings: &MeterSettings) -> Box<dyn SampleSource> {
    if let Some(path) = &args.wav {
        return Box::new(WavFileSource::new(path).looping(args.looping));
    }
    if let Some(frequency) = args.sine {
        return Box::new(SignalSource::sine(frequency, 0.5));
    }
    match &settings.input_device {
        Some(name) => Box::new(CpalSource::named(name.clone())),
        None => Box::new(CpalSource::default_input()),
    }
}

/// Render a reading as a fixed-width bar.
fn level_bar(value: f64, scale: LevelScale, floor_db: f64) -> String {
    let fraction = match scale {
        LevelScale::Linear => value,
        LevelScale::Decibels => (value - floor_db) / -floor_db,
    }
    .clamp(0.0, 1.0);

    let filled = (fraction * BAR_WIDTH as f64).round() as usize;
    format!("{}{}", "#".repeat(filled), ".".repeat(BAR_WIDTH - filled))
}

#[tokio::main]
async fn main() -> sound_meter::Result<()> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if args.list_devices {
        for device in list_input_devices()? {
            let marker = if device.is_default { "*" } else { " " };
            println!("{} {}", marker, device.name);
        }
        return Ok(());
    }

    let settings_path = args.config.clone().or_else(default_settings_path);
    let mut settings = settings_path
        .as_deref()
        .map(load_settings)
        .unwrap_or_default();
    apply_overrides(&mut settings, &args);
    settings.validate()?;

    if args.save_config {
        match &settings_path {
            Some(path) => {
                save_settings(path, &settings)?;
                log::info!("Saved settings to {:?}", path);
            }
            None => log::warn!("No settings location available, not saving"),
        }
    }

    let source = build_source(&args, &settings);
    let mut meter = Meter::from_settings(&settings, source)?;

    let scale = settings.scale;
    let floor_db = settings.floor_db;
    meter.begin_metering(Box::new(move |value| {
        println!("{:>9.2} {}", value, level_bar(value, scale, floor_db));
    }))?;

    let duration = args.duration_secs.map(Duration::from_secs);
    let deadline = async move {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
        _ = deadline => log::debug!("Duration elapsed"),
    }

    meter.end_metering();

    match serde_json::to_string_pretty(&meter.metrics_summary()) {
        Ok(json) => log::info!("Metering summary:\n{}", json),
        Err(e) => log::warn!("Failed to serialize metrics summary: {}", e),
    }

    Ok(())
}
