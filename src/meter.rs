//! The audio meter
//!
//! `Meter` ties a `SampleSource` to a level emitter task. The caller begins
//! metering with a callback, receives one reading per sample period, and
//! ends metering. Transitions go through the reducer in `state_machine`.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::audio::emitter::run_level_emitter;
use crate::audio::source::create_sample_channel;
use crate::audio::{
    CallbackSlot, CaptureHandle, CpalSource, LevelCallback, LevelProcessor, LevelSettings,
    SampleSource, SessionCounters,
};
use crate::error::{MeterError, Result};
use crate::metrics::{ErrorRecord, MetricsCollector, MetricsSummary, SessionMetrics};
use crate::settings::MeterSettings;
use crate::state_machine::{reduce, MeterEffect, MeterEvent, MeterState};

/// Longest accepted sample period
pub const MAX_SAMPLE_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Start/stop control over periodic level readings.
pub trait AudioMeter {
    /// Time between successive readings
    fn sample_period(&self) -> Duration;

    /// Begin metering, delivering one reading per sample period to `callback`.
    ///
    /// If metering is already running, the current session is ended first and
    /// its callback is never invoked again.
    fn begin_metering(&mut self, callback: LevelCallback) -> Result<()>;

    /// Stop metering. Once this returns the callback will not be invoked again.
    /// Does nothing when not metering.
    fn end_metering(&mut self);

    fn is_metering(&self) -> bool;

    /// Begin metering with readings delivered over a channel instead of a callback.
    fn begin_metering_channel(&mut self) -> Result<mpsc::UnboundedReceiver<f64>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.begin_metering(Box::new(move |value| {
            let _ = tx.send(value);
        }))?;
        Ok(rx)
    }
}

/// Everything owned by one running session.
struct ActiveSession {
    id: Uuid,
    capture: CaptureHandle,
    slot: Arc<CallbackSlot>,
    stop_tx: oneshot::Sender<()>,
    counters: Arc<SessionCounters>,
}

/// Audio meter over a sample source.
///
/// Readings are emitted from a task on the tokio runtime given with
/// `with_runtime`, or the runtime current at `begin_metering`.
/// Dropping a running meter ends metering.
pub struct Meter<S: SampleSource> {
    sample_period: Duration,
    source: S,
    level_settings: LevelSettings,
    runtime: Option<Handle>,
    state: MeterState,
    session: Option<ActiveSession>,
    metrics: MetricsCollector,
}

impl Meter<CpalSource> {
    /// Meter the host's default input device.
    pub fn default_input(sample_period: Duration) -> Result<Self> {
        Self::new(sample_period, CpalSource::default_input())
    }
}

impl<S: SampleSource> Meter<S> {
    /// Create an idle meter. The sample period must be greater than zero
    /// and no longer than `MAX_SAMPLE_PERIOD`.
    pub fn new(sample_period: Duration, source: S) -> Result<Self> {
        if sample_period.is_zero() {
            return Err(MeterError::InvalidSamplePeriod);
        }
        if sample_period > MAX_SAMPLE_PERIOD {
            return Err(MeterError::SamplePeriodTooLong(sample_period));
        }

        Ok(Self {
            sample_period,
            source,
            level_settings: LevelSettings::default(),
            runtime: None,
            state: MeterState::default(),
            session: None,
            metrics: MetricsCollector::new(),
        })
    }

    /// Create an idle meter from persisted settings.
    pub fn from_settings(settings: &MeterSettings, source: S) -> Result<Self> {
        settings.validate()?;
        Ok(Self::new(settings.sample_period(), source)?
            .with_level_settings(settings.level_settings()))
    }

    pub fn with_level_settings(mut self, level_settings: LevelSettings) -> Self {
        self.level_settings = level_settings;
        self
    }

    /// Run the emitter on this runtime instead of the one current at `begin_metering`.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn level_settings(&self) -> &LevelSettings {
        &self.level_settings
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Id of the running session, if any
    pub fn session_id(&self) -> Option<Uuid> {
        self.state.session_id()
    }

    pub fn metrics_summary(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    /// Completed sessions, newest first
    pub fn session_history(&self) -> Vec<SessionMetrics> {
        self.metrics.history()
    }

    /// Errors, newest first
    pub fn error_history(&self) -> Vec<ErrorRecord> {
        self.metrics.errors()
    }

    fn dispatch(&mut self, event: MeterEvent, mut callback: Option<LevelCallback>) -> Result<()> {
        let (next, effects) = reduce(&self.state, event);
        self.state = next;

        for effect in effects {
            match effect {
                MeterEffect::StopSession { id } => self.stop_session(id),
                MeterEffect::StartSession { id } => {
                    let Some(callback) = callback.take() else {
                        continue;
                    };
                    if let Err(e) = self.start_session(id, callback) {
                        log::error!("Failed to start metering from {}: {}", self.source.describe(), e);
                        self.metrics.start_failed(id, e.to_string());
                        let (next, _) = reduce(
                            &self.state,
                            MeterEvent::StartFailed {
                                id,
                                err: e.to_string(),
                            },
                        );
                        self.state = next;
                        return Err(e);
                    }
                }
            }
        }

        Ok(())
    }

    fn start_session(&mut self, id: Uuid, callback: LevelCallback) -> Result<()> {
        let runtime = match &self.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| MeterError::NoRuntime)?,
        };

        let counters = Arc::new(SessionCounters::default());
        let (tx, rx) = create_sample_channel(counters.clone());
        let capture = self.source.start(tx)?;

        let description = self.source.describe();
        self.metrics.start_session(id, description.clone());

        let processor = LevelProcessor::new(&self.level_settings, self.sample_period, capture.info());
        let slot = Arc::new(CallbackSlot::new(callback, counters.clone()));
        let (stop_tx, stop_rx) = oneshot::channel();

        runtime.spawn(run_level_emitter(
            id,
            self.sample_period,
            rx,
            stop_rx,
            processor,
            slot.clone(),
            counters.clone(),
        ));

        log::info!(
            "Metering started: session {} from {} every {:?}",
            id,
            description,
            self.sample_period
        );

        self.session = Some(ActiveSession {
            id,
            capture,
            slot,
            stop_tx,
            counters,
        });
        Ok(())
    }

    fn stop_session(&mut self, id: Uuid) {
        let session = match self.session.take() {
            Some(session) if session.id == id => session,
            other => {
                self.session = other;
                return;
            }
        };

        // Close the slot first: waits out an in-flight callback
        session.slot.close();
        let _ = session.stop_tx.send(());
        session.capture.stop();

        self.metrics.finish_session(id, session.counters.snapshot());
        log::info!("Metering stopped: session {}", id);
    }
}

impl<S: SampleSource> AudioMeter for Meter<S> {
    fn sample_period(&self) -> Duration {
        self.sample_period
    }

    fn begin_metering(&mut self, callback: LevelCallback) -> Result<()> {
        let id = Uuid::new_v4();
        self.dispatch(MeterEvent::Begin { id }, Some(callback))
    }

    fn end_metering(&mut self) {
        if let Err(e) = self.dispatch(MeterEvent::End, None) {
            log::warn!("End metering: {}", e);
        }
    }

    fn is_metering(&self) -> bool {
        self.state.is_metering()
    }
}

impl<S: SampleSource> Drop for Meter<S> {
    fn drop(&mut self) {
        if self.state.is_metering() {
            log::debug!("Meter dropped while metering, ending session");
            self.end_metering();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SignalSource;

    #[test]
    fn test_zero_period_rejected() {
        let result = Meter::new(Duration::ZERO, SignalSource::silence());
        assert!(matches!(result, Err(MeterError::InvalidSamplePeriod)));
    }

    #[test]
    fn test_period_limit() {
        assert!(Meter::new(MAX_SAMPLE_PERIOD, SignalSource::silence()).is_ok());

        let just_over = MAX_SAMPLE_PERIOD + Duration::from_nanos(1);
        let result = Meter::new(just_over, SignalSource::silence());
        assert!(matches!(result, Err(MeterError::SamplePeriodTooLong(p)) if p == just_over));

        let huge = Duration::from_secs(u64::MAX / 4);
        let result = Meter::new(huge, SignalSource::silence());
        assert!(matches!(result, Err(MeterError::SamplePeriodTooLong(_))));
    }

    #[test]
    fn test_longest_period_begins_and_ends() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap();

        let mut meter = Meter::new(MAX_SAMPLE_PERIOD, SignalSource::constant(0.5))
            .unwrap()
            .with_runtime(runtime.handle().clone());

        meter.begin_metering(Box::new(|_| {})).unwrap();
        assert!(meter.is_metering());
        std::thread::sleep(Duration::from_millis(50));
        meter.end_metering();

        assert!(!meter.is_metering());
        let history = meter.session_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].readings, 0);
        assert!(history[0].samples > 0);
    }

    #[test]
    fn test_new_meter_is_idle() {
        let meter = Meter::new(Duration::from_millis(50), SignalSource::silence()).unwrap();
        assert!(!meter.is_metering());
        assert_eq!(meter.sample_period(), Duration::from_millis(50));
        assert_eq!(meter.session_id(), None);
    }

    #[test]
    fn test_end_without_begin_is_noop() {
        let mut meter = Meter::new(Duration::from_millis(50), SignalSource::silence()).unwrap();
        meter.end_metering();
        meter.end_metering();
        assert!(!meter.is_metering());
        assert_eq!(meter.metrics_summary().total_sessions, 0);
    }

    #[test]
    fn test_begin_without_runtime_fails() {
        let mut meter = Meter::new(Duration::from_millis(50), SignalSource::silence()).unwrap();
        let result = meter.begin_metering(Box::new(|_| {}));
        assert!(matches!(result, Err(MeterError::NoRuntime)));
        assert!(!meter.is_metering());
        assert_eq!(meter.metrics_summary().failed_starts, 1);
        assert_eq!(meter.metrics_summary().total_sessions, 0);
    }

    #[test]
    fn test_from_settings_applies_level_settings() {
        let settings = MeterSettings {
            sample_period_ms: 20,
            smoothing: 1.0,
            floor_db: -80.0,
            ..MeterSettings::default()
        };
        let meter = Meter::from_settings(&settings, SignalSource::silence()).unwrap();
        assert_eq!(meter.sample_period(), Duration::from_millis(20));
        assert_eq!(meter.level_settings().floor_db, -80.0);
        assert_eq!(meter.level_settings().smoothing, 1.0);
    }

    #[test]
    fn test_explicit_runtime_outside_async_context() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap();

        let mut meter = Meter::new(Duration::from_millis(10), SignalSource::constant(0.5))
            .unwrap()
            .with_runtime(runtime.handle().clone());

        let mut rx = meter.begin_metering_channel().unwrap();
        assert!(meter.is_metering());
        std::thread::sleep(Duration::from_millis(100));
        meter.end_metering();
        assert!(!meter.is_metering());

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert!(count > 0, "expected readings from the explicit runtime");
        assert_eq!(meter.session_history().len(), 1);
    }
}
