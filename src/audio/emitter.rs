//! Level emitter task
//!
//! Runs on the tokio runtime for the lifetime of one metering session:
//! sample chunks are pushed into the level processor as they arrive, and
//! every sample period a reading is computed and handed to the caller's
//! callback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::audio::level::LevelProcessor;
use crate::audio::source::SampleReceiver;

/// Callback receiving one level reading per sample period
pub type LevelCallback = Box<dyn FnMut(f64) + Send + 'static>;

/// Holds the caller's callback for one session.
///
/// `close()` takes the same lock `invoke()` holds while calling out, so once
/// `close()` returns the callback can never run again. Delivered readings are
/// counted under that lock too, keeping the counters in step with the callback.
pub struct CallbackSlot {
    callback: Mutex<Option<LevelCallback>>,
    active: AtomicBool,
    counters: Arc<SessionCounters>,
}

impl CallbackSlot {
    pub fn new(callback: LevelCallback, counters: Arc<SessionCounters>) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
            active: AtomicBool::new(true),
            counters,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<LevelCallback>> {
        // A panicking callback poisons the lock; the slot itself stays usable
        self.callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver a reading. Returns false once the slot has been closed.
    pub fn invoke(&self, value: f64) -> bool {
        let mut guard = self.lock();
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        match guard.as_mut() {
            Some(callback) => {
                callback(value);
                self.counters.record_reading(value);
                true
            }
            None => false,
        }
    }

    /// Deactivate the slot, waiting for an in-flight invocation to finish.
    pub fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        let callback = self.lock().take();
        drop(callback);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Per-session counters shared by the capture side, the emitter and the meter.
#[derive(Default)]
pub struct SessionCounters {
    readings: AtomicU64,
    chunks: AtomicU64,
    samples: AtomicU64,
    chunks_dropped: AtomicU64,
    last_level: AtomicU64,
    max_level: AtomicU64,
    has_level: AtomicBool,
    source_errors: AtomicU64,
    last_source_error: Mutex<Option<String>>,
}

/// Point-in-time copy of `SessionCounters`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterSnapshot {
    pub readings: u64,
    pub chunks: u64,
    pub samples: u64,
    pub chunks_dropped: u64,
    pub last_level: Option<f64>,
    pub max_level: Option<f64>,
    /// Errors reported by the source while capture was running
    pub source_errors: u64,
    pub last_source_error: Option<String>,
}

impl SessionCounters {
    pub fn record_chunk(&self, samples: usize) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(samples as u64, Ordering::Relaxed);
    }

    pub fn record_dropped_chunk(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source_error(&self, message: String) {
        self.source_errors.fetch_add(1, Ordering::Relaxed);
        *self
            .last_source_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(message);
    }

    pub fn record_reading(&self, value: f64) {
        self.readings.fetch_add(1, Ordering::Relaxed);
        self.last_level.store(value.to_bits(), Ordering::Relaxed);

        let first = !self.has_level.swap(true, Ordering::Relaxed);
        if first {
            self.max_level.store(value.to_bits(), Ordering::Relaxed);
            return;
        }
        let _ = self
            .max_level
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                (value > f64::from_bits(bits)).then(|| value.to_bits())
            });
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let has_level = self.has_level.load(Ordering::Relaxed);
        CounterSnapshot {
            readings: self.readings.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            last_level: has_level
                .then(|| f64::from_bits(self.last_level.load(Ordering::Relaxed))),
            max_level: has_level.then(|| f64::from_bits(self.max_level.load(Ordering::Relaxed))),
            source_errors: self.source_errors.load(Ordering::Relaxed),
            last_source_error: self
                .last_source_error
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }
}

/// Run the level emitter for one session.
///
/// This task:
/// 1. Pushes sample chunks into the processor as soon as they arrive
/// 2. Waits one sample period before the first reading
/// 3. On each tick, computes a reading and invokes the callback
/// 4. Exits when stopped or when the callback slot is closed
pub async fn run_level_emitter(
    session_id: Uuid,
    sample_period: Duration,
    mut rx: SampleReceiver,
    mut stop_rx: oneshot::Receiver<()>,
    mut processor: LevelProcessor,
    slot: Arc<CallbackSlot>,
    counters: Arc<SessionCounters>,
) {
    let mut tick = interval_at(Instant::now() + sample_period, sample_period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut source_open = true;

    log::debug!("Level emitter started for session {}", session_id);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => {
                log::debug!("Level emitter received stop signal for session {}", session_id);
                break;
            }
            _ = tick.tick() => {
                // Pick up chunks that arrived in the same instant as the tick
                while source_open {
                    match rx.try_recv() {
                        Ok(chunk) => {
                            counters.record_chunk(chunk.len());
                            processor.push(&chunk);
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            source_ended(session_id, &mut processor);
                            source_open = false;
                        }
                    }
                }

                if !slot.invoke(processor.reading()) {
                    break;
                }
            }
            chunk = rx.recv(), if source_open => {
                match chunk {
                    Some(chunk) => {
                        counters.record_chunk(chunk.len());
                        processor.push(&chunk);
                    }
                    None => {
                        source_ended(session_id, &mut processor);
                        source_open = false;
                    }
                }
            }
        }
    }

    log::debug!("Level emitter stopped for session {}", session_id);
}

fn source_ended(session_id: Uuid, processor: &mut LevelProcessor) {
    log::info!("Sample source for session {} ended", session_id);
    processor.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::level::{LevelMode, LevelScale, LevelSettings};
    use crate::audio::source::{create_sample_channel, SourceInfo, SAMPLE_CHANNEL_CAPACITY};
    use std::sync::atomic::AtomicUsize;

    fn linear_processor() -> LevelProcessor {
        let settings = LevelSettings {
            scale: LevelScale::Linear,
            mode: LevelMode::Average,
            smoothing: 1.0,
            ..LevelSettings::default()
        };
        LevelProcessor::new(
            &settings,
            Duration::from_millis(10),
            SourceInfo {
                sample_rate: 1_000,
                channels: 1,
            },
        )
    }

    #[test]
    fn test_slot_invokes_until_closed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = calls.clone();
        let counters = Arc::new(SessionCounters::default());
        let slot = CallbackSlot::new(
            Box::new(move |_| {
                calls_cb.fetch_add(1, Ordering::SeqCst);
            }),
            counters.clone(),
        );

        assert!(slot.invoke(0.1));
        assert!(slot.invoke(0.2));
        slot.close();
        assert!(!slot.is_active());
        assert!(!slot.invoke(0.3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(counters.snapshot().readings, 2);
        assert_eq!(counters.snapshot().last_level, Some(0.2));
    }

    #[test]
    fn test_counters_track_levels() {
        let counters = SessionCounters::default();
        assert_eq!(counters.snapshot().max_level, None);

        counters.record_reading(-40.0);
        counters.record_reading(-12.5);
        counters.record_reading(-30.0);
        counters.record_chunk(256);

        let snap = counters.snapshot();
        assert_eq!(snap.readings, 3);
        assert_eq!(snap.last_level, Some(-30.0));
        assert_eq!(snap.max_level, Some(-12.5));
        assert_eq!(snap.chunks, 1);
        assert_eq!(snap.samples, 256);
        assert_eq!(snap.source_errors, 0);
        assert_eq!(snap.last_source_error, None);
    }

    #[test]
    fn test_counters_track_source_errors() {
        let counters = SessionCounters::default();
        counters.record_source_error("buffer overrun".to_string());
        counters.record_source_error("device unplugged".to_string());

        let snap = counters.snapshot();
        assert_eq!(snap.source_errors, 2);
        assert_eq!(snap.last_source_error.as_deref(), Some("device unplugged"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emitter_delivers_readings() {
        let counters = Arc::new(SessionCounters::default());
        let (tx, rx) = create_sample_channel(counters.clone());
        let (stop_tx, stop_rx) = oneshot::channel();
        let readings = Arc::new(Mutex::new(Vec::new()));
        let readings_cb = readings.clone();
        let slot = Arc::new(CallbackSlot::new(
            Box::new(move |v| {
                readings_cb.lock().unwrap().push(v);
            }),
            counters.clone(),
        ));

        assert!(tx.send(vec![0.5; 10]));

        let task = tokio::spawn(run_level_emitter(
            Uuid::new_v4(),
            Duration::from_millis(10),
            rx,
            stop_rx,
            linear_processor(),
            slot.clone(),
            counters.clone(),
        ));

        // Nothing is emitted before the first period elapses
        tokio::task::yield_now().await;
        assert!(readings.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(35)).await;
        stop_tx.send(()).unwrap();
        task.await.unwrap();

        let readings = readings.lock().unwrap();
        assert_eq!(readings.len(), 3);
        assert!((readings[0] - 0.5).abs() < 1e-6);
        assert_eq!(counters.snapshot().readings, 3);
        assert_eq!(counters.snapshot().samples, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emitter_exits_when_slot_closed() {
        let counters = Arc::new(SessionCounters::default());
        let (_tx, rx) = create_sample_channel(counters.clone());
        let (_stop_tx, stop_rx) = oneshot::channel();
        let slot = Arc::new(CallbackSlot::new(Box::new(|_| {}), counters.clone()));
        slot.close();

        let task = tokio::spawn(run_level_emitter(
            Uuid::new_v4(),
            Duration::from_millis(10),
            rx,
            stop_rx,
            linear_processor(),
            slot,
            counters.clone(),
        ));

        task.await.unwrap();
        assert_eq!(counters.snapshot().readings, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emitter_reads_zero_after_source_ends() {
        let counters = Arc::new(SessionCounters::default());
        let (tx, rx) = create_sample_channel(counters.clone());
        let (stop_tx, stop_rx) = oneshot::channel();
        let readings = Arc::new(Mutex::new(Vec::new()));
        let readings_cb = readings.clone();
        let slot = Arc::new(CallbackSlot::new(
            Box::new(move |v| {
                readings_cb.lock().unwrap().push(v);
            }),
            counters.clone(),
        ));

        assert!(tx.send(vec![1.0; 10]));
        drop(tx);

        let task = tokio::spawn(run_level_emitter(
            Uuid::new_v4(),
            Duration::from_millis(10),
            rx,
            stop_rx,
            linear_processor(),
            slot,
            counters,
        ));

        tokio::time::sleep(Duration::from_millis(25)).await;
        stop_tx.send(()).unwrap();
        task.await.unwrap();

        let readings = readings.lock().unwrap();
        assert_eq!(readings.len(), 2);
        assert!(readings.iter().all(|&v| v == 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emitter_keeps_up_with_long_periods() {
        let counters = Arc::new(SessionCounters::default());
        let (tx, rx) = create_sample_channel(counters.clone());
        let (stop_tx, stop_rx) = oneshot::channel();
        let readings = Arc::new(Mutex::new(Vec::new()));
        let readings_cb = readings.clone();
        let slot = Arc::new(CallbackSlot::new(
            Box::new(move |v| {
                readings_cb.lock().unwrap().push(v);
            }),
            counters.clone(),
        ));

        let task = tokio::spawn(run_level_emitter(
            Uuid::new_v4(),
            Duration::from_secs(3),
            rx,
            stop_rx,
            linear_processor(),
            slot,
            counters.clone(),
        ));

        // Three channel-fulls of audio within one period; the newest is loud
        let total = SAMPLE_CHANNEL_CAPACITY * 3;
        for i in 0..total {
            let value = if i + 1 == total { 0.5 } else { 0.0 };
            assert!(tx.send(vec![value; 10]));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        stop_tx.send(()).unwrap();
        task.await.unwrap();

        let readings = readings.lock().unwrap();
        assert_eq!(readings.len(), 1);
        assert!((readings[0] - 0.5).abs() < 1e-6, "got {}", readings[0]);
        let snap = counters.snapshot();
        assert_eq!(snap.chunks_dropped, 0);
        assert_eq!(snap.chunks, total as u64);
    }
}
