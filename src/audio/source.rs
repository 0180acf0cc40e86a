//! Sample source abstraction
//!
//! A source produces interleaved f32 chunks on its own capture thread and
//! pushes them into a bounded channel read by the level emitter. The
//! capture thread reports startup success or failure through a handshake
//! so `start()` can return errors synchronously.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::audio::emitter::SessionCounters;
use crate::error::{MeterError, Result};

/// Bounded capacity of the sample channel, in chunks
pub const SAMPLE_CHANNEL_CAPACITY: usize = 100;

/// Receiver type for sample chunks
pub type SampleReceiver = mpsc::Receiver<Vec<f32>>;

/// Format of the audio a running source delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Producer side of the sample channel, safe to call from an audio callback.
#[derive(Clone)]
pub struct SampleSender {
    tx: mpsc::Sender<Vec<f32>>,
    counters: Arc<SessionCounters>,
}

impl SampleSender {
    /// Push a chunk without blocking.
    ///
    /// Returns false once the receiving side is gone and the producer should stop.
    /// A full channel drops the chunk.
    pub fn send(&self, chunk: Vec<f32>) -> bool {
        match self.tx.try_send(chunk) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.counters.record_dropped_chunk();
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Record a non-fatal error raised by the source while capturing.
    pub fn report_error(&self, message: impl Into<String>) {
        self.counters.record_source_error(message.into());
    }
}

/// Create the sample channel for one session.
pub fn create_sample_channel(counters: Arc<SessionCounters>) -> (SampleSender, SampleReceiver) {
    let (tx, rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
    (SampleSender { tx, counters }, rx)
}

/// A backend that can feed audio into a meter.
pub trait SampleSource: Send {
    /// Human readable description, used in logs
    fn describe(&self) -> String;

    /// Start producing samples into `tx`.
    /// Capture stops when the returned handle is stopped or dropped.
    fn start(&mut self, tx: SampleSender) -> Result<CaptureHandle>;
}

impl SampleSource for Box<dyn SampleSource> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn start(&mut self, tx: SampleSender) -> Result<CaptureHandle> {
        (**self).start(tx)
    }
}

/// Stop flag observed by a capture thread.
#[derive(Clone)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Park until `deadline` or until stopped. Returns true if stopped.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        loop {
            if self.is_stopped() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::park_timeout(deadline - now);
        }
    }

    /// Park for at most `timeout`. Returns true if stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }
}

/// Used by a capture thread to report whether it started.
pub struct StartupReporter {
    tx: std_mpsc::SyncSender<Result<SourceInfo>>,
}

impl StartupReporter {
    pub fn ready(self, info: SourceInfo) {
        let _ = self.tx.send(Ok(info));
    }

    pub fn fail(self, err: MeterError) {
        let _ = self.tx.send(Err(err));
    }
}

/// Handle to a running capture thread.
/// When dropped, the thread is signalled and joined.
pub struct CaptureHandle {
    info: SourceInfo,
    stopped: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Spawn a named capture thread and wait for it to report startup.
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(StartupReporter, StopSignal) + Send + 'static,
    {
        let stopped = Arc::new(AtomicBool::new(false));
        let signal = StopSignal {
            stopped: stopped.clone(),
        };
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let reporter = StartupReporter { tx: ready_tx };

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(reporter, signal))?;

        match ready_rx.recv() {
            Ok(Ok(info)) => Ok(Self {
                info,
                stopped,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(MeterError::SourceThread)
            }
        }
    }

    pub fn info(&self) -> SourceInfo {
        self.info
    }

    /// Stop capture and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
