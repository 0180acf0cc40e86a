//! Metrics collection for metering sessions
//!
//! Tracks duration, reading counts, throughput and errors for each
//! begin/end cycle of a meter. Used for diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;
use uuid::Uuid;

use crate::audio::CounterSnapshot;

/// Maximum number of completed sessions to retain in history
const MAX_SESSION_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Metrics for a completed metering session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Number of callback invocations
    pub readings: u64,
    /// Sample chunks received from the source
    pub chunks: u64,
    pub samples: u64,
    /// Chunks dropped because the emitter fell behind
    pub chunks_dropped: u64,
    pub last_level: Option<f64>,
    pub max_level: Option<f64>,
    /// Stream errors reported by the source
    pub source_errors: u64,
    /// Description of the source that fed the session
    pub source: String,
}

/// Summary statistics across all sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_sessions: u64,
    pub failed_starts: u64,
    pub total_readings: u64,
    /// Average readings per completed session in history
    pub avg_readings_per_session: u64,
    /// Average session length (ms) across completed sessions in history
    pub avg_duration_ms: u64,
    pub total_chunks_dropped: u64,
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    /// Category of error (e.g., "start", "source")
    pub error_type: String,
    pub message: String,
    pub session_id: Option<Uuid>,
}

/// Internal state for tracking an in-progress session
struct SessionInProgress {
    session_id: Uuid,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    source: String,
}

/// Collects and stores metrics for metering sessions
pub struct MetricsCollector {
    /// History of completed sessions (newest first)
    history: VecDeque<SessionMetrics>,
    /// History of errors (newest first)
    errors: VecDeque<ErrorRecord>,
    current: Option<SessionInProgress>,
    total_sessions: u64,
    failed_starts: u64,
    total_readings: u64,
    total_chunks_dropped: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SESSION_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current: None,
            total_sessions: 0,
            failed_starts: 0,
            total_readings: 0,
            total_chunks_dropped: 0,
        }
    }

    /// Start tracking a new session
    pub fn start_session(&mut self, session_id: Uuid, source: String) {
        if let Some(old) = self.current.take() {
            log::warn!(
                "Metrics: discarding unfinished session {} to start {}",
                old.session_id,
                session_id
            );
        }

        log::debug!("Metrics: starting session {}", session_id);
        self.current = Some(SessionInProgress {
            session_id,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            source,
        });
        self.total_sessions += 1;
    }

    /// Finish the current session with the counters it accumulated
    pub fn finish_session(&mut self, session_id: Uuid, counters: CounterSnapshot) {
        let session = match self.current.take() {
            Some(s) if s.session_id == session_id => s,
            other => {
                log::warn!("Metrics: finish for unknown session {}", session_id);
                self.current = other;
                return;
            }
        };

        let metrics = SessionMetrics {
            session_id,
            started_at: session.started_at_utc,
            duration_ms: session.started_at.elapsed().as_millis() as u64,
            readings: counters.readings,
            chunks: counters.chunks,
            samples: counters.samples,
            chunks_dropped: counters.chunks_dropped,
            last_level: counters.last_level,
            max_level: counters.max_level,
            source_errors: counters.source_errors,
            source: session.source,
        };

        if let Some(message) = counters.last_source_error {
            self.record_error(
                "source".to_string(),
                format!("{} stream error(s), last: {}", counters.source_errors, message),
                Some(session_id),
            );
        }

        log::info!(
            "Metrics: session {} finished - {}ms, {} readings, {} chunks ({} dropped)",
            metrics.session_id,
            metrics.duration_ms,
            metrics.readings,
            metrics.chunks,
            metrics.chunks_dropped
        );

        self.total_readings += metrics.readings;
        self.total_chunks_dropped += metrics.chunks_dropped;

        self.history.push_front(metrics);
        while self.history.len() > MAX_SESSION_HISTORY {
            self.history.pop_back();
        }
    }

    /// Record a session that never started.
    /// A session already registered under `session_id` is withdrawn from the totals.
    pub fn start_failed(&mut self, session_id: Uuid, message: String) {
        if self
            .current
            .as_ref()
            .map(|s| s.session_id == session_id)
            .unwrap_or(false)
        {
            self.current = None;
            self.total_sessions = self.total_sessions.saturating_sub(1);
        }
        self.failed_starts += 1;
        self.record_error("start".to_string(), message, Some(session_id));
    }

    /// Record an error (not necessarily tied to a session)
    pub fn record_error(&mut self, error_type: String, message: String, session_id: Option<Uuid>) {
        let error = ErrorRecord {
            timestamp: Utc::now(),
            error_type,
            message,
            session_id,
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let count = self.history.len() as u64;
        let (avg_readings, avg_duration) = if count > 0 {
            let readings: u64 = self.history.iter().map(|s| s.readings).sum();
            let duration: u64 = self.history.iter().map(|s| s.duration_ms).sum();
            (readings / count, duration / count)
        } else {
            (0, 0)
        };

        MetricsSummary {
            total_sessions: self.total_sessions,
            failed_starts: self.failed_starts,
            total_readings: self.total_readings,
            avg_readings_per_session: avg_readings,
            avg_duration_ms: avg_duration,
            total_chunks_dropped: self.total_chunks_dropped,
            last_error: self.errors.front().cloned(),
        }
    }

    /// Completed sessions, newest first
    pub fn history(&self) -> Vec<SessionMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Errors, newest first
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    #[cfg(test)]
    pub fn is_active_session(&self, session_id: Uuid) -> bool {
        self.current
            .as_ref()
            .map(|s| s.session_id == session_id)
            .unwrap_or(false)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(readings: u64) -> CounterSnapshot {
        CounterSnapshot {
            readings,
            chunks: readings * 2,
            samples: readings * 960,
            chunks_dropped: 1,
            last_level: Some(-20.0),
            max_level: Some(-6.0),
            source_errors: 0,
            last_source_error: None,
        }
    }

    #[test]
    fn test_new_collector_is_empty() {
        let collector = MetricsCollector::new();
        let summary = collector.summary();
        assert_eq!(summary.total_sessions, 0);
        assert_eq!(summary.total_readings, 0);
        assert!(summary.last_error.is_none());
        assert!(collector.history().is_empty());
        assert!(collector.errors().is_empty());
    }

    #[test]
    fn test_session_tracking() {
        let mut collector = MetricsCollector::new();
        let id = Uuid::new_v4();

        collector.start_session(id, "silence".to_string());
        assert!(collector.is_active_session(id));
        std::thread::sleep(std::time::Duration::from_millis(10));
        collector.finish_session(id, counters(5));
        assert!(!collector.is_active_session(id));

        let history = collector.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].readings, 5);
        assert_eq!(history[0].max_level, Some(-6.0));
        assert_eq!(history[0].source, "silence");
        assert!(history[0].duration_ms >= 10);

        let summary = collector.summary();
        assert_eq!(summary.total_sessions, 1);
        assert_eq!(summary.total_readings, 5);
        assert_eq!(summary.avg_readings_per_session, 5);
        assert_eq!(summary.total_chunks_dropped, 1);
    }

    #[test]
    fn test_finish_for_other_session_is_ignored() {
        let mut collector = MetricsCollector::new();
        let id = Uuid::new_v4();
        collector.start_session(id, "silence".to_string());
        collector.finish_session(Uuid::new_v4(), counters(3));

        assert!(collector.is_active_session(id));
        assert!(collector.history().is_empty());
    }

    #[test]
    fn test_start_failure_recorded() {
        let mut collector = MetricsCollector::new();
        let id = Uuid::new_v4();
        collector.start_session(id, "default input device".to_string());
        collector.start_failed(id, "No audio input device found".to_string());

        assert!(!collector.is_active_session(id));
        let summary = collector.summary();
        assert_eq!(summary.failed_starts, 1);
        assert_eq!(summary.total_sessions, 0);
        let err = summary.last_error.unwrap();
        assert_eq!(err.error_type, "start");
        assert_eq!(err.session_id, Some(id));
    }

    #[test]
    fn test_failure_without_session_keeps_totals() {
        let mut collector = MetricsCollector::new();
        let running = Uuid::new_v4();
        collector.start_session(running, "silence".to_string());
        collector.finish_session(running, counters(2));

        collector.start_failed(Uuid::new_v4(), "No tokio runtime".to_string());

        let summary = collector.summary();
        assert_eq!(summary.total_sessions, 1);
        assert_eq!(summary.failed_starts, 1);
    }

    #[test]
    fn test_source_errors_recorded_on_finish() {
        let mut collector = MetricsCollector::new();
        let id = Uuid::new_v4();
        collector.start_session(id, "default input device".to_string());

        let mut snapshot = counters(4);
        snapshot.source_errors = 3;
        snapshot.last_source_error = Some("buffer overrun".to_string());
        collector.finish_session(id, snapshot);

        assert_eq!(collector.history()[0].source_errors, 3);
        let errors = collector.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, "source");
        assert_eq!(errors[0].session_id, Some(id));
        assert!(errors[0].message.contains("buffer overrun"));
    }

    #[test]
    fn test_clean_session_records_no_error() {
        let mut collector = MetricsCollector::new();
        let id = Uuid::new_v4();
        collector.start_session(id, "silence".to_string());
        collector.finish_session(id, counters(1));
        assert!(collector.errors().is_empty());
    }

    #[test]
    fn test_history_limit() {
        let mut collector = MetricsCollector::new();
        for i in 0..(MAX_SESSION_HISTORY + 10) {
            let id = Uuid::new_v4();
            collector.start_session(id, "signal".to_string());
            collector.finish_session(id, counters(i as u64));
        }

        let history = collector.history();
        assert_eq!(history.len(), MAX_SESSION_HISTORY);
        // Newest first
        assert!(history[0].readings > history[MAX_SESSION_HISTORY - 1].readings);
    }

    #[test]
    fn test_error_limit() {
        let mut collector = MetricsCollector::new();
        for i in 0..(MAX_ERROR_HISTORY + 5) {
            collector.record_error("source".to_string(), format!("error {}", i), None);
        }
        assert_eq!(collector.errors().len(), MAX_ERROR_HISTORY);
        assert_eq!(collector.errors()[0].message, format!("error {}", MAX_ERROR_HISTORY + 4));
    }
}
