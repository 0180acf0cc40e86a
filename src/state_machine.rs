//! State machine for a metering session
//!
//! All transitions go through the `reduce()` function, which returns
//! a new state and a list of effects for the meter to execute.

use std::time::Instant;
use uuid::Uuid;

/// Internal state of a meter.
#[derive(Debug, Clone, Default)]
pub enum MeterState {
    #[default]
    Idle,
    Metering {
        session_id: Uuid,
        started_at: Instant,
    },
}

impl MeterState {
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            MeterState::Idle => None,
            MeterState::Metering { session_id, .. } => Some(*session_id),
        }
    }

    pub fn is_metering(&self) -> bool {
        matches!(self, MeterState::Metering { .. })
    }
}

/// Events that can trigger state transitions.
#[derive(Debug, Clone)]
pub enum MeterEvent {
    /// Caller asked to begin metering (the id names the new session)
    Begin { id: Uuid },
    /// Caller asked to end metering
    End,
    /// The source or emitter for a session could not be started
    StartFailed { id: Uuid, err: String },
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeterEffect {
    StartSession { id: Uuid },
    StopSession { id: Uuid },
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Begin while metering restarts: the old session is stopped before the new one starts
/// - End while idle is a no-op
/// - StartFailed for anything but the current session is ignored
pub fn reduce(state: &MeterState, event: MeterEvent) -> (MeterState, Vec<MeterEffect>) {
    use MeterEffect::*;
    use MeterEvent::*;
    use MeterState::*;

    match (state, event) {
        (Idle, Begin { id }) => (
            Metering {
                session_id: id,
                started_at: Instant::now(),
            },
            vec![StartSession { id }],
        ),
        (Idle, End) => (Idle, vec![]),
        (Idle, StartFailed { .. }) => (Idle, vec![]),

        (Metering { session_id, .. }, Begin { id }) => {
            log::debug!("Restarting metering: session {} -> {}", session_id, id);
            (
                Metering {
                    session_id: id,
                    started_at: Instant::now(),
                },
                vec![StopSession { id: *session_id }, StartSession { id }],
            )
        }
        (Metering { session_id, .. }, End) => (Idle, vec![StopSession { id: *session_id }]),
        (Metering { session_id, .. }, StartFailed { id, err }) if *session_id == id => {
            log::warn!("Session {} failed to start: {}", id, err);
            (Idle, vec![])
        }
        (Metering { .. }, StartFailed { id, .. }) => {
            log::debug!("Ignoring stale start failure for session {}", id);
            (state.clone(), vec![])
        }
    }
}
