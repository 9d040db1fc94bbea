//! Stream lifecycle state machine
//!
//! ```text
//!            start               established
//!   Idle ──────────▶ Starting ──────────────▶ Streaming
//!    ▲                 │  │                    │    │
//!    │       rejected/ │  │ stop        stop / │    │ I/O failure
//!    │        failure  ▼  ▼        disconnect  ▼    ▼
//!    │               Error  Stopping ◀─────────┘  Error
//!    │                 │       │
//!    └── reset ────────┘       └──── teardown complete ──▶ Idle
//! ```
//!
//! `Error` leaves only through an explicit `reset` (to `Idle`) or an explicit
//! restart (`begin_start`, to `Starting`). Nothing in this crate restarts
//! automatically after a failure; sessions a peer opens use
//! `begin_start_from_idle`, which never leaves `Error`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::protocol::Receiver;

/// Lifecycle of one engine side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StreamState {
    #[default]
    Idle,
    Starting,
    Streaming,
    Stopping,
    Error,
}

impl StreamState {
    /// Whether `self -> next` is a legal edge
    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Error, Starting)
                | (Starting, Streaming)
                | (Starting, Error)
                | (Starting, Stopping)
                | (Streaming, Stopping)
                | (Streaming, Error)
                | (Stopping, Idle)
                | (Error, Idle)
        )
    }

    /// A session is in flight and another start must be refused
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Streaming | Self::Stopping)
    }
}

/// Derived read model for observers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub receiver: Option<Receiver>,
    pub error: Option<String>,
}

/// The single authoritative `StreamState` of an engine side
///
/// Mutation goes through a mutex so check-and-set is atomic; every accepted
/// transition is published on a watch channel for observers on other threads.
pub struct StreamStateMachine {
    name: &'static str,
    current: Mutex<StreamState>,
    last_error: Mutex<Option<String>>,
    peer: Mutex<Option<Receiver>>,
    tx: watch::Sender<StreamState>,
}

impl StreamStateMachine {
    pub fn new(name: &'static str) -> Self {
        let (tx, _rx) = watch::channel(StreamState::Idle);
        Self {
            name,
            current: Mutex::new(StreamState::Idle),
            last_error: Mutex::new(None),
            peer: Mutex::new(None),
            tx,
        }
    }

    pub fn current(&self) -> StreamState {
        *self.current.lock()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.tx.subscribe()
    }

    /// Attempt a transition, returning an error for illegal edges
    pub fn transition(&self, next: StreamState) -> Result<()> {
        let mut current = self.current.lock();
        let from = *current;
        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition { from, to: next });
        }
        *current = next;
        tracing::debug!(side = self.name, ?from, to = ?next, "State transition");
        self.tx.send_replace(next);
        Ok(())
    }

    /// `Idle | Error -> Starting`; a start while a session is active is refused
    pub fn begin_start(&self) -> Result<()> {
        self.start_from(true)
    }

    /// `Idle -> Starting` only; an `Error` has to be reset first
    pub fn begin_start_from_idle(&self) -> Result<()> {
        self.start_from(false)
    }

    fn start_from(&self, restart_error: bool) -> Result<()> {
        let mut current = self.current.lock();
        let from = *current;
        if from.is_active() {
            return Err(Error::AlreadyActive(from));
        }
        if from == StreamState::Error && !restart_error {
            return Err(Error::InvalidTransition {
                from,
                to: StreamState::Starting,
            });
        }
        *current = StreamState::Starting;
        *self.last_error.lock() = None;
        tracing::debug!(side = self.name, ?from, "State transition -> Starting");
        self.tx.send_replace(StreamState::Starting);
        Ok(())
    }

    pub fn mark_streaming(&self) -> Result<()> {
        self.transition(StreamState::Streaming)
    }

    /// Move to `Error` from `Starting` or `Streaming`, recording the reason
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut current = self.current.lock();
        let from = *current;
        if !from.can_transition_to(StreamState::Error) {
            tracing::debug!(side = self.name, ?from, %reason, "Ignoring failure outside an active session");
            return;
        }
        *current = StreamState::Error;
        tracing::warn!(side = self.name, ?from, %reason, "Stream failed");
        *self.last_error.lock() = Some(reason);
        self.tx.send_replace(StreamState::Error);
    }

    /// Clean teardown: `Starting | Streaming -> Stopping -> Idle`
    ///
    /// Returns false if there was no session to stop.
    pub fn finish_clean(&self) -> bool {
        let mut current = self.current.lock();
        match *current {
            StreamState::Starting | StreamState::Streaming => {
                *current = StreamState::Stopping;
                self.tx.send_replace(StreamState::Stopping);
            }
            StreamState::Stopping => {}
            _ => return false,
        }
        *current = StreamState::Idle;
        *self.peer.lock() = None;
        tracing::debug!(side = self.name, "Teardown complete -> Idle");
        self.tx.send_replace(StreamState::Idle);
        true
    }

    /// Explicit `Error -> Idle`
    pub fn reset(&self) -> Result<()> {
        let mut current = self.current.lock();
        match *current {
            StreamState::Idle => Ok(()),
            StreamState::Error => {
                *current = StreamState::Idle;
                *self.last_error.lock() = None;
                *self.peer.lock() = None;
                self.tx.send_replace(StreamState::Idle);
                Ok(())
            }
            other => Err(Error::InvalidTransition {
                from: other,
                to: StreamState::Idle,
            }),
        }
    }

    pub fn set_peer(&self, peer: Option<Receiver>) {
        *self.peer.lock() = peer;
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        let state = self.current();
        ConnectionState {
            is_connected: state == StreamState::Streaming,
            receiver: self.peer.lock().clone(),
            error: if state == StreamState::Error {
                self.last_error()
            } else {
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_never_jumps_to_streaming() {
        let sm = StreamStateMachine::new("test");
        assert!(matches!(
            sm.mark_streaming(),
            Err(Error::InvalidTransition { .. })
        ));
        assert_eq!(sm.current(), StreamState::Idle);

        sm.begin_start().unwrap();
        sm.mark_streaming().unwrap();
        assert_eq!(sm.current(), StreamState::Streaming);
    }

    #[test]
    fn test_start_while_active_is_rejected() {
        let sm = StreamStateMachine::new("test");
        sm.begin_start().unwrap();
        assert!(matches!(
            sm.begin_start(),
            Err(Error::AlreadyActive(StreamState::Starting))
        ));
        sm.mark_streaming().unwrap();
        assert!(matches!(
            sm.begin_start(),
            Err(Error::AlreadyActive(StreamState::Streaming))
        ));
    }

    #[test]
    fn test_clean_stop_passes_through_stopping() {
        let sm = StreamStateMachine::new("test");
        let mut rx = sm.subscribe();
        sm.begin_start().unwrap();
        sm.mark_streaming().unwrap();
        assert!(sm.finish_clean());
        assert_eq!(sm.current(), StreamState::Idle);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), StreamState::Idle);
        assert!(!sm.finish_clean());
    }

    #[test]
    fn test_error_requires_explicit_reset_or_restart() {
        let sm = StreamStateMachine::new("test");
        sm.begin_start().unwrap();
        sm.fail("connection refused");
        assert_eq!(sm.current(), StreamState::Error);
        assert_eq!(sm.last_error().as_deref(), Some("connection refused"));
        assert!(!sm.finish_clean());
        assert_eq!(sm.current(), StreamState::Error);

        let cs = sm.connection_state();
        assert!(!cs.is_connected);
        assert_eq!(cs.error.as_deref(), Some("connection refused"));

        sm.begin_start().unwrap();
        assert_eq!(sm.current(), StreamState::Starting);
        assert_eq!(sm.last_error(), None);

        sm.fail("again");
        sm.reset().unwrap();
        assert_eq!(sm.current(), StreamState::Idle);
    }

    #[test]
    fn test_start_from_idle_refuses_error() {
        let sm = StreamStateMachine::new("test");
        sm.begin_start_from_idle().unwrap();
        sm.fail("playback unavailable");
        assert!(matches!(
            sm.begin_start_from_idle(),
            Err(Error::InvalidTransition {
                from: StreamState::Error,
                to: StreamState::Starting
            })
        ));
        assert_eq!(sm.current(), StreamState::Error);
        assert_eq!(sm.last_error().as_deref(), Some("playback unavailable"));

        sm.reset().unwrap();
        sm.begin_start_from_idle().unwrap();
        assert_eq!(sm.current(), StreamState::Starting);
    }

    #[test]
    fn test_fail_is_ignored_when_idle() {
        let sm = StreamStateMachine::new("test");
        sm.fail("late error");
        assert_eq!(sm.current(), StreamState::Idle);
    }

    #[test]
    fn test_transition_table() {
        use StreamState::*;
        let all = [Idle, Starting, Streaming, Stopping, Error];
        for from in all {
            for to in all {
                let allowed = from.can_transition_to(to);
                if from == Idle && to == Streaming {
                    assert!(!allowed);
                }
                if from == Error && to == Streaming {
                    assert!(!allowed);
                }
            }
        }
        assert!(Stopping.can_transition_to(Idle));
        assert!(!Stopping.can_transition_to(Starting));
    }
}
