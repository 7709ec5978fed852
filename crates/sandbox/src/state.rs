//! Session lifecycle state machine.
//!
//! ```text
//! UNINITIALIZED ──start──▶ STARTING ──▶ READY ◀──▶ EXECUTING
//!                              ▲           │
//!          STOPPED / ERROR ────┘           └──stop──▶ STOPPING ──▶ STOPPED
//! ```
//!
//! `ERROR` is entered from any state when the substrate is gone. The machine
//! only guards transitions; the session drives the backend between them.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::stream::{AbortHandle, AbortRegistration};

use codebox_core::{Error, Result, SessionState};

struct Inner {
    state: SessionState,
    /// Bumped whenever a new execution begins or an in-flight one is
    /// forcibly cancelled, so stale guards cannot touch the state.
    generation: u64,
    in_flight: Option<AbortHandle>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

/// How a restart should be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RestartPlan {
    /// Reset the interpreter, keep the substrate.
    InPlace,
    /// The substrate is broken; release and start again.
    Cold,
}

pub(crate) struct StateMachine {
    inner: Mutex<Inner>,
}

impl StateMachine {
    pub(crate) fn new() -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: SessionState::Uninitialized,
                generation: 0,
                in_flight: None,
                created_at: now,
                last_activity: now,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn state(&self) -> SessionState {
        self.lock().state
    }

    pub(crate) fn set(&self, state: SessionState) {
        let mut inner = self.lock();
        tracing::debug!(from = %inner.state, to = %state, "Session state transition");
        inner.state = state;
        inner.last_activity = Utc::now();
    }

    pub(crate) fn touch(&self) {
        self.lock().last_activity = Utc::now();
    }

    pub(crate) fn created_at(&self) -> DateTime<Utc> {
        self.lock().created_at
    }

    pub(crate) fn last_activity(&self) -> DateTime<Utc> {
        self.lock().last_activity
    }

    /// Returns `false` when the session is already live and there is
    /// nothing to do.
    pub(crate) fn begin_start(&self) -> Result<bool> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Ready | SessionState::Executing => Ok(false),
            SessionState::Uninitialized | SessionState::Stopped | SessionState::Error => {
                inner.state = SessionState::Starting;
                Ok(true)
            }
            state @ (SessionState::Starting | SessionState::Stopping) => Err(Error::InvalidState {
                operation: "start",
                state,
            }),
        }
    }

    /// Claim the single execution slot.
    pub(crate) fn begin_execute(
        self: &Arc<Self>,
        session_id: &str,
    ) -> Result<(ExecutionGuard, AbortRegistration)> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Ready => {}
            SessionState::Executing => return Err(Error::SessionBusy(session_id.to_string())),
            SessionState::Stopped => {
                return Err(Error::SessionClosed(format!(
                    "session {} has been stopped",
                    session_id
                )))
            }
            state => {
                return Err(Error::InvalidState {
                    operation: "execute",
                    state,
                })
            }
        }

        let (handle, registration) = AbortHandle::new_pair();
        inner.generation += 1;
        inner.state = SessionState::Executing;
        inner.in_flight = Some(handle);
        inner.last_activity = Utc::now();

        let guard = ExecutionGuard {
            machine: Arc::clone(self),
            generation: inner.generation,
        };
        Ok((guard, registration))
    }

    /// Cancel any in-flight execution and move to `STARTING`.
    pub(crate) fn begin_restart(&self) -> Result<RestartPlan> {
        let mut inner = self.lock();
        let plan = match inner.state {
            SessionState::Ready | SessionState::Executing => RestartPlan::InPlace,
            SessionState::Error => RestartPlan::Cold,
            state => {
                return Err(Error::InvalidState {
                    operation: "restart",
                    state,
                })
            }
        };
        Self::cancel_in_flight(&mut inner);
        inner.state = SessionState::Starting;
        Ok(plan)
    }

    /// Returns `false` when there is no substrate left to release.
    pub(crate) fn begin_stop(&self) -> bool {
        let mut inner = self.lock();
        Self::cancel_in_flight(&mut inner);
        match inner.state {
            SessionState::Stopped => false,
            SessionState::Uninitialized => {
                inner.state = SessionState::Stopped;
                false
            }
            _ => {
                inner.state = SessionState::Stopping;
                true
            }
        }
    }

    /// Operations that need a live substrate but not the execution slot.
    pub(crate) fn check_usable(&self, operation: &'static str, session_id: &str) -> Result<()> {
        match self.state() {
            SessionState::Ready | SessionState::Executing => Ok(()),
            SessionState::Stopped => Err(Error::SessionClosed(format!(
                "session {} has been stopped",
                session_id
            ))),
            state => Err(Error::InvalidState { operation, state }),
        }
    }

    fn cancel_in_flight(inner: &mut Inner) {
        if let Some(handle) = inner.in_flight.take() {
            handle.abort();
            inner.generation += 1;
        }
    }
}

/// Holds the execution slot. Dropping it returns the session to `READY`
/// unless a restart or stop has taken over in the meantime.
pub(crate) struct ExecutionGuard {
    machine: Arc<StateMachine>,
    generation: u64,
}

impl ExecutionGuard {
    /// The substrate died under this execution.
    pub(crate) fn fault(self) {
        let mut inner = self.machine.lock();
        if inner.generation == self.generation {
            inner.in_flight = None;
            inner.state = SessionState::Error;
            inner.last_activity = Utc::now();
        }
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        let mut inner = self.machine.lock();
        if inner.generation == self.generation && inner.state == SessionState::Executing {
            inner.in_flight = None;
            inner.state = SessionState::Ready;
            inner.last_activity = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> Arc<StateMachine> {
        let machine = StateMachine::new();
        assert!(machine.begin_start().unwrap());
        machine.set(SessionState::Ready);
        machine
    }

    #[test]
    fn test_single_execution_slot() {
        let machine = ready();
        let (guard, _reg) = machine.begin_execute("s1").unwrap();
        assert_eq!(machine.state(), SessionState::Executing);

        let busy = machine.begin_execute("s1");
        assert!(matches!(busy, Err(Error::SessionBusy(ref id)) if id == "s1"));

        drop(guard);
        assert_eq!(machine.state(), SessionState::Ready);
        assert!(machine.begin_execute("s1").is_ok());
    }

    #[test]
    fn test_start_is_idempotent_when_live() {
        let machine = ready();
        assert!(!machine.begin_start().unwrap());
        assert_eq!(machine.state(), SessionState::Ready);
    }

    #[test]
    fn test_restart_aborts_in_flight_and_invalidates_guard() {
        let machine = ready();
        let (guard, registration) = machine.begin_execute("s1").unwrap();
        assert_eq!(machine.begin_restart().unwrap(), RestartPlan::InPlace);
        assert!(registration.handle().is_aborted());

        // The stale guard must not flip STARTING back to READY.
        drop(guard);
        assert_eq!(machine.state(), SessionState::Starting);
    }

    #[test]
    fn test_stop_transitions() {
        let machine = StateMachine::new();
        assert!(!machine.begin_stop());
        assert_eq!(machine.state(), SessionState::Stopped);
        assert!(!machine.begin_stop());

        let machine = ready();
        assert!(machine.begin_stop());
        assert_eq!(machine.state(), SessionState::Stopping);
    }

    #[test]
    fn test_execute_after_stop_is_closed() {
        let machine = ready();
        machine.begin_stop();
        machine.set(SessionState::Stopped);
        assert!(matches!(
            machine.begin_execute("s1"),
            Err(Error::SessionClosed(_))
        ));
        assert!(matches!(
            machine.begin_restart(),
            Err(Error::InvalidState { operation: "restart", .. })
        ));
    }

    #[test]
    fn test_fault_moves_to_error() {
        let machine = ready();
        let (guard, _reg) = machine.begin_execute("s1").unwrap();
        guard.fault();
        assert_eq!(machine.state(), SessionState::Error);
        assert_eq!(machine.begin_restart().unwrap(), RestartPlan::Cold);
    }
}
