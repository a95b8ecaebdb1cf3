//! Physical connection state machine, as seen by the cancellation layer

use crate::{Error, Result};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Ready for an operation
    Idle,

    /// An operation is running on the connection
    Executing,

    /// The operation's context fired; the call is still running server-side
    Canceling,

    /// A kill command was dispatched; waiting for the call to drain
    KillPending,

    /// Closed (terminal)
    Closed,
}

impl SessionState {
    /// Check if transition is valid
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, next),
            (Idle, Executing)
                | (Executing, Idle)
                | (Executing, Canceling)
                | (Canceling, KillPending)
                | (Canceling, Idle)
                | (KillPending, Idle)
                | (Idle | Executing | Canceling | KillPending, Closed)
        )
    }

    /// Transition to new state
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                expected: format!("valid transition from {:?}", self),
                actual: format!("{:?}", next),
            });
        }
        *self = next;
        Ok(())
    }

    /// True while an abandoned call is still draining
    pub fn is_draining(&self) -> bool {
        matches!(self, SessionState::Canceling | SessionState::KillPending)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Executing => write!(f, "executing"),
            Self::Canceling => write!(f, "canceling"),
            Self::KillPending => write!(f, "kill_pending"),
            Self::Closed => write!(f, "closed"),
        }
    }
}
