//! Sequencer lifecycle state machine.
//!
//! Phase transitions follow the dispatcher lifecycle:
//! IDLE → RUNNING → TERMINATING → STOPPED
//!
//! IDLE → TERMINATING is allowed so a session that fails during setup can
//! release its services without ever dispatching a tick.

use crate::error::{SeqError, SeqResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phases of the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SequencerPhase {
    /// Timer armed (or about to be); no tick dispatched yet.
    #[default]
    Idle,
    /// Ticks are being dispatched and releases posted.
    Running,
    /// Timer disarmed, abort flags set, final releases posted.
    Terminating,
    /// All services joined.
    Stopped,
}

impl fmt::Display for SequencerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Running => write!(f, "RUNNING"),
            Self::Terminating => write!(f, "TERMINATING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

impl SequencerPhase {
    /// Check if a transition to `target` is valid from the current phase.
    #[must_use]
    pub fn can_transition_to(&self, target: SequencerPhase) -> bool {
        use SequencerPhase::{Idle, Running, Stopped, Terminating};

        matches!(
            (self, target),
            (Idle, Running)
                | (Running, Terminating)
                | (Terminating, Stopped)
                // Setup failed before the first tick
                | (Idle, Terminating)
        )
    }
}

/// Phase tracker that rejects out-of-order transitions.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: SequencerPhase,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a new state machine starting in IDLE.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: SequencerPhase::Idle,
        }
    }

    /// Get the current phase.
    #[must_use]
    pub fn phase(&self) -> SequencerPhase {
        self.current
    }

    /// Attempt a phase transition.
    ///
    /// # Errors
    ///
    /// Returns [`SeqError::InvalidStateTransition`] if `target` is not
    /// reachable from the current phase.
    pub fn transition(&mut self, target: SequencerPhase) -> SeqResult<()> {
        if self.current.can_transition_to(target) {
            self.current = target;
            Ok(())
        } else {
            Err(SeqError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }
}
