use thiserror::Error;

/// Sequencer error types covering setup, planning, and shutdown failures.
///
/// Wait interruptions are retried where they happen and tick overruns are
/// counted in [`crate::metrics::DispatchMetrics`]; neither appears here.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SeqError {
    /// Token primitive, timer, or thread creation failed, or the
    /// configuration cannot produce a runnable session.
    #[error("initialization error: {0}")]
    Initialization(String),

    /// The fixed-priority real-time policy or CPU affinity could not be applied.
    #[error("scheduling privilege error: {0}")]
    SchedulingPrivilege(String),

    /// The scheduling plan cannot be built from the configured services.
    #[error("plan error: {0}")]
    Plan(String),

    /// Service threads did not exit within the join window.
    #[error("shutdown timeout: {pending} service(s) still running after {timeout_ms}ms")]
    ShutdownTimeout {
        /// Number of services that had not exited.
        pending: usize,
        /// Join window in milliseconds.
        timeout_ms: u64,
    },

    /// Invalid sequencer phase transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source phase.
        from: String,
        /// Attempted target phase.
        to: String,
    },
}

impl SeqError {
    /// Returns true for errors that abort a run before the timer is armed.
    #[must_use]
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            Self::Initialization(_) | Self::SchedulingPrivilege(_) | Self::Plan(_)
        )
    }
}

/// Convenience type alias for sequencer operations.
pub type SeqResult<T> = Result<T, SeqError>;
