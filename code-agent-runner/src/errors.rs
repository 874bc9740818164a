//! Failure taxonomy for supervised CLI runs.
//!
//! Every failure carries whatever output the child produced before the
//! fault, so callers can persist partial progress or surface it to users.

use std::time::Duration;
use thiserror::Error;

/// Why a CLI invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureKind {
    /// The main wall-clock deadline elapsed before the child exited.
    #[error("main timeout after {limit_ms}ms")]
    Timeout {
        /// Configured main timeout in milliseconds.
        limit_ms: u64,
    },

    /// No byte arrived on stdout or stderr within the idle window.
    #[error("idle timeout: no output for {limit_ms}ms")]
    IdleTimeout {
        /// Configured idle window in milliseconds.
        limit_ms: u64,
    },

    /// Combined stdout+stderr volume crossed the configured cap.
    #[error("combined output exceeded {limit_bytes} bytes")]
    OutputOverflow {
        /// Configured cap in bytes.
        limit_bytes: u64,
    },

    /// The child could not be started at all.
    #[error("failed to spawn agent CLI: {message}")]
    SpawnFailure {
        /// Underlying OS error, stringified.
        message: String,
    },

    /// The child ran to completion but reported a non-zero exit code.
    #[error("agent CLI exited with code {code}")]
    NonZeroExit {
        /// Exit code, or -1 when the child was killed by a signal.
        code: i32,
    },
}

/// A failed invocation together with the output captured before the fault.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct RunFailure {
    /// What went wrong.
    pub kind: FailureKind,
    /// Stdout captured up to the fault (truncated at the output cap).
    pub stdout: String,
    /// Stderr captured up to the fault.
    pub stderr: String,
    /// Exit code when the child did exit on its own.
    pub exit_code: Option<i32>,
    /// Wall-clock time from spawn to fault.
    pub duration: Duration,
}

impl RunFailure {
    pub(crate) fn spawn(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            kind: FailureKind::SpawnFailure {
                message: message.into(),
            },
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration,
        }
    }

    /// True when the child produced any output before failing.
    ///
    /// Multi-step callers use this to decide between "keep the partial
    /// progress and continue" and "abort, nothing happened".
    pub fn has_output(&self) -> bool {
        !self.stdout.is_empty() || !self.stderr.is_empty()
    }

    /// True when the supervisor killed the child (any of the three timers
    /// or the output cap), as opposed to the child failing on its own.
    pub fn killed_by_supervisor(&self) -> bool {
        matches!(
            self.kind,
            FailureKind::Timeout { .. }
                | FailureKind::IdleTimeout { .. }
                | FailureKind::OutputOverflow { .. }
        )
    }
}
