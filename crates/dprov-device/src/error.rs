//! # Channel Error Types

use std::time::Duration;

use dprov_core::ErrorClass;
use thiserror::Error;

/// Errors from the stub loader collaborator.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// The loader program could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program that was invoked.
        program: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The loader ran but reported failure.
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        /// Program that was invoked.
        program: String,
        /// Exit status as reported by the OS.
        status: String,
        /// Trimmed standard error output.
        stderr: String,
    },

    /// The stub image does not exist.
    #[error("stub image not found: {0}")]
    MissingImage(String),
}

/// Errors raised by the device command channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The serial port could not be opened.
    #[error("cannot open serial port {port}: {reason}")]
    Open {
        /// Port name.
        port: String,
        /// Reason reported by the transport.
        reason: String,
    },

    /// The command-interpreter stub could not be uploaded.
    #[error("stub upload to {port} failed: {source}")]
    StubLoad {
        /// Port name.
        port: String,
        /// Loader failure.
        #[source]
        source: LoaderError,
    },

    /// Read or write on an open transport failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The device did not respond in time.
    #[error("timed out after {after:?} waiting for {waiting_for}")]
    Timeout {
        /// What the channel was waiting for.
        waiting_for: String,
        /// Elapsed budget.
        after: Duration,
    },

    /// The secure element answered a command with a non-ok status.
    #[error("command `{command}` failed: {status}")]
    Command {
        /// Command name.
        command: String,
        /// Status text from the device.
        status: String,
    },

    /// A read command was issued before a successful `init`.
    #[error("command `{command}` rejected: secure element not initialized")]
    NotInitialized {
        /// The rejected command.
        command: String,
    },

    /// Operation is not valid in the current channel state.
    #[error("invalid channel transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The device response could not be understood.
    #[error("malformed response to `{command}`: {reason}")]
    Protocol {
        /// Command whose response was malformed.
        command: String,
        /// Description of the problem.
        reason: String,
    },

    /// The channel was already closed.
    #[error("channel is closed")]
    Closed,

    /// The operator cancelled the session.
    #[error("cancelled")]
    Cancelled,
}

impl ChannelError {
    /// Error classification.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Open { .. } | Self::StubLoad { .. } | Self::Transport(_) | Self::Closed => {
                ErrorClass::Transport
            }
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::Command { .. }
            | Self::NotInitialized { .. }
            | Self::InvalidTransition { .. }
            | Self::Protocol { .. } => ErrorClass::Command,
            Self::Cancelled => ErrorClass::Cancelled,
        }
    }
}
