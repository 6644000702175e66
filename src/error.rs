//! Error types for the supervisor core.
//!
//! Every failure here is recoverable from the host's point of view: the
//! worst case is a supervisor stuck at `Started` whose watchdog eventually
//! reports connection difficulties.

use thiserror::Error;

/// Errors produced by the supervisor and its collaborators.
#[derive(Error, Debug)]
pub enum TorError {
    /// The daemon process could not be spawned.
    #[error("failed to launch tor daemon: {0}")]
    Launch(String),

    /// The control port refused the connection (daemon not yet listening).
    #[error("control port not accepting connections: {0}")]
    Connect(#[source] std::io::Error),

    /// Cookie unreadable or rejected by the daemon.
    #[error("control port authentication failed: {0}")]
    Auth(String),

    /// An asynchronous event line could not be parsed.
    #[error("malformed control event: {0}")]
    EventParse(String),

    /// The daemon refused a SETCONF/RESETCONF.
    #[error("tor rejected configuration: {0}")]
    ConfigRejected(String),

    /// The daemon refused some other command.
    #[error("control command failed: {0}")]
    Command(String),

    /// No authenticated control session is active.
    #[error("no active control session")]
    NoSession,

    /// The control channel closed while a request was outstanding.
    #[error("control connection closed")]
    Disconnected,

    /// A pluggable transport proxy could not be started.
    #[error("transport proxy {name} failed: {reason}")]
    Transport { name: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, TorError>;

impl TorError {
    /// Errors that the deferred connect step should retry after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TorError::Connect(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connect_errors_are_retryable() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(TorError::Connect(refused).is_retryable());
        assert!(!TorError::Auth("bad cookie".into()).is_retryable());
        assert!(!TorError::NoSession.is_retryable());
    }
}
