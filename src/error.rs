//! Error taxonomy shared by every layer of the client.
//!
//! Three kinds of failure reach callers: the socket could not carry the
//! exchange, the agent answered with something unusable (or an explicit
//! error), or a polled remote command never exited.

use std::fmt;

/// Classification of a [`QgaError`], for callers that only care about the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Socket missing, refused, reset or timed out.
    Connection,
    /// Unparseable reply or an error reply from the agent.
    Protocol,
    /// Poll budget exhausted before the remote command exited.
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connection => "connection",
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Error returned by every client operation.
#[derive(Debug, thiserror::Error)]
pub enum QgaError {
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

impl QgaError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

pub type QgaResult<T> = std::result::Result<T, QgaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(QgaError::connection("x").kind(), ErrorKind::Connection);
        assert_eq!(QgaError::protocol("x").kind(), ErrorKind::Protocol);
        assert_eq!(QgaError::timeout("x").kind(), ErrorKind::Timeout);
    }

    #[test]
    fn io_error_is_kept_as_source() {
        let err = QgaError::io(
            "failed to send request",
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"),
        );
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("pipe closed"));
        assert_eq!(err.to_string(), "connection error: failed to send request");
    }

    #[test]
    fn protocol_message_is_verbatim() {
        let err = QgaError::protocol("agent error: command not found");
        assert!(err.to_string().contains("command not found"));
        assert_eq!(err.kind().to_string(), "protocol");
    }
}
