use thiserror::Error;

/// Errors produced by the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("tls error: {0}")]
    Tls(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("connection closed")]
    Closed,

    #[error("lease error: {0}")]
    Lease(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Whether the failure is a connectivity problem worth retrying.
    ///
    /// Authentication, routing and configuration problems are not: the
    /// offending connection or entry is rejected instead.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::Tls(_)
                | RelayError::Transport(_)
                | RelayError::Broker(_)
                | RelayError::Timeout(_)
                | RelayError::Closed
                | RelayError::Lease(_)
                | RelayError::Io(_)
        )
    }
}

impl From<ciborium::de::Error<std::io::Error>> for RelayError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        RelayError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for RelayError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        RelayError::Codec(e.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_errors_are_transient() {
        assert!(RelayError::Transport("reset".into()).is_transient());
        assert!(RelayError::Timeout("ack".into()).is_transient());
        assert!(RelayError::Closed.is_transient());
    }

    #[test]
    fn rejections_are_not_transient() {
        assert!(!RelayError::AuthFailed("untrusted".into()).is_transient());
        assert!(!RelayError::QueueNotFound("p2p.inbound.x".into()).is_transient());
        assert!(!RelayError::Config("bad target".into()).is_transient());
    }
}
