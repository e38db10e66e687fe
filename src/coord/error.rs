use thiserror::Error;

use crate::coord::core::ProcessId;

/// Every way a protocol step, a wire record or an operator command can fail.
///
/// None of these are fatal: the runtime logs them and keeps processing events.
#[derive(Debug, Error)]
pub enum CoordError {
    /// A record on a channel could not be decoded
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A record decoded fine but carries a tag the running protocol does not know
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),

    /// An operator command that is not valid in the current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Send attempted on a link that is currently down
    #[error("peer {0} is unreachable")]
    PeerUnreachable(ProcessId),

    /// Acknowledgement or reply for something no longer tracked
    #[error("stale message: {0}")]
    StaleMessage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoordError {
    /// Shorthand used by the state machines when rejecting operator commands
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperation(reason.into())
    }

    /// Shorthand for discarding late acknowledgements
    pub fn stale(reason: impl Into<String>) -> Self {
        Self::StaleMessage(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            CoordError::PeerUnreachable(3).to_string(),
            "peer 3 is unreachable"
        );
        assert_eq!(
            CoordError::UnknownMessageType("FOO".to_string()).to_string(),
            "unknown message type `FOO`"
        );
        assert_eq!(
            CoordError::invalid("resource r1 is not HELD").to_string(),
            "invalid operation: resource r1 is not HELD"
        );
    }
}
