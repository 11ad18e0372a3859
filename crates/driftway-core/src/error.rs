//! Error types for the Driftway signaling protocol

use thiserror::Error;

/// WebSocket close code for a policy violation (missing or invalid token)
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// WebSocket close code for an unexpected server-side failure
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Signaling-level errors
///
/// `AuthenticationRejected` and `ServiceUnavailable` refuse a connection and
/// `StaleConnection` ends one; every other variant is reported to the
/// requesting peer or logged and the connection carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("identity service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("join attempts rate limited")]
    RateLimited,

    #[error("invalid pair key")]
    InvalidKey,

    #[error("public room {0} does not exist")]
    InvalidRoom(String),

    #[error("no heartbeat for {0} ms")]
    StaleConnection(u64),

    #[error("connection is closing")]
    ConnectionClosed,

    #[error("websocket fallback relay is disabled")]
    RelayUnavailable,

    #[error("random number generator failed: {0}")]
    Entropy(String),
}

impl From<getrandom::Error> for SignalError {
    fn from(e: getrandom::Error) -> Self {
        SignalError::Entropy(e.to_string())
    }
}

impl SignalError {
    /// WebSocket close code to use when this error ends a connection
    pub fn close_code(&self) -> Option<u16> {
        match self {
            SignalError::AuthenticationRejected(_) => Some(CLOSE_POLICY_VIOLATION),
            SignalError::ServiceUnavailable(_) | SignalError::Entropy(_) => {
                Some(CLOSE_INTERNAL_ERROR)
            }
            _ => None,
        }
    }

    /// Close reason shown to the client; internal details stay in the log
    pub fn close_reason(&self) -> &'static str {
        match self {
            SignalError::AuthenticationRejected(_) => "Authentication required",
            SignalError::StaleConnection(_) => "Connection timed out",
            _ => "Internal server error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        assert_eq!(
            SignalError::AuthenticationRejected("expired".into()).close_code(),
            Some(CLOSE_POLICY_VIOLATION)
        );
        assert_eq!(
            SignalError::ServiceUnavailable("ldap down".into()).close_code(),
            Some(CLOSE_INTERNAL_ERROR)
        );
        assert_eq!(SignalError::RelayUnavailable.close_code(), None);
        assert_eq!(SignalError::ConnectionClosed.close_code(), None);
    }

    #[test]
    fn test_close_reasons_hide_details() {
        let err = SignalError::ServiceUnavailable("connection refused 10.0.0.5:389".into());
        assert_eq!(err.close_reason(), "Internal server error");
        assert_eq!(
            SignalError::AuthenticationRejected("ExpiredSignature".into()).close_reason(),
            "Authentication required"
        );
    }

    #[test]
    fn test_error_display() {
        let err = SignalError::InvalidRoom("abcde".into());
        assert_eq!(err.to_string(), "public room abcde does not exist");
    }
}
