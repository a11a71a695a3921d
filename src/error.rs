//! Engine error taxonomy

use thiserror::Error;

/// Engine result type
pub type Result<T> = std::result::Result<T, SipError>;

#[derive(Error, Debug, Clone)]
pub enum SipError {
    /// A user profile URI is missing its user or host part.
    #[error("Malformed profile: {0}")]
    MalformedProfile(String),

    /// Inbound bytes did not parse as a SIP message. Dropped, never retried.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    /// No final response within the bounded retransmission schedule.
    #[error("Transaction timed out")]
    Timeout,

    /// Challenge loop bound exceeded.
    #[error("Authentication retries exhausted after {0} attempts")]
    AuthExhausted(u32),

    /// Non-2xx final response to INVITE. Terminal for the call attempt,
    /// not a fault of the engine.
    #[error("Call rejected with status {0}")]
    CallRejected(u16),

    /// INVITE server transaction never saw an ACK for its final response.
    #[error("No ACK received for final response")]
    NoAck,

    /// Operation not legal in the current transaction/dialog state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("No transaction matches: {0}")]
    TransactionNotFound(String),

    #[error("No dialog matches: {0}")]
    DialogNotFound(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::MalformedMessage(err.to_string())
    }
}
