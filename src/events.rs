//! User agent event sink
//!
//! Everything the engine cannot resolve by itself is delivered exactly once
//! over an mpsc channel as a [`SipEvent`]. The application reacts: answer an
//! INVITE, back off and re-register, tear down call state.

use crate::dialog::DialogId;
use crate::message::{SipRequest, SipResponse};
use crate::transaction::TransactionKey;
use std::fmt;
use std::net::SocketAddr;

/// Why a transaction or dialog reached its terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Ran to completion normally.
    Completed,
    /// Retry budget exhausted with no final response.
    Timeout,
    /// The transport could not deliver.
    TransportError,
    /// INVITE final response never acknowledged.
    NoAck,
    /// Cancelled before a final response.
    Cancelled,
    /// Digest challenge loop bound exceeded.
    AuthExhausted,
    /// Non-2xx final response to INVITE.
    CallRejected(u16),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Completed => write!(f, "completed"),
            TerminationReason::Timeout => write!(f, "timeout"),
            TerminationReason::TransportError => write!(f, "transport error"),
            TerminationReason::NoAck => write!(f, "no ack"),
            TerminationReason::Cancelled => write!(f, "cancelled"),
            TerminationReason::AuthExhausted => write!(f, "auth exhausted"),
            TerminationReason::CallRejected(code) => write!(f, "call rejected ({})", code),
        }
    }
}

/// Events delivered to the application.
#[derive(Debug, Clone)]
pub enum SipEvent {
    /// A new request arrived and a server transaction was created for it.
    /// ACKs to 2xx responses arrive here too (they match no transaction).
    RequestReceived {
        key: TransactionKey,
        request: SipRequest,
        source: SocketAddr,
    },
    /// A response was matched to one of our client transactions. Responses
    /// the engine consumed internally (challenge retries, absorbed
    /// retransmissions) are not surfaced.
    ResponseReceived {
        key: TransactionKey,
        response: SipResponse,
    },
    /// A client transaction gave up waiting for a final response.
    Timeout { key: TransactionKey },
    /// The transport failed while the transaction was trying to send.
    TransportFailure { key: TransactionKey },
    /// Terminal state reached; the key is dead after this.
    TransactionTerminated {
        key: TransactionKey,
        reason: TerminationReason,
    },
    /// A dialog left Confirmed (or a never-confirmed early dialog died).
    DialogTerminated {
        id: DialogId,
        reason: TerminationReason,
    },
}

impl SipEvent {
    /// Call-ID carried by the event's message, when it has one.
    pub fn call_id(&self) -> Option<String> {
        match self {
            SipEvent::RequestReceived { request, .. } => request.call_id(),
            SipEvent::ResponseReceived { response, .. } => response.call_id(),
            SipEvent::DialogTerminated { id, .. } => Some(id.call_id.clone()),
            _ => None,
        }
    }

    /// Remote party (To for responses, From for requests), when present.
    pub fn peer(&self) -> Option<String> {
        match self {
            SipEvent::RequestReceived { request, .. } => request.from_uri(),
            SipEvent::ResponseReceived { response, .. } => response.to_uri(),
            _ => None,
        }
    }
}
