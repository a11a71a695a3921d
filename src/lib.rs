//! Confab - a SIP (RFC 3261) user-agent signaling engine
//!
//! Constructs, sends, and correlates SIP requests and responses to
//! establish, modify, and tear down sessions: registration, call setup and
//! teardown, mid-call renegotiation, and transfer-status notification.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Application           │
//! │  (events in, ops out)   │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   User Agent            │
//! │  (orchestration, auth)  │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │    Dialog Layer         │
//! │   (call legs, CSeq)     │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │  (RFC 3261 §17 + timers)│
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Port        │
//! │  (provided by the app)  │
//! └─────────────────────────┘
//! ```
//!
//! Wire parsing/serialization is delegated to `rsip`; sockets, TLS and
//! address resolution belong to the embedding application.

pub mod agent;
pub mod auth;
pub mod builder;
pub mod config;
pub mod dialog;
pub mod error;
pub mod events;
pub mod message;
pub mod profile;
pub mod timer;
pub mod transaction;
pub mod transport;

pub use agent::{CallHandle, UserAgent};
pub use auth::{Challenge, ChallengeResponder};
pub use builder::{InviteOptions, Payload, RequestBuilder, ResponseBuilder};
pub use config::EngineConfig;
pub use dialog::{Dialog, DialogId, DialogLayer, DialogRole, DialogState};
pub use error::{Result, SipError};
pub use events::{SipEvent, TerminationReason};
pub use message::{SipMessage, SipMethod, SipRequest, SipResponse};
pub use profile::{DigestCredentials, UserProfile};
pub use timer::{SipTimers, TimerType};
pub use transaction::{
    InviteClientState, InviteServerState, NonInviteClientState, NonInviteServerState,
    RequestDisposition, Transaction, TransactionKey, TransactionLayer, TransactionState,
};
pub use transport::{ChannelTransport, IncomingMessage, OutgoingMessage, Transport, TransportKind};
