//! SIP transaction layer
//!
//! Implements client and server transactions as per RFC 3261 Section 17
//!
//! ## Transaction Types
//! - INVITE Client Transaction (ICT) - Section 17.1.1
//! - INVITE Server Transaction (IST) - Section 17.2.1
//! - Non-INVITE Client Transaction (NICT) - Section 17.1.2
//! - Non-INVITE Server Transaction (NIST) - Section 17.2.2
//!
//! Every event for a given transaction (inbound message, timer fire,
//! application command) is processed while holding the transaction map's
//! write guard, so per-transaction processing is strictly serial while
//! distinct transactions proceed in parallel.

use crate::builder::ResponseBuilder;
use crate::error::SipError;
use crate::events::{SipEvent, TerminationReason};
use crate::message::{SipMethod, SipRequest, SipResponse};
use crate::timer::{SipTimers, TimerSet, TimerType};
use crate::transport::{OutgoingMessage, Transport};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Transaction identifier: Via branch plus CSeq method, so a CANCEL and the
/// INVITE it targets (same branch) live in separate transactions, and
/// responses match by branch + CSeq method (Section 17.1.3).
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionKey {
    pub branch: String,
    pub method: SipMethod,
}

impl TransactionKey {
    pub fn new(branch: &str, method: SipMethod) -> Self {
        // ACK for a non-2xx final belongs to the INVITE transaction
        let method = if method == SipMethod::Ack {
            SipMethod::Invite
        } else {
            method
        };
        Self {
            branch: branch.to_string(),
            method,
        }
    }

    pub fn for_request(request: &SipRequest) -> Result<Self, SipError> {
        let branch = request
            .branch()
            .ok_or_else(|| SipError::MalformedMessage("no branch in Via header".to_string()))?;
        let method = request
            .method()
            .ok_or_else(|| SipError::MalformedMessage("unsupported method".to_string()))?;
        Ok(Self::new(&branch, method))
    }

    pub fn for_response(response: &SipResponse) -> Result<Self, SipError> {
        let branch = response
            .branch()
            .ok_or_else(|| SipError::MalformedMessage("no branch in Via header".to_string()))?;
        let (_, method) = response
            .cseq()
            .ok_or_else(|| SipError::MalformedMessage("no CSeq in response".to_string()))?;
        Ok(Self::new(&branch, method))
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch, self.method)
    }
}

/// INVITE Client Transaction States (RFC 3261 Section 17.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteClientState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// INVITE Server Transaction States (RFC 3261 Section 17.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteServerState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Non-INVITE Client Transaction States (RFC 3261 Section 17.1.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteClientState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Non-INVITE Server Transaction States (RFC 3261 Section 17.2.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteServerState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Transaction type and state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    InviteClient(InviteClientState),
    InviteServer(InviteServerState),
    NonInviteClient(NonInviteClientState),
    NonInviteServer(NonInviteServerState),
}

impl TransactionState {
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            TransactionState::InviteClient(InviteClientState::Terminated)
                | TransactionState::InviteServer(InviteServerState::Terminated)
                | TransactionState::NonInviteClient(NonInviteClientState::Terminated)
                | TransactionState::NonInviteServer(NonInviteServerState::Terminated)
        )
    }

    pub fn is_client(&self) -> bool {
        matches!(
            self,
            TransactionState::InviteClient(_) | TransactionState::NonInviteClient(_)
        )
    }

    /// Get state name for debugging
    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::InviteClient(InviteClientState::Calling) => "ICT-Calling",
            TransactionState::InviteClient(InviteClientState::Proceeding) => "ICT-Proceeding",
            TransactionState::InviteClient(InviteClientState::Completed) => "ICT-Completed",
            TransactionState::InviteClient(InviteClientState::Terminated) => "ICT-Terminated",
            TransactionState::InviteServer(InviteServerState::Proceeding) => "IST-Proceeding",
            TransactionState::InviteServer(InviteServerState::Completed) => "IST-Completed",
            TransactionState::InviteServer(InviteServerState::Confirmed) => "IST-Confirmed",
            TransactionState::InviteServer(InviteServerState::Terminated) => "IST-Terminated",
            TransactionState::NonInviteClient(NonInviteClientState::Trying) => "NICT-Trying",
            TransactionState::NonInviteClient(NonInviteClientState::Proceeding) => {
                "NICT-Proceeding"
            }
            TransactionState::NonInviteClient(NonInviteClientState::Completed) => "NICT-Completed",
            TransactionState::NonInviteClient(NonInviteClientState::Terminated) => {
                "NICT-Terminated"
            }
            TransactionState::NonInviteServer(NonInviteServerState::Trying) => "NIST-Trying",
            TransactionState::NonInviteServer(NonInviteServerState::Proceeding) => {
                "NIST-Proceeding"
            }
            TransactionState::NonInviteServer(NonInviteServerState::Completed) => "NIST-Completed",
            TransactionState::NonInviteServer(NonInviteServerState::Terminated) => {
                "NIST-Terminated"
            }
        }
    }
}

/// What the layer must do after a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    None,
    RetransmitRequest,
    RetransmitResponse,
    /// Retry budget exhausted with no final response.
    Timeout,
    /// INVITE final response never acknowledged (Timer H).
    NoAck,
    /// Quiet terminal transition (Timers D/I/J/K).
    Terminate,
}

/// One SIP transaction
#[derive(Clone)]
pub struct Transaction {
    pub key: TransactionKey,
    pub state: TransactionState,
    pub request: SipRequest,
    pub destination: SocketAddr,
    pub is_reliable: bool,
    timers: TimerSet,
    pub last_response: Option<SipResponse>,
    /// Status of the last provisional seen, to absorb its retransmissions.
    last_provisional: Option<u16>,
    pub created_at: Instant,
    sip_timers: SipTimers,
}

impl Transaction {
    pub fn new_invite_client(
        key: TransactionKey,
        request: SipRequest,
        destination: SocketAddr,
        is_reliable: bool,
        sip_timers: SipTimers,
    ) -> Self {
        let mut transaction = Self {
            key,
            state: TransactionState::InviteClient(InviteClientState::Calling),
            request,
            destination,
            is_reliable,
            timers: TimerSet::new(),
            last_response: None,
            last_provisional: None,
            created_at: Instant::now(),
            sip_timers,
        };

        // Timer A drives request retransmission, Timer B bounds the wait
        if !is_reliable {
            transaction.arm(TimerType::TimerA);
        }
        transaction.arm(TimerType::TimerB);
        transaction
    }

    pub fn new_invite_server(
        key: TransactionKey,
        request: SipRequest,
        destination: SocketAddr,
        is_reliable: bool,
        sip_timers: SipTimers,
    ) -> Self {
        Self {
            key,
            state: TransactionState::InviteServer(InviteServerState::Proceeding),
            request,
            destination,
            is_reliable,
            timers: TimerSet::new(),
            last_response: None,
            last_provisional: None,
            created_at: Instant::now(),
            sip_timers,
        }
    }

    pub fn new_non_invite_client(
        key: TransactionKey,
        request: SipRequest,
        destination: SocketAddr,
        is_reliable: bool,
        sip_timers: SipTimers,
    ) -> Self {
        let mut transaction = Self {
            key,
            state: TransactionState::NonInviteClient(NonInviteClientState::Trying),
            request,
            destination,
            is_reliable,
            timers: TimerSet::new(),
            last_response: None,
            last_provisional: None,
            created_at: Instant::now(),
            sip_timers,
        };

        if !is_reliable {
            transaction.arm(TimerType::TimerE);
        }
        transaction.arm(TimerType::TimerF);
        transaction
    }

    pub fn new_non_invite_server(
        key: TransactionKey,
        request: SipRequest,
        destination: SocketAddr,
        is_reliable: bool,
        sip_timers: SipTimers,
    ) -> Self {
        Self {
            key,
            state: TransactionState::NonInviteServer(NonInviteServerState::Trying),
            request,
            destination,
            is_reliable,
            timers: TimerSet::new(),
            last_response: None,
            last_provisional: None,
            created_at: Instant::now(),
            sip_timers,
        }
    }

    fn arm(&mut self, timer_type: TimerType) {
        self.timers.arm(timer_type, &self.sip_timers, self.is_reliable);
    }

    pub fn is_armed(&self, timer_type: TimerType) -> bool {
        self.timers.is_armed(timer_type)
    }

    /// Process a received response (client transactions).
    /// Returns true when the response is new to the transaction user,
    /// false when it is an absorbed retransmission.
    pub fn process_response(&mut self, response: &SipResponse) -> Result<bool, SipError> {
        let status = response.status_code();

        match &self.state {
            TransactionState::InviteClient(state) => match state {
                InviteClientState::Calling | InviteClientState::Proceeding => {
                    if status < 200 {
                        self.state = TransactionState::InviteClient(InviteClientState::Proceeding);
                        // provisionals slow the INVITE retransmit to the T2 cap
                        self.timers.slow_to(TimerType::TimerA, self.sip_timers.t2);
                        // a repeat of the same provisional is a retransmission
                        Ok(self.last_provisional.replace(status) != Some(status))
                    } else if status < 300 {
                        // 2xx terminates the ICT; the ACK belongs to the TU
                        self.state = TransactionState::InviteClient(InviteClientState::Terminated);
                        self.timers.cancel_all();
                        Ok(true)
                    } else {
                        self.state = TransactionState::InviteClient(InviteClientState::Completed);
                        self.timers.cancel(TimerType::TimerA);
                        self.timers.cancel(TimerType::TimerB);
                        self.arm(TimerType::TimerD);
                        Ok(true)
                    }
                }
                InviteClientState::Completed => Ok(false),
                InviteClientState::Terminated => Err(SipError::InvalidState(
                    "transaction already terminated".to_string(),
                )),
            },

            TransactionState::NonInviteClient(state) => match state {
                NonInviteClientState::Trying | NonInviteClientState::Proceeding => {
                    if status < 200 {
                        self.state =
                            TransactionState::NonInviteClient(NonInviteClientState::Proceeding);
                        self.timers.cancel(TimerType::TimerE);
                        Ok(self.last_provisional.replace(status) != Some(status))
                    } else {
                        self.state =
                            TransactionState::NonInviteClient(NonInviteClientState::Completed);
                        self.timers.cancel(TimerType::TimerE);
                        self.timers.cancel(TimerType::TimerF);
                        self.arm(TimerType::TimerK);
                        Ok(true)
                    }
                }
                NonInviteClientState::Completed => Ok(false),
                NonInviteClientState::Terminated => Err(SipError::InvalidState(
                    "transaction already terminated".to_string(),
                )),
            },

            _ => Err(SipError::InvalidState(
                "not a client transaction".to_string(),
            )),
        }
    }

    /// Process a received ACK (INVITE server transactions).
    pub fn process_ack(&mut self) -> Result<(), SipError> {
        match &self.state {
            TransactionState::InviteServer(InviteServerState::Completed) => {
                self.state = TransactionState::InviteServer(InviteServerState::Confirmed);
                self.timers.cancel(TimerType::TimerG);
                self.timers.cancel(TimerType::TimerH);
                self.arm(TimerType::TimerI);
                Ok(())
            }
            _ => Err(SipError::InvalidState(format!(
                "ACK not expected in {}",
                self.state.name()
            ))),
        }
    }

    /// Record a response the application sends (server transactions).
    pub fn send_response(&mut self, response: SipResponse) -> Result<(), SipError> {
        let status = response.status_code();
        self.last_response = Some(response);

        match &self.state {
            TransactionState::InviteServer(state) => match state {
                InviteServerState::Proceeding => {
                    if status < 200 {
                        // stay Proceeding, remember the response for replays
                    } else if status < 300 {
                        // 2xx is retransmitted end-to-end by the TU, not here
                        self.state = TransactionState::InviteServer(InviteServerState::Terminated);
                        self.timers.cancel_all();
                    } else {
                        self.state = TransactionState::InviteServer(InviteServerState::Completed);
                        if !self.is_reliable {
                            self.arm(TimerType::TimerG);
                        }
                        self.arm(TimerType::TimerH);
                    }
                    Ok(())
                }
                InviteServerState::Completed | InviteServerState::Confirmed => Err(
                    SipError::InvalidState("final response already sent".to_string()),
                ),
                InviteServerState::Terminated => Err(SipError::InvalidState(
                    "transaction already terminated".to_string(),
                )),
            },

            TransactionState::NonInviteServer(state) => match state {
                NonInviteServerState::Trying | NonInviteServerState::Proceeding => {
                    if status < 200 {
                        self.state =
                            TransactionState::NonInviteServer(NonInviteServerState::Proceeding);
                    } else {
                        self.state =
                            TransactionState::NonInviteServer(NonInviteServerState::Completed);
                        self.arm(TimerType::TimerJ);
                    }
                    Ok(())
                }
                _ => Err(SipError::InvalidState(
                    "final response already sent".to_string(),
                )),
            },

            _ => Err(SipError::InvalidState(
                "not a server transaction".to_string(),
            )),
        }
    }

    /// Handle timer expiration
    pub fn handle_timer_fired(&mut self, timer_type: TimerType) -> TimerAction {
        debug!(
            "timer {:?} fired for {} in state {}",
            timer_type,
            self.key,
            self.state.name()
        );

        match timer_type {
            TimerType::TimerA => {
                if matches!(
                    self.state,
                    TransactionState::InviteClient(
                        InviteClientState::Calling | InviteClientState::Proceeding
                    )
                ) {
                    self.timers.backoff(TimerType::TimerA, self.sip_timers.t2);
                    TimerAction::RetransmitRequest
                } else {
                    self.timers.cancel(TimerType::TimerA);
                    TimerAction::None
                }
            }

            TimerType::TimerB => {
                self.state = TransactionState::InviteClient(InviteClientState::Terminated);
                self.timers.cancel_all();
                TimerAction::Timeout
            }

            TimerType::TimerD => {
                self.state = TransactionState::InviteClient(InviteClientState::Terminated);
                self.timers.cancel_all();
                TimerAction::Terminate
            }

            TimerType::TimerE => {
                if matches!(
                    self.state,
                    TransactionState::NonInviteClient(NonInviteClientState::Trying)
                ) {
                    self.timers.backoff(TimerType::TimerE, self.sip_timers.t2);
                    TimerAction::RetransmitRequest
                } else {
                    self.timers.cancel(TimerType::TimerE);
                    TimerAction::None
                }
            }

            TimerType::TimerF => {
                self.state = TransactionState::NonInviteClient(NonInviteClientState::Terminated);
                self.timers.cancel_all();
                TimerAction::Timeout
            }

            TimerType::TimerG => {
                if matches!(
                    self.state,
                    TransactionState::InviteServer(InviteServerState::Completed)
                ) {
                    self.timers.backoff(TimerType::TimerG, self.sip_timers.t2);
                    TimerAction::RetransmitResponse
                } else {
                    self.timers.cancel(TimerType::TimerG);
                    TimerAction::None
                }
            }

            TimerType::TimerH => {
                self.state = TransactionState::InviteServer(InviteServerState::Terminated);
                self.timers.cancel_all();
                TimerAction::NoAck
            }

            TimerType::TimerI => {
                self.state = TransactionState::InviteServer(InviteServerState::Terminated);
                self.timers.cancel_all();
                TimerAction::Terminate
            }

            TimerType::TimerJ => {
                self.state = TransactionState::NonInviteServer(NonInviteServerState::Terminated);
                self.timers.cancel_all();
                TimerAction::Terminate
            }

            TimerType::TimerK => {
                self.state = TransactionState::NonInviteClient(NonInviteClientState::Terminated);
                self.timers.cancel_all();
                TimerAction::Terminate
            }
        }
    }

    /// Pop due timers and translate them into actions.
    pub fn check_timers(&mut self, now: Instant) -> Vec<(TimerType, TimerAction)> {
        let expired = self.timers.take_expired(now);
        let mut actions = Vec::new();
        for timer_type in expired {
            let action = self.handle_timer_fired(timer_type);
            if action != TimerAction::None {
                actions.push((timer_type, action));
            }
        }
        actions
    }
}

/// What happened to an inbound request.
#[derive(Debug, Clone)]
pub enum RequestDisposition {
    /// Fresh server transaction; surface to the application.
    New(TransactionKey),
    /// Retransmission; the last response was replayed.
    Retransmission(TransactionKey),
    /// ACK consumed by an INVITE server transaction in Completed.
    AckConfirmed(TransactionKey),
    /// ACK for a 2xx: matches no transaction, belongs to the dialog/TU.
    AckForDialog,
    /// CANCEL matched a pending INVITE; 200 + 487 were sent, the INVITE
    /// server transaction moved to Completed.
    Cancelled {
        invite: TransactionKey,
        cancel: TransactionKey,
    },
    /// CANCEL matched nothing (or arrived after the final); answered 481,
    /// no other effect.
    CancelUnmatched(TransactionKey),
}

/// Transaction layer: owns all active transactions, drives their timers,
/// retransmits through the transport port, reports terminal outcomes on the
/// event channel.
pub struct TransactionLayer {
    transactions: Arc<RwLock<HashMap<TransactionKey, Transaction>>>,
    sip_timers: SipTimers,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<SipEvent>,
    timer_task: Option<JoinHandle<()>>,
}

impl TransactionLayer {
    pub fn new(
        sip_timers: SipTimers,
        transport: Arc<dyn Transport>,
        events: mpsc::Sender<SipEvent>,
    ) -> Self {
        Self {
            transactions: Arc::new(RwLock::new(HashMap::new())),
            sip_timers,
            transport,
            events,
            timer_task: None,
        }
    }

    fn is_reliable(&self) -> bool {
        self.transport.kind().is_reliable()
    }

    async fn transmit(&self, data: Bytes, destination: SocketAddr) -> Result<(), SipError> {
        self.transport
            .send(OutgoingMessage { data, destination })
            .await
    }

    async fn emit(&self, event: SipEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event sink closed, dropping event");
        }
    }

    /// Start the background timer task. Fired timers run under the same
    /// write guard as message events, so they never race a concurrent
    /// response delivery for the same transaction.
    pub fn start(&mut self) {
        let transactions = self.transactions.clone();
        let transport = self.transport.clone();
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            info!("transaction timer task started");

            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;

                // collect due work under the lock, send after releasing it
                struct Due {
                    key: TransactionKey,
                    action: TimerAction,
                    data: Option<Bytes>,
                    destination: SocketAddr,
                }

                let mut due: Vec<Due> = Vec::new();
                {
                    let mut txns = transactions.write().await;
                    let now = Instant::now();
                    for (key, txn) in txns.iter_mut() {
                        for (_, action) in txn.check_timers(now) {
                            let data = match action {
                                TimerAction::RetransmitRequest => Some(txn.request.to_bytes()),
                                TimerAction::RetransmitResponse => {
                                    txn.last_response.as_ref().map(|r| r.to_bytes())
                                }
                                _ => None,
                            };
                            due.push(Due {
                                key: key.clone(),
                                action,
                                data,
                                destination: txn.destination,
                            });
                        }
                    }

                    // reap terminated transactions
                    txns.retain(|key, txn| {
                        let done = txn.state.is_terminated();
                        if done {
                            debug!("removing terminated transaction {}", key);
                        }
                        !done
                    });
                }

                for item in due {
                    match item.action {
                        TimerAction::RetransmitRequest | TimerAction::RetransmitResponse => {
                            if let Some(data) = item.data {
                                debug!("{}: retransmitting", item.key);
                                let send = transport
                                    .send(OutgoingMessage {
                                        data,
                                        destination: item.destination,
                                    })
                                    .await;
                                if let Err(e) = send {
                                    warn!("{}: retransmit failed: {}", item.key, e);
                                    let mut txns = transactions.write().await;
                                    txns.remove(&item.key);
                                    drop(txns);
                                    let _ = events
                                        .send(SipEvent::TransportFailure {
                                            key: item.key.clone(),
                                        })
                                        .await;
                                    let _ = events
                                        .send(SipEvent::TransactionTerminated {
                                            key: item.key,
                                            reason: TerminationReason::TransportError,
                                        })
                                        .await;
                                }
                            }
                        }
                        TimerAction::Timeout => {
                            warn!("{}: timed out", item.key);
                            let _ = events
                                .send(SipEvent::Timeout {
                                    key: item.key.clone(),
                                })
                                .await;
                            let _ = events
                                .send(SipEvent::TransactionTerminated {
                                    key: item.key,
                                    reason: TerminationReason::Timeout,
                                })
                                .await;
                        }
                        TimerAction::NoAck => {
                            warn!("{}: no ACK for final response", item.key);
                            let _ = events
                                .send(SipEvent::TransactionTerminated {
                                    key: item.key,
                                    reason: TerminationReason::NoAck,
                                })
                                .await;
                        }
                        TimerAction::Terminate => {
                            // quiet cleanup; the terminal outcome was already
                            // reported when the final response/ACK was seen
                            debug!("{}: wait timer expired, transaction reaped", item.key);
                        }
                        TimerAction::None => {}
                    }
                }
            }
        });

        self.timer_task = Some(handle);
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.timer_task.take() {
            handle.abort();
            info!("transaction timer task stopped");
        }
    }

    /// Create a client transaction for an outgoing request and put the
    /// request on the wire. A failed initial send terminates the transaction
    /// with a transport failure event rather than an error return.
    pub async fn create_client_transaction(
        &self,
        request: SipRequest,
        destination: SocketAddr,
    ) -> Result<TransactionKey, SipError> {
        let key = TransactionKey::for_request(&request)?;
        let is_reliable = self.is_reliable();

        let transaction = if request.method() == Some(SipMethod::Invite) {
            Transaction::new_invite_client(
                key.clone(),
                request.clone(),
                destination,
                is_reliable,
                self.sip_timers,
            )
        } else {
            Transaction::new_non_invite_client(
                key.clone(),
                request.clone(),
                destination,
                is_reliable,
                self.sip_timers,
            )
        };

        {
            let mut txns = self.transactions.write().await;
            if txns.contains_key(&key) {
                return Err(SipError::InvalidState(format!(
                    "transaction {} already exists",
                    key
                )));
            }
            info!("created client transaction {} to {}", key, destination);
            txns.insert(key.clone(), transaction);
        }

        if let Err(e) = self.transmit(request.to_bytes(), destination).await {
            warn!("{}: initial send failed: {}", key, e);
            let mut txns = self.transactions.write().await;
            txns.remove(&key);
            drop(txns);
            self.emit(SipEvent::TransportFailure { key: key.clone() }).await;
            self.emit(SipEvent::TransactionTerminated {
                key: key.clone(),
                reason: TerminationReason::TransportError,
            })
            .await;
        }

        Ok(key)
    }

    /// Route an inbound request into the server transaction machinery.
    pub async fn process_request(
        &self,
        request: SipRequest,
        source: SocketAddr,
    ) -> Result<RequestDisposition, SipError> {
        let method = request
            .method()
            .ok_or_else(|| SipError::MalformedMessage("unsupported method".to_string()))?;

        match method {
            SipMethod::Ack => self.process_ack(request).await,
            SipMethod::Cancel => self.process_cancel(request, source).await,
            _ => self.process_new_or_retransmitted(request, source).await,
        }
    }

    async fn process_new_or_retransmitted(
        &self,
        request: SipRequest,
        source: SocketAddr,
    ) -> Result<RequestDisposition, SipError> {
        let key = TransactionKey::for_request(&request)?;
        let mut txns = self.transactions.write().await;

        if let Some(txn) = txns.get(&key) {
            // retransmission: replay the last response verbatim
            let replay = txn.last_response.as_ref().map(|r| r.to_bytes());
            let destination = txn.destination;
            drop(txns);
            if let Some(data) = replay {
                debug!("{}: retransmitted request, replaying last response", key);
                self.transmit(data, destination).await?;
            }
            return Ok(RequestDisposition::Retransmission(key));
        }

        let is_reliable = self.is_reliable();
        let transaction = if request.method() == Some(SipMethod::Invite) {
            Transaction::new_invite_server(
                key.clone(),
                request,
                source,
                is_reliable,
                self.sip_timers,
            )
        } else {
            Transaction::new_non_invite_server(
                key.clone(),
                request,
                source,
                is_reliable,
                self.sip_timers,
            )
        };

        info!("created server transaction {} from {}", key, source);
        txns.insert(key.clone(), transaction);
        Ok(RequestDisposition::New(key))
    }

    async fn process_ack(&self, request: SipRequest) -> Result<RequestDisposition, SipError> {
        let key = TransactionKey::for_request(&request)?;
        let mut txns = self.transactions.write().await;

        match txns.get_mut(&key) {
            Some(txn) => {
                txn.process_ack()?;
                debug!("{}: ACK confirmed", key);
                Ok(RequestDisposition::AckConfirmed(key))
            }
            // ACK for a 2xx never matches: it is its own end-to-end message
            None => Ok(RequestDisposition::AckForDialog),
        }
    }

    /// CANCEL handling per Section 9.2: answer the CANCEL itself with 200 on
    /// its own transaction, and if the matched INVITE server transaction has
    /// not sent a final response yet, finish it with 487.
    async fn process_cancel(
        &self,
        request: SipRequest,
        source: SocketAddr,
    ) -> Result<RequestDisposition, SipError> {
        let cancel_key = TransactionKey::for_request(&request)?;
        let invite_key = TransactionKey {
            branch: cancel_key.branch.clone(),
            method: SipMethod::Invite,
        };

        let is_reliable = self.is_reliable();
        let mut to_send: Vec<(Bytes, SocketAddr)> = Vec::new();
        let matched;

        {
            let mut txns = self.transactions.write().await;
            if txns.contains_key(&cancel_key) {
                // retransmitted CANCEL
                let replay = txns
                    .get(&cancel_key)
                    .and_then(|t| t.last_response.as_ref().map(|r| r.to_bytes()));
                drop(txns);
                if let Some(data) = replay {
                    self.transmit(data, source).await?;
                }
                return Ok(RequestDisposition::Retransmission(cancel_key));
            }

            let mut cancel_txn = Transaction::new_non_invite_server(
                cancel_key.clone(),
                request.clone(),
                source,
                is_reliable,
                self.sip_timers,
            );

            matched = match txns.get_mut(&invite_key) {
                Some(invite_txn)
                    if matches!(
                        invite_txn.state,
                        TransactionState::InviteServer(InviteServerState::Proceeding)
                    ) =>
                {
                    let terminated = ResponseBuilder::request_terminated()
                        .build_for_request(&invite_txn.request)?;
                    to_send.push((terminated.to_bytes(), invite_txn.destination));
                    invite_txn.send_response(terminated)?;

                    let ok = ResponseBuilder::ok().build_for_request(&request)?;
                    to_send.push((ok.to_bytes(), source));
                    cancel_txn.send_response(ok)?;
                    true
                }
                _ => {
                    // no cancellable INVITE: 481 per Section 9.2
                    let gone = ResponseBuilder::new(481).build_for_request(&request)?;
                    to_send.push((gone.to_bytes(), source));
                    cancel_txn.send_response(gone)?;
                    false
                }
            };

            txns.insert(cancel_key.clone(), cancel_txn);
        }

        for (data, destination) in to_send {
            self.transmit(data, destination).await?;
        }

        if matched {
            info!("{}: cancelled by peer", invite_key);
            Ok(RequestDisposition::Cancelled {
                invite: invite_key,
                cancel: cancel_key,
            })
        } else {
            debug!("{}: CANCEL matched no pending INVITE", cancel_key);
            Ok(RequestDisposition::CancelUnmatched(cancel_key))
        }
    }

    /// Process an inbound response. Returns the response paired with its
    /// transaction when it is news for the transaction user; retransmissions
    /// are absorbed and return `None`.
    pub async fn process_response(
        &self,
        response: SipResponse,
    ) -> Result<Option<(TransactionKey, SipResponse)>, SipError> {
        let key = TransactionKey::for_response(&response)?;
        let mut txns = self.transactions.write().await;

        match txns.get_mut(&key) {
            // not yet reaped: same as gone, so late 2xx retransmissions
            // still reach the dialog-level re-ACK path
            Some(txn) if txn.state.is_terminated() => {
                Err(SipError::TransactionNotFound(key.to_string()))
            }
            Some(txn) => {
                let old_state = txn.state;
                let is_news = txn.process_response(&response)?;
                debug!(
                    "{}: response {} moved {} -> {}",
                    key,
                    response.status_code(),
                    old_state.name(),
                    txn.state.name()
                );
                Ok(is_news.then_some((key, response)))
            }
            None => {
                warn!("no transaction for response with branch {}", key.branch);
                Err(SipError::TransactionNotFound(key.to_string()))
            }
        }
    }

    /// Send a response through a server transaction.
    pub async fn send_response(
        &self,
        key: &TransactionKey,
        response: SipResponse,
    ) -> Result<(), SipError> {
        let (data, destination) = {
            let mut txns = self.transactions.write().await;
            let txn = txns
                .get_mut(key)
                .ok_or_else(|| SipError::TransactionNotFound(key.to_string()))?;
            let old_state = txn.state;
            txn.send_response(response.clone())?;
            debug!(
                "{}: sent {} moving {} -> {}",
                key,
                response.status_code(),
                old_state.name(),
                txn.state.name()
            );
            (response.to_bytes(), txn.destination)
        };

        self.transmit(data, destination).await
    }

    /// CANCEL is only legal while the INVITE client transaction is still
    /// waiting for a final response.
    pub async fn cancel_allowed(&self, invite_key: &TransactionKey) -> bool {
        let txns = self.transactions.read().await;
        matches!(
            txns.get(invite_key).map(|t| t.state),
            Some(TransactionState::InviteClient(
                InviteClientState::Calling | InviteClientState::Proceeding
            ))
        )
    }

    pub async fn state_of(&self, key: &TransactionKey) -> Option<TransactionState> {
        let txns = self.transactions.read().await;
        txns.get(key).map(|t| t.state)
    }

    pub async fn request_of(&self, key: &TransactionKey) -> Option<SipRequest> {
        let txns = self.transactions.read().await;
        txns.get(key).map(|t| t.request.clone())
    }

    pub async fn destination_of(&self, key: &TransactionKey) -> Option<SocketAddr> {
        let txns = self.transactions.read().await;
        txns.get(key).map(|t| t.destination)
    }

    pub async fn has_transaction(&self, key: &TransactionKey) -> bool {
        let txns = self.transactions.read().await;
        txns.contains_key(key)
    }

    pub async fn transaction_count(&self) -> usize {
        let txns = self.transactions.read().await;
        txns.len()
    }
}

impl Drop for TransactionLayer {
    fn drop(&mut self) {
        self.stop();
    }
}
