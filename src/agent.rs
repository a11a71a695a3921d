//! SIP user agent
//!
//! Orchestrates the layers below into the operations an application
//! actually performs: register (and stay registered), place and receive
//! calls, cancel, hang up, probe with OPTIONS, report transfer progress
//! with NOTIFY. Owns the inbound demux loop: every message from the
//! transport is routed through the transaction layer, correlated to
//! dialogs, and surfaced on the event channel exactly once.
//!
//! Address resolution is the caller's problem (the engine never touches
//! DNS): every out-of-dialog operation takes an explicit destination, and
//! in-dialog traffic goes back where the dialog came from.

use crate::auth::ChallengeResponder;
use crate::builder::{
    new_call_id, new_tag, InviteOptions, Payload, RequestBuilder, ResponseBuilder,
};
use crate::config::EngineConfig;
use crate::dialog::{DialogId, DialogLayer, DialogState};
use crate::error::SipError;
use crate::events::{SipEvent, TerminationReason};
use crate::message::{SipMessage, SipMethod, SipRequest, SipResponse};
use crate::profile::{DigestCredentials, UserProfile};
use crate::transaction::{RequestDisposition, TransactionKey, TransactionLayer};
use crate::transport::{IncomingMessage, OutgoingMessage, Transport};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle for a call attempt.
#[derive(Debug, Clone)]
pub struct CallHandle {
    pub transaction: TransactionKey,
    pub call_id: String,
}

/// What an outstanding client transaction was for.
#[derive(Debug, Clone)]
enum ExchangeKind {
    Register { aor: String },
    Invite,
    Reinvite,
    Bye { dialog: DialogId },
    Cancel,
    Options,
    Notify,
}

/// Client transaction bookkeeping beyond what the transaction layer keeps.
struct PendingExchange {
    kind: ExchangeKind,
    request: SipRequest,
    destination: SocketAddr,
    credentials: Option<DigestCredentials>,
    /// Set when the application asked to CANCEL this INVITE.
    cancel_requested: bool,
}

/// Registration lifecycle for one address of record.
struct RegistrationState {
    profile: UserProfile,
    registrar: SocketAddr,
    call_id: String,
    tag: String,
    cseq: u32,
    expires: u32,
    /// When the registrar will drop the binding, from the last 2xx.
    expires_at: Option<DateTime<Utc>>,
    refresh_task: Option<JoinHandle<()>>,
}

impl Drop for RegistrationState {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
    }
}

/// UAS-side call state keyed by the INVITE server transaction.
struct UasCall {
    local_tag: String,
    dialog: Option<DialogId>,
}

struct Inner {
    config: EngineConfig,
    builder: RequestBuilder,
    transport: Arc<dyn Transport>,
    transactions: TransactionLayer,
    dialogs: DialogLayer,
    events: mpsc::Sender<SipEvent>,
    auth: Mutex<ChallengeResponder>,
    pendings: RwLock<HashMap<TransactionKey, PendingExchange>>,
    registrations: RwLock<HashMap<String, RegistrationState>>,
    uas_calls: RwLock<HashMap<TransactionKey, UasCall>>,
    /// Where in-dialog requests are sent: learned from the peer that formed
    /// the dialog. Symmetric routing; no URI resolution in the engine.
    dialog_routes: RwLock<HashMap<DialogId, SocketAddr>>,
}

/// The user agent. Create one per transport, then drive it with the
/// operation methods; protocol outcomes arrive on the event receiver.
pub struct UserAgent {
    inner: Arc<Inner>,
    run_task: Option<JoinHandle<()>>,
}

impl UserAgent {
    /// Wire a user agent to its transport. `incoming` is the channel the
    /// transport owner feeds with parsed inbound messages (malformed bytes
    /// are dropped and logged at the transport edge, never retried).
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        incoming: mpsc::Receiver<IncomingMessage>,
    ) -> (Self, mpsc::Receiver<SipEvent>) {
        let (app_tx, app_rx) = mpsc::channel(256);
        let (layer_tx, layer_rx) = mpsc::channel(256);

        let builder = RequestBuilder::new(&config, transport.local_addr(), transport.kind());
        let mut transactions = TransactionLayer::new(config.timers, transport.clone(), layer_tx);
        transactions.start();

        let inner = Arc::new(Inner {
            auth: Mutex::new(ChallengeResponder::new(config.max_auth_attempts)),
            config,
            builder,
            transport,
            transactions,
            dialogs: DialogLayer::new(),
            events: app_tx,
            pendings: RwLock::new(HashMap::new()),
            registrations: RwLock::new(HashMap::new()),
            uas_calls: RwLock::new(HashMap::new()),
            dialog_routes: RwLock::new(HashMap::new()),
        });

        let run_task = tokio::spawn(Inner::run(inner.clone(), incoming, layer_rx));

        (
            Self {
                inner,
                run_task: Some(run_task),
            },
            app_rx,
        )
    }

    pub fn shutdown(&mut self) {
        if let Some(task) = self.run_task.take() {
            task.abort();
            info!("user agent stopped");
        }
    }

    /// REGISTER the profile with its registrar, then keep the binding
    /// alive: every 2xx schedules the next refresh at expiry minus the
    /// configured margin.
    pub async fn register(
        &self,
        profile: &UserProfile,
        registrar: SocketAddr,
    ) -> Result<TransactionKey, SipError> {
        let expires = self.inner.config.default_register_expires;
        self.register_with_expires(profile, registrar, expires).await
    }

    pub async fn register_with_expires(
        &self,
        profile: &UserProfile,
        registrar: SocketAddr,
        expires: u32,
    ) -> Result<TransactionKey, SipError> {
        let aor = profile.uri();
        {
            let mut registrations = self.inner.registrations.write().await;
            let state = registrations
                .entry(aor.clone())
                .or_insert_with(|| RegistrationState {
                    profile: profile.clone(),
                    registrar,
                    call_id: new_call_id(profile.host()),
                    tag: new_tag(),
                    cseq: 0,
                    expires,
                    expires_at: None,
                    refresh_task: None,
                });
            state.profile = profile.clone();
            state.registrar = registrar;
            state.expires = expires;
            if expires == 0 {
                if let Some(task) = state.refresh_task.take() {
                    task.abort();
                }
            }
        }
        self.inner.send_register(&aor).await
    }

    /// Remove every binding for the profile: wildcard Contact, Expires 0.
    pub async fn deregister(
        &self,
        profile: &UserProfile,
        registrar: SocketAddr,
    ) -> Result<TransactionKey, SipError> {
        self.register_with_expires(profile, registrar, 0).await
    }

    /// Place a call. The returned handle identifies the INVITE client
    /// transaction; ringing/answer/rejection arrive as events.
    pub async fn invite(
        &self,
        caller: &UserProfile,
        callee: &UserProfile,
        destination: SocketAddr,
        session_description: &str,
        options: InviteOptions,
    ) -> Result<CallHandle, SipError> {
        let call_id = new_call_id(caller.host());
        let request = self.inner.builder.invite(
            caller,
            callee,
            &new_tag(),
            &call_id,
            1,
            session_description,
            options,
        )?;

        let key = self
            .inner
            .submit(
                request,
                destination,
                ExchangeKind::Invite,
                caller.credentials.clone(),
            )
            .await?;
        Ok(CallHandle {
            transaction: key,
            call_id,
        })
    }

    /// CANCEL a pending INVITE. Legal only while the INVITE has not seen a
    /// final response; a 200 OK racing past the CANCEL wins, in which case
    /// the engine ACKs, immediately sends BYE, and swallows the late 487.
    pub async fn cancel(&self, call: &CallHandle) -> Result<TransactionKey, SipError> {
        if !self
            .inner
            .transactions
            .cancel_allowed(&call.transaction)
            .await
        {
            return Err(SipError::InvalidState(
                "INVITE already answered or terminated".to_string(),
            ));
        }

        let (invite_request, destination) = {
            let mut pendings = self.inner.pendings.write().await;
            let pending = pendings
                .get_mut(&call.transaction)
                .ok_or_else(|| SipError::TransactionNotFound(call.transaction.to_string()))?;
            pending.cancel_requested = true;
            (pending.request.clone(), pending.destination)
        };

        let cancel = self.inner.builder.cancel(&invite_request)?;
        self.inner
            .submit(cancel, destination, ExchangeKind::Cancel, None)
            .await
    }

    /// Hang up: BYE inside the dialog. The dialog terminates when the BYE
    /// transaction completes.
    pub async fn bye(&self, dialog: &DialogId) -> Result<TransactionKey, SipError> {
        let request = self
            .inner
            .dialogs
            .create_request(dialog, SipMethod::Bye, None, &self.inner.builder)
            .await?;
        let destination = self.inner.route_for(dialog).await?;
        self.inner
            .submit(
                request,
                destination,
                ExchangeKind::Bye {
                    dialog: dialog.clone(),
                },
                None,
            )
            .await
    }

    /// Mid-call renegotiation: re-INVITE with a fresh session description.
    /// The ACK for its 2xx is dialog-level and sent by the engine.
    pub async fn reinvite(
        &self,
        dialog: &DialogId,
        session_description: &str,
    ) -> Result<TransactionKey, SipError> {
        let request = self
            .inner
            .dialogs
            .create_request(
                dialog,
                SipMethod::Invite,
                Some(Payload::sdp(session_description)),
                &self.inner.builder,
            )
            .await?;
        let destination = self.inner.route_for(dialog).await?;
        self.inner
            .submit(request, destination, ExchangeKind::Reinvite, None)
            .await
    }

    /// OPTIONS keepalive / capability probe.
    pub async fn options(
        &self,
        caller: &UserProfile,
        callee: &UserProfile,
        destination: SocketAddr,
    ) -> Result<TransactionKey, SipError> {
        let request = self.inner.builder.options(
            caller,
            callee,
            &new_tag(),
            &new_call_id(caller.host()),
            1,
        )?;
        self.inner
            .submit(
                request,
                destination,
                ExchangeKind::Options,
                caller.credentials.clone(),
            )
            .await
    }

    /// NOTIFY the transfer originator how the transferred call is going
    /// (`Event: refer`, body `message/sipfrag`, e.g. "SIP/2.0 200 OK").
    pub async fn refer_notify(
        &self,
        dialog: &DialogId,
        status_fragment: &str,
    ) -> Result<TransactionKey, SipError> {
        let request = self
            .inner
            .dialogs
            .create_refer_notify(dialog, status_fragment, &self.inner.builder)
            .await?;
        let destination = self.inner.route_for(dialog).await?;
        self.inner
            .submit(request, destination, ExchangeKind::Notify, None)
            .await
    }

    /// Answer an inbound INVITE with 180 Ringing. Establishes the early
    /// dialog and returns its id.
    pub async fn ringing(&self, key: &TransactionKey) -> Result<DialogId, SipError> {
        let request = self
            .inner
            .transactions
            .request_of(key)
            .await
            .ok_or_else(|| SipError::TransactionNotFound(key.to_string()))?;

        let (response, dialog_id) = self.inner.uas_response(key, &request, 180, None, None).await?;
        self.inner.transactions.send_response(key, response).await?;
        Ok(dialog_id)
    }

    /// Accept an inbound INVITE: 200 OK with our contact and the answer
    /// session description. The dialog confirms once the ACK arrives.
    pub async fn answer(
        &self,
        key: &TransactionKey,
        profile: &UserProfile,
        session_description: &str,
    ) -> Result<DialogId, SipError> {
        let request = self
            .inner
            .transactions
            .request_of(key)
            .await
            .ok_or_else(|| SipError::TransactionNotFound(key.to_string()))?;

        let contact_addr = profile
            .external_contact
            .unwrap_or_else(|| self.inner.transport.local_addr());
        let contact = format!("sip:{}@{}", profile.user(), contact_addr);

        let (response, dialog_id) = self
            .inner
            .uas_response(
                key,
                &request,
                200,
                Some(contact),
                Some(Payload::sdp(session_description)),
            )
            .await?;
        self.inner.transactions.send_response(key, response).await?;
        Ok(dialog_id)
    }

    /// Decline an inbound INVITE with 486 Busy Here.
    pub async fn busy(&self, key: &TransactionKey) -> Result<(), SipError> {
        self.respond(key, 486).await?;
        self.inner
            .drop_uas_call(key, TerminationReason::CallRejected(486))
            .await;
        Ok(())
    }

    /// Answer any server transaction with a plain status code.
    pub async fn respond(&self, key: &TransactionKey, status: u16) -> Result<(), SipError> {
        let request = self
            .inner
            .transactions
            .request_of(key)
            .await
            .ok_or_else(|| SipError::TransactionNotFound(key.to_string()))?;
        let response = ResponseBuilder::new(status).build_for_request(&request)?;
        self.inner.transactions.send_response(key, response).await
    }

    pub async fn dialog_state(&self, id: &DialogId) -> Option<DialogState> {
        self.inner.dialogs.state_of(id).await
    }

    /// When the registrar will drop the profile's binding, from the last
    /// accepted REGISTER.
    pub async fn registration_expiry(&self, profile: &UserProfile) -> Option<DateTime<Utc>> {
        let registrations = self.inner.registrations.read().await;
        registrations
            .get(&profile.uri())
            .and_then(|state| state.expires_at)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }
}

impl Drop for UserAgent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    async fn run(
        inner: Arc<Inner>,
        mut incoming: mpsc::Receiver<IncomingMessage>,
        mut layer_events: mpsc::Receiver<SipEvent>,
    ) {
        info!("user agent event loop started");
        loop {
            tokio::select! {
                maybe_message = incoming.recv() => match maybe_message {
                    Some(message) => inner.handle_incoming(message).await,
                    None => break,
                },
                maybe_event = layer_events.recv() => match maybe_event {
                    Some(event) => inner.handle_layer_event(event).await,
                    None => break,
                },
            }
        }
        info!("user agent event loop stopped");
    }

    async fn emit(&self, event: SipEvent) {
        if self.events.send(event).await.is_err() {
            debug!("application event channel closed");
        }
    }

    async fn send_raw(&self, data: Bytes, destination: SocketAddr) -> Result<(), SipError> {
        self.transport
            .send(OutgoingMessage { data, destination })
            .await
    }

    async fn handle_incoming(self: &Arc<Self>, incoming: IncomingMessage) {
        match incoming.message {
            SipMessage::Request(request) => self.handle_request(request, incoming.source).await,
            SipMessage::Response(response) => self.handle_response(response).await,
        }
    }

    /// Timer-driven outcomes from the transaction layer: clean our
    /// bookkeeping, then forward to the application.
    async fn handle_layer_event(&self, event: SipEvent) {
        if let SipEvent::TransactionTerminated { key, reason } = &event {
            let removed = self.pendings.write().await.remove(key);
            if let Some(pending) = removed {
                if matches!(pending.kind, ExchangeKind::Invite | ExchangeKind::Reinvite) {
                    self.terminate_call_dialogs(&pending.request, reason.clone())
                        .await;
                }
            }
        }
        self.emit(event).await;
    }

    /// Kill every dialog the given INVITE spawned (early forks included).
    async fn terminate_call_dialogs(&self, invite: &SipRequest, reason: TerminationReason) {
        if let (Some(call_id), Some(local_tag)) = (invite.call_id(), invite.from_tag()) {
            for id in self.dialogs.terminate_call(&call_id, &local_tag).await {
                self.dialog_routes.write().await.remove(&id);
                self.emit(SipEvent::DialogTerminated {
                    id,
                    reason: reason.clone(),
                })
                .await;
            }
        }
    }

    async fn route_for(&self, dialog: &DialogId) -> Result<SocketAddr, SipError> {
        let routes = self.dialog_routes.read().await;
        routes
            .get(dialog)
            .copied()
            .ok_or_else(|| SipError::DialogNotFound(dialog.to_string()))
    }

    /// Build a UAS response for an INVITE, creating (or reusing) the
    /// dialog that goes with it. Re-INVITEs keep their existing dialog.
    async fn uas_response(
        &self,
        key: &TransactionKey,
        request: &SipRequest,
        status: u16,
        contact: Option<String>,
        body: Option<Payload>,
    ) -> Result<(SipResponse, DialogId), SipError> {
        let dialog_id = if request.to_tag().is_some() {
            // in-dialog re-INVITE: the dialog already exists
            self.dialogs
                .match_request(request)
                .await
                .ok_or_else(|| SipError::DialogNotFound("re-INVITE outside dialog".to_string()))?
        } else {
            let local_tag = {
                let mut calls = self.uas_calls.write().await;
                calls
                    .entry(key.clone())
                    .or_insert_with(|| UasCall {
                        local_tag: new_tag(),
                        dialog: None,
                    })
                    .local_tag
                    .clone()
            };
            let id = self.dialogs.create_uas(request, &local_tag).await?;
            {
                let mut calls = self.uas_calls.write().await;
                if let Some(call) = calls.get_mut(key) {
                    call.dialog = Some(id.clone());
                }
            }
            if let Some(source) = self.transactions.destination_of(key).await {
                self.dialog_routes.write().await.insert(id.clone(), source);
            }
            id
        };

        let local_tag = dialog_id.local_tag.clone();
        let mut builder = ResponseBuilder::new(status).to_tag(&local_tag);
        if let Some(contact) = contact {
            builder = builder.contact(&contact);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let response = builder.build_for_request(request)?;
        Ok((response, dialog_id))
    }

    async fn drop_uas_call(&self, key: &TransactionKey, reason: TerminationReason) {
        let dialog = {
            let mut calls = self.uas_calls.write().await;
            calls.remove(key).and_then(|call| call.dialog)
        };
        if let Some(id) = dialog {
            if self.dialogs.terminate(&id).await {
                self.dialog_routes.write().await.remove(&id);
                self.emit(SipEvent::DialogTerminated { id, reason }).await;
            }
        }
    }

    /// Create a client transaction and remember what it was for. The
    /// bookkeeping goes in first so a transport-failure event cannot race
    /// past it.
    async fn submit(
        &self,
        request: SipRequest,
        destination: SocketAddr,
        kind: ExchangeKind,
        credentials: Option<DigestCredentials>,
    ) -> Result<TransactionKey, SipError> {
        let key = TransactionKey::for_request(&request)?;
        {
            let mut pendings = self.pendings.write().await;
            pendings.insert(
                key.clone(),
                PendingExchange {
                    kind,
                    request: request.clone(),
                    destination,
                    credentials,
                    cancel_requested: false,
                },
            );
        }

        match self
            .transactions
            .create_client_transaction(request, destination)
            .await
        {
            Ok(key) => Ok(key),
            Err(e) => {
                self.pendings.write().await.remove(&key);
                Err(e)
            }
        }
    }

    /// Compose and send the REGISTER for a tracked address of record.
    async fn send_register(&self, aor: &str) -> Result<TransactionKey, SipError> {
        let (request, registrar, credentials) = {
            let mut registrations = self.registrations.write().await;
            let state = registrations
                .get_mut(aor)
                .ok_or_else(|| SipError::InvalidState(format!("unknown registration {}", aor)))?;
            state.cseq += 1;
            let request = self.builder.register(
                &state.profile,
                &state.tag,
                &state.call_id,
                state.cseq,
                state.expires,
            )?;
            (request, state.registrar, state.profile.credentials.clone())
        };

        self.submit(
            request,
            registrar,
            ExchangeKind::Register {
                aor: aor.to_string(),
            },
            credentials,
        )
        .await
    }

    /// Schedule the refresh REGISTER at expiry minus the margin.
    async fn schedule_refresh(self: &Arc<Self>, aor: &str, granted_expires: u32) {
        let margin = self.config.register_refresh_margin;
        let delay = granted_expires.saturating_sub(margin).max(1) as u64;
        let weak: Weak<Inner> = Arc::downgrade(self);
        let aor_owned = aor.to_string();

        let mut registrations = self.registrations.write().await;
        let Some(state) = registrations.get_mut(aor) else {
            return;
        };
        if state.expires == 0 {
            return;
        }
        if let Some(old) = state.refresh_task.take() {
            old.abort();
        }
        debug!("registration {} refreshes in {}s", aor, delay);
        state.refresh_task = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay)).await;
            if let Some(inner) = weak.upgrade() {
                info!("refreshing registration {}", aor_owned);
                if let Err(e) = inner.send_register(&aor_owned).await {
                    warn!("registration refresh failed: {}", e);
                }
            }
        }));
    }

    async fn handle_request(self: &Arc<Self>, request: SipRequest, source: SocketAddr) {
        let disposition = match self
            .transactions
            .process_request(request.clone(), source)
            .await
        {
            Ok(disposition) => disposition,
            Err(e) => {
                warn!("dropping inbound request: {}", e);
                return;
            }
        };

        match disposition {
            RequestDisposition::New(key) => {
                self.handle_new_request(key, request, source).await;
            }
            RequestDisposition::Retransmission(_) => {}
            RequestDisposition::AckConfirmed(_) => {
                // ACK to our non-2xx final; nothing for the application
            }
            RequestDisposition::AckForDialog => {
                // end-to-end ACK for a 2xx: the call is up
                if let Some(id) = self.dialogs.match_request(&request).await {
                    let _ = self.dialogs.confirm(&id).await;
                    self.forget_uas_call(&id).await;
                    if let Ok(key) = TransactionKey::for_request(&request) {
                        self.emit(SipEvent::RequestReceived {
                            key,
                            request,
                            source,
                        })
                        .await;
                    }
                } else {
                    debug!("ACK matched no dialog, dropped");
                }
            }
            RequestDisposition::Cancelled { invite, .. } => {
                self.drop_uas_call(&invite, TerminationReason::Cancelled).await;
                self.emit(SipEvent::TransactionTerminated {
                    key: invite,
                    reason: TerminationReason::Cancelled,
                })
                .await;
            }
            RequestDisposition::CancelUnmatched(_) => {}
        }
    }

    /// The INVITE exchange is over once the ACK lands; its bookkeeping can go.
    async fn forget_uas_call(&self, dialog: &DialogId) {
        let mut calls = self.uas_calls.write().await;
        calls.retain(|_, call| call.dialog.as_ref() != Some(dialog));
    }

    async fn handle_new_request(
        self: &Arc<Self>,
        key: TransactionKey,
        request: SipRequest,
        source: SocketAddr,
    ) {
        // in-dialog requests must respect the peer's CSeq ordering
        if let Some(dialog_id) = self.dialogs.match_request(&request).await {
            if let Some((seq, method)) = request.cseq() {
                match self.dialogs.accept_remote_cseq(&dialog_id, seq).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("out-of-order CSeq {} on dialog {}", seq, dialog_id);
                        let _ = self.auto_respond(&key, &request, 500).await;
                        return;
                    }
                    Err(_) => {}
                }

                if method == SipMethod::Bye {
                    // session over: 200 the BYE and tear the dialog down
                    let _ = self.auto_respond(&key, &request, 200).await;
                    let existed = self.dialogs.terminate(&dialog_id).await;
                    self.dialog_routes.write().await.remove(&dialog_id);
                    self.emit(SipEvent::RequestReceived {
                        key,
                        request,
                        source,
                    })
                    .await;
                    if existed {
                        self.emit(SipEvent::DialogTerminated {
                            id: dialog_id,
                            reason: TerminationReason::Completed,
                        })
                        .await;
                    }
                    return;
                }
            }
        } else if request.method() == Some(SipMethod::Bye) {
            // BYE outside any dialog we know
            let _ = self.auto_respond(&key, &request, 481).await;
            return;
        }

        self.emit(SipEvent::RequestReceived {
            key,
            request,
            source,
        })
        .await;
    }

    async fn auto_respond(
        &self,
        key: &TransactionKey,
        request: &SipRequest,
        status: u16,
    ) -> Result<(), SipError> {
        let response = ResponseBuilder::new(status).build_for_request(request)?;
        self.transactions.send_response(key, response).await
    }

    async fn handle_response(self: &Arc<Self>, response: SipResponse) {
        let matched = match self.transactions.process_response(response.clone()).await {
            Ok(matched) => matched,
            Err(SipError::TransactionNotFound(_)) => {
                // late 2xx retransmission for a finished INVITE: re-ACK it
                self.reack_late_2xx(&response).await;
                return;
            }
            Err(e) => {
                warn!("dropping inbound response: {}", e);
                return;
            }
        };

        let Some((key, response)) = matched else {
            return; // absorbed retransmission
        };

        // digest challenges are consumed internally while credentials and
        // the retry budget hold out
        if response.is_final()
            && ChallengeResponder::is_challenge(&response)
            && self.try_answer_challenge(&key, &response).await
        {
            return;
        }

        let pending = if response.is_final() {
            self.pendings.write().await.remove(&key)
        } else {
            None
        };

        match pending {
            Some(pending) => self.conclude_exchange(key, response, pending).await,
            None => self.handle_untracked(key, response).await,
        }
    }

    /// Provisionals, and responses on transactions we are not tracking.
    async fn handle_untracked(&self, key: TransactionKey, response: SipResponse) {
        if response.is_provisional() && response.to_tag().is_some() {
            // a tagged provisional forms an early dialog
            let context = {
                let pendings = self.pendings.read().await;
                pendings
                    .get(&key)
                    .map(|p| (p.request.clone(), p.destination))
            };
            if let Some((request, destination)) = context {
                match self.dialogs.absorb_uac_response(&request, &response).await {
                    Ok(outcome) => {
                        self.dialog_routes
                            .write()
                            .await
                            .insert(outcome.id, destination);
                    }
                    Err(e) => debug!("ignoring malformed early dialog: {}", e),
                }
            }
        }
        self.emit(SipEvent::ResponseReceived { key, response }).await;
    }

    /// A final response closed a tracked exchange: do what the exchange
    /// demands, then surface it.
    async fn conclude_exchange(
        self: &Arc<Self>,
        key: TransactionKey,
        response: SipResponse,
        pending: PendingExchange,
    ) {
        let status = response.status_code();

        match &pending.kind {
            ExchangeKind::Register { aor } => {
                if response.is_success() {
                    let granted = response.expires().unwrap_or_else(|| {
                        pending
                            .request
                            .expires()
                            .unwrap_or(self.config.default_register_expires)
                    });
                    if let Some(call_id) = pending.request.call_id() {
                        self.auth.lock().await.clear(&call_id);
                    }
                    if granted > 0 && pending.request.expires() != Some(0) {
                        {
                            let mut registrations = self.registrations.write().await;
                            if let Some(state) = registrations.get_mut(aor) {
                                state.expires_at =
                                    Some(Utc::now() + chrono::Duration::seconds(granted as i64));
                            }
                        }
                        self.schedule_refresh(aor, granted).await;
                    } else {
                        self.registrations.write().await.remove(aor);
                        info!("deregistered {}", aor);
                    }
                } else {
                    warn!("registration {} failed with {}", aor, status);
                }
                self.emit(SipEvent::ResponseReceived {
                    key: key.clone(),
                    response,
                })
                .await;
                self.emit(SipEvent::TransactionTerminated {
                    key,
                    reason: TerminationReason::Completed,
                })
                .await;
            }

            ExchangeKind::Invite | ExchangeKind::Reinvite => {
                self.conclude_invite(key, response, pending).await;
            }

            ExchangeKind::Bye { dialog } => {
                let existed = self.dialogs.terminate(dialog).await;
                self.dialog_routes.write().await.remove(dialog);
                self.emit(SipEvent::ResponseReceived {
                    key: key.clone(),
                    response,
                })
                .await;
                self.emit(SipEvent::TransactionTerminated {
                    key,
                    reason: TerminationReason::Completed,
                })
                .await;
                if existed {
                    self.emit(SipEvent::DialogTerminated {
                        id: dialog.clone(),
                        reason: TerminationReason::Completed,
                    })
                    .await;
                }
            }

            ExchangeKind::Cancel | ExchangeKind::Options | ExchangeKind::Notify => {
                self.emit(SipEvent::ResponseReceived {
                    key: key.clone(),
                    response,
                })
                .await;
                self.emit(SipEvent::TransactionTerminated {
                    key,
                    reason: TerminationReason::Completed,
                })
                .await;
            }
        }
    }

    async fn conclude_invite(
        self: &Arc<Self>,
        key: TransactionKey,
        response: SipResponse,
        pending: PendingExchange,
    ) {
        let status = response.status_code();

        if response.is_success() {
            // dialog confirms; engine sends the end-to-end ACK
            match self
                .dialogs
                .absorb_uac_response(&pending.request, &response)
                .await
            {
                Ok(outcome) => {
                    self.dialog_routes
                        .write()
                        .await
                        .insert(outcome.id.clone(), pending.destination);
                    for dead in outcome.superseded {
                        self.dialog_routes.write().await.remove(&dead);
                        self.emit(SipEvent::DialogTerminated {
                            id: dead,
                            reason: TerminationReason::Completed,
                        })
                        .await;
                    }

                    let invite_cseq = pending.request.cseq().map(|(seq, _)| seq).unwrap_or(1);
                    if let Err(e) = self.send_dialog_ack(&outcome.id, invite_cseq).await {
                        warn!("failed to ACK 2xx on {}: {}", outcome.id, e);
                    }

                    if pending.cancel_requested {
                        // the 200 beat our CANCEL: accept, then hang up
                        info!("200 OK won the CANCEL race on {}, sending BYE", outcome.id);
                        if let Err(e) = self.bye_after_race(&outcome.id).await {
                            warn!("BYE after CANCEL race failed: {}", e);
                        }
                    }

                    if let Some(call_id) = pending.request.call_id() {
                        self.auth.lock().await.clear(&call_id);
                    }
                }
                Err(e) => warn!("2xx INVITE response without usable dialog: {}", e),
            }

            self.emit(SipEvent::ResponseReceived {
                key: key.clone(),
                response,
            })
            .await;
            self.emit(SipEvent::TransactionTerminated {
                key,
                reason: TerminationReason::Completed,
            })
            .await;
            return;
        }

        // non-2xx final: acknowledge so the server stops retransmitting
        if let Ok(ack) = self.builder.ack_for_error(&pending.request, &response) {
            if let Err(e) = self.send_raw(ack.to_bytes(), pending.destination).await {
                warn!("failed to ACK error response: {}", e);
            }
        }

        // a rejected initial INVITE kills the attempt's dialogs; a rejected
        // re-INVITE leaves the session up unless the error says it is gone
        let session_lost = matches!(pending.kind, ExchangeKind::Invite)
            || matches!(status, 481 | 408);
        if session_lost {
            self.terminate_call_dialogs(&pending.request, TerminationReason::CallRejected(status))
                .await;
        }

        if pending.cancel_requested && status == 487 {
            // our CANCEL worked; the 487 is the expected echo, not news
            self.emit(SipEvent::TransactionTerminated {
                key,
                reason: TerminationReason::Cancelled,
            })
            .await;
            return;
        }

        self.emit(SipEvent::ResponseReceived {
            key: key.clone(),
            response,
        })
        .await;
        self.emit(SipEvent::TransactionTerminated {
            key,
            reason: TerminationReason::CallRejected(status),
        })
        .await;
    }

    /// ACK a 2xx through the dialog, straight to the transport (no
    /// transaction of its own; RFC 3261 Section 13.2.2.4).
    async fn send_dialog_ack(&self, dialog: &DialogId, invite_cseq: u32) -> Result<(), SipError> {
        let ack = self
            .dialogs
            .create_ack(dialog, invite_cseq, &self.builder)
            .await?;
        let destination = self.route_for(dialog).await?;
        self.send_raw(ack.to_bytes(), destination).await
    }

    async fn bye_after_race(&self, dialog: &DialogId) -> Result<(), SipError> {
        let request = self
            .dialogs
            .create_request(dialog, SipMethod::Bye, None, &self.builder)
            .await?;
        let destination = self.route_for(dialog).await?;
        self.submit(
            request,
            destination,
            ExchangeKind::Bye {
                dialog: dialog.clone(),
            },
            None,
        )
        .await
        .map(|_| ())
    }

    /// Try to consume a 401/407 by resubmitting with credentials.
    /// Returns true when the challenge was handled (nothing surfaces
    /// except a terminal AuthExhausted).
    async fn try_answer_challenge(&self, key: &TransactionKey, response: &SipResponse) -> bool {
        let (original, destination, credentials, kind, cancel_requested) = {
            let pendings = self.pendings.read().await;
            match pendings.get(key) {
                Some(pending) => match &pending.credentials {
                    Some(credentials) => (
                        pending.request.clone(),
                        pending.destination,
                        credentials.clone(),
                        pending.kind.clone(),
                        pending.cancel_requested,
                    ),
                    None => return false,
                },
                None => return false,
            }
        };

        let answered = {
            let mut auth = self.auth.lock().await;
            auth.answer(&original, response, &credentials)
        };

        match answered {
            Ok(retry) => {
                // ACK the INVITE's 401/407 so the server stops retransmitting
                if original.method() == Some(SipMethod::Invite) {
                    if let Ok(ack) = self.builder.ack_for_error(&original, response) {
                        let _ = self.send_raw(ack.to_bytes(), destination).await;
                    }
                }

                let Ok(new_key) = TransactionKey::for_request(&retry) else {
                    return false;
                };
                {
                    let mut pendings = self.pendings.write().await;
                    pendings.remove(key);
                    pendings.insert(
                        new_key.clone(),
                        PendingExchange {
                            kind,
                            request: retry.clone(),
                            destination,
                            credentials: Some(credentials),
                            cancel_requested,
                        },
                    );
                }
                match self
                    .transactions
                    .create_client_transaction(retry, destination)
                    .await
                {
                    Ok(_) => {
                        debug!("challenge answered, resubmitted as {}", new_key);
                        true
                    }
                    Err(e) => {
                        warn!("failed to resubmit after challenge: {}", e);
                        self.pendings.write().await.remove(&new_key);
                        true
                    }
                }
            }
            Err(SipError::AuthExhausted(bound)) => {
                warn!("{}: challenge loop exceeded {} attempts", key, bound);
                self.pendings.write().await.remove(key);
                self.emit(SipEvent::TransactionTerminated {
                    key: key.clone(),
                    reason: TerminationReason::AuthExhausted,
                })
                .await;
                true
            }
            Err(e) => {
                debug!("challenge not answerable: {}", e);
                false
            }
        }
    }

    /// Re-ACK a retransmitted 2xx whose INVITE transaction is already gone.
    async fn reack_late_2xx(&self, response: &SipResponse) {
        if !response.is_success() {
            debug!("unmatched response {} dropped", response.status_code());
            return;
        }
        let Some((seq, method)) = response.cseq() else {
            return;
        };
        if method != SipMethod::Invite {
            return;
        }
        if let Some(id) = self.dialogs.match_response(response).await {
            debug!("re-ACKing retransmitted 2xx on {}", id);
            if let Err(e) = self.send_dialog_ack(&id, seq).await {
                debug!("re-ACK failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelTransport, TransportKind};

    fn agent() -> (UserAgent, mpsc::Receiver<SipEvent>) {
        let (transport, _wire) =
            ChannelTransport::new("127.0.0.1:5060".parse().unwrap(), TransportKind::Udp);
        let (_incoming_tx, incoming_rx) = mpsc::channel(16);
        UserAgent::new(EngineConfig::default(), Arc::new(transport), incoming_rx)
    }

    #[tokio::test]
    async fn test_agent_creation() {
        let (agent, _events) = agent();
        assert_eq!(agent.local_addr().port(), 5060);
    }

    #[tokio::test]
    async fn test_cancel_of_unknown_call_is_invalid() {
        let (agent, _events) = agent();
        let call = CallHandle {
            transaction: TransactionKey::new("z9hG4bK-nope", SipMethod::Invite),
            call_id: "nope@example.com".to_string(),
        };
        assert!(matches!(
            agent.cancel(&call).await,
            Err(SipError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_bye_requires_known_dialog() {
        let (agent, _events) = agent();
        let dialog = DialogId {
            call_id: "x@example.com".to_string(),
            local_tag: "a".to_string(),
            remote_tag: "b".to_string(),
        };
        assert!(matches!(
            agent.bye(&dialog).await,
            Err(SipError::DialogNotFound(_))
        ));
    }
}
