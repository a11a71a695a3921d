//! SIP dialog layer
//!
//! A dialog is the peer-to-peer relationship a successful INVITE (or other
//! dialog-forming request) establishes: Call-ID plus the two tags identify
//! it, and it owns the sequencing state every in-dialog request must respect
//! (RFC 3261 Section 12). Dialogs start Early on a tagged provisional,
//! become Confirmed on 2xx, and die on BYE completion, terminal error or
//! explicit teardown.

use crate::builder::{InDialogContext, Payload, RequestBuilder};
use crate::error::SipError;
use crate::message::{SipMethod, SipRequest, SipResponse};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Dialog identifier: Call-ID + local tag + remote tag.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// Established by a tagged provisional, awaiting the final answer.
    Early,
    Confirmed,
    Terminated,
}

impl DialogState {
    pub fn name(&self) -> &'static str {
        match self {
            DialogState::Early => "Early",
            DialogState::Confirmed => "Confirmed",
            DialogState::Terminated => "Terminated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogRole {
    /// We sent the dialog-forming request.
    Uac,
    /// We answered it.
    Uas,
}

/// One call leg.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub role: DialogRole,
    pub state: DialogState,
    local_uri: String,
    remote_uri: String,
    /// Where in-dialog requests go: the peer's Contact.
    remote_target: String,
    route_set: Vec<String>,
    local_seq: u32,
    remote_seq: Option<u32>,
}

impl Dialog {
    /// Dialog seen from the caller side, built from the dialog-forming
    /// request and the first tagged response.
    pub fn from_uac(request: &SipRequest, response: &SipResponse) -> Result<Self, SipError> {
        let call_id = request
            .call_id()
            .ok_or_else(|| SipError::MalformedMessage("request without Call-ID".to_string()))?;
        let local_tag = request
            .from_tag()
            .ok_or_else(|| SipError::MalformedMessage("request without From tag".to_string()))?;
        let remote_tag = response.to_tag().ok_or_else(|| {
            SipError::MalformedMessage("dialog-forming response without To tag".to_string())
        })?;
        let local_uri = request
            .from_uri()
            .ok_or_else(|| SipError::MalformedMessage("request without From".to_string()))?;
        let remote_uri = request
            .to_uri()
            .ok_or_else(|| SipError::MalformedMessage("request without To".to_string()))?;
        let (local_seq, _) = request
            .cseq()
            .ok_or_else(|| SipError::MalformedMessage("request without CSeq".to_string()))?;

        // target refresh: peer's contact, falling back to its public address
        let remote_target = response.contact_uri().unwrap_or_else(|| remote_uri.clone());

        // the UAC learns the route set from Record-Route, reversed
        let mut route_set = response.record_routes();
        route_set.reverse();

        let state = if response.is_provisional() {
            DialogState::Early
        } else {
            DialogState::Confirmed
        };

        Ok(Self {
            id: DialogId {
                call_id,
                local_tag,
                remote_tag,
            },
            role: DialogRole::Uac,
            state,
            local_uri,
            remote_uri,
            remote_target,
            route_set,
            local_seq,
            remote_seq: None,
        })
    }

    /// Dialog seen from the answering side. `local_tag` is the tag we stamp
    /// on our responses; the dialog starts Early until our 2xx goes out.
    pub fn from_uas(request: &SipRequest, local_tag: &str) -> Result<Self, SipError> {
        let call_id = request
            .call_id()
            .ok_or_else(|| SipError::MalformedMessage("request without Call-ID".to_string()))?;
        let remote_tag = request
            .from_tag()
            .ok_or_else(|| SipError::MalformedMessage("request without From tag".to_string()))?;
        let local_uri = request
            .to_uri()
            .ok_or_else(|| SipError::MalformedMessage("request without To".to_string()))?;
        let remote_uri = request
            .from_uri()
            .ok_or_else(|| SipError::MalformedMessage("request without From".to_string()))?;
        let (remote_seq, _) = request
            .cseq()
            .ok_or_else(|| SipError::MalformedMessage("request without CSeq".to_string()))?;
        let remote_target = request.contact_uri().unwrap_or_else(|| remote_uri.clone());

        Ok(Self {
            id: DialogId {
                call_id,
                local_tag: local_tag.to_string(),
                remote_tag,
            },
            role: DialogRole::Uas,
            state: DialogState::Early,
            local_uri,
            remote_uri,
            remote_target,
            route_set: request.record_routes(),
            local_seq: 0,
            remote_seq: Some(remote_seq),
        })
    }

    pub fn remote_target(&self) -> &str {
        &self.remote_target
    }

    pub fn local_seq(&self) -> u32 {
        self.local_seq
    }

    pub fn remote_seq(&self) -> Option<u32> {
        self.remote_seq
    }

    /// Next CSeq for a request we originate. Strictly increasing.
    pub fn next_local_cseq(&mut self) -> u32 {
        self.local_seq += 1;
        self.local_seq
    }

    /// Validate and record the peer's CSeq. Out-of-order in-dialog requests
    /// (below the highest seen) are rejected per Section 12.2.2.
    pub fn accept_remote_cseq(&mut self, seq: u32) -> bool {
        match self.remote_seq {
            Some(seen) if seq <= seen => false,
            _ => {
                self.remote_seq = Some(seq);
                true
            }
        }
    }

    /// Target refresh from a re-INVITE or its answer.
    pub fn refresh_remote_target(&mut self, contact_uri: &str) {
        self.remote_target = contact_uri.to_string();
    }

    pub fn confirm(&mut self) {
        if self.state == DialogState::Early {
            info!("dialog {} confirmed", self.id);
            self.state = DialogState::Confirmed;
        }
    }

    pub fn terminate(&mut self) {
        if self.state != DialogState::Terminated {
            info!("dialog {} terminated", self.id);
            self.state = DialogState::Terminated;
        }
    }

    /// Header context for a request carrying the given CSeq.
    fn context(&self, cseq: u32) -> InDialogContext {
        InDialogContext {
            call_id: self.id.call_id.clone(),
            from: format!("<{}>;tag={}", self.local_uri, self.id.local_tag),
            to: format!("<{}>;tag={}", self.remote_uri, self.id.remote_tag),
            target: self.remote_target.clone(),
            route_set: self.route_set.clone(),
            cseq,
        }
    }
}

/// What absorbing a UAC response did to the dialog set.
#[derive(Debug, Clone)]
pub struct UacDialogOutcome {
    pub id: DialogId,
    pub state: DialogState,
    pub newly_created: bool,
    /// Early dialogs killed because another fork won the call.
    pub superseded: Vec<DialogId>,
}

/// Owns every live dialog; all mutation happens under one lock, held just
/// long enough to update sequencing/route state.
pub struct DialogLayer {
    dialogs: Arc<RwLock<HashMap<DialogId, Dialog>>>,
}

impl DialogLayer {
    pub fn new() -> Self {
        Self {
            dialogs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Fold a tagged response to our dialog-forming request into the dialog
    /// set: create an early dialog on a tagged provisional, promote (or
    /// fork) on 2xx, and supersede losing early forks once one is
    /// confirmed.
    pub async fn absorb_uac_response(
        &self,
        request: &SipRequest,
        response: &SipResponse,
    ) -> Result<UacDialogOutcome, SipError> {
        let candidate = Dialog::from_uac(request, response)?;
        let id = candidate.id.clone();
        let mut dialogs = self.dialogs.write().await;

        let newly_created = match dialogs.get_mut(&id) {
            Some(existing) => {
                if response.is_success() {
                    existing.confirm();
                    if let Some(contact) = response.contact_uri() {
                        existing.refresh_remote_target(&contact);
                    }
                }
                false
            }
            None => {
                debug!(
                    "new {} dialog {} ({})",
                    match candidate.state {
                        DialogState::Early => "early",
                        _ => "confirmed",
                    },
                    id,
                    response.status_code()
                );
                dialogs.insert(id.clone(), candidate);
                true
            }
        };

        // a confirmed fork supersedes the other early dialogs of this call
        let mut superseded = Vec::new();
        if response.is_success() {
            for (other_id, other) in dialogs.iter_mut() {
                if other_id != &id
                    && other_id.call_id == id.call_id
                    && other_id.local_tag == id.local_tag
                    && other.state == DialogState::Early
                {
                    other.terminate();
                    superseded.push(other_id.clone());
                }
            }
            for dead in &superseded {
                dialogs.remove(dead);
            }
        }

        let state = dialogs
            .get(&id)
            .map(|d| d.state)
            .unwrap_or(DialogState::Terminated);

        Ok(UacDialogOutcome {
            id,
            state,
            newly_created,
            superseded,
        })
    }

    /// Register the UAS-side dialog for an INVITE we are answering.
    pub async fn create_uas(
        &self,
        request: &SipRequest,
        local_tag: &str,
    ) -> Result<DialogId, SipError> {
        let dialog = Dialog::from_uas(request, local_tag)?;
        let id = dialog.id.clone();
        let mut dialogs = self.dialogs.write().await;
        dialogs.entry(id.clone()).or_insert(dialog);
        Ok(id)
    }

    /// Promote a dialog to Confirmed (2xx sent or ACK seen).
    pub async fn confirm(&self, id: &DialogId) -> Result<(), SipError> {
        let mut dialogs = self.dialogs.write().await;
        let dialog = dialogs
            .get_mut(id)
            .ok_or_else(|| SipError::DialogNotFound(id.to_string()))?;
        dialog.confirm();
        Ok(())
    }

    /// Terminate and drop a dialog. Returns whether it existed.
    pub async fn terminate(&self, id: &DialogId) -> bool {
        let mut dialogs = self.dialogs.write().await;
        match dialogs.remove(id) {
            Some(mut dialog) => {
                dialog.terminate();
                true
            }
            None => false,
        }
    }

    pub async fn state_of(&self, id: &DialogId) -> Option<DialogState> {
        let dialogs = self.dialogs.read().await;
        dialogs.get(id).map(|d| d.state)
    }

    pub async fn dialog_count(&self) -> usize {
        let dialogs = self.dialogs.read().await;
        dialogs.len()
    }

    /// Match an inbound in-dialog request: their From tag is our remote
    /// tag, their To tag is our local tag.
    pub async fn match_request(&self, request: &SipRequest) -> Option<DialogId> {
        let id = DialogId {
            call_id: request.call_id()?,
            local_tag: request.to_tag()?,
            remote_tag: request.from_tag()?,
        };
        let dialogs = self.dialogs.read().await;
        dialogs.contains_key(&id).then_some(id)
    }

    /// Match a response to one of our in-dialog requests.
    pub async fn match_response(&self, response: &SipResponse) -> Option<DialogId> {
        let id = DialogId {
            call_id: response.call_id()?,
            local_tag: response.from_tag()?,
            remote_tag: response.to_tag()?,
        };
        let dialogs = self.dialogs.read().await;
        dialogs.contains_key(&id).then_some(id)
    }

    /// Record the peer's CSeq for an in-dialog request; false means the
    /// request is out of order and should be rejected with 500.
    pub async fn accept_remote_cseq(&self, id: &DialogId, seq: u32) -> Result<bool, SipError> {
        let mut dialogs = self.dialogs.write().await;
        let dialog = dialogs
            .get_mut(id)
            .ok_or_else(|| SipError::DialogNotFound(id.to_string()))?;
        Ok(dialog.accept_remote_cseq(seq))
    }

    /// Build the next in-dialog request, stamping the next local CSeq.
    pub async fn create_request(
        &self,
        id: &DialogId,
        method: SipMethod,
        body: Option<Payload>,
        builder: &RequestBuilder,
    ) -> Result<SipRequest, SipError> {
        let ctx = {
            let mut dialogs = self.dialogs.write().await;
            let dialog = dialogs
                .get_mut(id)
                .ok_or_else(|| SipError::DialogNotFound(id.to_string()))?;
            if dialog.state == DialogState::Terminated {
                return Err(SipError::InvalidState(format!(
                    "dialog {} is terminated",
                    id
                )));
            }
            let cseq = dialog.next_local_cseq();
            dialog.context(cseq)
        };
        builder.in_dialog(method, &ctx, body)
    }

    /// Build the ACK for a 2xx. The CSeq number mirrors the INVITE it
    /// acknowledges instead of advancing the dialog counter.
    pub async fn create_ack(
        &self,
        id: &DialogId,
        invite_cseq: u32,
        builder: &RequestBuilder,
    ) -> Result<SipRequest, SipError> {
        let ctx = {
            let dialogs = self.dialogs.read().await;
            let dialog = dialogs
                .get(id)
                .ok_or_else(|| SipError::DialogNotFound(id.to_string()))?;
            dialog.context(invite_cseq)
        };
        builder.in_dialog(SipMethod::Ack, &ctx, None)
    }

    /// NOTIFY the transfer originator about the transferred call's status.
    pub async fn create_refer_notify(
        &self,
        id: &DialogId,
        status_fragment: &str,
        builder: &RequestBuilder,
    ) -> Result<SipRequest, SipError> {
        let ctx = {
            let mut dialogs = self.dialogs.write().await;
            let dialog = dialogs
                .get_mut(id)
                .ok_or_else(|| SipError::DialogNotFound(id.to_string()))?;
            if dialog.state != DialogState::Confirmed {
                return Err(SipError::InvalidState(format!(
                    "dialog {} is {}",
                    id,
                    dialog.state.name()
                )));
            }
            let cseq = dialog.next_local_cseq();
            dialog.context(cseq)
        };
        builder.refer_notify(&ctx, status_fragment)
    }

    /// The destination for in-dialog traffic (the peer's contact URI).
    pub async fn remote_target(&self, id: &DialogId) -> Option<String> {
        let dialogs = self.dialogs.read().await;
        dialogs.get(id).map(|d| d.remote_target.clone())
    }

    /// Terminate every dialog (early forks included) spawned by the call
    /// identified by Call-ID + our tag. Returns the ids that died.
    pub async fn terminate_call(&self, call_id: &str, local_tag: &str) -> Vec<DialogId> {
        let mut dialogs = self.dialogs.write().await;
        let dead: Vec<DialogId> = dialogs
            .keys()
            .filter(|id| id.call_id == call_id && id.local_tag == local_tag)
            .cloned()
            .collect();
        for id in &dead {
            if let Some(mut dialog) = dialogs.remove(id) {
                dialog.terminate();
            }
        }
        dead
    }
}

impl Default for DialogLayer {
    fn default() -> Self {
        Self::new()
    }
}
