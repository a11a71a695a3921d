//! SIP message builders
//!
//! Assembles well-formed requests and responses from user profiles and
//! dialog context. Every call produces a fresh immutable message; a message
//! that has been handed to a transaction is never touched again.

use crate::config::EngineConfig;
use crate::error::SipError;
use crate::message::{SipMethod, SipRequest, SipResponse};
use crate::profile::UserProfile;
use crate::transport::TransportKind;
use rand::Rng;
use rsip::headers::{
    CallId, Contact, ContentLength, ContentType, Expires, From as FromHeader, MaxForwards, Route,
    To as ToHeader, UserAgent, Via,
};
use rsip::{Header, Headers, Response, StatusCode, Uri, Version};
use std::net::SocketAddr;

/// Magic cookie every RFC 3261 branch starts with.
pub const BRANCH_COOKIE: &str = "z9hG4bK";

/// Generate a transaction branch: magic cookie + random 64-bit token.
pub fn new_branch() -> String {
    let mut rng = rand::thread_rng();
    let random: u64 = rng.gen();
    format!("{}{:016x}", BRANCH_COOKIE, random)
}

/// Generate a From/To tag: random 64-bit token.
pub fn new_tag() -> String {
    let mut rng = rand::thread_rng();
    let random: u64 = rng.gen();
    format!("{:016x}", random)
}

/// Generate a Call-ID, unique per registration/call attempt.
pub fn new_call_id(host: &str) -> String {
    format!("{}@{}", uuid::Uuid::new_v4(), host)
}

/// A body with its content type.
#[derive(Debug, Clone)]
pub struct Payload {
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn sdp(session_description: &str) -> Self {
        Self {
            content_type: "application/sdp".to_string(),
            data: session_description.as_bytes().to_vec(),
        }
    }

    /// `message/sipfrag` payload for transfer-status NOTIFY.
    pub fn sipfrag(fragment: &str) -> Self {
        Self {
            content_type: "message/sipfrag".to_string(),
            data: fragment.as_bytes().to_vec(),
        }
    }
}

/// Extra headers for INVITE built during a transfer.
#[derive(Debug, Clone, Default)]
pub struct InviteOptions {
    pub referred_by: Option<String>,
    pub replaces: Option<String>,
}

/// Context for requests sent inside an established dialog. The dialog layer
/// fills this from its own state; the builder just stamps headers.
#[derive(Debug, Clone)]
pub struct InDialogContext {
    pub call_id: String,
    /// Full name-addr with our tag.
    pub from: String,
    /// Full name-addr with the peer's tag.
    pub to: String,
    /// Request-URI (the peer's contact).
    pub target: String,
    pub route_set: Vec<String>,
    pub cseq: u32,
}

/// Builds outgoing requests for one local endpoint.
pub struct RequestBuilder {
    user_agent: String,
    max_forwards: u32,
    local_addr: SocketAddr,
    transport: TransportKind,
}

impl RequestBuilder {
    pub fn new(config: &EngineConfig, local_addr: SocketAddr, transport: TransportKind) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            max_forwards: config.max_forwards,
            local_addr,
            transport,
        }
    }

    /// The Via header for a fresh transaction. rport is always requested so
    /// servers can route responses back through the sender's NAT mapping.
    fn via(&self, branch: &str) -> Header {
        Header::Via(Via::from(format!(
            "SIP/2.0/{} {};rport;branch={}",
            self.transport.as_str(),
            self.local_addr,
            branch
        )))
    }

    fn cseq(seq: u32, method: SipMethod) -> Header {
        Header::CSeq(rsip::headers::CSeq::from(format!(
            "{} {}",
            seq,
            method.as_str()
        )))
    }

    /// Contact for the given profile. The profile's external address
    /// override wins over the local socket address.
    fn contact(&self, profile: &UserProfile) -> Header {
        let addr = profile
            .external_contact
            .unwrap_or(self.local_addr);
        Header::Contact(Contact::from(format!(
            "<sip:{}@{};transport={}>",
            profile.user(),
            addr,
            self.transport.as_str().to_ascii_lowercase()
        )))
    }

    /// Core request skeleton: From/To/Via/CSeq/Call-ID/Max-Forwards/
    /// User-Agent, fresh branch.
    fn request(
        &self,
        method: SipMethod,
        target: &str,
        from: String,
        to: String,
        tag: &str,
        call_id: &str,
        seq: u32,
    ) -> Result<SipRequest, SipError> {
        let uri = Uri::try_from(target)
            .map_err(|e| SipError::MalformedProfile(format!("{}: {}", target, e)))?;

        let mut headers: Vec<Header> = Vec::new();
        headers.push(self.via(&new_branch()));
        headers.push(Header::MaxForwards(MaxForwards::from(self.max_forwards)));
        headers.push(Header::From(FromHeader::from(format!("{};tag={}", from, tag))));
        headers.push(Header::To(ToHeader::from(to)));
        headers.push(Header::CallId(CallId::from(call_id.to_string())));
        headers.push(Self::cseq(seq, method));
        headers.push(Header::UserAgent(UserAgent::from(self.user_agent.clone())));

        Ok(SipRequest::new(rsip::Request {
            method: method.to_rsip(),
            uri,
            version: Version::V2,
            headers: Headers::from(headers),
            body: Vec::new(),
        }))
    }

    fn finish(mut request: SipRequest, body: Option<Payload>) -> SipRequest {
        match body {
            Some(payload) => {
                request.inner.headers.push(Header::ContentType(ContentType::from(
                    payload.content_type,
                )));
                request.inner.headers.push(Header::ContentLength(
                    ContentLength::from(payload.data.len() as u32),
                ));
                request.inner.body = payload.data;
            }
            None => {
                request
                    .inner
                    .headers
                    .push(Header::ContentLength(ContentLength::from(0u32)));
            }
        }
        request
    }

    /// REGISTER for the profile's address of record. `expires == 0`
    /// deregisters with a wildcard Contact (RFC 3261 Section 10.2.2).
    pub fn register(
        &self,
        profile: &UserProfile,
        tag: &str,
        call_id: &str,
        seq: u32,
        expires: u32,
    ) -> Result<SipRequest, SipError> {
        let registrar = format!("sip:{}", profile.host());
        let mut request = self.request(
            SipMethod::Register,
            &registrar,
            profile.name_addr(),
            profile.name_addr(),
            tag,
            call_id,
            seq,
        )?;

        if expires == 0 {
            // remove all previous registrations by wildcard
            request
                .inner
                .headers
                .push(Header::Contact(Contact::from("*".to_string())));
        } else {
            request.inner.headers.push(self.contact(profile));
        }
        request
            .inner
            .headers
            .push(Header::Expires(Expires::from(expires)));

        Ok(Self::finish(request, None))
    }

    /// Out-of-dialog INVITE carrying the session description.
    pub fn invite(
        &self,
        caller: &UserProfile,
        callee: &UserProfile,
        tag: &str,
        call_id: &str,
        seq: u32,
        session_description: &str,
        options: InviteOptions,
    ) -> Result<SipRequest, SipError> {
        let mut request = self.request(
            SipMethod::Invite,
            &callee.uri(),
            caller.name_addr(),
            callee.name_addr(),
            tag,
            call_id,
            seq,
        )?;
        request.inner.headers.push(self.contact(caller));

        if let Some(referred_by) = options.referred_by {
            request
                .inner
                .headers
                .push(Header::Other("Referred-By".to_string(), referred_by));
        }
        if let Some(replaces) = options.replaces {
            request
                .inner
                .headers
                .push(Header::Other("Replaces".to_string(), replaces));
        }

        Ok(Self::finish(
            request,
            Some(Payload::sdp(session_description)),
        ))
    }

    /// OPTIONS keepalive. Caller and callee may be the same profile
    /// (self-probe towards the registrar).
    pub fn options(
        &self,
        caller: &UserProfile,
        callee: &UserProfile,
        tag: &str,
        call_id: &str,
        seq: u32,
    ) -> Result<SipRequest, SipError> {
        let target = if caller.uri() == callee.uri() {
            format!("sip:{}", caller.host())
        } else {
            callee.uri()
        };
        let mut request = self.request(
            SipMethod::Options,
            &target,
            caller.name_addr(),
            callee.name_addr(),
            tag,
            call_id,
            seq,
        )?;
        request.inner.headers.push(self.contact(caller));
        Ok(Self::finish(request, None))
    }

    /// CANCEL for a pending INVITE (RFC 3261 Section 9.1): same
    /// Request-URI, Call-ID, From, To and Route set, same CSeq number with
    /// method CANCEL, and the same branch so the server can match it.
    pub fn cancel(&self, invite: &SipRequest) -> Result<SipRequest, SipError> {
        if invite.method() != Some(SipMethod::Invite) {
            return Err(SipError::InvalidState(
                "CANCEL targets an INVITE request".to_string(),
            ));
        }
        let (seq, _) = invite
            .cseq()
            .ok_or_else(|| SipError::MalformedMessage("INVITE without CSeq".to_string()))?;

        let mut headers: Vec<Header> = Vec::new();
        for header in invite.headers().iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::To(_) | Header::CallId(_)
                | Header::Route(_) => headers.push(header.clone()),
                _ => {}
            }
        }
        headers.push(Header::MaxForwards(MaxForwards::from(self.max_forwards)));
        headers.push(Self::cseq(seq, SipMethod::Cancel));
        headers.push(Header::ContentLength(ContentLength::from(0u32)));

        Ok(SipRequest::new(rsip::Request {
            method: SipMethod::Cancel.to_rsip(),
            uri: invite.uri().clone(),
            version: Version::V2,
            headers: Headers::from(headers),
            body: Vec::new(),
        }))
    }

    /// ACK for a non-2xx final response (RFC 3261 Section 17.1.1.3): same
    /// branch and CSeq number as the INVITE, To taken from the response so
    /// the tag matches what the server sent.
    pub fn ack_for_error(
        &self,
        invite: &SipRequest,
        response: &SipResponse,
    ) -> Result<SipRequest, SipError> {
        let (seq, _) = invite
            .cseq()
            .ok_or_else(|| SipError::MalformedMessage("INVITE without CSeq".to_string()))?;

        let mut headers: Vec<Header> = Vec::new();
        for header in invite.headers().iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::Route(_) => {
                    headers.push(header.clone())
                }
                _ => {}
            }
        }
        // the response's To carries the tag the peer assigned
        for header in response.headers().iter() {
            if let Header::To(_) = header {
                headers.push(header.clone());
            }
        }
        headers.push(Header::MaxForwards(MaxForwards::from(self.max_forwards)));
        headers.push(Self::cseq(seq, SipMethod::Ack));
        headers.push(Header::ContentLength(ContentLength::from(0u32)));

        Ok(SipRequest::new(rsip::Request {
            method: SipMethod::Ack.to_rsip(),
            uri: invite.uri().clone(),
            version: Version::V2,
            headers: Headers::from(headers),
            body: Vec::new(),
        }))
    }

    /// Request inside an established dialog: CSeq and tags come from the
    /// dialog, the target is the peer's contact, the route set is replayed.
    pub fn in_dialog(
        &self,
        method: SipMethod,
        ctx: &InDialogContext,
        body: Option<Payload>,
    ) -> Result<SipRequest, SipError> {
        let uri = Uri::try_from(ctx.target.as_str())
            .map_err(|e| SipError::MalformedMessage(format!("{}: {}", ctx.target, e)))?;

        let mut headers: Vec<Header> = Vec::new();
        headers.push(self.via(&new_branch()));
        for route in &ctx.route_set {
            headers.push(Header::Route(Route::from(route.clone())));
        }
        headers.push(Header::MaxForwards(MaxForwards::from(self.max_forwards)));
        headers.push(Header::From(FromHeader::from(ctx.from.clone())));
        headers.push(Header::To(ToHeader::from(ctx.to.clone())));
        headers.push(Header::CallId(CallId::from(ctx.call_id.clone())));
        headers.push(Self::cseq(ctx.cseq, method));
        headers.push(Header::UserAgent(UserAgent::from(self.user_agent.clone())));

        let request = SipRequest::new(rsip::Request {
            method: method.to_rsip(),
            uri,
            version: Version::V2,
            headers: Headers::from(headers),
            body: Vec::new(),
        });
        Ok(Self::finish(request, body))
    }

    /// NOTIFY reporting a transferred call's status as a SIP fragment
    /// (`Event: refer`, RFC 3515).
    pub fn refer_notify(
        &self,
        ctx: &InDialogContext,
        status_fragment: &str,
    ) -> Result<SipRequest, SipError> {
        let mut request =
            self.in_dialog(SipMethod::Notify, ctx, Some(Payload::sipfrag(status_fragment)))?;
        request
            .inner
            .headers
            .push(Header::Other("Event".to_string(), "refer".to_string()));
        request.inner.headers.push(Header::Other(
            "Subscription-State".to_string(),
            "active;expires=60".to_string(),
        ));
        Ok(request)
    }
}

/// Build a response for a received request.
pub struct ResponseBuilder {
    status_code: u16,
    to_tag: Option<String>,
    contact: Option<String>,
    headers: Vec<Header>,
    body: Option<Payload>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            to_tag: None,
            contact: None,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn ringing() -> Self {
        Self::new(180)
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn busy_here() -> Self {
        Self::new(486)
    }

    pub fn request_terminated() -> Self {
        Self::new(487)
    }

    /// Tag for the To header; a dialog-forming response must carry one.
    pub fn to_tag(mut self, tag: &str) -> Self {
        self.to_tag = Some(tag.to_string());
        self
    }

    pub fn contact(mut self, contact_uri: &str) -> Self {
        self.contact = Some(contact_uri.to_string());
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn body(mut self, payload: Payload) -> Self {
        self.body = Some(payload);
        self
    }

    /// Copy the dialog-correlating headers (Via/Record-Route/From/To/
    /// Call-ID/CSeq) from the request, then apply this builder's additions.
    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers: Vec<Header> = Vec::new();

        for header in request.headers().iter() {
            match header {
                Header::Via(_) | Header::RecordRoute(_) | Header::From(_) | Header::CallId(_)
                | Header::CSeq(_) => headers.push(header.clone()),
                Header::To(to) => {
                    let value = to.to_string();
                    let value = value.strip_prefix("To: ").unwrap_or(&value).to_string();
                    let to_value = match (&self.to_tag, value.contains(";tag=")) {
                        (Some(tag), false) => format!("{};tag={}", value, tag),
                        _ => value,
                    };
                    headers.push(Header::To(ToHeader::from(to_value)));
                }
                _ => {}
            }
        }

        if let Some(contact) = &self.contact {
            headers.push(Header::Contact(Contact::from(format!("<{}>", contact))));
        }
        headers.extend(self.headers);

        let body = match self.body {
            Some(payload) => {
                headers.push(Header::ContentType(ContentType::from(payload.content_type)));
                headers.push(Header::ContentLength(ContentLength::from(
                    payload.data.len() as u32,
                )));
                payload.data
            }
            None => {
                headers.push(Header::ContentLength(ContentLength::from(0u32)));
                Vec::new()
            }
        };

        Ok(SipResponse::new(Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            version: Version::V2,
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> RequestBuilder {
        RequestBuilder::new(
            &EngineConfig::default(),
            "192.168.1.100:5060".parse().unwrap(),
            TransportKind::Udp,
        )
    }

    fn alice() -> UserProfile {
        UserProfile::from_uri("sip:alice@example.com").unwrap()
    }

    fn bob() -> UserProfile {
        UserProfile::from_uri("sip:bob@example.com").unwrap()
    }

    #[test]
    fn test_branch_carries_cookie() {
        let branch = new_branch();
        assert!(branch.starts_with(BRANCH_COOKIE));
        assert_ne!(new_branch(), new_branch());
    }

    #[test]
    fn test_register_request() {
        let call_id = new_call_id("example.com");
        let request = builder()
            .register(&alice(), &new_tag(), &call_id, 1, 3600)
            .unwrap();

        assert_eq!(request.method(), Some(SipMethod::Register));
        assert_eq!(request.call_id(), Some(call_id));
        assert_eq!(request.cseq(), Some((1, SipMethod::Register)));
        assert_eq!(request.expires(), Some(3600));
        assert!(request.branch().unwrap().starts_with(BRANCH_COOKIE));
        assert!(request.contact_uri().unwrap().contains("alice"));
    }

    #[test]
    fn test_deregister_uses_wildcard_contact() {
        let request = builder()
            .register(&alice(), &new_tag(), "dereg@example.com", 2, 0)
            .unwrap();

        assert_eq!(request.expires(), Some(0));
        // wildcard Contact has no URI
        assert_eq!(request.contact_uri(), None);
        let raw = String::from_utf8(request.to_bytes().to_vec()).unwrap();
        assert!(raw.contains("Contact: *"));
    }

    #[test]
    fn test_invite_carries_sdp() {
        let request = builder()
            .invite(
                &alice(),
                &bob(),
                &new_tag(),
                "call@example.com",
                1,
                "v=0\r\no=- 0 0 IN IP4 192.168.1.100\r\n",
                InviteOptions::default(),
            )
            .unwrap();

        assert_eq!(request.method(), Some(SipMethod::Invite));
        assert!(!request.body().is_empty());
        let raw = String::from_utf8(request.to_bytes().to_vec()).unwrap();
        assert!(raw.contains("Content-Type: application/sdp"));
        assert!(raw.contains("rport"));
    }

    #[test]
    fn test_invite_transfer_headers() {
        let request = builder()
            .invite(
                &alice(),
                &bob(),
                &new_tag(),
                "xfer@example.com",
                1,
                "v=0\r\n",
                InviteOptions {
                    referred_by: Some("<sip:carol@example.com>".to_string()),
                    replaces: Some("rep@example.com;to-tag=1;from-tag=2".to_string()),
                },
            )
            .unwrap();

        assert!(request.header_value("Referred-By").is_some());
        assert!(request.header_value("Replaces").is_some());
    }

    #[test]
    fn test_cancel_mirrors_invite() {
        let b = builder();
        let invite = b
            .invite(
                &alice(),
                &bob(),
                &new_tag(),
                "cx@example.com",
                7,
                "v=0\r\n",
                InviteOptions::default(),
            )
            .unwrap();
        let cancel = b.cancel(&invite).unwrap();

        assert_eq!(cancel.method(), Some(SipMethod::Cancel));
        assert_eq!(cancel.call_id(), invite.call_id());
        assert_eq!(cancel.branch(), invite.branch());
        assert_eq!(cancel.cseq(), Some((7, SipMethod::Cancel)));
        assert_eq!(cancel.from_tag(), invite.from_tag());
    }

    #[test]
    fn test_cancel_rejects_non_invite() {
        let b = builder();
        let register = b
            .register(&alice(), &new_tag(), "r@example.com", 1, 3600)
            .unwrap();
        assert!(matches!(
            b.cancel(&register),
            Err(SipError::InvalidState(_))
        ));
    }

    #[test]
    fn test_in_dialog_request_stamps_dialog_state() {
        let ctx = InDialogContext {
            call_id: "dlg@example.com".to_string(),
            from: "<sip:alice@example.com>;tag=atag".to_string(),
            to: "<sip:bob@example.com>;tag=btag".to_string(),
            target: "sip:bob@192.168.1.200:5060".to_string(),
            route_set: vec!["<sip:proxy.example.com;lr>".to_string()],
            cseq: 3,
        };
        let request = builder().in_dialog(SipMethod::Bye, &ctx, None).unwrap();

        assert_eq!(request.method(), Some(SipMethod::Bye));
        assert_eq!(request.cseq(), Some((3, SipMethod::Bye)));
        assert_eq!(request.from_tag(), Some("atag".to_string()));
        assert_eq!(request.to_tag(), Some("btag".to_string()));
        let raw = String::from_utf8(request.to_bytes().to_vec()).unwrap();
        assert!(raw.contains("Route: <sip:proxy.example.com;lr>"));
    }

    #[test]
    fn test_refer_notify() {
        let ctx = InDialogContext {
            call_id: "dlg@example.com".to_string(),
            from: "<sip:alice@example.com>;tag=atag".to_string(),
            to: "<sip:bob@example.com>;tag=btag".to_string(),
            target: "sip:bob@192.168.1.200:5060".to_string(),
            route_set: Vec::new(),
            cseq: 4,
        };
        let request = builder()
            .refer_notify(&ctx, "SIP/2.0 200 OK\r\n")
            .unwrap();

        assert_eq!(request.method(), Some(SipMethod::Notify));
        assert_eq!(request.header_value("Event").as_deref(), Some("refer"));
        assert_eq!(
            request.header_value("Subscription-State").as_deref(),
            Some("active;expires=60")
        );
        let raw = String::from_utf8(request.to_bytes().to_vec()).unwrap();
        assert!(raw.contains("message/sipfrag"));
    }

    #[test]
    fn test_response_copies_correlating_headers() {
        let invite = builder()
            .invite(
                &alice(),
                &bob(),
                &new_tag(),
                "resp@example.com",
                1,
                "v=0\r\n",
                InviteOptions::default(),
            )
            .unwrap();

        let response = ResponseBuilder::ringing()
            .to_tag("server-tag")
            .build_for_request(&invite)
            .unwrap();

        assert_eq!(response.status_code(), 180);
        assert_eq!(response.call_id(), invite.call_id());
        assert_eq!(response.cseq(), invite.cseq());
        assert_eq!(response.branch(), invite.branch());
        assert_eq!(response.to_tag(), Some("server-tag".to_string()));
        assert_eq!(response.from_tag(), invite.from_tag());
    }

    #[test]
    fn test_ok_with_sdp_and_contact() {
        let invite = builder()
            .invite(
                &alice(),
                &bob(),
                &new_tag(),
                "ok@example.com",
                1,
                "v=0\r\n",
                InviteOptions::default(),
            )
            .unwrap();

        let response = ResponseBuilder::ok()
            .to_tag("t1")
            .contact("sip:bob@192.168.1.200:5060")
            .body(Payload::sdp("v=0\r\no=answer 0 0 IN IP4 10.0.0.2\r\n"))
            .build_for_request(&invite)
            .unwrap();

        assert_eq!(response.status_code(), 200);
        assert!(!response.body().is_empty());
        assert_eq!(
            response.contact_uri(),
            Some("sip:bob@192.168.1.200:5060".to_string())
        );
    }

    #[test]
    fn test_ack_for_error_takes_response_to_tag() {
        let b = builder();
        let invite = b
            .invite(
                &alice(),
                &bob(),
                &new_tag(),
                "err@example.com",
                5,
                "v=0\r\n",
                InviteOptions::default(),
            )
            .unwrap();
        let busy = ResponseBuilder::busy_here()
            .to_tag("busy-tag")
            .build_for_request(&invite)
            .unwrap();

        let ack = b.ack_for_error(&invite, &busy).unwrap();
        assert_eq!(ack.method(), Some(SipMethod::Ack));
        assert_eq!(ack.cseq(), Some((5, SipMethod::Ack)));
        assert_eq!(ack.branch(), invite.branch());
        assert_eq!(ack.to_tag(), Some("busy-tag".to_string()));
    }
}
