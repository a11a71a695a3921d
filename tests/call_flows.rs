//! End-to-end signaling flows over an in-memory transport.
//!
//! Two styles of harness: `TestPeer` scripts the far end byte-by-byte for
//! the flows where exact wire behavior matters (auth challenge, CANCEL
//! races, registration refresh), and `link` wires two real user agents
//! back-to-back for the full call scenario.

use confab::{
    CallHandle, ChannelTransport, DialogId, DialogState, EngineConfig, IncomingMessage,
    InviteOptions, OutgoingMessage, Payload, ResponseBuilder, SipEvent, SipMessage, SipMethod,
    SipRequest, SipResponse, SipTimers, TerminationReason, TransportKind, UserAgent, UserProfile,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn quiet_config() -> EngineConfig {
    init_tracing();
    // big T1 keeps retransmissions out of prompt request/response tests
    EngineConfig {
        timers: SipTimers {
            t1: Duration::from_secs(3),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        },
        register_refresh_margin: 60,
        ..EngineConfig::default()
    }
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

/// Scripted far end: reads what the agent put on the wire, answers by
/// injecting into the agent's incoming channel.
struct TestPeer {
    wire: mpsc::UnboundedReceiver<OutgoingMessage>,
    incoming: mpsc::Sender<IncomingMessage>,
    source: SocketAddr,
}

impl TestPeer {
    async fn recv(&mut self) -> SipMessage {
        let out = tokio::time::timeout(Duration::from_secs(5), self.wire.recv())
            .await
            .expect("peer expected a message")
            .expect("wire closed");
        SipMessage::parse(&out.data).expect("agent sent unparseable bytes")
    }

    async fn recv_request(&mut self) -> SipRequest {
        match self.recv().await {
            SipMessage::Request(request) => request,
            SipMessage::Response(response) => {
                panic!("expected request, got response {}", response.status_code())
            }
        }
    }

    async fn inject_response(&self, response: SipResponse) {
        self.incoming
            .send(IncomingMessage {
                message: SipMessage::Response(response),
                source: self.source,
            })
            .await
            .unwrap();
    }

    async fn inject_request(&self, request: SipRequest) {
        self.incoming
            .send(IncomingMessage {
                message: SipMessage::Request(request),
                source: self.source,
            })
            .await
            .unwrap();
    }
}

/// One agent wired to a scripted peer.
fn agent_with_peer(config: EngineConfig) -> (UserAgent, mpsc::Receiver<SipEvent>, TestPeer) {
    let local = addr(5060);
    let peer_addr = addr(5070);
    let (transport, wire) = ChannelTransport::new(local, TransportKind::Udp);
    let (incoming_tx, incoming_rx) = mpsc::channel(64);
    let (agent, events) = UserAgent::new(config, Arc::new(transport), incoming_rx);
    (
        agent,
        events,
        TestPeer {
            wire,
            incoming: incoming_tx,
            source: peer_addr,
        },
    )
}

async fn next_event(events: &mut mpsc::Receiver<SipEvent>) -> SipEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("expected an event")
        .expect("event channel closed")
}

/// The UAC-side dialog id encoded in a 2xx to our INVITE.
fn uac_dialog_id(handle: &CallHandle, response: &SipResponse) -> DialogId {
    DialogId {
        call_id: handle.call_id.clone(),
        local_tag: response.from_tag().unwrap(),
        remote_tag: response.to_tag().unwrap(),
    }
}

fn alice() -> UserProfile {
    UserProfile::from_uri("sip:alice@example.com").unwrap()
}

fn bob() -> UserProfile {
    UserProfile::from_uri("sip:bob@example.com").unwrap()
}

#[tokio::test]
async fn register_then_deregister_share_call_id() {
    let (agent, mut events, mut peer) = agent_with_peer(quiet_config());

    agent
        .register_with_expires(&alice(), peer.source, 3600)
        .await
        .unwrap();

    let first = peer.recv_request().await;
    assert_eq!(first.method(), Some(SipMethod::Register));
    assert_eq!(first.expires(), Some(3600));
    let (first_seq, _) = first.cseq().unwrap();
    let call_id = first.call_id().unwrap();
    assert!(first.contact_uri().unwrap().contains("alice"));

    peer.inject_response(ResponseBuilder::ok().build_for_request(&first).unwrap())
        .await;
    // 200 surfaces, then the transaction concludes
    assert!(matches!(
        next_event(&mut events).await,
        SipEvent::ResponseReceived { .. }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        SipEvent::TransactionTerminated {
            reason: TerminationReason::Completed,
            ..
        }
    ));
    // the binding's lifetime is tracked
    assert!(agent.registration_expiry(&alice()).await.is_some());

    agent.deregister(&alice(), peer.source).await.unwrap();
    let second = peer.recv_request().await;
    assert_eq!(second.method(), Some(SipMethod::Register));
    assert_eq!(second.expires(), Some(0));
    // wildcard form removes every binding
    let raw = String::from_utf8(second.to_bytes().to_vec()).unwrap();
    assert!(raw.contains("Contact: *"));
    // same exchange: same Call-ID, later CSeq
    assert_eq!(second.call_id().unwrap(), call_id);
    let (second_seq, _) = second.cseq().unwrap();
    assert!(second_seq > first_seq);
}

#[tokio::test]
async fn registration_refreshes_before_expiry() {
    let (agent, mut _events, mut peer) = agent_with_peer(quiet_config());

    // margin 60, expiry 61: refresh due one second after the 200
    agent
        .register_with_expires(&alice(), peer.source, 61)
        .await
        .unwrap();

    let first = peer.recv_request().await;
    let (first_seq, _) = first.cseq().unwrap();
    peer.inject_response(ResponseBuilder::ok().build_for_request(&first).unwrap())
        .await;

    let refresh = peer.recv_request().await;
    assert_eq!(refresh.method(), Some(SipMethod::Register));
    assert_eq!(refresh.call_id(), first.call_id());
    let (refresh_seq, _) = refresh.cseq().unwrap();
    assert_eq!(refresh_seq, first_seq + 1);
}

#[tokio::test]
async fn register_answers_digest_challenge_with_cseq_plus_one() {
    let mut profile = alice();
    profile = profile.with_credentials("alice", "secret");
    let (agent, mut events, mut peer) = agent_with_peer(quiet_config());

    agent
        .register_with_expires(&profile, peer.source, 3600)
        .await
        .unwrap();

    let first = peer.recv_request().await;
    let (first_seq, _) = first.cseq().unwrap();

    let challenge = ResponseBuilder::new(401)
        .header(rsip::Header::WwwAuthenticate(
            rsip::headers::WwwAuthenticate::from(
                r#"Digest realm="example.com", nonce="xyz", algorithm=MD5, qop="auth""#.to_string(),
            ),
        ))
        .build_for_request(&first)
        .unwrap();
    peer.inject_response(challenge).await;

    // the retry carries credentials and the next CSeq, same Call-ID
    let retry = peer.recv_request().await;
    assert_eq!(retry.method(), Some(SipMethod::Register));
    assert_eq!(retry.call_id(), first.call_id());
    let (retry_seq, _) = retry.cseq().unwrap();
    assert_eq!(retry_seq, first_seq + 1);
    assert_ne!(retry.branch(), first.branch());
    let raw = String::from_utf8(retry.to_bytes().to_vec()).unwrap();
    assert!(raw.contains("Authorization: Digest username=\"alice\""));
    assert!(raw.contains("response="));

    peer.inject_response(ResponseBuilder::ok().build_for_request(&retry).unwrap())
        .await;
    let event = next_event(&mut events).await;
    match event {
        SipEvent::ResponseReceived { response, .. } => assert_eq!(response.status_code(), 200),
        other => panic!("expected the 200, got {:?}", other),
    }
}

#[tokio::test]
async fn invite_challenge_then_answer_establishes_dialog() {
    let mut caller = alice();
    caller = caller.with_credentials("alice", "secret");
    let (agent, mut events, mut peer) = agent_with_peer(quiet_config());

    let handle = agent
        .invite(&caller, &bob(), peer.source, "v=0\r\n", InviteOptions::default())
        .await
        .unwrap();

    let invite = peer.recv_request().await;
    assert_eq!(invite.method(), Some(SipMethod::Invite));
    let (invite_seq, _) = invite.cseq().unwrap();

    // challenge it
    let challenge = ResponseBuilder::new(401)
        .to_tag("challenge-tag")
        .header(rsip::Header::WwwAuthenticate(
            rsip::headers::WwwAuthenticate::from(
                r#"Digest realm="example.com", nonce="n1""#.to_string(),
            ),
        ))
        .build_for_request(&invite)
        .unwrap();
    peer.inject_response(challenge).await;

    // the engine ACKs the 401 before retrying
    let ack = peer.recv_request().await;
    assert_eq!(ack.method(), Some(SipMethod::Ack));
    assert_eq!(ack.branch(), invite.branch());

    let retry = peer.recv_request().await;
    assert_eq!(retry.method(), Some(SipMethod::Invite));
    let (retry_seq, _) = retry.cseq().unwrap();
    assert_eq!(retry_seq, invite_seq + 1);
    let raw = String::from_utf8(retry.to_bytes().to_vec()).unwrap();
    assert!(raw.contains("Authorization: Digest"));

    // ring, then answer
    peer.inject_response(
        ResponseBuilder::ringing()
            .to_tag("t1")
            .build_for_request(&retry)
            .unwrap(),
    )
    .await;
    match next_event(&mut events).await {
        SipEvent::ResponseReceived { response, .. } => assert_eq!(response.status_code(), 180),
        other => panic!("expected 180, got {:?}", other),
    }

    peer.inject_response(
        ResponseBuilder::ok()
            .to_tag("t1")
            .contact("sip:bob@127.0.0.1:5070")
            .body(Payload::sdp("v=0\r\n"))
            .build_for_request(&retry)
            .unwrap(),
    )
    .await;

    // engine ACKs the 2xx through the dialog
    let ack2 = peer.recv_request().await;
    assert_eq!(ack2.method(), Some(SipMethod::Ack));
    assert_eq!(ack2.cseq(), Some((retry_seq, SipMethod::Ack)));

    let ok = loop {
        match next_event(&mut events).await {
            SipEvent::ResponseReceived { response, .. } if response.status_code() == 200 => {
                break response
            }
            SipEvent::TransactionTerminated { .. } => continue,
            other => panic!("unexpected event {:?}", other),
        }
    };

    let dialog = uac_dialog_id(&handle, &ok);
    assert_eq!(agent.dialog_state(&dialog).await, Some(DialogState::Confirmed));
}

#[tokio::test]
async fn cancel_before_answer_yields_487_race_losing_side() {
    let (agent, mut events, mut peer) = agent_with_peer(quiet_config());

    let handle = agent
        .invite(&alice(), &bob(), peer.source, "v=0\r\n", InviteOptions::default())
        .await
        .unwrap();
    let invite = peer.recv_request().await;

    // 100 Trying keeps the transaction in Proceeding
    peer.inject_response(ResponseBuilder::new(100).build_for_request(&invite).unwrap())
        .await;
    match next_event(&mut events).await {
        SipEvent::ResponseReceived { response, .. } => assert_eq!(response.status_code(), 100),
        other => panic!("expected 100, got {:?}", other),
    }

    agent.cancel(&handle).await.unwrap();
    let cancel = peer.recv_request().await;
    assert_eq!(cancel.method(), Some(SipMethod::Cancel));
    assert_eq!(cancel.branch(), invite.branch());
    assert_eq!(
        cancel.cseq().map(|(seq, _)| seq),
        invite.cseq().map(|(seq, _)| seq)
    );

    // server: 200 for the CANCEL, 487 for the INVITE
    peer.inject_response(ResponseBuilder::ok().build_for_request(&cancel).unwrap())
        .await;
    peer.inject_response(
        ResponseBuilder::request_terminated()
            .to_tag("t487")
            .build_for_request(&invite)
            .unwrap(),
    )
    .await;

    // the 487 is ACKed on the INVITE branch
    let ack = peer.recv_request().await;
    assert_eq!(ack.method(), Some(SipMethod::Ack));
    assert_eq!(ack.branch(), invite.branch());

    // events: CANCEL's own 200 surfaces; the 487 is swallowed as the
    // expected outcome and the INVITE terminates Cancelled
    let mut cancelled = false;
    for _ in 0..4 {
        match next_event(&mut events).await {
            SipEvent::TransactionTerminated { key, reason } if key == handle.transaction => {
                assert_eq!(reason, TerminationReason::Cancelled);
                cancelled = true;
                break;
            }
            _ => continue,
        }
    }
    assert!(cancelled);
}

#[tokio::test]
async fn ok_racing_past_cancel_wins_and_engine_hangs_up() {
    let (agent, mut events, mut peer) = agent_with_peer(quiet_config());

    let handle = agent
        .invite(&alice(), &bob(), peer.source, "v=0\r\n", InviteOptions::default())
        .await
        .unwrap();
    let invite = peer.recv_request().await;

    peer.inject_response(
        ResponseBuilder::ringing()
            .to_tag("t1")
            .build_for_request(&invite)
            .unwrap(),
    )
    .await;
    let _ = next_event(&mut events).await; // 180

    agent.cancel(&handle).await.unwrap();
    let cancel = peer.recv_request().await;
    assert_eq!(cancel.method(), Some(SipMethod::Cancel));

    // the callee answered before the CANCEL reached it
    peer.inject_response(
        ResponseBuilder::ok()
            .to_tag("t1")
            .contact("sip:bob@127.0.0.1:5070")
            .build_for_request(&invite)
            .unwrap(),
    )
    .await;

    // engine accepts the call (ACK) and immediately hangs up (BYE)
    let mut saw_ack = false;
    let mut bye: Option<SipRequest> = None;
    for _ in 0..3 {
        let request = peer.recv_request().await;
        match request.method() {
            Some(SipMethod::Ack) => saw_ack = true,
            Some(SipMethod::Bye) => {
                bye = Some(request);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_ack);
    let bye = bye.expect("expected a BYE after the lost CANCEL race");
    assert_eq!(bye.call_id().unwrap(), handle.call_id);

    // answer the BYE; the dialog dies
    peer.inject_response(ResponseBuilder::ok().build_for_request(&bye).unwrap())
        .await;
    let mut dialog_terminated = false;
    for _ in 0..8 {
        match next_event(&mut events).await {
            SipEvent::DialogTerminated { .. } => {
                dialog_terminated = true;
                break;
            }
            _ => continue,
        }
    }
    assert!(dialog_terminated);
}

/// Pump everything one agent puts on the wire into the other agent's
/// incoming channel.
fn link(
    mut wire: mpsc::UnboundedReceiver<OutgoingMessage>,
    incoming: mpsc::Sender<IncomingMessage>,
    source: SocketAddr,
) {
    tokio::spawn(async move {
        while let Some(out) = wire.recv().await {
            if let Ok(message) = SipMessage::parse(&out.data) {
                if incoming
                    .send(IncomingMessage { message, source })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    });
}

#[tokio::test]
async fn full_call_between_two_agents() {
    let a_addr = addr(5060);
    let b_addr = addr(5062);

    let (a_transport, a_wire) = ChannelTransport::new(a_addr, TransportKind::Udp);
    let (b_transport, b_wire) = ChannelTransport::new(b_addr, TransportKind::Udp);
    let (a_in_tx, a_in_rx) = mpsc::channel(64);
    let (b_in_tx, b_in_rx) = mpsc::channel(64);

    let (a, mut a_events) = UserAgent::new(quiet_config(), Arc::new(a_transport), a_in_rx);
    let (b, mut b_events) = UserAgent::new(quiet_config(), Arc::new(b_transport), b_in_rx);

    link(a_wire, b_in_tx, a_addr);
    link(b_wire, a_in_tx, b_addr);

    let handle = a
        .invite(&alice(), &bob(), b_addr, "v=0\r\n", InviteOptions::default())
        .await
        .unwrap();

    // B sees the INVITE and rings, then answers
    let (b_key, b_request) = loop {
        match next_event(&mut b_events).await {
            SipEvent::RequestReceived { key, request, .. }
                if request.method() == Some(SipMethod::Invite) =>
            {
                break (key, request)
            }
            other => panic!("unexpected event at B: {:?}", other),
        }
    };
    assert_eq!(b_request.call_id().unwrap(), handle.call_id);

    let b_dialog = b.ringing(&b_key).await.unwrap();
    assert_eq!(b.dialog_state(&b_dialog).await, Some(DialogState::Early));

    // A sees 180 with a tag: early dialog on the caller side too
    let ringing = loop {
        match next_event(&mut a_events).await {
            SipEvent::ResponseReceived { response, .. } if response.status_code() == 180 => {
                break response
            }
            other => panic!("unexpected event at A: {:?}", other),
        }
    };
    let a_dialog = uac_dialog_id(&handle, &ringing);
    assert_eq!(a.dialog_state(&a_dialog).await, Some(DialogState::Early));

    let answered = b.answer(&b_key, &bob(), "v=0\r\n").await.unwrap();
    assert_eq!(answered, b_dialog);

    // A gets the 200; the engine ACKs; both sides confirm
    loop {
        match next_event(&mut a_events).await {
            SipEvent::ResponseReceived { response, .. } if response.status_code() == 200 => break,
            SipEvent::TransactionTerminated { .. } | SipEvent::DialogTerminated { .. } => continue,
            other => panic!("unexpected event at A: {:?}", other),
        }
    }
    assert_eq!(a.dialog_state(&a_dialog).await, Some(DialogState::Confirmed));

    // B observes the ACK
    loop {
        match next_event(&mut b_events).await {
            SipEvent::RequestReceived { request, .. }
                if request.method() == Some(SipMethod::Ack) =>
            {
                break
            }
            SipEvent::TransactionTerminated { .. } => continue,
            other => panic!("unexpected event at B: {:?}", other),
        }
    }
    assert_eq!(b.dialog_state(&b_dialog).await, Some(DialogState::Confirmed));

    // A hangs up; both dialogs terminate after the BYE transaction
    a.bye(&a_dialog).await.unwrap();

    let mut b_terminated = false;
    for _ in 0..6 {
        match next_event(&mut b_events).await {
            SipEvent::DialogTerminated { id, reason } => {
                assert_eq!(id, b_dialog);
                assert_eq!(reason, TerminationReason::Completed);
                b_terminated = true;
                break;
            }
            _ => continue,
        }
    }
    assert!(b_terminated);

    let mut a_terminated = false;
    for _ in 0..6 {
        match next_event(&mut a_events).await {
            SipEvent::DialogTerminated { id, reason } => {
                assert_eq!(id, a_dialog);
                assert_eq!(reason, TerminationReason::Completed);
                a_terminated = true;
                break;
            }
            _ => continue,
        }
    }
    assert!(a_terminated);

    assert_eq!(a.dialog_state(&a_dialog).await, None);
    assert_eq!(b.dialog_state(&b_dialog).await, None);
}

#[tokio::test]
async fn callee_busy_rejects_call() {
    let a_addr = addr(5060);
    let b_addr = addr(5062);

    let (a_transport, a_wire) = ChannelTransport::new(a_addr, TransportKind::Udp);
    let (b_transport, b_wire) = ChannelTransport::new(b_addr, TransportKind::Udp);
    let (a_in_tx, a_in_rx) = mpsc::channel(64);
    let (b_in_tx, b_in_rx) = mpsc::channel(64);

    let (a, mut a_events) = UserAgent::new(quiet_config(), Arc::new(a_transport), a_in_rx);
    let (b, mut b_events) = UserAgent::new(quiet_config(), Arc::new(b_transport), b_in_rx);

    link(a_wire, b_in_tx, a_addr);
    link(b_wire, a_in_tx, b_addr);

    let handle = a
        .invite(&alice(), &bob(), b_addr, "v=0\r\n", InviteOptions::default())
        .await
        .unwrap();

    let b_key = loop {
        match next_event(&mut b_events).await {
            SipEvent::RequestReceived { key, request, .. }
                if request.method() == Some(SipMethod::Invite) =>
            {
                break key
            }
            other => panic!("unexpected event at B: {:?}", other),
        }
    };
    b.busy(&b_key).await.unwrap();

    // caller sees the 486 and the terminal classification
    let mut rejected = false;
    for _ in 0..4 {
        match next_event(&mut a_events).await {
            SipEvent::TransactionTerminated { key, reason } if key == handle.transaction => {
                assert_eq!(reason, TerminationReason::CallRejected(486));
                rejected = true;
                break;
            }
            _ => continue,
        }
    }
    assert!(rejected);
}

#[tokio::test]
async fn notify_reports_transfer_status_inside_dialog() {
    let (agent, mut events, mut peer) = agent_with_peer(quiet_config());

    let handle = agent
        .invite(&alice(), &bob(), peer.source, "v=0\r\n", InviteOptions::default())
        .await
        .unwrap();
    let invite = peer.recv_request().await;

    peer.inject_response(
        ResponseBuilder::ok()
            .to_tag("t1")
            .contact("sip:bob@127.0.0.1:5070")
            .build_for_request(&invite)
            .unwrap(),
    )
    .await;
    let _ack = peer.recv_request().await;

    let ok = loop {
        match next_event(&mut events).await {
            SipEvent::ResponseReceived { response, .. } if response.status_code() == 200 => {
                break response
            }
            _ => continue,
        }
    };
    let dialog = uac_dialog_id(&handle, &ok);

    agent
        .refer_notify(&dialog, "SIP/2.0 200 OK\r\n")
        .await
        .unwrap();
    let notify = peer.recv_request().await;
    assert_eq!(notify.method(), Some(SipMethod::Notify));
    assert_eq!(notify.call_id().unwrap(), handle.call_id);
    assert_eq!(notify.header_value("Event").as_deref(), Some("refer"));
    let raw = String::from_utf8(notify.to_bytes().to_vec()).unwrap();
    assert!(raw.contains("message/sipfrag"));
    assert!(raw.contains("SIP/2.0 200 OK"));

    // NOTIFY advances the dialog CSeq past the INVITE's
    let (invite_seq, _) = invite.cseq().unwrap();
    let (notify_seq, _) = notify.cseq().unwrap();
    assert!(notify_seq > invite_seq);
}
