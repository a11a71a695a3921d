//! SIP message model
//!
//! Thin immutable wrappers over `rsip` requests/responses with the typed
//! accessors the transaction and dialog layers correlate on (Call-ID, CSeq,
//! Via branch, From/To tags, Contact). Wire parsing and serialization stay
//! inside `rsip`; nothing here touches raw bytes beyond handing them over.

use crate::error::SipError;
use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            Method::Info => Some(SipMethod::Info),
            Method::Update => Some(SipMethod::Update),
            Method::PRack => Some(SipMethod::Prack),
            Method::Subscribe => Some(SipMethod::Subscribe),
            Method::Notify => Some(SipMethod::Notify),
            Method::Refer => Some(SipMethod::Refer),
            Method::Message => Some(SipMethod::Message),
            Method::Publish => Some(SipMethod::Publish),
        }
    }

    pub fn to_rsip(&self) -> Method {
        match self {
            SipMethod::Register => Method::Register,
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Bye => Method::Bye,
            SipMethod::Options => Method::Options,
            SipMethod::Info => Method::Info,
            SipMethod::Update => Method::Update,
            SipMethod::Prack => Method::PRack,
            SipMethod::Subscribe => Method::Subscribe,
            SipMethod::Notify => Method::Notify,
            SipMethod::Refer => Method::Refer,
            SipMethod::Message => Method::Message,
            SipMethod::Publish => Method::Publish,
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim() {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "CANCEL" => Some(SipMethod::Cancel),
            "BYE" => Some(SipMethod::Bye),
            "OPTIONS" => Some(SipMethod::Options),
            "INFO" => Some(SipMethod::Info),
            "UPDATE" => Some(SipMethod::Update),
            "PRACK" => Some(SipMethod::Prack),
            "SUBSCRIBE" => Some(SipMethod::Subscribe),
            "NOTIFY" => Some(SipMethod::Notify),
            "REFER" => Some(SipMethod::Refer),
            "MESSAGE" => Some(SipMethod::Message),
            "PUBLISH" => Some(SipMethod::Publish),
            _ => None,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// rsip's untyped headers render as `Name: value`; strip the name when we
/// only want the value.
fn strip_header_name(raw: String, name: &str) -> String {
    let prefix = format!("{}: ", name);
    raw.strip_prefix(&prefix)
        .map(|v| v.to_string())
        .unwrap_or(raw)
}

/// Extract a `;tag=` parameter from a From/To header value.
fn tag_param(value: &str) -> Option<String> {
    value
        .split(';')
        .skip(1)
        .find_map(|p| p.trim().strip_prefix("tag="))
        .map(|t| t.trim().to_string())
}

/// Extract the `branch=` parameter from a Via header value.
fn branch_param(value: &str) -> Option<String> {
    value
        .split(';')
        .find_map(|p| p.trim().strip_prefix("branch="))
        .map(|b| b.trim().to_string())
}

/// Pull the URI out of a name-addr header value (`"Name" <sip:..>` or bare).
fn name_addr_uri(value: &str) -> String {
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return value[start + 1..end].to_string();
        }
    }
    // bare URI form, drop any parameters
    value
        .split(';')
        .next()
        .unwrap_or(value)
        .trim()
        .to_string()
}

fn find_header_value(headers: &Headers, wanted: &str) -> Option<String> {
    headers.iter().find_map(|h| {
        let raw = h.to_string();
        raw.split_once(':').and_then(|(name, value)| {
            if name.trim().eq_ignore_ascii_case(wanted) {
                Some(value.trim().to_string())
            } else {
                None
            }
        })
    })
}

/// Shared header accessors for requests and responses.
macro_rules! correlation_accessors {
    () => {
        pub fn headers(&self) -> &Headers {
            &self.inner.headers
        }

        pub fn body(&self) -> &[u8] {
            &self.inner.body
        }

        pub fn call_id(&self) -> Option<String> {
            self.inner.headers.iter().find_map(|h| match h {
                Header::CallId(cid) => Some(strip_header_name(cid.to_string(), "Call-ID")),
                _ => None,
            })
        }

        /// CSeq as (sequence number, method).
        pub fn cseq(&self) -> Option<(u32, SipMethod)> {
            self.inner.headers.iter().find_map(|h| match h {
                Header::CSeq(cseq) => {
                    let value = strip_header_name(cseq.to_string(), "CSeq");
                    let mut parts = value.split_whitespace();
                    let seq = parts.next()?.parse().ok()?;
                    let method = SipMethod::from_token(parts.next()?)?;
                    Some((seq, method))
                }
                _ => None,
            })
        }

        pub fn from_tag(&self) -> Option<String> {
            self.inner.headers.iter().find_map(|h| match h {
                Header::From(from) => tag_param(&strip_header_name(from.to_string(), "From")),
                _ => None,
            })
        }

        pub fn to_tag(&self) -> Option<String> {
            self.inner.headers.iter().find_map(|h| match h {
                Header::To(to) => tag_param(&strip_header_name(to.to_string(), "To")),
                _ => None,
            })
        }

        pub fn from_uri(&self) -> Option<String> {
            self.inner.headers.iter().find_map(|h| match h {
                Header::From(from) => {
                    Some(name_addr_uri(&strip_header_name(from.to_string(), "From")))
                }
                _ => None,
            })
        }

        pub fn to_uri(&self) -> Option<String> {
            self.inner.headers.iter().find_map(|h| match h {
                Header::To(to) => Some(name_addr_uri(&strip_header_name(to.to_string(), "To"))),
                _ => None,
            })
        }

        /// Branch parameter of the topmost Via header.
        pub fn branch(&self) -> Option<String> {
            self.inner.headers.iter().find_map(|h| match h {
                Header::Via(via) => branch_param(&strip_header_name(via.to_string(), "Via")),
                _ => None,
            })
        }

        /// URI carried by the Contact header, if any.
        pub fn contact_uri(&self) -> Option<String> {
            self.inner.headers.iter().find_map(|h| match h {
                Header::Contact(contact) => {
                    let value = strip_header_name(contact.to_string(), "Contact");
                    if value.trim() == "*" {
                        None
                    } else {
                        Some(name_addr_uri(&value))
                    }
                }
                _ => None,
            })
        }

        pub fn expires(&self) -> Option<u32> {
            self.inner.headers.iter().find_map(|h| match h {
                Header::Expires(exp) => {
                    strip_header_name(exp.to_string(), "Expires").parse().ok()
                }
                _ => None,
            })
        }

        /// Record-Route values in message order.
        pub fn record_routes(&self) -> Vec<String> {
            self.inner
                .headers
                .iter()
                .filter_map(|h| match h {
                    Header::RecordRoute(rr) => {
                        Some(strip_header_name(rr.to_string(), "Record-Route"))
                    }
                    _ => None,
                })
                .collect()
        }

        /// Look up an arbitrary header by name (case-insensitive).
        pub fn header_value(&self, name: &str) -> Option<String> {
            find_header_value(&self.inner.headers, name)
        }
    };
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }

    correlation_accessors!();
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    pub fn is_final(&self) -> bool {
        self.status_code() >= 200
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }

    correlation_accessors!();
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // Requests and responses are distinguished by the start line.
        if data.starts_with(b"SIP/") {
            return Ok(SipMessage::Response(SipResponse::parse(data)?));
        }
        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }
        if let Ok(response) = SipResponse::parse(data) {
            return Ok(SipMessage::Response(response));
        }
        Err(SipError::MalformedMessage(
            "could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn call_id(&self) -> Option<String> {
        match self {
            SipMessage::Request(req) => req.call_id(),
            SipMessage::Response(resp) => resp.call_id(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &[u8] = b"REGISTER sip:registrar.example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.168.1.100:5060;rport;branch=z9hG4bK776asdhds\r\n\
        From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
        To: Alice <sip:alice@example.com>\r\n\
        Call-ID: a84b4c76e66710@pc33.example.com\r\n\
        CSeq: 314159 REGISTER\r\n\
        Contact: <sip:alice@192.168.1.100:5060>\r\n\
        Expires: 3600\r\n\
        Content-Length: 0\r\n\r\n";

    const OK: &[u8] = b"SIP/2.0 200 OK\r\n\
        Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
        From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
        To: Bob <sip:bob@example.com>;tag=a6c85cf\r\n\
        Call-ID: a84b4c76e66710@pc33.example.com\r\n\
        Record-Route: <sip:proxy.example.com;lr>\r\n\
        CSeq: 314159 INVITE\r\n\
        Contact: <sip:bob@192.168.1.200:5060>\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn test_parse_register_request() {
        let msg = SipMessage::parse(REGISTER).unwrap();
        assert!(msg.is_request());

        let req = msg.as_request().unwrap();
        assert_eq!(req.method(), Some(SipMethod::Register));
        assert_eq!(
            req.call_id(),
            Some("a84b4c76e66710@pc33.example.com".to_string())
        );
        assert_eq!(req.cseq(), Some((314159, SipMethod::Register)));
        assert_eq!(req.expires(), Some(3600));
        assert_eq!(req.branch(), Some("z9hG4bK776asdhds".to_string()));
    }

    #[test]
    fn test_tags_and_contact() {
        let msg = SipMessage::parse(OK).unwrap();
        let resp = msg.as_response().unwrap();

        assert_eq!(resp.status_code(), 200);
        assert!(resp.is_success());
        assert_eq!(resp.from_tag(), Some("1928301774".to_string()));
        assert_eq!(resp.to_tag(), Some("a6c85cf".to_string()));
        assert_eq!(
            resp.contact_uri(),
            Some("sip:bob@192.168.1.200:5060".to_string())
        );
        assert_eq!(resp.record_routes(), vec!["<sip:proxy.example.com;lr>"]);
    }

    #[test]
    fn test_request_without_to_tag() {
        let msg = SipMessage::parse(REGISTER).unwrap();
        let req = msg.as_request().unwrap();
        assert_eq!(req.to_tag(), None);
        assert_eq!(req.from_tag(), Some("1928301774".to_string()));
    }

    #[test]
    fn test_name_addr_uri_forms() {
        assert_eq!(
            name_addr_uri("Alice <sip:alice@example.com>;tag=abc"),
            "sip:alice@example.com"
        );
        assert_eq!(
            name_addr_uri("sip:alice@example.com;transport=udp"),
            "sip:alice@example.com"
        );
    }

    #[test]
    fn test_parse_garbage_is_malformed() {
        let err = SipMessage::parse(b"\x00\x01not sip at all").unwrap_err();
        assert!(matches!(err, SipError::MalformedMessage(_)));
    }
}
