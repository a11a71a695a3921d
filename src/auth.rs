//! SIP digest authentication (RFC 2617, RFC 3261)
//!
//! Client side of the challenge dance: parse the 401/407 challenge, compute
//! the digest from the profile's credentials, and reissue the request as a
//! new transaction with the CSeq bumped and a fresh branch. Retries per
//! original request are bounded to keep a misbehaving server from looping
//! us forever.

use crate::builder;
use crate::error::SipError;
use crate::message::{SipRequest, SipResponse};
use crate::profile::DigestCredentials;
use rand::Rng;
use rsip::headers::{Authorization, ProxyAuthorization, Via};
use rsip::Header;
use std::collections::HashMap;

/// Parsed WWW-Authenticate / Proxy-Authenticate challenge
#[derive(Debug, Clone)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    /// True when the challenge came as 407 Proxy-Authenticate.
    pub proxy: bool,
}

impl Challenge {
    /// Extract the challenge from a 401/407 response.
    pub fn from_response(response: &SipResponse) -> Result<Self, SipError> {
        let (value, proxy) = response
            .headers()
            .iter()
            .find_map(|h| match h {
                Header::WwwAuthenticate(a) => Some((a.to_string(), false)),
                Header::ProxyAuthenticate(a) => Some((a.to_string(), true)),
                _ => None,
            })
            .ok_or_else(|| {
                SipError::MalformedMessage("challenge response without challenge header".to_string())
            })?;

        let params = parse_digest_params(&value);
        let realm = params
            .get("realm")
            .ok_or_else(|| SipError::MalformedMessage("challenge missing realm".to_string()))?
            .clone();
        let nonce = params
            .get("nonce")
            .ok_or_else(|| SipError::MalformedMessage("challenge missing nonce".to_string()))?
            .clone();

        Ok(Self {
            realm,
            nonce,
            algorithm: params.get("algorithm").cloned(),
            qop: params.get("qop").cloned(),
            opaque: params.get("opaque").cloned(),
            proxy,
        })
    }
}

/// Parse `key="value"` digest parameters, tolerating the header name prefix
/// and the `Digest` keyword.
fn parse_digest_params(raw: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    let value = raw
        .split_once(':')
        .map(|(name, rest)| {
            if name.trim().eq_ignore_ascii_case("WWW-Authenticate")
                || name.trim().eq_ignore_ascii_case("Proxy-Authenticate")
            {
                rest
            } else {
                raw
            }
        })
        .unwrap_or(raw);
    let digest_str = value.trim().strip_prefix("Digest ").unwrap_or(value).trim();

    for part in digest_str.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().trim_matches('"');
            params.insert(key, value.to_string());
        }
    }

    params
}

/// MD5 digest response (RFC 2617). With qop the full
/// `HA1:nonce:nc:cnonce:qop:HA2` form, without it the RFC 2069 form.
fn calculate_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    let ha1 = {
        let digest = md5::compute(format!("{}:{}:{}", username, realm, password));
        format!("{:x}", digest)
    };

    let ha2 = {
        let digest = md5::compute(format!("{}:{}", method, uri));
        format!("{:x}", digest)
    };

    if let Some(qop_value) = qop {
        let nc_value = nc.unwrap_or("00000001");
        let cnonce_value = cnonce.unwrap_or("");
        let digest = md5::compute(format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, nc_value, cnonce_value, qop_value, ha2
        ));
        format!("{:x}", digest)
    } else {
        let digest = md5::compute(format!("{}:{}:{}", ha1, nonce, ha2));
        format!("{:x}", digest)
    }
}

fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(random_bytes)
}

/// Answers digest challenges, bounded per original request.
pub struct ChallengeResponder {
    max_attempts: u32,
    /// Attempts so far, keyed by Call-ID (one challenge loop per exchange).
    attempts: HashMap<String, u32>,
}

impl ChallengeResponder {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: HashMap::new(),
        }
    }

    /// Whether this response is a digest challenge we should answer.
    pub fn is_challenge(response: &SipResponse) -> bool {
        matches!(response.status_code(), 401 | 407)
    }

    /// Build the authenticated retry for `original` given the challenge in
    /// `response`. Fails with `AuthExhausted` once the per-exchange bound is
    /// hit. The retry is the original request with the CSeq incremented, a
    /// fresh branch, and the Authorization header attached; the transaction
    /// layer treats it as a brand-new client transaction.
    pub fn answer(
        &mut self,
        original: &SipRequest,
        response: &SipResponse,
        credentials: &DigestCredentials,
    ) -> Result<SipRequest, SipError> {
        let call_id = original
            .call_id()
            .ok_or_else(|| SipError::MalformedMessage("request without Call-ID".to_string()))?;

        let attempts = self.attempts.entry(call_id).or_insert(0);
        if *attempts >= self.max_attempts {
            return Err(SipError::AuthExhausted(self.max_attempts));
        }
        *attempts += 1;

        let challenge = Challenge::from_response(response)?;
        if let Some(expected_realm) = &credentials.realm {
            if expected_realm != &challenge.realm {
                tracing::warn!(
                    "challenge realm {} does not match credential realm {}",
                    challenge.realm,
                    expected_realm
                );
            }
        }

        let method = original
            .method()
            .ok_or_else(|| SipError::MalformedMessage("request without method".to_string()))?;
        let uri = original.uri().to_string();

        // qop=auth requires a client nonce and count
        let use_qop = challenge
            .qop
            .as_deref()
            .map(|q| q.split(',').any(|v| v.trim() == "auth"));
        let (qop, cnonce, nc) = match use_qop {
            Some(true) => (Some("auth"), Some(generate_cnonce()), Some("00000001")),
            _ => (None, None, None),
        };

        let digest = calculate_response(
            &credentials.username,
            &credentials.password,
            &challenge.realm,
            &challenge.nonce,
            method.as_str(),
            &uri,
            qop,
            nc,
            cnonce.as_deref(),
        );

        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
            credentials.username,
            challenge.realm,
            challenge.nonce,
            uri,
            digest,
            challenge.algorithm.as_deref().unwrap_or("MD5"),
        );
        if let Some(qop_value) = qop {
            value.push_str(&format!(
                r#", qop={}, cnonce="{}", nc={}"#,
                qop_value,
                cnonce.as_deref().unwrap_or(""),
                nc.unwrap_or("00000001")
            ));
        }
        if let Some(opaque) = &challenge.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }

        Ok(reissue(original, &challenge, value))
    }

    /// Forget the attempt counter once an exchange concludes.
    pub fn clear(&mut self, call_id: &str) {
        self.attempts.remove(call_id);
    }
}

/// Clone the original request as a new transaction: bump CSeq, stamp a
/// fresh branch, replace any stale credentials with the new ones.
fn reissue(original: &SipRequest, challenge: &Challenge, authorization: String) -> SipRequest {
    let mut request = original.clone();
    let next_seq = original.cseq().map(|(seq, _)| seq + 1).unwrap_or(1);
    let method = original.cseq().map(|(_, m)| m);

    let fresh_branch = builder::new_branch();
    let mut headers: Vec<Header> = Vec::new();
    for header in request.inner.headers.iter() {
        match header {
            Header::Via(via) => {
                let value = via.to_string();
                let value = value.strip_prefix("Via: ").unwrap_or(&value);
                let rebranched = match value.split_once("branch=") {
                    Some((prefix, rest)) => {
                        let tail = rest
                            .split_once(';')
                            .map(|(_, tail)| format!(";{}", tail))
                            .unwrap_or_default();
                        format!("{}branch={}{}", prefix, fresh_branch, tail)
                    }
                    None => format!("{};branch={}", value, fresh_branch),
                };
                headers.push(Header::Via(Via::from(rebranched)));
            }
            Header::CSeq(_) => {
                if let Some(method) = method {
                    headers.push(Header::CSeq(rsip::headers::CSeq::from(format!(
                        "{} {}",
                        next_seq,
                        method.as_str()
                    ))));
                }
            }
            Header::Authorization(_) | Header::ProxyAuthorization(_) => {}
            other => headers.push(other.clone()),
        }
    }

    if challenge.proxy {
        headers.push(Header::ProxyAuthorization(ProxyAuthorization::from(
            authorization,
        )));
    } else {
        headers.push(Header::Authorization(Authorization::from(authorization)));
    }

    request.inner.headers = rsip::Headers::from(headers);
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{new_call_id, new_tag, InviteOptions, RequestBuilder, ResponseBuilder};
    use crate::config::EngineConfig;
    use crate::message::SipMethod;
    use crate::profile::UserProfile;
    use crate::transport::TransportKind;

    fn credentials() -> DigestCredentials {
        DigestCredentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
            realm: None,
        }
    }

    fn challenged(request: &crate::message::SipRequest, status: u16) -> SipResponse {
        let header = if status == 401 {
            Header::WwwAuthenticate(rsip::headers::WwwAuthenticate::from(
                r#"Digest realm="example.com", nonce="abc123", algorithm=MD5, qop="auth""#
                    .to_string(),
            ))
        } else {
            Header::ProxyAuthenticate(rsip::headers::ProxyAuthenticate::from(
                r#"Digest realm="example.com", nonce="abc123""#.to_string(),
            ))
        };
        ResponseBuilder::new(status)
            .header(header)
            .build_for_request(request)
            .unwrap()
    }

    fn invite() -> crate::message::SipRequest {
        let builder = RequestBuilder::new(
            &EngineConfig::default(),
            "192.168.1.100:5060".parse().unwrap(),
            TransportKind::Udp,
        );
        builder
            .invite(
                &UserProfile::from_uri("sip:alice@example.com").unwrap(),
                &UserProfile::from_uri("sip:bob@example.com").unwrap(),
                &new_tag(),
                &new_call_id("example.com"),
                1,
                "v=0\r\n",
                InviteOptions::default(),
            )
            .unwrap()
    }

    #[test]
    fn test_parse_digest_params() {
        let params = parse_digest_params(
            r#"Digest realm="test.com", nonce="abc123", algorithm=MD5, qop="auth""#,
        );
        assert_eq!(params.get("realm").unwrap(), "test.com");
        assert_eq!(params.get("nonce").unwrap(), "abc123");
        assert_eq!(params.get("qop").unwrap(), "auth");
    }

    #[test]
    fn test_calculate_response_known_vector() {
        // RFC 2617 section 3.5 example, adapted to SIP-style inputs
        let response = calculate_response(
            "alice",
            "secret",
            "example.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "REGISTER",
            "sip:example.com",
            None,
            None,
            None,
        );
        assert_eq!(response.len(), 32);
        assert!(response.chars().all(|c| c.is_ascii_hexdigit()));
        // deterministic for fixed inputs
        let again = calculate_response(
            "alice",
            "secret",
            "example.com",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "REGISTER",
            "sip:example.com",
            None,
            None,
            None,
        );
        assert_eq!(response, again);
    }

    #[test]
    fn test_answer_increments_cseq_and_adds_authorization() {
        let original = invite();
        let response = challenged(&original, 401);

        let mut responder = ChallengeResponder::new(5);
        let retry = responder
            .answer(&original, &response, &credentials())
            .unwrap();

        assert_eq!(retry.cseq(), Some((2, SipMethod::Invite)));
        assert_ne!(retry.branch(), original.branch());
        assert_eq!(retry.call_id(), original.call_id());
        let raw = String::from_utf8(retry.to_bytes().to_vec()).unwrap();
        assert!(raw.contains("Authorization: Digest username=\"alice\""));
        assert!(raw.contains("qop=auth"));
    }

    #[test]
    fn test_proxy_challenge_gets_proxy_authorization() {
        let original = invite();
        let response = challenged(&original, 407);

        let mut responder = ChallengeResponder::new(5);
        let retry = responder
            .answer(&original, &response, &credentials())
            .unwrap();

        let raw = String::from_utf8(retry.to_bytes().to_vec()).unwrap();
        assert!(raw.contains("Proxy-Authorization: Digest"));
    }

    #[test]
    fn test_auth_exhausted_after_bound() {
        let original = invite();
        let response = challenged(&original, 401);
        let mut responder = ChallengeResponder::new(2);

        assert!(responder
            .answer(&original, &response, &credentials())
            .is_ok());
        assert!(responder
            .answer(&original, &response, &credentials())
            .is_ok());
        let err = responder
            .answer(&original, &response, &credentials())
            .unwrap_err();
        assert!(matches!(err, SipError::AuthExhausted(2)));
    }

    #[test]
    fn test_clear_resets_bound() {
        let original = invite();
        let response = challenged(&original, 401);
        let mut responder = ChallengeResponder::new(1);

        responder
            .answer(&original, &response, &credentials())
            .unwrap();
        assert!(responder
            .answer(&original, &response, &credentials())
            .is_err());

        responder.clear(&original.call_id().unwrap());
        assert!(responder
            .answer(&original, &response, &credentials())
            .is_ok());
    }
}
