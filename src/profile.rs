//! User profiles
//!
//! A profile names one SIP identity: its address of record, optional digest
//! credentials, and how it prefers to reach the network. Profiles are
//! immutable; the caller supplies one per request.

use crate::error::SipError;
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Credentials for answering digest challenges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestCredentials {
    pub username: String,
    pub password: String,
    /// Restrict these credentials to one realm; `None` answers any realm.
    pub realm: Option<String>,
}

/// One SIP identity (address of record) plus how to speak for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    user: String,
    host: String,
    port: Option<u16>,
    pub display_name: Option<String>,
    pub credentials: Option<DigestCredentials>,
    pub transport: TransportKind,
    /// Advertised address for Contact when the local socket address is not
    /// reachable from outside (static NAT mapping). Consulted wherever a
    /// Contact header is built.
    pub external_contact: Option<SocketAddr>,
}

impl UserProfile {
    /// Build a profile from a `sip:user@host[:port]` URI string.
    /// Fails with `MalformedProfile` when the user or host part is missing.
    pub fn from_uri(uri: &str) -> Result<Self, SipError> {
        let rest = uri
            .strip_prefix("sip:")
            .or_else(|| uri.strip_prefix("sips:"))
            .ok_or_else(|| SipError::MalformedProfile(format!("not a sip uri: {}", uri)))?;

        let (user, host_part) = rest
            .split_once('@')
            .ok_or_else(|| SipError::MalformedProfile(format!("missing user part: {}", uri)))?;
        if user.is_empty() {
            return Err(SipError::MalformedProfile(format!(
                "empty user part: {}",
                uri
            )));
        }

        // strip uri parameters before host:port
        let host_port = host_part.split(';').next().unwrap_or(host_part);
        let (host, port) = match host_port.split_once(':') {
            Some((h, p)) => {
                let port = p.parse().map_err(|_| {
                    SipError::MalformedProfile(format!("bad port in uri: {}", uri))
                })?;
                (h, Some(port))
            }
            None => (host_port, None),
        };
        if host.is_empty() {
            return Err(SipError::MalformedProfile(format!("empty host: {}", uri)));
        }

        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
            port,
            display_name: None,
            credentials: None,
            transport: TransportKind::Udp,
            external_contact: None,
        })
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(DigestCredentials {
            username: username.to_string(),
            password: password.to_string(),
            realm: None,
        });
        self
    }

    pub fn with_display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_external_contact(mut self, addr: SocketAddr) -> Self {
        self.external_contact = Some(addr);
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The address-of-record URI.
    pub fn uri(&self) -> String {
        match self.port {
            Some(port) => format!("sip:{}@{}:{}", self.user, self.host, port),
            None => format!("sip:{}@{}", self.user, self.host),
        }
    }

    /// Name-addr form for From/To headers.
    pub fn name_addr(&self) -> String {
        match &self.display_name {
            Some(name) => format!("\"{}\" <{}>", name, self.uri()),
            None => format!("<{}>", self.uri()),
        }
    }
}

impl fmt::Display for UserProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri())
    }
}
