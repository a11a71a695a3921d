//! Engine configuration

use crate::timer::SipTimers;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// RFC 3261 timer table (T1/T2/T4).
    pub timers: SipTimers,
    /// Value of the User-Agent header stamped on outgoing requests.
    pub user_agent: String,
    /// Maximum digest challenge round-trips per original request.
    pub max_auth_attempts: u32,
    /// Default Expires for REGISTER when the caller does not pick one.
    pub default_register_expires: u32,
    /// Seconds before expiry at which a registration refresh is sent.
    pub register_refresh_margin: u32,
    /// Max-Forwards on built requests.
    pub max_forwards: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timers: SipTimers::default(),
            user_agent: "confab/0.1".to_string(),
            max_auth_attempts: 5,
            default_register_expires: 3600,
            register_refresh_margin: 60,
            max_forwards: 70,
        }
    }
}
