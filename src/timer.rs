//! RFC 3261 timer facility
//!
//! Holds the timer table (Section 17.1.1.1) and the per-transaction active
//! timer sets. Timers are polled by the transaction layer's tick task, so a
//! timer callback never runs concurrently with other events for the same
//! transaction.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// SIP base timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SipTimers {
    /// T1: RTT estimate (default 500ms)
    pub t1: Duration,
    /// T2: maximum retransmit interval (default 4s)
    pub t2: Duration,
    /// T4: maximum duration a message remains in the network (default 5s)
    pub t4: Duration,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Timer types for SIP transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// Timer A: INVITE request retransmit interval (default: T1)
    TimerA,
    /// Timer B: INVITE transaction timeout (default: 64*T1)
    TimerB,
    /// Timer D: wait time for response retransmits (>32s for UDP, 0s for reliable)
    TimerD,
    /// Timer E: non-INVITE request retransmit (default: T1)
    TimerE,
    /// Timer F: non-INVITE transaction timeout (default: 64*T1)
    TimerF,
    /// Timer G: INVITE response retransmit (default: T1)
    TimerG,
    /// Timer H: wait time for ACK receipt (default: 64*T1)
    TimerH,
    /// Timer I: wait time for ACK retransmits (T4 for UDP, 0s for reliable)
    TimerI,
    /// Timer J: wait time for non-INVITE request retransmits (64*T1 for UDP, 0s for reliable)
    TimerJ,
    /// Timer K: wait time for response retransmits (T4 for UDP, 0s for reliable)
    TimerK,
}

impl TimerType {
    /// Get default duration for this timer
    pub fn default_duration(&self, timers: &SipTimers, is_reliable: bool) -> Duration {
        match self {
            TimerType::TimerA => timers.t1,
            TimerType::TimerB => timers.t1 * 64,
            TimerType::TimerD => {
                if is_reliable {
                    Duration::from_secs(0)
                } else {
                    Duration::from_secs(32)
                }
            }
            TimerType::TimerE => timers.t1,
            TimerType::TimerF => timers.t1 * 64,
            TimerType::TimerG => timers.t1,
            TimerType::TimerH => timers.t1 * 64,
            TimerType::TimerI => {
                if is_reliable {
                    Duration::from_secs(0)
                } else {
                    timers.t4
                }
            }
            TimerType::TimerJ => {
                if is_reliable {
                    Duration::from_secs(0)
                } else {
                    timers.t1 * 64
                }
            }
            TimerType::TimerK => {
                if is_reliable {
                    Duration::from_secs(0)
                } else {
                    timers.t4
                }
            }
        }
    }
}

/// A scheduled timer
#[derive(Debug, Clone)]
pub struct ActiveTimer {
    pub timer_type: TimerType,
    pub expires_at: Instant,
    pub interval: Duration,
}

/// The set of timers armed for one transaction.
///
/// Arm/cancel/backoff only; firing is decided by the owner polling
/// [`TimerSet::take_expired`].
#[derive(Debug, Clone, Default)]
pub struct TimerSet {
    timers: Vec<ActiveTimer>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self { timers: Vec::new() }
    }

    /// Arm a timer with its default duration. A zero duration (reliable
    /// transport shortcuts) is not armed at all.
    pub fn arm(&mut self, timer_type: TimerType, timers: &SipTimers, is_reliable: bool) {
        let duration = timer_type.default_duration(timers, is_reliable);
        if duration.as_millis() > 0 {
            self.timers.push(ActiveTimer {
                timer_type,
                expires_at: Instant::now() + duration,
                interval: duration,
            });
            debug!("armed {:?} (expires in {:?})", timer_type, duration);
        }
    }

    pub fn cancel(&mut self, timer_type: TimerType) {
        self.timers.retain(|t| t.timer_type != timer_type);
    }

    pub fn cancel_all(&mut self) {
        self.timers.clear();
    }

    pub fn is_armed(&self, timer_type: TimerType) -> bool {
        self.timers.iter().any(|t| t.timer_type == timer_type)
    }

    /// Double a retransmit timer's interval, capped at T2, and re-arm it.
    pub fn backoff(&mut self, timer_type: TimerType, cap: Duration) {
        if let Some(timer) = self.timers.iter_mut().find(|t| t.timer_type == timer_type) {
            timer.interval = std::cmp::min(timer.interval * 2, cap);
            timer.expires_at = Instant::now() + timer.interval;
        }
    }

    /// Pin a retransmit timer to a fixed (longer) interval. No-op when the
    /// timer is not armed.
    pub fn slow_to(&mut self, timer_type: TimerType, interval: Duration) {
        if let Some(timer) = self.timers.iter_mut().find(|t| t.timer_type == timer_type) {
            timer.interval = interval;
            timer.expires_at = Instant::now() + interval;
        }
    }

    /// Pop every timer that is due. Retransmit timers are re-armed by the
    /// owner via [`TimerSet::backoff`] after acting on them.
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerType> {
        let expired: Vec<TimerType> = self
            .timers
            .iter()
            .filter(|t| t.expires_at <= now)
            .map(|t| t.timer_type)
            .collect();
        // one-shot timers leave the set; retransmit timers get re-armed by backoff()
        self.timers.retain(|t| {
            t.expires_at > now
                || matches!(
                    t.timer_type,
                    TimerType::TimerA | TimerType::TimerE | TimerType::TimerG
                )
        });
        expired
    }
}
