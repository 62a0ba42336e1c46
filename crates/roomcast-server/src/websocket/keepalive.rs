//! Keepalive timing policy shared by the read and write pumps.
//!
//! The write pump pings every `ping_period`; the read pump fails once
//! `pong_wait` passes without a pong. A peer that answers pings therefore
//! stays connected, and a dead one is dropped within one read-deadline cycle.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Time allowed to read the next pong from the peer.
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping interval, 9/10 of [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(54);
/// Time allowed for a single write to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Maximum inbound message size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Invalid keepalive configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeepaliveError {
    /// The ping period must be strictly shorter than the pong wait.
    #[error("ping period {ping:?} must be shorter than pong wait {pong:?}")]
    PingNotBeforePong {
        /// Configured ping period.
        ping: Duration,
        /// Configured pong wait.
        pong: Duration,
    },
    /// A timing was zero.
    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),
    /// The inbound size limit was zero.
    #[error("max message size must be non-zero")]
    ZeroMessageSize,
}

/// Per-connection liveness and framing limits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Read deadline, refreshed on every pong.
    pub pong_wait: Duration,
    /// Interval between pings sent by the write pump.
    pub ping_period: Duration,
    /// Upper bound on any single write.
    pub write_wait: Duration,
    /// Inbound frames larger than this terminate the connection.
    pub max_message_size: usize,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
            write_wait: WRITE_WAIT,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl KeepaliveConfig {
    /// Build from millisecond values, as stored in settings.
    pub fn from_millis(
        pong_wait_ms: u64,
        ping_period_ms: u64,
        write_wait_ms: u64,
        max_message_size: usize,
    ) -> Self {
        Self {
            pong_wait: Duration::from_millis(pong_wait_ms),
            ping_period: Duration::from_millis(ping_period_ms),
            write_wait: Duration::from_millis(write_wait_ms),
            max_message_size,
        }
    }

    /// Reject configurations under which a healthy peer could time out.
    pub fn validate(&self) -> Result<(), KeepaliveError> {
        if self.pong_wait.is_zero() {
            return Err(KeepaliveError::ZeroDuration("pong wait"));
        }
        if self.ping_period.is_zero() {
            return Err(KeepaliveError::ZeroDuration("ping period"));
        }
        if self.write_wait.is_zero() {
            return Err(KeepaliveError::ZeroDuration("write wait"));
        }
        if self.ping_period >= self.pong_wait {
            return Err(KeepaliveError::PingNotBeforePong {
                ping: self.ping_period,
                pong: self.pong_wait,
            });
        }
        if self.max_message_size == 0 {
            return Err(KeepaliveError::ZeroMessageSize);
        }
        Ok(())
    }
}

/// The read pump's deadline. Set on construction, pushed forward on pong.
#[derive(Debug, Clone, Copy)]
pub struct ReadDeadline {
    wait: Duration,
    at: Instant,
}

impl ReadDeadline {
    /// Deadline `wait` from now.
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            at: Instant::now() + wait,
        }
    }

    /// Push the deadline to `wait` from now.
    pub fn refresh(&mut self) {
        self.at = Instant::now() + self.wait;
    }

    /// The instant at which the next read times out.
    pub fn at(&self) -> Instant {
        self.at
    }

    /// The configured wait.
    pub fn wait(&self) -> Duration {
        self.wait
    }
}
