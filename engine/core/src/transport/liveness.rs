//! Link Liveness Monitoring
//!
//! Ping/pong health checks for one link. The connection manager's pump task
//! owns a [`LivenessMonitor`] per link and calls [`LivenessMonitor::tick`] on a
//! fixed interval.
//!
//! # Protocol
//!
//! 1. After `ping_interval` without inbound traffic, a protocol ping carrying a
//!    sequence number is sent
//! 2. The peer must answer with a pong echoing the payload within
//!    `response_timeout`
//! 3. After `max_missed_pongs` consecutive misses the link is declared dead
//!
//! Any inbound frame counts as activity: it clears the miss counter and
//! postpones the next ping.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Configuration for liveness pings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Idle time before a ping is sent (default: 30 seconds)
    pub ping_interval: Duration,
    /// Maximum time to wait for a pong (default: 10 seconds)
    pub response_timeout: Duration,
    /// Consecutive missed pongs before the link is dead (default: 3)
    pub max_missed_pongs: u32,
    /// Whether pings are sent at all
    pub enabled: bool,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            response_timeout: Duration::from_secs(10),
            max_missed_pongs: 3,
            enabled: true,
        }
    }
}

impl LivenessConfig {
    /// Create a config with pings disabled
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Create a config with short intervals
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            ping_interval: Duration::from_millis(100),
            response_timeout: Duration::from_millis(50),
            max_missed_pongs: 2,
            enabled: true,
        }
    }

    /// How often the monitor should be ticked
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        (self.response_timeout / 4).max(Duration::from_millis(10))
    }
}

/// Ping/pong counters for one link
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkHealth {
    /// Consecutive missed pongs
    pub missed_pongs: u32,
    /// Round-trip time of the last answered ping
    pub last_rtt: Option<Duration>,
    /// Pings sent on this link
    pub pings_sent: u64,
    /// Pongs that answered a ping
    pub pongs_received: u64,
}

/// What the pump should do after a tick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LivenessCheck {
    /// Nothing to do
    Idle,
    /// Send a ping with this sequence number
    SendPing(u64),
    /// A pong was missed; the link is still considered alive
    PongMissed {
        /// Consecutive misses so far
        missed: u32,
    },
    /// Too many misses; close the link
    Dead {
        /// Consecutive misses
        missed: u32,
    },
}

/// Ping/pong state for one link
#[derive(Debug)]
pub struct LivenessMonitor {
    config: LivenessConfig,
    health: LinkHealth,
    last_activity: Instant,
    pending_ping: Option<(u64, Instant)>,
    next_seq: u64,
}

impl LivenessMonitor {
    /// Create a monitor for a freshly established link
    #[must_use]
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            health: LinkHealth::default(),
            last_activity: Instant::now(),
            pending_ping: None,
            next_seq: 1,
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Check if pings are enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Current health snapshot
    #[must_use]
    pub fn health(&self) -> &LinkHealth {
        &self.health
    }

    /// Record inbound traffic
    ///
    /// Returns `true` if this cleared earlier misses.
    pub fn record_activity(&mut self) -> bool {
        self.last_activity = Instant::now();
        self.pending_ping = None;
        if self.health.missed_pongs == 0 {
            return false;
        }
        tracing::debug!(
            missed = self.health.missed_pongs,
            "Inbound traffic after missed pongs, link healthy again"
        );
        self.health.missed_pongs = 0;
        true
    }

    /// Record a pong payload
    ///
    /// Returns `true` if it answered the outstanding ping.
    pub fn record_pong(&mut self, payload: &[u8]) -> bool {
        let Some(seq) = decode_seq(payload) else {
            tracing::trace!(len = payload.len(), "Ignoring pong with foreign payload");
            return false;
        };
        let Some((expected, sent_at)) = self.pending_ping else {
            return false;
        };
        if seq != expected {
            tracing::debug!(seq, expected, "Ignoring stale pong");
            return false;
        }

        let rtt = sent_at.elapsed();
        self.pending_ping = None;
        self.health.pongs_received += 1;
        self.health.missed_pongs = 0;
        self.health.last_rtt = Some(rtt);
        self.last_activity = Instant::now();

        tracing::trace!(seq, rtt_ms = rtt.as_millis(), "Pong received");
        true
    }

    /// Advance the monitor
    pub fn tick(&mut self) -> LivenessCheck {
        if !self.config.enabled {
            return LivenessCheck::Idle;
        }

        if let Some((seq, sent_at)) = self.pending_ping {
            if sent_at.elapsed() < self.config.response_timeout {
                return LivenessCheck::Idle;
            }

            self.pending_ping = None;
            self.health.missed_pongs += 1;
            let missed = self.health.missed_pongs;

            if missed >= self.config.max_missed_pongs {
                tracing::warn!(missed, "Link missed too many pongs");
                return LivenessCheck::Dead { missed };
            }

            tracing::debug!(
                seq,
                missed,
                max_missed = self.config.max_missed_pongs,
                "Pong missed"
            );
            return LivenessCheck::PongMissed { missed };
        }

        // After a miss, ping again right away rather than waiting a full interval
        let idle_for = self.last_activity.elapsed();
        if self.health.missed_pongs == 0 && idle_for < self.config.ping_interval {
            return LivenessCheck::Idle;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending_ping = Some((seq, Instant::now()));
        self.health.pings_sent += 1;
        LivenessCheck::SendPing(seq)
    }
}

/// Encode a ping sequence number as a ping payload
#[must_use]
pub fn encode_seq(seq: u64) -> Vec<u8> {
    seq.to_be_bytes().to_vec()
}

fn decode_seq(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = payload.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
