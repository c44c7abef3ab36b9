//! Receiver configuration.

use anyhow::bail;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ReceiverConfig {
    /// TTL for outgoing datagrams (1-255). Songcast traffic is LAN-local,
    /// so the default keeps it from crossing a router.
    pub ttl: u8,

    /// Upper bound for the sample data carried by one audio frame.
    pub payload_max_bytes: usize,

    /// Maximum number of out-of-order frames buffered while a gap awaits
    /// retransmission (the bound `N` of the repair buffer).
    pub repair_backlog_max_frames: usize,

    /// Base interval `T` for retransmission sweeps; each sweep is scheduled
    /// with jitter in `[T/4, 3T/8]` to avoid synchronised request storms
    /// across receivers.
    pub resend_timeout: Duration,

    /// Join re-send period while waiting for the sender's Track and
    /// Metatext.
    pub join_timeout: Duration,

    /// Base timeout `T` for keep-alive Listen frames: armed initially to
    /// `T/4 - rand(T/8)` and re-armed to `T/2 - rand(T/8)` whenever the
    /// sender's own Listen is observed.
    pub listen_timeout: Duration,

    /// Grace period between a stop request and the forced Leave.
    pub leave_timeout: Duration,

    /// Pause before re-joining after a network error or discontinuity, so
    /// a dead network cannot spin the session loop.
    pub rejoin_backoff: Duration,

    /// Capacity of the slave (secondary receiver) table.
    pub max_slaves: usize,

    /// Slave entries older than this are evicted.
    pub slave_expiry: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> ReceiverConfig {
        ReceiverConfig {
            ttl: 1,
            payload_max_bytes: 6144,
            repair_backlog_max_frames: 100,
            resend_timeout: Duration::from_millis(500),
            join_timeout: Duration::from_millis(300),
            listen_timeout: Duration::from_secs(10),
            leave_timeout: Duration::from_millis(50),
            rejoin_backoff: Duration::from_millis(50),
            max_slaves: 4,
            slave_expiry: Duration::from_secs(10),
        }
    }
}

impl ReceiverConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ttl == 0 {
            bail!("ttl must be at least 1");
        }
        if self.payload_max_bytes == 0 {
            bail!("payload_max_bytes must be non-zero");
        }
        if self.repair_backlog_max_frames < 2 {
            bail!("repair_backlog_max_frames must be at least 2");
        }
        if self.resend_timeout.is_zero() {
            bail!("resend_timeout must be non-zero");
        }
        if self.join_timeout.is_zero() || self.listen_timeout.is_zero() {
            bail!("join_timeout and listen_timeout must be non-zero");
        }
        if self.rejoin_backoff < Duration::from_millis(50) {
            bail!("rejoin_backoff must be at least 50ms");
        }
        if self.max_slaves == 0 {
            bail!("max_slaves must be at least 1");
        }
        Ok(())
    }
}
