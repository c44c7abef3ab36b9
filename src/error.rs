//! Error types for the receiver core.
//!
//! The split mirrors the recovery policies: wire-level errors are logged and
//! the offending datagram skipped, socket errors restart the session loop
//! body, and repair errors purge the repair buffer while the reader
//! resynchronises on the live stream.

use std::io;
use thiserror::Error;

/// Wire-level failures while parsing an OHM datagram. Policy: log, skip the
/// datagram, keep reading.
#[derive(Debug, Error)]
pub enum OhmError {
    #[error("malformed OHM header")]
    BadHeader,

    #[error("unsupported OHM version {0}")]
    BadVersion(u8),

    #[error("unknown OHM message type {0}")]
    UnknownType(u8),

    #[error("truncated OHM payload")]
    Truncated,

    #[error("OHM metadata is not valid UTF-8")]
    InvalidText,
}

/// Failures raised by the repair buffer. Both purge all buffered repair
/// state; the incoming frame is released before the error is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepairError {
    /// Accepting the frame would have grown the repair backlog beyond its
    /// configured bound.
    #[error("repair buffer overflow")]
    BufferFull,

    /// A non-resend frame arrived with a sequence number at or before the
    /// last emitted one: the sender restarted its stream.
    #[error("sender restarted the stream")]
    StreamRestarted,
}

/// Failures on the UDP transport.
#[derive(Debug, Error)]
pub enum SocketError {
    /// `interrupt(true)` is active; recoverable once the interrupt is
    /// cleared.
    #[error("read interrupted")]
    Interrupted,

    #[error("socket is not open")]
    NotOpen,

    #[error("network error: {0}")]
    Network(#[from] io::Error),
}

/// The sender flagged a halt in its audio stream. The session leaves and
/// re-joins.
#[derive(Debug, Error)]
#[error("sender signalled a stream discontinuity")]
pub struct Discontinuity;
