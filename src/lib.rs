//! Audio reception and repair for OHM/OHU senders.
//!
//! This crate implements the receiving half of a networked audio stream:
//! numbered audio frames arrive over UDP, and the receiver turns them into a
//! gap-free, in-order byte stream for a playback pipeline while asking the
//! sender to retransmit anything that got lost on the way.
//!
//! ## Design goals
//!
//! * Repair, don't block: a dropout buffers out-of-order frames and
//!   requests retransmission, but the backlog is strictly bounded - if the
//!   sender cannot fill a gap in time, the buffered state is dropped and
//!   reception resynchronises on the live stream. Latency wins over
//!   completeness.
//! * Frame numbers are 16 bits and wrap; all ordering decisions use
//!   serial-number arithmetic (RFC 1982) so `65535 -> 0` is an ordinary
//!   in-order step and a genuine sender restart is still detected.
//! * Retransmission requests are timer-driven with randomised jitter, so a
//!   roomful of receivers does not ask the sender for the same frames in
//!   the same instant.
//! * The session is a small state machine (join, listen, leave) over a
//!   single interruptible UDP socket. Leave ordering is a hard guarantee:
//!   once a Leave has been sent for a session, no Join or Listen follows
//!   it, so the sender never sees a ghost receiver.
//! * One reader task owns all protocol state; timers and external control
//!   only set flags, send datagrams, or eject the reader from its socket.
//!   Everything the pipeline observes is ordered by that single task.
//!
//! ## Structure
//!
//! * [`seq`] - wrap-safe sequence numbers and ranges
//! * [`frame`] - pooled audio frame carriers
//! * [`ohm_header`], [`ohm_messages`] - the OHM wire format
//! * [`repairer`] - the reorder/retransmit buffer
//! * [`resend`] - unicast retransmission requests
//! * [`timer`] - the re-armable sweep timer
//! * [`ohm_socket`] - interruptible UDP endpoint
//! * [`supply`] - pipeline-facing event adaptor
//! * [`session`] - the OHU join/listen/leave state machine
//! * [`config`] - receiver configuration

pub mod config;
pub mod error;
pub mod frame;
pub mod ohm_header;
pub mod ohm_messages;
pub mod ohm_socket;
pub mod repairer;
pub mod resend;
pub mod seq;
pub mod session;
pub mod supply;
pub mod timer;

pub use config::ReceiverConfig;
pub use error::{OhmError, RepairError, SocketError};
pub use repairer::Repairer;
pub use session::{OhuSession, PlayOutcome};
pub use supply::{OkToPlay, PipelineEvent, PipelineSupply};

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
