//! The repair buffer: an ordered, bounded reorder/retransmit buffer over a
//! stream of numbered audio frames.
//!
//! Frames arrive over UDP and may be dropped, duplicated or re-ordered. The
//! repairer publishes a gap-free, in-order byte stream downstream: in-order
//! frames pass straight through; a gap parks the first out-of-order frame as
//! a head sentinel, buffers everything after it in ascending order, and arms
//! a jittered timer. Each timer sweep coalesces the missing numbers into
//! ranges and asks the sender to retransmit them; arriving resends fill the
//! gaps and drain the buffered run.
//!
//! All sequence comparisons are serial (RFC 1982), so the wrap from 65535
//! to 0 is an ordinary in-order step.
//!
//! The buffered backlog is bounded: one sentinel slot plus `backlog_max`
//! body slots. Overflow and stream restarts purge all buffered state; the
//! caller resynchronises on the live stream (the next frame accepted seeds
//! a fresh run).

use crate::error::RepairError;
use crate::frame::{Frame, FramePool};
use crate::seq::{SeqNo, SeqRange};
use crate::timer::{RepairTimer, TimerFactory};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Downstream consumer of the repaired, in-order audio stream.
pub trait AudioSink: Send + Sync + 'static {
    fn output_audio(&self, audio: &[u8]);
}

/// Dispatches one retransmission request carrying every range. Best-effort:
/// transmit failures are logged by the implementation, not surfaced - the
/// next sweep re-requests whatever is still missing.
pub trait ResendRangeRequester: Send + Sync + 'static {
    fn request_resend(&self, ranges: &[SeqRange]);
}

pub struct Repairer {
    shared: Arc<RepairerShared>,
}

struct RepairerShared {
    backlog_max: usize,
    resend_timeout: Duration,
    pool: Arc<FramePool>,
    requester: Arc<dyn ResendRangeRequester>,
    sink: Arc<dyn AudioSink>,
    timer: OnceLock<Box<dyn RepairTimer>>,
    state: Mutex<RepairState>,
}

struct RepairState {
    last_emitted: Option<SeqNo>,
    /// Buffered frames in ascending serial order. Index 0 is the head
    /// sentinel: the first frame received after the gap.
    pending: VecDeque<Frame>,
    /// Another receiver requested a resend since the last sweep; skip one
    /// request to avoid hammering the sender with duplicates.
    suppress_sweep: bool,
}

impl Repairer {
    pub fn new(
        backlog_max: usize,
        resend_timeout: Duration,
        pool: Arc<FramePool>,
        requester: Arc<dyn ResendRangeRequester>,
        sink: Arc<dyn AudioSink>,
        timers: &dyn TimerFactory,
    ) -> Repairer {
        assert!(backlog_max >= 2, "repair backlog must hold at least two frames");

        let shared = Arc::new(RepairerShared {
            backlog_max,
            resend_timeout,
            pool,
            requester,
            sink,
            timer: OnceLock::new(),
            state: Mutex::new(RepairState {
                last_emitted: None,
                pending: VecDeque::with_capacity(backlog_max + 1),
                suppress_sweep: false,
            }),
        });

        let weak = Arc::downgrade(&shared);
        let timer = timers.create_timer(
            Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_timer();
                }
            }),
            "repairer",
        );
        assert!(shared.timer.set(timer).is_ok(), "timer is set exactly once");

        Repairer { shared }
    }

    /// Sole ingress. Takes ownership of the frame; it is released exactly
    /// once, either after publication or on discard. On error all buffered
    /// repair state has been purged and the stream position reset.
    pub fn on_audio(&self, frame: Frame) -> Result<(), RepairError> {
        self.shared.on_audio(frame)
    }

    /// Discard any in-flight repair: cancel the timer, release the sentinel
    /// and body. The stream position is kept, so an in-order successor of
    /// the last emitted frame continues the run.
    pub fn drop_audio(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if !state.pending.is_empty() {
            debug!("dropping {} buffered repair frames", state.pending.len());
        }
        self.shared.purge(&mut state);
    }

    /// A resend request from another receiver of the same stream was
    /// observed; back off for one sweep so the sender is not asked twice.
    pub fn resend_seen(&self) {
        self.shared.state.lock().unwrap().suppress_sweep = true;
    }
}

impl RepairerShared {
    fn on_audio(&self, frame: Frame) -> Result<(), RepairError> {
        let mut state = self.state.lock().unwrap();

        let last = match state.last_emitted {
            // first frame of a (re)started run seeds the stream position
            None => {
                self.emit(&mut state, frame);
                return Ok(());
            }
            Some(last) => last,
        };

        if !frame.seq().is_after(last) {
            if frame.resend() {
                trace!("discarding stale resend #{} (last emitted #{})", frame.seq(), last);
                self.pool.release(frame);
                return Ok(());
            }
            warn!(
                "non-resend frame #{} at or before last emitted #{} - stream restarted",
                frame.seq(),
                last
            );
            self.purge(&mut state);
            self.pool.release(frame);
            state.last_emitted = None;
            return Err(RepairError::StreamRestarted);
        }

        if frame.seq() == last.next() {
            self.emit(&mut state, frame);
            self.drain(&mut state);
            return Ok(());
        }

        // out of order: buffer while the gap awaits retransmission
        let repair_begins = state.pending.is_empty();
        let Some(position) = insert_position(&state.pending, frame.seq()) else {
            trace!("discarding duplicate of buffered frame #{}", frame.seq());
            self.pool.release(frame);
            return Ok(());
        };

        if state.pending.len() >= self.backlog_max + 1 {
            warn!(
                "repair backlog exceeded {} frames - dropping repair state",
                self.backlog_max
            );
            self.timer().cancel();
            self.release_pending(&mut state);
            self.pool.release(frame);
            state.last_emitted = None;
            return Err(RepairError::BufferFull);
        }

        if repair_begins {
            debug!("gap after frame #{}: buffering #{}, repair begins", last, frame.seq());
        }
        state.pending.insert(position, frame);
        if repair_begins {
            self.timer().fire_in(self.sweep_delay());
        }
        Ok(())
    }

    /// Retransmission sweep, invoked on timer expiry.
    fn on_timer(&self) {
        let (ranges, suppressed) = {
            let mut state = self.state.lock().unwrap();
            let suppressed = std::mem::take(&mut state.suppress_sweep);
            (self.missing_ranges(&state), suppressed)
        };

        if ranges.is_empty() {
            trace!("sweep: nothing missing");
            return;
        }
        if suppressed {
            debug!("sweep: resend already requested by another receiver - deferring");
        } else {
            debug!("sweep: requesting resend of {} range(s)", ranges.len());
            self.requester.request_resend(&ranges);
        }
        self.timer().fire_in(self.sweep_delay());
    }

    fn emit(&self, state: &mut RepairState, frame: Frame) {
        trace!("emitting frame #{}", frame.seq());
        self.sink.output_audio(frame.data());
        state.last_emitted = Some(frame.seq());
        self.pool.release(frame);
    }

    /// Publish the now-contiguous prefix of the buffer. Ends the repair
    /// once the buffer is empty.
    fn drain(&self, state: &mut RepairState) {
        if state.pending.is_empty() {
            return;
        }
        loop {
            let expected = state
                .last_emitted
                .expect("frames are only buffered after an initial emission")
                .next();
            let contiguous = state.pending.front().is_some_and(|front| front.seq() == expected);
            if !contiguous {
                break;
            }
            let frame = state.pending.pop_front().expect("front was just checked");
            self.emit(state, frame);
        }
        if state.pending.is_empty() {
            debug!("repair complete");
            self.timer().cancel();
        }
    }

    /// The missing numbers between the last emitted frame and the highest
    /// buffered one, coalesced into ascending ranges. At most
    /// `backlog_max / 2` ranges per sweep; the rest wait for the next sweep
    /// so one request cannot flood the buffer with resends.
    fn missing_ranges(&self, state: &RepairState) -> Vec<SeqRange> {
        let Some(last) = state.last_emitted else {
            return Vec::new();
        };
        let max_ranges = (self.backlog_max / 2).max(1);
        let mut ranges = Vec::new();
        let mut deferred = false;
        let mut expected = last.next();
        for frame in &state.pending {
            if frame.seq() != expected {
                if ranges.len() < max_ranges {
                    ranges.push(SeqRange::new(expected, frame.seq().prev()));
                } else {
                    deferred = true;
                }
            }
            expected = frame.seq().next();
        }
        if deferred {
            debug!("sweep: range cap of {} reached - deferring further ranges", max_ranges);
        }
        ranges
    }

    fn purge(&self, state: &mut RepairState) {
        if !state.pending.is_empty() {
            self.timer().cancel();
        }
        self.release_pending(state);
    }

    fn release_pending(&self, state: &mut RepairState) {
        for frame in state.pending.drain(..) {
            self.pool.release(frame);
        }
    }

    fn sweep_delay(&self) -> Duration {
        let millis = self.resend_timeout.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=millis / 8);
        Duration::from_millis(millis / 4 + jitter)
    }

    fn timer(&self) -> &dyn RepairTimer {
        self.timer
            .get()
            .expect("timer is created with the repairer")
            .as_ref()
    }
}

/// Ascending insert position for `seq`, or `None` if a frame with that
/// number is already buffered.
fn insert_position(pending: &VecDeque<Frame>, seq: SeqNo) -> Option<usize> {
    for (index, buffered) in pending.iter().enumerate() {
        if buffered.seq() == seq {
            return None;
        }
        if buffered.seq().is_after(seq) {
            return Some(index);
        }
    }
    Some(pending.len())
}
