//! Pooled audio frame carriers.
//!
//! A [`Frame`] owns one received audio payload together with its sequence
//! number and resend marker. Carriers are pooled: the payload storage is
//! pre-allocated once and recycled through [`FramePool::release`], so steady
//! state reception does not allocate.
//!
//! Ownership is single-owner handoff: the repair buffer takes the frame on
//! ingest and releases it exactly once, either after publishing the payload
//! downstream or when discarding it.

use crate::seq::SeqNo;
use std::sync::Mutex;
use tracing::trace;

pub struct Frame {
    seq: SeqNo,
    resend: bool,
    data: Vec<u8>,
}

impl Frame {
    pub fn seq(&self) -> SeqNo {
        self.seq
    }

    pub fn resend(&self) -> bool {
        self.resend
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Bounded allocator for frame carriers.
///
/// The pool never blocks and never grows: the repair buffer caps demand at
/// its backlog bound plus one in-flight frame, so the pool is sized to that
/// and running dry is a programming error, not a load condition.
pub struct FramePool {
    payload_max: usize,
    storage: Mutex<Vec<Vec<u8>>>,
}

impl FramePool {
    pub fn new(pool_size: usize, payload_max: usize) -> FramePool {
        let storage = (0..pool_size)
            .map(|_| Vec::with_capacity(payload_max))
            .collect();
        FramePool {
            payload_max,
            storage: Mutex::new(storage),
        }
    }

    pub fn allocate(&self, seq: SeqNo, resend: bool, payload: &[u8]) -> Frame {
        assert!(
            payload.len() <= self.payload_max,
            "payload of {} bytes exceeds the configured maximum of {}",
            payload.len(),
            self.payload_max
        );

        let mut data = self
            .storage
            .lock()
            .unwrap()
            .pop()
            .expect("frame pool exhausted - the repair buffer should bound demand");
        data.clear();
        data.extend_from_slice(payload);

        trace!("allocated frame #{} ({} bytes, resend={})", seq, payload.len(), resend);
        Frame { seq, resend, data }
    }

    pub fn release(&self, frame: Frame) {
        trace!("released frame #{}", frame.seq);
        self.storage.lock().unwrap().push(frame.data);
    }

    /// Number of free carriers. Steady state returns to the initial pool
    /// size once all frames have been released.
    pub fn free_count(&self) -> usize {
        self.storage.lock().unwrap().len()
    }
}
