//! Pipeline supply adaptor.
//!
//! Bridges the repaired audio stream to the playback pipeline. Everything
//! the pipeline sees leaves here as one ordered sequence of
//! [`PipelineEvent`]s; ordering is the sender-side call order, which the
//! session guarantees by emitting from a single reader task.
//!
//! Live sessions are gated: before audio is forwarded the pipeline is asked
//! [`StreamPlayGate::ok_to_play`]. `Later` buffers audio inside the adaptor
//! until a subsequent `Yes` promotes the stream, `No` discards.

use crate::repairer::AudioSink;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

pub const STREAM_ID_INVALID: u32 = 0;
pub const FLUSH_ID_INVALID: u32 = 0;

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum PipelineEvent {
    Stream {
        uri: String,
        total_bytes: u64,
        offset: u64,
        seekable: bool,
        live: bool,
        stream_id: u32,
    },
    Data(Bytes),
    Metadata(String),
    Wait,
    Flush(u32),
    Halt,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum OkToPlay {
    Yes,
    Later,
    No,
}

/// Pipeline-side gate deciding whether a live stream may start playing.
#[cfg_attr(test, automock)]
pub trait StreamPlayGate: Send + Sync + 'static {
    fn ok_to_play(&self, stream_id: u32) -> OkToPlay;
}

/// Allocates flush ids for asynchronous stop/seek reconciliation.
#[cfg_attr(test, automock)]
pub trait FlushIdProvider: Send + Sync + 'static {
    fn next_flush_id(&self) -> u32;
}

/// Allocates stream identities for the currently-active reception.
#[cfg_attr(test, automock)]
pub trait StreamIdProvider: Send + Sync + 'static {
    fn next_stream_id(&self) -> u32;
}

/// Back-pressure seam: the session waits for the pipeline to drain before
/// (re)joining a sender.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PipelineDrain: Send + Sync + 'static {
    async fn wait_for_empty(&self);
}

/// Monotonic id allocation starting at 1 (0 is the invalid id).
pub struct SequentialIds {
    next_stream: AtomicU32,
    next_flush: AtomicU32,
}

impl SequentialIds {
    pub fn new() -> SequentialIds {
        SequentialIds {
            next_stream: AtomicU32::new(1),
            next_flush: AtomicU32::new(1),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        SequentialIds::new()
    }
}

impl StreamIdProvider for SequentialIds {
    fn next_stream_id(&self) -> u32 {
        self.next_stream.fetch_add(1, Ordering::Relaxed)
    }
}

impl FlushIdProvider for SequentialIds {
    fn next_flush_id(&self) -> u32 {
        self.next_flush.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct PipelineSupply {
    events: mpsc::UnboundedSender<PipelineEvent>,
    gate: Arc<dyn StreamPlayGate>,
    state: Mutex<SupplyState>,
}

struct SupplyState {
    stream_id: u32,
    deferred: Vec<Bytes>,
}

impl PipelineSupply {
    pub fn new(
        gate: Arc<dyn StreamPlayGate>,
    ) -> (Arc<PipelineSupply>, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let supply = Arc::new(PipelineSupply {
            events,
            gate,
            state: Mutex::new(SupplyState {
                stream_id: STREAM_ID_INVALID,
                deferred: Vec::new(),
            }),
        });
        (supply, receiver)
    }

    /// Announce the stream this session will feed. Emitted once per
    /// session; resets any audio deferred from a previous stream.
    pub fn output_stream(
        &self,
        uri: &str,
        total_bytes: u64,
        offset: u64,
        seekable: bool,
        live: bool,
        stream_id: u32,
    ) {
        {
            let mut state = self.state.lock().unwrap();
            state.stream_id = stream_id;
            state.deferred.clear();
        }
        self.send(PipelineEvent::Stream {
            uri: uri.to_owned(),
            total_bytes,
            offset,
            seekable,
            live,
            stream_id,
        });
    }

    pub fn output_metadata(&self, metadata: &str) {
        self.send(PipelineEvent::Metadata(metadata.to_owned()));
    }

    pub fn output_wait(&self) {
        self.send(PipelineEvent::Wait);
    }

    pub fn output_flush(&self, flush_id: u32) {
        self.send(PipelineEvent::Flush(flush_id));
    }

    pub fn output_halt(&self) {
        self.send(PipelineEvent::Halt);
    }

    fn send(&self, event: PipelineEvent) {
        if self.events.send(event).is_err() {
            debug!("pipeline receiver is gone - dropping event");
        }
    }
}

impl AudioSink for PipelineSupply {
    fn output_audio(&self, audio: &[u8]) {
        let mut state = self.state.lock().unwrap();
        match self.gate.ok_to_play(state.stream_id) {
            OkToPlay::Yes => {
                // a promotion releases everything deferred, in order
                for deferred in state.deferred.drain(..) {
                    self.send(PipelineEvent::Data(deferred));
                }
                self.send(PipelineEvent::Data(Bytes::copy_from_slice(audio)));
            }
            OkToPlay::Later => {
                trace!("stream {} not promoted yet - deferring {} bytes", state.stream_id, audio.len());
                state.deferred.push(Bytes::copy_from_slice(audio));
            }
            OkToPlay::No => {
                debug!("stream {} refused - discarding {} bytes", state.stream_id, audio.len());
            }
        }
    }
}
