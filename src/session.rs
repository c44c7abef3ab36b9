//! The OHU session state machine.
//!
//! OHU is the unicast flavour of the OHM protocol: the receiver asks a
//! sender to stream to it by sending Join, keeps the stream alive with
//! periodic Listen frames, and releases it with Leave. One [`play`] call is
//! one session: it loops joining and listening until stopped, restarting
//! the loop body (leave, back off, re-join) on network errors and sender
//! discontinuities.
//!
//! [`play`]: OhuSession::play
//!
//! The session is the single reader of its socket. Everything that arrives
//! is dispatched by OHM message type: audio feeds the repair buffer, track
//! and metatext are forwarded to the pipeline supply, a Slave frame
//! replaces the table of secondary receivers that every forwarded frame is
//! relayed to, and an observed Resend from another receiver backs off the
//! local repair sweep.
//!
//! Stopping is asynchronous: `try_stop` flags the session, interrupts the
//! reader and arms a fallback leave timer. Whichever path runs first -
//! audio handling, the timer, or session exit - sends the Leave, and the
//! flag protocol around the leave mutex guarantees that no Join or Listen
//! follows it.

use crate::config::ReceiverConfig;
use crate::error::{Discontinuity, RepairError, SocketError};
use crate::frame::FramePool;
use crate::ohm_header::{OhmAudioHeader, OhmHeader, OhmMsgType};
use crate::ohm_messages::{OhmMetatext, OhmSlaveList, OhmTrack};
use crate::ohm_socket::OhmSocket;
use crate::repairer::Repairer;
use crate::resend::OhmResendRequester;
use crate::supply::{
    FlushIdProvider, PipelineDrain, PipelineSupply, StreamIdProvider, FLUSH_ID_INVALID,
    STREAM_ID_INVALID,
};
use crate::timer::TimerFactory;
use bytes::BytesMut;
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, span, trace, warn, Level};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Optional collaborator that maps sender clock ticks to local time. Fed
/// even while joining so it cannot fill up with stale values.
#[cfg_attr(test, automock)]
pub trait OhmTimestamper: Send + Sync + 'static {
    fn start(&self, local_addr: SocketAddr);
    fn stop(&self);
    fn record(&self, network_timestamp: u32);
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PlayOutcome {
    /// The session ended because it was told to stop.
    Stopped,
    /// The session could not establish its transport.
    Unrecoverable,
}

pub struct OhuSession {
    config: ReceiverConfig,
    socket: Arc<OhmSocket>,
    supply: Arc<PipelineSupply>,
    drain: Arc<dyn PipelineDrain>,
    stream_ids: Arc<dyn StreamIdProvider>,
    flush_ids: Arc<dyn FlushIdProvider>,
    timestamper: Option<Arc<dyn OhmTimestamper>>,
    pool: Arc<FramePool>,
    requester: Arc<OhmResendRequester>,
    repairer: Repairer,
    stream_id: AtomicU32,
    sender_endpoint: Mutex<Option<SocketAddr>>,
    leave: Mutex<LeaveState>,
    leave_task: Mutex<Option<JoinHandle<()>>>,
    /// Back-reference for spawning the leave timer task.
    self_ref: OnceLock<Weak<OhuSession>>,
}

/// The stop/leave flags. Short critical sections only: every lock holder
/// updates the flags and performs at most one send or interrupt.
struct LeaveState {
    leaving: bool,
    stopped: bool,
    starving: bool,
    next_flush_id: u32,
}

struct SessionCtx {
    uri: String,
    slaves: Vec<SlaveEntry>,
    first_join: bool,
    stream_output: bool,
}

struct SlaveEntry {
    endpoint: SocketAddr,
    expires_at: Instant,
}

#[derive(Debug)]
enum LoopRestart {
    Socket(SocketError),
    Halted(Discontinuity),
    Repair(RepairError),
}

impl From<SocketError> for LoopRestart {
    fn from(e: SocketError) -> LoopRestart {
        LoopRestart::Socket(e)
    }
}

impl From<Discontinuity> for LoopRestart {
    fn from(e: Discontinuity) -> LoopRestart {
        LoopRestart::Halted(e)
    }
}

impl OhuSession {
    pub fn new(
        config: ReceiverConfig,
        supply: Arc<PipelineSupply>,
        drain: Arc<dyn PipelineDrain>,
        stream_ids: Arc<dyn StreamIdProvider>,
        flush_ids: Arc<dyn FlushIdProvider>,
        timestamper: Option<Arc<dyn OhmTimestamper>>,
        timers: &dyn TimerFactory,
    ) -> anyhow::Result<Arc<OhuSession>> {
        config.validate()?;

        let socket = Arc::new(OhmSocket::new());
        // sized for the full backlog, the head sentinel slot and one
        // in-flight ingest frame
        let pool = Arc::new(FramePool::new(
            config.repair_backlog_max_frames + 2,
            config.payload_max_bytes,
        ));
        let requester = Arc::new(OhmResendRequester::new(socket.clone()));
        let repairer = Repairer::new(
            config.repair_backlog_max_frames,
            config.resend_timeout,
            pool.clone(),
            requester.clone(),
            supply.clone(),
            timers,
        );

        let session = Arc::new(OhuSession {
            config,
            socket,
            supply,
            drain,
            stream_ids,
            flush_ids,
            timestamper,
            pool,
            requester,
            repairer,
            stream_id: AtomicU32::new(STREAM_ID_INVALID),
            sender_endpoint: Mutex::new(None),
            leave: Mutex::new(LeaveState {
                leaving: false,
                stopped: false,
                starving: false,
                next_flush_id: FLUSH_ID_INVALID,
            }),
            leave_task: Mutex::new(None),
            self_ref: OnceLock::new(),
        });
        assert!(
            session.self_ref.set(Arc::downgrade(&session)).is_ok(),
            "self reference is set exactly once"
        );
        Ok(session)
    }

    /// Run one session against the sender at `endpoint`. Returns when the
    /// session is stopped or its transport cannot be established. The null
    /// endpoint stops immediately.
    pub async fn play(&self, interface: Ipv4Addr, endpoint: SocketAddrV4) -> PlayOutcome {
        debug!("OHU: play({:?}, {:?})", interface, endpoint);
        if endpoint.ip().is_unspecified() {
            return PlayOutcome::Stopped;
        }

        {
            let mut leave = self.leave.lock().unwrap();
            leave.leaving = false;
            leave.stopped = false;
            leave.next_flush_id = FLUSH_ID_INVALID;
        }
        let sender = SocketAddr::V4(endpoint);
        *self.sender_endpoint.lock().unwrap() = Some(sender);
        self.requester.set_endpoint(Some(sender));

        let mut ctx = SessionCtx {
            uri: format!("ohu://{}", endpoint),
            slaves: Vec::new(),
            first_join: true,
            stream_output: false,
        };

        let mut restarting = false;
        loop {
            if restarting {
                // leave the previous join before re-joining; the failed
                // iteration's join/listen timers are already gone
                self.send_leave();
                tokio::time::sleep(self.config.rejoin_backoff).await;
            }
            restarting = true;

            self.repairer.drop_audio();
            self.drain.wait_for_empty().await;
            {
                let mut leave = self.leave.lock().unwrap();
                if leave.starving && !leave.stopped {
                    leave.starving = false;
                    self.socket.interrupt(false);
                }
            }

            self.socket.close();
            if let Err(e) = self.socket.open_unicast(interface, self.config.ttl).await {
                error!("OHU: failed to open unicast socket: {}", e);
                return PlayOutcome::Unrecoverable;
            }
            if let Some(timestamper) = &self.timestamper {
                timestamper.stop();
                if let Ok(local) = self.socket.local_addr() {
                    timestamper.start(local);
                }
            }

            if let Err(restart) = self.run_session_phases(&mut ctx).await {
                let (stopped, starving, leaving) = {
                    let leave = self.leave.lock().unwrap();
                    (leave.stopped, leave.starving, leave.leaving)
                };
                warn!(
                    "OHU: {:?}. stopped={} starving={} leaving={}",
                    restart, stopped, starving, leaving
                );
            }

            if self.leave.lock().unwrap().stopped {
                break;
            }
        }

        if let Some(timestamper) = &self.timestamper {
            timestamper.stop();
        }

        // clear any interrupt so the final Leave can go out
        self.socket.interrupt(false);
        self.cancel_leave_timer();
        {
            let mut leave = self.leave.lock().unwrap();
            if leave.leaving {
                leave.leaving = false;
                self.send_leave();
            }
        }
        self.socket.close();
        self.requester.set_endpoint(None);
        *self.sender_endpoint.lock().unwrap() = None;
        self.stream_id.store(STREAM_ID_INVALID, Ordering::SeqCst);

        let flush_id = {
            let mut leave = self.leave.lock().unwrap();
            std::mem::replace(&mut leave.next_flush_id, FLUSH_ID_INVALID)
        };
        if flush_id != FLUSH_ID_INVALID {
            self.supply.output_flush(flush_id);
        }
        self.supply.output_halt();
        PlayOutcome::Stopped
    }

    /// Request an asynchronous stop of the identified stream. Returns the
    /// flush id the pipeline will observe, or the invalid id if the stream
    /// is not the active one.
    pub fn try_stop(&self, stream_id: u32) -> u32 {
        debug!("OHU: try_stop({})", stream_id);
        if stream_id == STREAM_ID_INVALID || self.stream_id.load(Ordering::SeqCst) != stream_id {
            return FLUSH_ID_INVALID;
        }

        let mut leave = self.leave.lock().unwrap();
        if leave.next_flush_id == FLUSH_ID_INVALID {
            leave.next_flush_id = self.flush_ids.next_flush_id();
        }
        leave.stopped = true;
        leave.leaving = true;
        self.arm_leave_timer();
        self.socket.interrupt(true);
        leave.next_flush_id
    }

    /// Seeking is meaningless on a live stream.
    pub fn try_seek(&self, _stream_id: u32, _byte_offset: u64) -> u32 {
        FLUSH_ID_INVALID
    }

    /// Asynchronous cancel from outside the session. Idempotent.
    pub fn interrupt(&self, interrupt: bool) {
        debug!("OHU: interrupt({})", interrupt);
        if interrupt {
            let mut leave = self.leave.lock().unwrap();
            leave.stopped = true;
            leave.leaving = true;
        }
        self.socket.interrupt(interrupt);
    }

    /// Pipeline-side starvation report. A starving live stream means the
    /// sender went quiet: eject the reader so the session re-joins.
    pub fn notify_starving(&self, mode: &str, stream_id: u32, starving: bool) {
        debug!("OHU: notify_starving({}, {}, {})", mode, stream_id, starving);
        if starving
            && stream_id != STREAM_ID_INVALID
            && self.stream_id.load(Ordering::SeqCst) == stream_id
        {
            self.leave.lock().unwrap().starving = true;
            self.socket.interrupt(true);
        }
    }

    async fn run_session_phases(&self, ctx: &mut SessionCtx) -> Result<(), LoopRestart> {
        self.join_phase(ctx).await?;
        debug!("OHU: joined");

        if !ctx.stream_output {
            let stream_id = self.stream_ids.next_stream_id();
            self.stream_id.store(stream_id, Ordering::SeqCst);
            self.supply.output_stream(&ctx.uri, 0, 0, false, true, stream_id);
            ctx.stream_output = true;
        }
        if ctx.first_join {
            /* Put the pipeline into Waiting initially in case the sender is
            currently paused. Later iterations are typically prompted by
            starvation, where Buffering is the correct pipeline state. */
            self.supply.output_wait();
            ctx.first_join = false;
        }

        self.listen_phase(ctx).await
    }

    /// Phase 1: re-send Join periodically until both a Track and a Metatext
    /// have been observed.
    async fn join_phase(&self, ctx: &mut SessionCtx) -> Result<(), LoopRestart> {
        let mut join_interval = tokio::time::interval(self.config.join_timeout);
        let mut received_track = false;
        let mut received_metatext = false;

        while !(received_track && received_metatext) {
            tokio::select! {
                _ = join_interval.tick() => {
                    self.send_join()?;
                }
                result = self.recv_datagram() => {
                    let datagram = result?;
                    let (track, metatext) = self.on_join_datagram(ctx, &datagram)?;
                    received_track |= track;
                    received_metatext |= metatext;
                }
            }
        }
        Ok(())
    }

    /// Phase 2: consume the stream, answering the sender's keep-alive
    /// discipline with Listen frames.
    async fn listen_phase(&self, ctx: &mut SessionCtx) -> Result<(), LoopRestart> {
        let listen_sleep = tokio::time::sleep(self.listen_delay_primary());
        tokio::pin!(listen_sleep);

        loop {
            tokio::select! {
                _ = listen_sleep.as_mut() => {
                    self.send_listen()?;
                    listen_sleep.as_mut().reset(Instant::now() + self.listen_delay_primary());
                }
                result = self.recv_datagram() => {
                    let datagram = result?;
                    if let Some(rearm) = self.on_listen_datagram(ctx, &datagram)? {
                        listen_sleep.as_mut().reset(Instant::now() + rearm);
                    }
                }
            }
        }
    }

    /// Returns which of (track, metatext) the datagram contributed.
    fn on_join_datagram(
        &self,
        ctx: &mut SessionCtx,
        datagram: &[u8],
    ) -> Result<(bool, bool), LoopRestart> {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "ohm_datagram", ?correlation_id);
        let _entered = span.enter();

        let mut payload: &[u8] = datagram;
        let header = match OhmHeader::deser(&mut payload) {
            Ok(header) => header,
            Err(e) => {
                warn!("OHU: dropping datagram while joining: {}", e);
                return Ok((false, false));
            }
        };

        match header.msg_type {
            OhmMsgType::Join | OhmMsgType::Listen | OhmMsgType::Leave => {}
            OhmMsgType::Audio => {
                /* Ignore audio while joining - it might be left over from
                before the pipeline emptied when re-starting after a
                dropout. The timestamper still sees it so it cannot fill
                with out of date values. */
                match OhmAudioHeader::deser(&mut payload) {
                    Ok(audio) => self.record_timestamp(&audio),
                    Err(e) => warn!("OHU: dropping malformed audio frame: {}", e),
                }
            }
            OhmMsgType::Track => {
                let handled = self.handle_track(ctx, datagram, &mut payload);
                if handled {
                    debug!("OHU: joining, received track");
                }
                return Ok((handled, false));
            }
            OhmMsgType::Metatext => {
                let handled = self.handle_metatext(ctx, datagram, &mut payload);
                if handled {
                    debug!("OHU: joining, received metatext");
                }
                return Ok((false, handled));
            }
            OhmMsgType::Slave => self.handle_slave(ctx, &mut payload),
            OhmMsgType::Resend => self.repairer.resend_seen(),
        }
        Ok((false, false))
    }

    /// Returns a new listen-timer delay when the sender's own Listen was
    /// observed.
    fn on_listen_datagram(
        &self,
        ctx: &mut SessionCtx,
        datagram: &[u8],
    ) -> Result<Option<Duration>, LoopRestart> {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "ohm_datagram", ?correlation_id);
        let _entered = span.enter();

        let mut payload: &[u8] = datagram;
        let header = match OhmHeader::deser(&mut payload) {
            Ok(header) => header,
            Err(e) => {
                warn!("OHU: dropping datagram: {}", e);
                return Ok(None);
            }
        };

        match header.msg_type {
            OhmMsgType::Join | OhmMsgType::Leave => {}
            OhmMsgType::Listen => {
                // another receiver is keeping the stream alive for us
                return Ok(Some(self.listen_delay_secondary()));
            }
            OhmMsgType::Audio => self.handle_audio(ctx, datagram, &mut payload)?,
            OhmMsgType::Track => {
                self.handle_track(ctx, datagram, &mut payload);
            }
            OhmMsgType::Metatext => {
                self.handle_metatext(ctx, datagram, &mut payload);
            }
            OhmMsgType::Slave => self.handle_slave(ctx, &mut payload),
            OhmMsgType::Resend => self.repairer.resend_seen(),
        }
        Ok(None)
    }

    fn handle_audio(
        &self,
        ctx: &mut SessionCtx,
        datagram: &[u8],
        payload: &mut &[u8],
    ) -> Result<(), LoopRestart> {
        let audio = match OhmAudioHeader::deser(payload) {
            Ok(audio) => audio,
            Err(e) => {
                warn!("OHU: dropping malformed audio frame: {}", e);
                return Ok(());
            }
        };

        self.rebroadcast(ctx, datagram);
        self.record_timestamp(&audio);

        let samples: &[u8] = *payload;
        if samples.len() > self.config.payload_max_bytes {
            warn!(
                "OHU: audio frame #{} carries {} bytes, more than the configured maximum of {} - dropping",
                audio.frame,
                samples.len(),
                self.config.payload_max_bytes
            );
        } else if !samples.is_empty() {
            let frame = self.pool.allocate(audio.frame, audio.resend, samples);
            match self.repairer.on_audio(frame) {
                Ok(()) => {}
                Err(RepairError::StreamRestarted) => {
                    // the repairer purged itself; the next frame re-seeds
                    debug!("OHU: sender restarted its stream");
                }
                Err(e @ RepairError::BufferFull) => {
                    return Err(LoopRestart::Repair(e));
                }
            }
        }

        self.complete_leave_after_audio();

        if audio.halt {
            return Err(Discontinuity.into());
        }
        Ok(())
    }

    fn handle_track(&self, ctx: &mut SessionCtx, datagram: &[u8], payload: &mut &[u8]) -> bool {
        let track = match OhmTrack::deser(payload) {
            Ok(track) => track,
            Err(e) => {
                warn!("OHU: dropping malformed track: {}", e);
                return false;
            }
        };
        self.rebroadcast(ctx, datagram);
        trace!("OHU: track uri {}", track.uri);
        self.supply.output_metadata(&track.metadata);
        true
    }

    fn handle_metatext(&self, ctx: &mut SessionCtx, datagram: &[u8], payload: &mut &[u8]) -> bool {
        let metatext = match OhmMetatext::deser(payload) {
            Ok(metatext) => metatext,
            Err(e) => {
                warn!("OHU: dropping malformed metatext: {}", e);
                return false;
            }
        };
        self.rebroadcast(ctx, datagram);
        self.supply.output_metadata(&metatext.metatext);
        true
    }

    fn handle_slave(&self, ctx: &mut SessionCtx, payload: &mut &[u8]) {
        let list = match OhmSlaveList::deser(payload) {
            Ok(list) => list,
            Err(e) => {
                warn!("OHU: dropping malformed slave list: {}", e);
                return;
            }
        };
        let expires_at = Instant::now() + self.config.slave_expiry;
        ctx.slaves.clear();
        for endpoint in list.endpoints.into_iter().take(self.config.max_slaves) {
            trace!("OHU: slave {:?}", endpoint);
            ctx.slaves.push(SlaveEntry {
                endpoint: SocketAddr::V4(endpoint),
                expires_at,
            });
        }
        debug!("OHU: slave list replaced, {} entries", ctx.slaves.len());
    }

    /// Relay a frame to every listed slave before it is processed locally.
    /// Per-slave failures are logged; the other slaves still get a copy.
    fn rebroadcast(&self, ctx: &mut SessionCtx, datagram: &[u8]) {
        if ctx.slaves.is_empty() {
            return;
        }
        let now = Instant::now();
        ctx.slaves.retain(|slave| {
            if slave.expires_at <= now {
                debug!("OHU: evicting stale slave {:?}", slave.endpoint);
                false
            } else {
                true
            }
        });
        for slave in &ctx.slaves {
            if let Err(e) = self.socket.try_send(datagram, slave.endpoint) {
                warn!("OHU: failed to relay to slave {:?}: {}", slave.endpoint, e);
            }
        }
    }

    fn record_timestamp(&self, audio: &OhmAudioHeader) {
        if audio.timestamped {
            if let Some(timestamper) = &self.timestamper {
                timestamper.record(audio.network_timestamp);
            }
        }
    }

    /// The stop path taken when audio is flowing: honour a pending leave
    /// right after the frame that revealed it.
    fn complete_leave_after_audio(&self) {
        let mut leave = self.leave.lock().unwrap();
        if !leave.leaving {
            return;
        }
        self.cancel_leave_timer();
        leave.leaving = false;
        // send_join/send_listen check `stopped` under this same lock, so
        // neither can follow this Leave
        self.send_leave();
        self.socket.interrupt(true);
    }

    fn arm_leave_timer(&self) {
        let Some(session) = self.self_ref.get().and_then(Weak::upgrade) else {
            return;
        };
        let task = tokio::spawn(async move {
            tokio::time::sleep(session.config.leave_timeout).await;
            session.on_leave_timer();
        });
        if let Some(previous) = self.leave_task.lock().unwrap().replace(task) {
            previous.abort();
        }
    }

    fn cancel_leave_timer(&self) {
        if let Some(task) = self.leave_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn on_leave_timer(&self) {
        let mut leave = self.leave.lock().unwrap();
        if !leave.leaving {
            return;
        }
        leave.leaving = false;
        self.send_leave();
        self.socket.interrupt(true);
    }

    fn send_join(&self) -> Result<(), SocketError> {
        let leave = self.leave.lock().unwrap();
        if leave.leaving || leave.stopped {
            return Ok(());
        }
        trace!("OHU: sending join");
        self.send_control(OhmMsgType::Join)
    }

    fn send_listen(&self) -> Result<(), SocketError> {
        let leave = self.leave.lock().unwrap();
        if leave.leaving || leave.stopped {
            return Ok(());
        }
        trace!("OHU: sending listen");
        self.send_control(OhmMsgType::Listen)
    }

    /// Best-effort: a Leave that cannot be sent is only logged - the sender
    /// will drop us once the Listen keep-alives stop.
    fn send_leave(&self) {
        debug!("OHU: sending leave");
        if let Err(e) = self.send_control(OhmMsgType::Leave) {
            debug!("OHU: failed to send leave: {}", e);
        }
    }

    fn send_control(&self, msg_type: OhmMsgType) -> Result<(), SocketError> {
        let Some(endpoint) = *self.sender_endpoint.lock().unwrap() else {
            return Ok(());
        };
        let mut buf = BytesMut::with_capacity(OhmHeader::SERIALIZED_LEN);
        OhmHeader::for_payload(msg_type, 0).ser(&mut buf);
        self.socket.try_send(&buf, endpoint)
    }

    async fn recv_datagram(&self) -> Result<Vec<u8>, SocketError> {
        let mut buf = vec![0u8; self.config.payload_max_bytes + 4096];
        let (len, _from) = self.socket.recv(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    fn listen_delay_primary(&self) -> Duration {
        let millis = self.config.listen_timeout.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=millis / 8);
        Duration::from_millis(millis / 4 - jitter)
    }

    fn listen_delay_secondary(&self) -> Duration {
        let millis = self.config.listen_timeout.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=millis / 8);
        Duration::from_millis(millis / 2 - jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::SeqNo;
    use crate::supply::{OkToPlay, PipelineEvent, SequentialIds, StreamPlayGate};
    use crate::timer::TokioTimerFactory;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    struct AlwaysPlay;

    impl StreamPlayGate for AlwaysPlay {
        fn ok_to_play(&self, _stream_id: u32) -> OkToPlay {
            OkToPlay::Yes
        }
    }

    struct NoBackPressure;

    #[async_trait]
    impl PipelineDrain for NoBackPressure {
        async fn wait_for_empty(&self) {}
    }

    fn test_config() -> ReceiverConfig {
        ReceiverConfig {
            payload_max_bytes: 256,
            repair_backlog_max_frames: 8,
            resend_timeout: Duration::from_millis(50),
            join_timeout: Duration::from_millis(25),
            listen_timeout: Duration::from_millis(400),
            leave_timeout: Duration::from_millis(25),
            ..Default::default()
        }
    }

    struct Harness {
        session: Arc<OhuSession>,
        events: UnboundedReceiver<PipelineEvent>,
        sender: UdpSocket,
        sender_addr: SocketAddrV4,
    }

    async fn harness() -> Harness {
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender_addr = match sender.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            other => panic!("unexpected sender address {:?}", other),
        };
        let (supply, events) = PipelineSupply::new(Arc::new(AlwaysPlay));
        let ids = Arc::new(SequentialIds::new());
        let session = OhuSession::new(
            test_config(),
            supply,
            Arc::new(NoBackPressure),
            ids.clone(),
            ids,
            None,
            &TokioTimerFactory,
        )
        .unwrap();
        Harness { session, events, sender, sender_addr }
    }

    fn audio_datagram(frame: u16, resend: bool, halt: bool, samples: &[u8]) -> Vec<u8> {
        let mut payload = BytesMut::new();
        OhmAudioHeader {
            halt,
            resend,
            timestamped: false,
            frame: SeqNo::from_raw(frame),
            network_timestamp: 0,
            media_latency: 0,
        }
        .ser(&mut payload);
        payload.extend_from_slice(samples);

        let mut buf = BytesMut::new();
        OhmHeader::for_payload(OhmMsgType::Audio, payload.len()).ser(&mut buf);
        buf.extend_from_slice(&payload);
        buf.to_vec()
    }

    fn track_datagram(uri: &str, metadata: &str) -> Vec<u8> {
        let track = OhmTrack { uri: uri.to_owned(), metadata: metadata.to_owned() };
        let mut payload = BytesMut::new();
        track.ser(&mut payload);

        let mut buf = BytesMut::new();
        OhmHeader::for_payload(OhmMsgType::Track, payload.len()).ser(&mut buf);
        buf.extend_from_slice(&payload);
        buf.to_vec()
    }

    fn metatext_datagram(metatext: &str) -> Vec<u8> {
        let message = OhmMetatext { metatext: metatext.to_owned() };
        let mut payload = BytesMut::new();
        message.ser(&mut payload);

        let mut buf = BytesMut::new();
        OhmHeader::for_payload(OhmMsgType::Metatext, payload.len()).ser(&mut buf);
        buf.extend_from_slice(&payload);
        buf.to_vec()
    }

    async fn next_datagram(sender: &UdpSocket) -> (OhmMsgType, SocketAddr) {
        let mut buf = [0u8; 2048];
        let (len, from) = timeout(Duration::from_secs(2), sender.recv_from(&mut buf))
            .await
            .expect("timed out waiting for a datagram")
            .unwrap();
        let mut b: &[u8] = &buf[..len];
        let header = OhmHeader::deser(&mut b).expect("receiver sent an unparseable datagram");
        (header.msg_type, from)
    }

    async fn next_event(events: &mut UnboundedReceiver<PipelineEvent>) -> PipelineEvent {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for a pipeline event")
            .expect("event channel closed")
    }

    /// Drive the sender side through the join handshake; returns the
    /// receiver's endpoint and the allocated stream id.
    async fn complete_join(h: &mut Harness) -> (SocketAddr, u32) {
        let (msg, receiver_addr) = next_datagram(&h.sender).await;
        assert_eq!(msg, OhmMsgType::Join);

        h.sender
            .send_to(&track_datagram("spotify://x", "track-meta"), receiver_addr)
            .await
            .unwrap();
        h.sender
            .send_to(&metatext_datagram("meta-text"), receiver_addr)
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut h.events).await,
            PipelineEvent::Metadata("track-meta".to_owned())
        );
        assert_eq!(
            next_event(&mut h.events).await,
            PipelineEvent::Metadata("meta-text".to_owned())
        );
        let stream_id = match next_event(&mut h.events).await {
            PipelineEvent::Stream { live, seekable, stream_id, .. } => {
                assert!(live);
                assert!(!seekable);
                stream_id
            }
            other => panic!("expected a stream event, got {:?}", other),
        };
        assert_eq!(next_event(&mut h.events).await, PipelineEvent::Wait);
        (receiver_addr, stream_id)
    }

    #[tokio::test]
    async fn test_null_endpoint_stops_immediately() {
        let h = harness().await;
        let outcome = h
            .session
            .play(Ipv4Addr::LOCALHOST, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .await;
        assert_eq!(outcome, PlayOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_join_listen_stop_lifecycle() {
        let mut h = harness().await;
        let session = h.session.clone();
        let sender_addr = h.sender_addr;
        let play = tokio::spawn(async move { session.play(Ipv4Addr::LOCALHOST, sender_addr).await });

        let (receiver_addr, stream_id) = complete_join(&mut h).await;

        // audio flows through to the pipeline in order
        h.sender
            .send_to(&audio_datagram(0, false, false, b"s0"), receiver_addr)
            .await
            .unwrap();
        h.sender
            .send_to(&audio_datagram(1, false, false, b"s1"), receiver_addr)
            .await
            .unwrap();
        assert_eq!(next_event(&mut h.events).await, PipelineEvent::Data(Bytes::from_static(b"s0")));
        assert_eq!(next_event(&mut h.events).await, PipelineEvent::Data(Bytes::from_static(b"s1")));

        // stopping an inactive stream id is refused
        assert_eq!(h.session.try_stop(stream_id + 1), FLUSH_ID_INVALID);

        let flush_id = h.session.try_stop(stream_id);
        assert_ne!(flush_id, FLUSH_ID_INVALID);

        assert_eq!(next_event(&mut h.events).await, PipelineEvent::Flush(flush_id));
        assert_eq!(next_event(&mut h.events).await, PipelineEvent::Halt);
        assert_eq!(
            timeout(Duration::from_secs(2), play).await.unwrap().unwrap(),
            PlayOutcome::Stopped
        );

        // on the wire: a Leave went out, and nothing but Leave after it
        let mut saw_leave = false;
        loop {
            let mut buf = [0u8; 2048];
            match timeout(Duration::from_millis(300), h.sender.recv_from(&mut buf)).await {
                Ok(received) => {
                    let (len, _) = received.unwrap();
                    let mut b: &[u8] = &buf[..len];
                    let header = OhmHeader::deser(&mut b).unwrap();
                    if saw_leave {
                        assert_eq!(
                            header.msg_type,
                            OhmMsgType::Leave,
                            "no join/listen may follow a leave"
                        );
                    }
                    if header.msg_type == OhmMsgType::Leave {
                        saw_leave = true;
                    }
                }
                Err(_) => break,
            }
        }
        assert!(saw_leave);
    }

    #[tokio::test]
    async fn test_repair_round_trip_over_the_wire() {
        let mut h = harness().await;
        let session = h.session.clone();
        let sender_addr = h.sender_addr;
        let play = tokio::spawn(async move { session.play(Ipv4Addr::LOCALHOST, sender_addr).await });

        let (receiver_addr, _stream_id) = complete_join(&mut h).await;

        h.sender
            .send_to(&audio_datagram(0, false, false, b"s0"), receiver_addr)
            .await
            .unwrap();
        assert_eq!(next_event(&mut h.events).await, PipelineEvent::Data(Bytes::from_static(b"s0")));

        // drop frame 1: the receiver must ask for it
        h.sender
            .send_to(&audio_datagram(2, false, false, b"s2"), receiver_addr)
            .await
            .unwrap();

        let ranges = loop {
            let mut buf = [0u8; 2048];
            let (len, _) = timeout(Duration::from_secs(2), h.sender.recv_from(&mut buf))
                .await
                .expect("timed out waiting for a resend request")
                .unwrap();
            let mut b: &[u8] = &buf[..len];
            let header = OhmHeader::deser(&mut b).unwrap();
            // listen keep-alives may interleave with the resend request
            if header.msg_type == OhmMsgType::Resend {
                break crate::ohm_messages::OhmResendRanges::deser(&mut b).unwrap().ranges;
            }
        };
        assert_eq!(ranges, vec![crate::seq::SeqRange::single(SeqNo::from_raw(1))]);

        // answer the request: the stream un-blocks in order
        h.sender
            .send_to(&audio_datagram(1, true, false, b"s1"), receiver_addr)
            .await
            .unwrap();
        assert_eq!(next_event(&mut h.events).await, PipelineEvent::Data(Bytes::from_static(b"s1")));
        assert_eq!(next_event(&mut h.events).await, PipelineEvent::Data(Bytes::from_static(b"s2")));

        h.session.interrupt(true);
        assert_eq!(
            timeout(Duration::from_secs(2), play).await.unwrap().unwrap(),
            PlayOutcome::Stopped
        );
    }

    #[tokio::test]
    async fn test_halt_flag_triggers_rejoin() {
        let mut h = harness().await;
        let session = h.session.clone();
        let sender_addr = h.sender_addr;
        let play = tokio::spawn(async move { session.play(Ipv4Addr::LOCALHOST, sender_addr).await });

        let (receiver_addr, _stream_id) = complete_join(&mut h).await;

        h.sender
            .send_to(&audio_datagram(0, false, true, b"h0"), receiver_addr)
            .await
            .unwrap();
        // the halt frame's audio still plays
        assert_eq!(next_event(&mut h.events).await, PipelineEvent::Data(Bytes::from_static(b"h0")));

        // the session leaves and joins again
        let mut saw_leave = false;
        loop {
            let (msg, _) = next_datagram(&h.sender).await;
            match msg {
                OhmMsgType::Leave => saw_leave = true,
                OhmMsgType::Join if saw_leave => break,
                _ => {}
            }
        }

        h.session.interrupt(true);
        assert_eq!(
            timeout(Duration::from_secs(2), play).await.unwrap().unwrap(),
            PlayOutcome::Stopped
        );
    }

    #[tokio::test]
    async fn test_slave_receives_relayed_audio() {
        let mut h = harness().await;
        let session = h.session.clone();
        let sender_addr = h.sender_addr;
        let play = tokio::spawn(async move { session.play(Ipv4Addr::LOCALHOST, sender_addr).await });

        let (receiver_addr, _stream_id) = complete_join(&mut h).await;

        // register a slave endpoint
        let slave = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let slave_addr = match slave.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            other => panic!("unexpected slave address {:?}", other),
        };
        let list = OhmSlaveList { endpoints: vec![slave_addr] };
        let mut payload = BytesMut::new();
        list.ser(&mut payload);
        let mut datagram = BytesMut::new();
        OhmHeader::for_payload(OhmMsgType::Slave, payload.len()).ser(&mut datagram);
        datagram.extend_from_slice(&payload);
        h.sender.send_to(&datagram, receiver_addr).await.unwrap();

        // the slave registration races the next audio frame; keep sending
        // until the relay shows up
        let audio = audio_datagram(0, false, false, b"s0");
        let relayed = loop {
            h.sender.send_to(&audio, receiver_addr).await.unwrap();
            let mut buf = [0u8; 2048];
            match timeout(Duration::from_millis(200), slave.recv_from(&mut buf)).await {
                Ok(received) => {
                    let (len, _) = received.unwrap();
                    break buf[..len].to_vec();
                }
                Err(_) => continue,
            }
        };
        assert_eq!(relayed, audio);

        h.session.interrupt(true);
        assert_eq!(
            timeout(Duration::from_secs(2), play).await.unwrap().unwrap(),
            PlayOutcome::Stopped
        );
    }

    #[tokio::test]
    async fn test_try_seek_is_invalid_for_live_streams() {
        let h = harness().await;
        assert_eq!(h.session.try_seek(1, 0), FLUSH_ID_INVALID);
    }
}
