// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode pipeline.
//!
//! A decode session owns one thread that takes compressed packets from an input
//! [`TransferQueue`], splits them into hardware input buffers and submits them to a
//! [`DecoderBackend`]. Decoded pictures come back on the backend's own thread, are wrapped into
//! [`Frame`](crate::video_frame::Frame)s without copying, and are queued for the presenter,
//! preceded by a [`VideoItem::SetClock`] whenever the presentation clock needs to be reset.
//!
//! The session goes through the following states:
//!
//! ```text
//! Starting -> Ready <-> Feeding
//!               |  \
//!               |   Flushing -> Ready
//!               v
//!            Draining -> Stopped
//! ```
//!
//! The controller interacts with a running session through its [`PipelineHandle`]: it can pause
//! the decode thread at a safe point, flush it when seeking, and shut it down.

mod callbacks;
mod worker;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::DecoderBackend;
use crate::backend::HwStatus;
use crate::backend::OutputFormat;
use crate::backend::StreamParams;
use crate::checkpoint::Checkpoint;
use crate::packet::PooledPacket;
use crate::queue::TransferQueue;
use crate::video_frame::VideoItem;

/// What to do when the hardware rejects a submission.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Abort the process. The hardware state is unknown and the player cannot recover.
    #[default]
    Abort,
    /// End the session with [`SessionEnd::Fault`].
    Terminate,
}

impl FromStr for FaultPolicy {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort" => Ok(FaultPolicy::Abort),
            "terminate" => Ok(FaultPolicy::Terminate),
            _ => Err("unrecognized fault policy. Valid values: abort, terminate"),
        }
    }
}

/// Tunables of a decode session.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Sleep between polls of an empty input queue.
    pub idle_backoff: Duration,
    /// Sleep while waiting for a free input buffer header.
    pub input_buffer_wait: Duration,
    /// Sleep between polls while waiting for a flush to complete.
    pub flush_poll_interval: Duration,
    /// Sleep between polls while waiting for frames in transit to come back at shutdown.
    pub drain_poll_interval: Duration,
    /// Number of polls after which waiting loops start logging.
    pub poll_warn_threshold: u32,
    /// Frames the presenter may keep, typically the one on screen, when a flush completes.
    pub presenter_hold_frames: usize,
    /// Output buffers requested on top of what the decoder recommends.
    pub decode_cache_frames: usize,
    pub fault_policy: FaultPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idle_backoff: Duration::from_millis(5),
            input_buffer_wait: Duration::from_millis(10),
            flush_poll_interval: Duration::from_millis(10),
            drain_poll_interval: Duration::from_millis(10),
            poll_warn_threshold: 50,
            presenter_hold_frames: 1,
            decode_cache_frames: 0,
            fault_policy: FaultPolicy::default(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Ready,
    Feeding,
    Flushing,
    Draining,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a decode session ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The input queue was closed and everything submitted was processed or discarded.
    EndOfStream,
    /// The hardware rejected a submission.
    Fault(HwStatus),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to initialize the decoder: {0}")]
    InitFailed(BackendError),
    #[error("failed to spawn the decode thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("the decode session is not running")]
    NotRunning,
}

/// State of the decoder shared between the decode thread, the hardware callbacks and the
/// controller.
#[derive(Debug, Default)]
pub struct DecoderContext {
    /// Output format announced by the hardware and not yet committed.
    pub(crate) pending_format: Mutex<Option<OutputFormat>>,
    pub(crate) format: Mutex<Option<OutputFormat>>,
    pub(crate) flushing: AtomicBool,
    /// Whether a [`VideoItem::SetClock`] was sent since the session started or was last flushed.
    pub(crate) clock_set: AtomicBool,
    /// Input buffers submitted and not yet consumed by the hardware.
    pub(crate) in_decoder: AtomicUsize,
    /// Output buffers lent to the application.
    pub(crate) in_transit: Arc<AtomicUsize>,
}

impl DecoderContext {
    pub fn in_decoder(&self) -> usize {
        self.in_decoder.load(Ordering::Acquire)
    }

    pub fn in_transit(&self) -> usize {
        self.in_transit.load(Ordering::Acquire)
    }

    pub fn clock_set(&self) -> bool {
        self.clock_set.load(Ordering::Acquire)
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// Output format currently committed on the hardware.
    pub fn output_format(&self) -> Option<OutputFormat> {
        *self.format.lock().unwrap()
    }
}

#[derive(Debug, Default)]
struct FlushStatus {
    /// Incremented every time a flush completes.
    generation: u64,
    stopped: bool,
}

/// State of a session shared between its decode thread and its handle.
pub(crate) struct Shared {
    pub(crate) config: PipelineConfig,
    pub(crate) context: DecoderContext,
    pub(crate) checkpoint: Checkpoint,
    pub(crate) packets: Arc<TransferQueue<PooledPacket>>,
    pub(crate) frames: Arc<TransferQueue<VideoItem>>,
    state: Mutex<PipelineState>,
    flush_requested: AtomicBool,
    /// The controller had paused the session before the pending flush.
    pause_after_flush: AtomicBool,
    /// Set by `shutdown` so the decode thread discards pending work instead of draining it.
    shutdown_requested: AtomicBool,
    flush_status: Mutex<FlushStatus>,
    flush_cond: Condvar,
}

impl Shared {
    fn new(
        config: PipelineConfig,
        packets: Arc<TransferQueue<PooledPacket>>,
        frames: Arc<TransferQueue<VideoItem>>,
    ) -> Self {
        Self {
            config,
            context: Default::default(),
            checkpoint: Checkpoint::new(),
            packets,
            frames,
            state: Mutex::new(PipelineState::Starting),
            flush_requested: AtomicBool::new(false),
            pause_after_flush: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            flush_status: Default::default(),
            flush_cond: Condvar::new(),
        }
    }

    fn state(&self) -> PipelineState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, new_state: PipelineState) {
        let mut state = self.state.lock().unwrap();
        if *state != new_state {
            log::trace!("decode session {} -> {}", *state, new_state);
            *state = new_state;
        }
    }

    fn flush_completed(&self) {
        // Parks the decode thread again before the controller is released.
        if self.pause_after_flush.swap(false, Ordering::AcqRel) {
            self.checkpoint.halt();
        }
        self.flush_requested.store(false, Ordering::Release);
        self.flush_status.lock().unwrap().generation += 1;
        self.flush_cond.notify_all();
    }

    fn stopped(&self) {
        self.set_state(PipelineState::Stopped);
        self.flush_status.lock().unwrap().stopped = true;
        self.flush_cond.notify_all();
    }
}

/// Everything a decode session needs from the rest of the player.
pub struct SessionContext {
    pub stream: StreamParams,
    /// Packets from the demuxer. Closing this queue ends the session.
    pub packets: Arc<TransferQueue<PooledPacket>>,
    /// Frames for the presenter. Closed by the session when it ends.
    pub frames: Arc<TransferQueue<VideoItem>>,
}

/// Start a decode session on its own thread.
///
/// Returns once the decoder is configured and accepting input, or with
/// [`PipelineError::InitFailed`] if it could not be set up. In the latter case the output queue
/// has been closed.
pub fn start<B: DecoderBackend + 'static>(
    context: SessionContext,
    backend: B,
    config: PipelineConfig,
) -> Result<PipelineHandle, PipelineError> {
    let SessionContext { stream, packets, frames } = context;
    let shared = Arc::new(Shared::new(config, packets, frames));

    let (ready_tx, ready_rx) = mpsc::channel();
    let worker = {
        let shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("video-decoder".into())
            .spawn(move || worker::run(shared, backend, stream, ready_tx))?
    };

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(PipelineHandle { shared, worker: Some(worker), end: None }),
        Ok(Err(e)) => {
            let _ = worker.join();
            Err(PipelineError::InitFailed(e))
        }
        Err(_) => {
            let _ = worker.join();
            Err(PipelineError::InitFailed(BackendError::Status(HwStatus::Unknown)))
        }
    }
}

/// Controller side of a running decode session.
///
/// Dropping the handle shuts the session down.
pub struct PipelineHandle {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<SessionEnd>>,
    end: Option<SessionEnd>,
}

impl PipelineHandle {
    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn context(&self) -> &DecoderContext {
        &self.shared.context
    }

    /// Park the decode thread at its next safe point.
    ///
    /// While paused, nothing is submitted to the hardware. Returns `false` if the thread did not
    /// reach the safe point within `timeout`.
    pub fn pause(&self, timeout: Option<Duration>) -> bool {
        self.shared.checkpoint.pause(timeout)
    }

    pub fn resume(&self) {
        self.shared.checkpoint.resume();
    }

    /// Discard everything queued or being decoded, e.g. before a seek.
    ///
    /// Blocks until the decoder holds no input and at most
    /// [`PipelineConfig::presenter_hold_frames`] frames are still out. The next frame decoded
    /// afterwards is preceded by a [`VideoItem::SetClock`].
    pub fn request_flush(&self) -> Result<(), PipelineError> {
        let shared = &self.shared;
        if matches!(shared.state(), PipelineState::Draining | PipelineState::Stopped) {
            return Err(PipelineError::NotRunning);
        }

        // With the decode thread parked nothing is being submitted, so pending packets can be
        // dropped safely. A pause requested by the controller outlives the flush.
        let paused = shared.checkpoint.is_halt_requested();
        shared.checkpoint.pause(None);
        let stale = shared.packets.discard_pending();
        log::debug!("flushing decode session, {} packets discarded", stale.len());
        drop(stale);

        let mut status = shared.flush_status.lock().unwrap();
        let generation = status.generation;
        shared.pause_after_flush.store(paused, Ordering::Release);
        shared.flush_requested.store(true, Ordering::Release);
        shared.checkpoint.resume();

        while status.generation == generation && !status.stopped {
            status = shared.flush_cond.wait(status).unwrap();
        }
        match status.generation == generation {
            true => Err(PipelineError::NotRunning),
            false => Ok(()),
        }
    }

    fn join(&mut self) -> SessionEnd {
        if let Some(end) = self.end {
            return end;
        }
        let end = match self.worker.take().map(JoinHandle::join) {
            Some(Ok(end)) => end,
            Some(Err(_)) => {
                log::error!("decode thread panicked");
                SessionEnd::Fault(HwStatus::Unknown)
            }
            None => SessionEnd::EndOfStream,
        };
        self.end = Some(end);
        end
    }

    /// Wait for the session to end on its own, i.e. after the input queue has been closed and
    /// drained.
    pub fn wait(&mut self) -> SessionEnd {
        self.join()
    }

    /// Stop the session, dropping any packet not submitted yet, and wait until every resource is
    /// released.
    ///
    /// The presenter must keep consuming the output queue until it closes.
    pub fn shutdown(&mut self) -> SessionEnd {
        if self.end.is_none() {
            self.shared.shutdown_requested.store(true, Ordering::Release);
            drop(self.shared.packets.shutdown());
            self.shared.checkpoint.resume();
        }
        self.join()
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;
    use std::time::Instant;

    use bytes::Bytes;

    use super::*;
    use crate::backend::dummy::DummyDecoder;
    use crate::backend::dummy::DummyOptions;
    use crate::backend::dummy::DummyStats;
    use crate::backend::Codec;
    use crate::packet::packet_pool;
    use crate::packet::Packet;
    use crate::pool::Pool;
    use crate::queue::QueueState;
    use crate::Rational;
    use crate::Resolution;

    const TICKS_PER_FRAME: i64 = 3003;

    #[derive(Debug, PartialEq, Eq)]
    enum Seen {
        Clock(Option<i64>),
        Frame(Option<i64>),
    }

    struct Harness {
        packet_pool: Pool<Packet>,
        packets: Arc<TransferQueue<PooledPacket>>,
        frames: Arc<TransferQueue<VideoItem>>,
        seen: Arc<Mutex<Vec<Seen>>>,
        presenter: Option<thread::JoinHandle<()>>,
    }

    impl Harness {
        /// `hold_last` makes the presenter keep the most recent frame, like a display showing it.
        fn new(hold_last: bool) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let packets = Arc::new(TransferQueue::new(16));
            let frames = Arc::new(TransferQueue::new(4));
            let seen = Arc::new(Mutex::new(Vec::new()));
            let presenter = {
                let frames = Arc::clone(&frames);
                let seen = Arc::clone(&seen);
                thread::spawn(move || {
                    let mut held = None;
                    while let Ok(item) = frames.get() {
                        match item {
                            VideoItem::SetClock(pts) => seen.lock().unwrap().push(Seen::Clock(pts)),
                            VideoItem::Frame(frame) => {
                                seen.lock().unwrap().push(Seen::Frame(frame.pts));
                                if hold_last {
                                    held = Some(frame);
                                }
                            }
                        }
                    }
                    drop(held);
                })
            };

            Self {
                packet_pool: packet_pool(32),
                packets,
                frames,
                seen,
                presenter: Some(presenter),
            }
        }

        fn start(
            &self,
            backend: DummyDecoder,
            config: PipelineConfig,
        ) -> Result<PipelineHandle, PipelineError> {
            let context = SessionContext {
                stream: StreamParams {
                    codec: Codec::H264,
                    extradata: Bytes::new(),
                    frame_rate: Rational::new(30000, 1001),
                    time_base: Rational::new(1, 90_000),
                },
                packets: Arc::clone(&self.packets),
                frames: Arc::clone(&self.frames),
            };
            start(context, backend, config)
        }

        fn put_packet(&self, index: i64, len: usize) {
            let mut packet = self.packet_pool.acquire().unwrap();
            packet.data = Bytes::from(vec![index as u8; len]);
            packet.pts = Some(index * TICKS_PER_FRAME);
            self.packets.put(packet).unwrap();
        }

        fn frames_seen(&self) -> usize {
            self.seen.lock().unwrap().iter().filter(|s| matches!(s, Seen::Frame(_))).count()
        }

        fn wait_for_frames(&self, count: usize) {
            let deadline = Instant::now() + Duration::from_secs(10);
            while self.frames_seen() < count {
                assert!(Instant::now() < deadline, "timed out waiting for {count} frames");
                thread::sleep(Duration::from_millis(1));
            }
        }

        fn finish(mut self) -> Vec<Seen> {
            if let Some(presenter) = self.presenter.take() {
                presenter.join().unwrap();
            }
            assert_eq!(self.packet_pool.outstanding(), 0);
            std::mem::take(&mut *self.seen.lock().unwrap())
        }
    }

    fn us(index: i64) -> Option<i64> {
        Some(Rational::new(1, 90_000).rescale(index * TICKS_PER_FRAME, crate::MICROSECONDS))
    }

    fn dummy(options: DummyOptions) -> (DummyDecoder, DummyStats) {
        let decoder = DummyDecoder::new(options);
        let stats = decoder.stats();
        (decoder, stats)
    }

    #[test]
    fn frames_come_out_in_order_after_one_clock_reset() {
        let harness = Harness::new(false);
        let (decoder, stats) = dummy(Default::default());
        let mut handle = harness.start(decoder, Default::default()).unwrap();

        for i in 0..10 {
            harness.put_packet(i, 100);
        }
        harness.packets.close();

        assert_eq!(handle.wait(), SessionEnd::EndOfStream);
        assert_eq!(handle.state(), PipelineState::Stopped);
        assert_eq!(harness.frames.state(), QueueState::Closed);
        assert_eq!(handle.context().in_transit(), 0);
        assert_eq!(handle.context().in_decoder(), 0);
        assert_eq!(stats.pictures(), 10);

        let mut expected = vec![Seen::Clock(us(0))];
        expected.extend((0..10).map(|i| Seen::Frame(us(i))));
        assert_eq!(harness.finish(), expected);
    }

    #[test]
    fn large_packets_are_split_across_input_buffers() {
        let harness = Harness::new(false);
        let (decoder, stats) = dummy(DummyOptions {
            input_buffer_size: 16,
            input_buffer_count: 2,
            ..Default::default()
        });
        let mut handle = harness.start(decoder, Default::default()).unwrap();

        harness.put_packet(0, 40);
        harness.put_packet(1, 16);
        harness.packets.close();

        assert_eq!(handle.wait(), SessionEnd::EndOfStream);
        // 40 bytes need three buffers, 16 bytes fit in one.
        assert_eq!(stats.submitted(), 4);
        assert_eq!(stats.pictures(), 2);
        assert_eq!(harness.finish().len(), 3);
    }

    #[test]
    fn closing_input_mid_stream_ends_normally() {
        let harness = Harness::new(false);
        let (decoder, _) =
            dummy(DummyOptions { decode_delay: Duration::from_millis(2), ..Default::default() });
        let mut handle = harness.start(decoder, Default::default()).unwrap();

        for i in 0..10 {
            harness.put_packet(i, 64);
        }
        harness.wait_for_frames(1);
        harness.packets.close();

        assert_eq!(handle.wait(), SessionEnd::EndOfStream);
        assert_eq!(harness.frames.state(), QueueState::Closed);

        let seen = harness.finish();
        let pts: Vec<_> = seen
            .iter()
            .filter_map(|s| match s {
                Seen::Frame(pts) => Some(*pts),
                Seen::Clock(_) => None,
            })
            .collect();
        assert!(!pts.is_empty());
        assert!(pts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn flush_releases_all_but_displayed_frame() {
        let harness = Harness::new(true);
        let (decoder, _) = dummy(Default::default());
        let mut handle = harness.start(decoder, Default::default()).unwrap();

        for i in 0..6 {
            harness.put_packet(i, 32);
        }
        harness.wait_for_frames(3);

        for _ in 0..3 {
            handle.request_flush().unwrap();
            assert!(handle.context().in_transit() <= 1);
            assert_eq!(handle.context().in_decoder(), 0);
            assert!(!handle.context().clock_set());
            assert_eq!(handle.state(), PipelineState::Ready);
        }

        // Decoding resumes after a flush with a fresh clock reset.
        let before = harness.frames_seen();
        harness.put_packet(100, 32);
        harness.wait_for_frames(before + 1);
        assert_eq!(handle.shutdown(), SessionEnd::EndOfStream);

        let seen = harness.finish();
        let clocks: Vec<_> = seen.iter().filter(|s| matches!(s, Seen::Clock(_))).collect();
        assert_eq!(clocks.first(), Some(&&Seen::Clock(us(0))));
        assert_eq!(clocks.last(), Some(&&Seen::Clock(us(100))));
    }

    #[test]
    fn paused_session_submits_nothing() {
        let harness = Harness::new(false);
        let (decoder, stats) = dummy(Default::default());
        let mut handle = harness.start(decoder, Default::default()).unwrap();

        assert!(handle.pause(Some(Duration::from_secs(5))));
        for i in 0..3 {
            harness.put_packet(i, 8);
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(stats.submitted(), 0);
        assert_eq!(harness.packets.len(), 3);

        handle.resume();
        harness.wait_for_frames(3);
        assert_eq!(stats.submitted(), 3);
        assert_eq!(handle.shutdown(), SessionEnd::EndOfStream);
        harness.finish();
    }

    #[test]
    fn flush_keeps_session_paused() {
        let harness = Harness::new(false);
        let (decoder, stats) = dummy(Default::default());
        let mut handle = harness.start(decoder, Default::default()).unwrap();

        harness.put_packet(0, 8);
        harness.wait_for_frames(1);
        assert!(handle.pause(Some(Duration::from_secs(5))));
        handle.request_flush().unwrap();
        assert_eq!(handle.state(), PipelineState::Ready);

        for i in 1..4 {
            harness.put_packet(i, 8);
        }
        thread::sleep(Duration::from_millis(100));
        assert_eq!(stats.submitted(), 1);
        assert_eq!(harness.packets.len(), 3);

        handle.resume();
        harness.wait_for_frames(4);
        assert_eq!(stats.submitted(), 4);
        assert_eq!(handle.shutdown(), SessionEnd::EndOfStream);
        harness.finish();
    }

    #[test]
    fn closed_output_queue_returns_every_buffer() {
        let harness = Harness::new(false);
        let (decoder, stats) = dummy(Default::default());
        let mut handle = harness.start(decoder, Default::default()).unwrap();

        harness.put_packet(0, 8);
        harness.wait_for_frames(1);
        // The presenter is gone: everything decoded from now on is rejected by the queue.
        drop(harness.frames.shutdown());
        for i in 1..7 {
            harness.put_packet(i, 8);
        }

        // More pictures than output buffers, so decoding only goes on if rejected frames give
        // their buffer back.
        let deadline = Instant::now() + Duration::from_secs(10);
        while stats.pictures() < 7 || handle.context().in_transit() > 0 {
            assert!(Instant::now() < deadline, "output buffers did not come back");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(stats.recycled(), 7);
        assert_eq!(handle.context().in_decoder(), 0);

        assert_eq!(handle.shutdown(), SessionEnd::EndOfStream);
        assert_eq!(harness.finish().len(), 2);
    }

    #[test]
    fn resolution_change_rebuilds_output_port() {
        let harness = Harness::new(true);
        let resolution = Resolution::from((64, 32));
        let (decoder, stats) = dummy(DummyOptions {
            resolution_change: Some((3, resolution)),
            ..Default::default()
        });
        let mut handle = harness.start(decoder, Default::default()).unwrap();

        for i in 0..8 {
            harness.put_packet(i, 16);
        }
        harness.wait_for_frames(8);
        let format = handle.context().output_format().unwrap();
        assert_eq!(format.resolution, resolution);
        assert_eq!(format.buffer_size_recommended, 64 * 32 * 4);

        assert_eq!(handle.shutdown(), SessionEnd::EndOfStream);
        assert_eq!(handle.context().in_transit(), 0);
        assert_eq!(stats.pictures(), 8);

        let frames: Vec<_> = harness
            .finish()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Frame(pts) => Some(pts),
                Seen::Clock(_) => None,
            })
            .collect();
        assert_eq!(frames, (0..8).map(us).collect::<Vec<_>>());
    }

    #[test]
    fn init_failure_is_reported() {
        let harness = Harness::new(false);
        let (decoder, _) =
            dummy(DummyOptions { fail_configure: Some(HwStatus::NoMemory), ..Default::default() });

        match harness.start(decoder, Default::default()) {
            Err(PipelineError::InitFailed(e)) => assert_eq!(e.status(), HwStatus::NoMemory),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("session started with a broken decoder"),
        }
        assert_eq!(harness.frames.state(), QueueState::Closed);
        assert!(harness.finish().is_empty());
    }

    #[test]
    fn unsupported_codec_is_rejected_at_start() {
        let harness = Harness::new(false);
        let (decoder, _) =
            dummy(DummyOptions { codecs: Some(vec![Codec::VP8]), ..Default::default() });

        assert!(matches!(
            harness.start(decoder, Default::default()),
            Err(PipelineError::InitFailed(BackendError::UnsupportedCodec(Codec::H264)))
        ));
        assert!(harness.finish().is_empty());
    }

    #[test]
    fn rejected_submission_terminates_session() {
        let harness = Harness::new(false);
        let (decoder, stats) = dummy(DummyOptions {
            fail_submission: Some((2, HwStatus::NoSpace)),
            ..Default::default()
        });
        let config = PipelineConfig { fault_policy: FaultPolicy::Terminate, ..Default::default() };
        let mut handle = harness.start(decoder, config).unwrap();

        for i in 0..4 {
            harness.put_packet(i, 8);
        }

        assert_eq!(handle.wait(), SessionEnd::Fault(HwStatus::NoSpace));
        assert_eq!(stats.submitted(), 2);
        assert_eq!(harness.frames.state(), QueueState::Closed);
        assert_eq!(handle.context().in_transit(), 0);
        // Packets the session never got to are still the demuxer's.
        drop(harness.packets.shutdown());
        harness.finish();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let harness = Harness::new(false);
        let (decoder, _) = dummy(Default::default());
        let mut handle = harness.start(decoder, Default::default()).unwrap();

        harness.put_packet(0, 8);
        assert_eq!(handle.shutdown(), SessionEnd::EndOfStream);
        assert_eq!(handle.shutdown(), SessionEnd::EndOfStream);
        assert!(matches!(handle.request_flush(), Err(PipelineError::NotRunning)));
        drop(handle);
        harness.finish();
    }
}
