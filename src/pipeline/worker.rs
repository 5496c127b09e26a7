// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decode thread of a session.

use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;

use crate::backend::BackendError;
use crate::backend::BufferFlags;
use crate::backend::DecoderBackend;
use crate::backend::HwEventSink;
use crate::backend::InputBuffer;
use crate::backend::InputPortConfig;
use crate::backend::InputPortInfo;
use crate::backend::OutputRecycler;
use crate::backend::StreamParams;
use crate::backend::MAX_EXTRADATA_SIZE;
use crate::pipeline::callbacks::EventSink;
use crate::pipeline::FaultPolicy;
use crate::pipeline::PipelineState;
use crate::pipeline::SessionEnd;
use crate::pipeline::Shared;
use crate::pool::Pool;
use crate::pool::PoolError;
use crate::pool::Pooled;
use crate::queue::QueueError;
use crate::utils::PollCounter;
use crate::video_frame::frame_pool;
use crate::Rational;

/// The packet at the head of the input queue, as seen through `peek`.
struct PendingPacket {
    data: Bytes,
    /// Address of the payload, used to check that the packet dequeued at the end of the
    /// submission is the one that was peeked.
    head: usize,
    pts: Option<i64>,
    dts: Option<i64>,
}

struct Worker<B: DecoderBackend> {
    shared: Arc<Shared>,
    backend: B,
    sink: Arc<EventSink>,
    /// Only strong reference to the recycler. Output buffers coming back once the worker is gone
    /// are freed instead of being queued again.
    _recycler: Arc<dyn OutputRecycler>,
    input_pool: Pool<InputBuffer>,
    input_info: InputPortInfo,
    time_base: Rational,
}

/// Entry point of the decode thread.
///
/// Reports the outcome of the decoder setup through `ready`, then decodes until the input queue
/// closes or the hardware faults.
pub(crate) fn run<B: DecoderBackend>(
    shared: Arc<Shared>,
    backend: B,
    stream: StreamParams,
    ready: Sender<Result<(), BackendError>>,
) -> SessionEnd {
    let worker = match Worker::new(Arc::clone(&shared), backend, &stream) {
        Ok(worker) => worker,
        Err(e) => {
            log::error!("could not start {:?} decoder: {e}", stream.codec);
            let status = e.status();
            drop(shared.frames.shutdown());
            shared.stopped();
            let _ = ready.send(Err(e));
            return SessionEnd::Fault(status);
        }
    };

    shared.checkpoint.enable();
    shared.set_state(PipelineState::Ready);
    let _ = ready.send(Ok(()));

    worker.run()
}

impl<B: DecoderBackend> Worker<B> {
    fn new(
        shared: Arc<Shared>,
        mut backend: B,
        stream: &StreamParams,
    ) -> Result<Self, BackendError> {
        if stream.extradata.len() > MAX_EXTRADATA_SIZE {
            log::warn!(
                "{} bytes of extradata, the decoder may not accept more than {}",
                stream.extradata.len(),
                MAX_EXTRADATA_SIZE
            );
        }

        let sink = Arc::new(EventSink::new(Arc::clone(&shared)));
        let events: Arc<dyn HwEventSink> = sink.clone();
        let input_info = backend.configure(&InputPortConfig::from(stream), events)?;
        let recycler = backend.recycler();
        sink.set_recycler(Arc::downgrade(&recycler));
        backend.enable()?;

        log::info!(
            "{:?} decoder started at {} fps, {} input buffers of {} bytes",
            stream.codec,
            stream.frame_rate,
            input_info.buffer_count,
            input_info.buffer_size
        );

        Ok(Self {
            shared,
            backend,
            sink,
            _recycler: recycler,
            input_pool: Pool::with_reset(
                input_info.buffer_count,
                InputBuffer::default,
                InputBuffer::reset,
            ),
            input_info,
            time_base: stream.time_base,
        })
    }

    fn run(mut self) -> SessionEnd {
        let end = self.decode_loop();
        self.teardown(end);
        end
    }

    fn decode_loop(&mut self) -> SessionEnd {
        loop {
            self.shared.checkpoint.arrive_and_wait();

            if let Err(e) = self.apply_pending_format() {
                return self.fault(e);
            }

            if self.shared.flush_requested.load(Ordering::Acquire) {
                if let Err(e) = self.flush() {
                    return self.fault(e);
                }
                self.shared.set_state(PipelineState::Ready);
                self.shared.flush_completed();
                continue;
            }

            let time_base = self.time_base;
            let next = self.shared.packets.peek(false, |packet| PendingPacket {
                data: packet.data.clone(),
                head: packet.data.as_ptr() as usize,
                pts: packet.pts_us(time_base),
                dts: packet.dts_us(time_base),
            });
            let pending = match next {
                Ok(pending) => pending,
                Err(QueueError::WouldBlock) => {
                    self.shared.set_state(PipelineState::Ready);
                    thread::sleep(self.shared.config.idle_backoff);
                    continue;
                }
                Err(QueueError::Closed) => return SessionEnd::EndOfStream,
            };

            self.shared.set_state(PipelineState::Feeding);
            if let Err(e) = self.submit(pending) {
                return self.fault(e);
            }
        }
    }

    fn fault(&self, e: BackendError) -> SessionEnd {
        let context = &self.shared.context;
        log::error!(
            "could not send packet to the decoder: {e} (in_decoder={}, in_transit={})",
            context.in_decoder(),
            context.in_transit()
        );
        match self.shared.config.fault_policy {
            FaultPolicy::Abort => std::process::abort(),
            FaultPolicy::Terminate => SessionEnd::Fault(e.status()),
        }
    }

    /// Wait for a free input buffer header.
    fn acquire_input_header(&mut self) -> Result<Pooled<InputBuffer>, BackendError> {
        let mut polls = PollCounter::new(self.shared.config.poll_warn_threshold);
        loop {
            match self.input_pool.acquire() {
                Ok(header) => return Ok(header),
                Err(PoolError::Exhausted(n)) => {
                    // The decoder may be holding input until it gets output buffers.
                    self.apply_pending_format()?;
                    if polls.tick() {
                        log::warn!("all {n} input buffers are still in the decoder");
                    }
                    thread::sleep(self.shared.config.input_buffer_wait);
                }
            }
        }
    }

    /// Submit the packet at the head of the input queue, split into as many input buffers as
    /// needed. The packet is dequeued together with its last buffer.
    fn submit(&mut self, pending: PendingPacket) -> Result<(), BackendError> {
        let PendingPacket { mut data, head, pts, dts } = pending;
        let mut flags = BufferFlags::FRAME_START;

        loop {
            let mut header = self.acquire_input_header()?;
            let len = data.len().min(self.input_info.buffer_size);
            header.data = data.split_to(len);
            header.pts = pts;
            header.dts = dts;
            header.flags = flags;
            flags = BufferFlags::NONE;

            let last = data.is_empty();
            if last {
                header.flags |= BufferFlags::FRAME_END;
                match self.shared.packets.try_get() {
                    Ok(packet) => {
                        assert_eq!(
                            packet.data.as_ptr() as usize,
                            head,
                            "input queue head changed during submission"
                        );
                        header.packet = Some(packet);
                    }
                    Err(e) => {
                        log::debug!("input queue went away during submission: {e}");
                        return Ok(());
                    }
                }
            }

            let context = &self.shared.context;
            context.in_decoder.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = self.backend.send_input(header) {
                context.in_decoder.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
            thread::yield_now();

            if last {
                return Ok(());
            }
        }
    }

    /// Commit the output format announced by the decoder, if any.
    fn apply_pending_format(&mut self) -> Result<(), BackendError> {
        let context = &self.shared.context;
        let Some(format) = context.pending_format.lock().unwrap().take() else {
            return Ok(());
        };

        let config = &self.shared.config;
        let requested = format.buffer_count_recommended
            + config.decode_cache_frames
            + config.presenter_hold_frames;

        // Frames can come back as soon as the output port is seeded.
        self.sink.set_output_port(frame_pool(requested), format);
        let count = self.backend.set_output_format(&format, requested)?;
        if count != requested {
            log::debug!("decoder allocated {count} output buffers instead of {requested}");
            self.sink.set_output_port(frame_pool(count), format);
        }
        *context.format.lock().unwrap() = Some(format);

        log::info!(
            "output format set to {} {:?} with {count} buffers",
            format.resolution,
            format.format
        );
        Ok(())
    }

    /// Drop everything queued or being decoded.
    ///
    /// Returns once no input buffer is left in the decoder and the presenter holds at most
    /// `presenter_hold_frames` frames.
    fn flush(&mut self) -> Result<(), BackendError> {
        let shared = Arc::clone(&self.shared);
        let context = &shared.context;
        let config = &shared.config;

        shared.set_state(PipelineState::Flushing);
        context.flushing.store(true, Ordering::Release);
        // A hardware callback may be blocked on a full output queue.
        drop(shared.frames.discard_pending());
        let result = self.backend.flush();

        let mut polls = PollCounter::new(config.poll_warn_threshold);
        loop {
            drop(shared.frames.discard_pending());
            let pending = self.input_pool.outstanding();
            let in_transit = context.in_transit();
            if pending == 0 && in_transit <= config.presenter_hold_frames {
                break;
            }

            if polls.tick() {
                log::warn!(
                    "flush: {pending} of {} input buffers pending, {in_transit} frames in transit",
                    self.input_pool.capacity()
                );
            }
            thread::sleep(config.flush_poll_interval);
        }

        context.clock_set.store(false, Ordering::Release);
        context.flushing.store(false, Ordering::Release);
        log::debug!("decoder flushed");
        result
    }

    /// Wait until everything submitted has been decoded and queued for the presenter.
    fn drain(&mut self) {
        let config = &self.shared.config;
        let interval = config.drain_poll_interval;
        let mut polls = PollCounter::new(config.poll_warn_threshold);
        loop {
            if let Err(e) = self.apply_pending_format() {
                log::error!("could not set output format while draining: {e}");
                return;
            }
            match self.backend.drain(interval) {
                Ok(true) => return,
                Ok(false) => {
                    if polls.tick() {
                        log::warn!(
                            "draining: {} input buffers still in the decoder",
                            self.shared.context.in_decoder()
                        );
                    }
                }
                Err(e) => {
                    log::error!("could not drain decoder: {e}");
                    return;
                }
            }
        }
    }

    fn teardown(&mut self, end: SessionEnd) {
        let shared = Arc::clone(&self.shared);
        let config = &shared.config;
        shared.set_state(PipelineState::Draining);

        if end == SessionEnd::EndOfStream && !shared.shutdown_requested.load(Ordering::Acquire) {
            self.drain();
        } else if let Err(e) = self.flush() {
            log::error!("could not flush decoder: {e}");
        }

        // From here on the decode thread no longer reaches the checkpoint.
        shared.checkpoint.disable();
        shared.frames.close();

        let mut polls = PollCounter::new(config.poll_warn_threshold);
        while shared.context.in_transit() > 0 {
            if polls.tick() {
                log::warn!("waiting for {} frames in transit", shared.context.in_transit());
            }
            thread::sleep(config.drain_poll_interval);
        }
        log::debug!("all frames returned to the decoder");

        self.backend.disable();
        drop(shared.frames.shutdown());
        shared.stopped();
        log::info!("decode session ended: {end:?}");
    }
}
