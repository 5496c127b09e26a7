// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the pipeline run so we can
//! test it in isolation.
//!
//! It behaves like a hardware component with its own thread: input buffers are consumed
//! asynchronously, the output format is announced when the first picture is complete, and a
//! picture is delivered for every packet once output buffers have been committed. Pictures are
//! XRGB8888 and filled with a color derived from the packet payload.

use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use crate::backend::BackendError;
use crate::backend::BufferFlags;
use crate::backend::Codec;
use crate::backend::DecoderBackend;
use crate::backend::HwEventSink;
use crate::backend::HwStatus;
use crate::backend::InputBuffer;
use crate::backend::InputPortConfig;
use crate::backend::InputPortInfo;
use crate::backend::OutputBuffer;
use crate::backend::OutputFormat;
use crate::backend::OutputRecycler;
use crate::backend::Result;
use crate::pool::Pooled;
use crate::PixelFormat;
use crate::Resolution;

#[derive(Clone, Debug)]
pub struct DummyOptions {
    pub resolution: Resolution,
    pub input_buffer_size: usize,
    pub input_buffer_count: usize,
    pub output_buffer_count: usize,
    /// Time spent "decoding" every picture.
    pub decode_delay: Duration,
    /// Codecs accepted by `configure`, or `None` for all of them.
    pub codecs: Option<Vec<Codec>>,
    /// Make `configure` fail with this status.
    pub fail_configure: Option<HwStatus>,
    /// Make `send_input` fail with the given status once this many buffers have been accepted.
    pub fail_submission: Option<(usize, HwStatus)>,
    /// Switch to this resolution once this many pictures have been completed. The new format
    /// is announced and no picture is delivered until new output buffers are committed.
    pub resolution_change: Option<(usize, Resolution)>,
}

impl Default for DummyOptions {
    fn default() -> Self {
        Self {
            resolution: Resolution::from((32, 16)),
            input_buffer_size: 4096,
            input_buffer_count: 8,
            output_buffer_count: 4,
            decode_delay: Duration::ZERO,
            codecs: None,
            fail_configure: None,
            fail_submission: None,
            resolution_change: None,
        }
    }
}

/// Counters shared with the test that created the decoder.
#[derive(Clone, Debug, Default)]
pub struct DummyStats {
    submitted: Arc<AtomicUsize>,
    consumed: Arc<AtomicUsize>,
    pictures: Arc<AtomicUsize>,
    recycled: Arc<AtomicUsize>,
}

impl DummyStats {
    /// Input buffers accepted by `send_input`.
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Input buffers given back through `input_consumed`.
    pub fn consumed(&self) -> usize {
        self.consumed.load(Ordering::SeqCst)
    }

    /// Pictures delivered through `frame_decoded`.
    pub fn pictures(&self) -> usize {
        self.pictures.load(Ordering::SeqCst)
    }

    /// Output buffers given back through the recycler, whether they were reused or not.
    pub fn recycled(&self) -> usize {
        self.recycled.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Picture {
    pts: Option<i64>,
    bytes: usize,
    checksum: u32,
}

#[derive(Default)]
struct HwState {
    running: bool,
    input: VecDeque<Pooled<InputBuffer>>,
    /// Output buffers owned by the port, ready to receive a picture.
    outputs: VecDeque<OutputBuffer>,
    committed: Option<OutputFormat>,
    format_announced: bool,
    /// Pictures completed since the component started.
    completed: usize,
    assembling: Option<Picture>,
    /// The worker holds a buffer outside of the lock.
    busy: bool,
    flush_generation: u64,
}

#[derive(Default)]
struct Shared {
    state: Mutex<HwState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<HwState> {
        self.state.lock().unwrap()
    }
}

struct DummyRecycler {
    shared: Weak<Shared>,
    stats: DummyStats,
}

impl OutputRecycler for DummyRecycler {
    fn recycle(&self, mut buffer: OutputBuffer) {
        self.stats.recycled.fetch_add(1, Ordering::SeqCst);
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.lock();
        let expected = state.committed.map(|f| f.buffer_size_recommended);
        if state.running && expected == Some(buffer.memory.as_slice().len()) {
            buffer.length = 0;
            buffer.pts = None;
            state.outputs.push_back(buffer);
            shared.cond.notify_all();
        }
    }
}

pub struct DummyDecoder {
    options: DummyOptions,
    shared: Arc<Shared>,
    events: Option<Arc<dyn HwEventSink>>,
    worker: Option<thread::JoinHandle<()>>,
    stats: DummyStats,
}

impl DummyDecoder {
    pub fn new(options: DummyOptions) -> Self {
        Self {
            options,
            shared: Default::default(),
            events: None,
            worker: None,
            stats: Default::default(),
        }
    }

    pub fn stats(&self) -> DummyStats {
        self.stats.clone()
    }

    fn output_format(options: &DummyOptions, resolution: Resolution) -> OutputFormat {
        OutputFormat {
            resolution,
            format: PixelFormat::XRGB8888,
            buffer_count_recommended: options.output_buffer_count,
            buffer_size_recommended: resolution.get_area() * 4,
        }
    }
}

/// Body of the component thread.
struct Component {
    shared: Arc<Shared>,
    events: Arc<dyn HwEventSink>,
    options: DummyOptions,
    stats: DummyStats,
}

impl Component {
    fn run(self) {
        loop {
            let mut state = self.shared.lock();
            while state.running && state.input.is_empty() {
                state = self.shared.cond.wait(state).unwrap();
            }
            if !state.running {
                break;
            }
            let Some(buffer) = state.input.pop_front() else {
                continue;
            };
            state.busy = true;
            let generation = state.flush_generation;

            if buffer.flags.contains(BufferFlags::FRAME_START) || state.assembling.is_none() {
                state.assembling = Some(Picture { pts: buffer.pts, ..Default::default() });
            }
            if let Some(picture) = state.assembling.as_mut() {
                picture.bytes += buffer.data.len();
                picture.checksum = buffer
                    .data
                    .iter()
                    .fold(picture.checksum, |acc, b| acc.rotate_left(5) ^ u32::from(*b));
            }
            let picture = match buffer.flags.contains(BufferFlags::FRAME_END) {
                true => state.assembling.take(),
                false => None,
            };
            let announce = match picture {
                Some(_) => self.next_resolution(&mut state),
                None => None,
            };
            drop(state);

            self.events.input_consumed(buffer);
            self.stats.consumed.fetch_add(1, Ordering::SeqCst);
            if let Some(resolution) = announce {
                self.events.format_changed(DummyDecoder::output_format(&self.options, resolution));
            }
            if let Some(picture) = picture {
                self.deliver(picture, generation);
            }

            self.shared.lock().busy = false;
            self.shared.cond.notify_all();
        }
    }

    /// Count a completed picture and return the resolution to announce before delivering it,
    /// if any. A new resolution invalidates the committed output buffers.
    fn next_resolution(&self, state: &mut HwState) -> Option<Resolution> {
        let index = state.completed;
        state.completed += 1;
        if !state.format_announced {
            state.format_announced = true;
            return Some(self.options.resolution);
        }
        match self.options.resolution_change {
            Some((at, resolution)) if at == index => {
                log::debug!("dummy decoder switching to {resolution}");
                state.committed = None;
                state.outputs.clear();
                Some(resolution)
            }
            _ => None,
        }
    }

    /// Wait for a free output buffer. Gives up if the component stops or is flushed.
    fn wait_output(&self, generation: u64) -> Option<OutputBuffer> {
        let mut state = self.shared.lock();
        loop {
            if !state.running || state.flush_generation != generation {
                return None;
            }
            if state.committed.is_some() {
                if let Some(buffer) = state.outputs.pop_front() {
                    return Some(buffer);
                }
            }
            state = self.shared.cond.wait(state).unwrap();
        }
    }

    fn deliver(&self, picture: Picture, generation: u64) {
        let Some(mut buffer) = self.wait_output(generation) else {
            log::debug!("dropping picture {:?}", picture.pts);
            return;
        };

        if !self.options.decode_delay.is_zero() {
            thread::sleep(self.options.decode_delay);
        }

        buffer.pts = picture.pts;
        if picture.bytes == 0 {
            buffer.length = 0;
        } else {
            let pixel = (0xff00_0000 | (picture.checksum & 0x00ff_ffff)).to_ne_bytes();
            let memory = buffer.memory.as_mut_slice();
            for chunk in memory.chunks_exact_mut(4) {
                chunk.copy_from_slice(&pixel);
            }
            buffer.length = memory.len();
        }

        self.events.frame_decoded(buffer);
        self.stats.pictures.fetch_add(1, Ordering::SeqCst);
    }
}

impl DecoderBackend for DummyDecoder {
    fn configure(
        &mut self,
        config: &InputPortConfig,
        events: Arc<dyn HwEventSink>,
    ) -> Result<InputPortInfo> {
        if let Some(status) = self.options.fail_configure {
            return Err(status.into());
        }
        if let Some(codecs) = &self.options.codecs {
            if !codecs.contains(&config.codec) {
                return Err(BackendError::UnsupportedCodec(config.codec));
            }
        }
        log::debug!("dummy decoder configured for {:?}", config.codec);
        self.events = Some(events);
        Ok(InputPortInfo {
            buffer_size: self.options.input_buffer_size,
            buffer_count: self.options.input_buffer_count,
        })
    }

    fn enable(&mut self) -> Result<()> {
        let events = self.events.clone().ok_or(HwStatus::BadConfig)?;
        if self.worker.is_some() {
            return Ok(());
        }

        self.shared.lock().running = true;
        let component = Component {
            shared: Arc::clone(&self.shared),
            events,
            options: self.options.clone(),
            stats: self.stats.clone(),
        };
        let worker = thread::Builder::new()
            .name("dummy-decoder".into())
            .spawn(move || component.run())
            .map_err(anyhow::Error::from)?;
        self.worker = Some(worker);
        Ok(())
    }

    fn set_output_format(&mut self, format: &OutputFormat, buffer_count: usize) -> Result<usize> {
        if format.format != PixelFormat::XRGB8888 {
            return Err(HwStatus::Invalid.into());
        }

        let pitch = format.resolution.width as usize * 4;
        let mut state = self.shared.lock();
        state.outputs = (0..buffer_count)
            .map(|index| OutputBuffer {
                index,
                pts: None,
                length: 0,
                pitch,
                memory: Box::new(vec![0u8; format.buffer_size_recommended]),
            })
            .collect();
        state.committed = Some(*format);
        drop(state);
        self.shared.cond.notify_all();
        Ok(buffer_count)
    }

    fn recycler(&self) -> Arc<dyn OutputRecycler> {
        Arc::new(DummyRecycler { shared: Arc::downgrade(&self.shared), stats: self.stats.clone() })
    }

    fn send_input(&mut self, buffer: Pooled<InputBuffer>) -> Result<()> {
        if let Some((limit, status)) = self.options.fail_submission {
            if self.stats.submitted() >= limit {
                return Err(status.into());
            }
        }

        let mut state = self.shared.lock();
        if !state.running {
            return Err(HwStatus::NotReady.into());
        }
        state.input.push_back(buffer);
        drop(state);
        self.stats.submitted.fetch_add(1, Ordering::SeqCst);
        self.shared.cond.notify_all();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        state.flush_generation += 1;
        state.assembling = None;
        let pending: Vec<_> = state.input.drain(..).collect();
        self.shared.cond.notify_all();
        while state.busy {
            state = self.shared.cond.wait(state).unwrap();
        }
        drop(state);

        if let Some(events) = &self.events {
            for buffer in pending {
                events.input_consumed(buffer);
                self.stats.consumed.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn drain(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while state.running && (state.busy || !state.input.is_empty()) {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = self.shared.cond.wait_timeout(state, deadline - now).unwrap().0;
        }
        Ok(true)
    }

    fn disable(&mut self) {
        let mut state = self.shared.lock();
        state.running = false;
        let pending: Vec<_> = state.input.drain(..).collect();
        state.outputs.clear();
        drop(state);
        self.shared.cond.notify_all();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("dummy decoder thread panicked");
            }
        }
        if let Some(events) = &self.events {
            for buffer in pending {
                events.input_consumed(buffer);
                self.stats.consumed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

impl Drop for DummyDecoder {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.disable();
        }
    }
}
