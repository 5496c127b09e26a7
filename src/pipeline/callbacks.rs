// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Handlers for the events the hardware decoder raises on its own thread.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::Weak;
use std::thread;

use crate::backend::HwEventSink;
use crate::backend::HwStatus;
use crate::backend::InputBuffer;
use crate::backend::OutputBuffer;
use crate::backend::OutputFormat;
use crate::backend::OutputRecycler;
use crate::pipeline::Shared;
use crate::pool::Pool;
use crate::pool::PoolError;
use crate::pool::Pooled;
use crate::video_frame::Frame;
use crate::video_frame::HwFrameBuffer;
use crate::video_frame::VideoItem;

/// Everything the output callback needs once the output format has been negotiated.
struct OutputPort {
    frame_pool: Pool<Frame>,
    format: OutputFormat,
}

pub(crate) struct EventSink {
    shared: Arc<Shared>,
    /// Where output buffers go back to the decoder. Known as soon as it is configured.
    recycler: OnceLock<Weak<dyn OutputRecycler>>,
    output: Mutex<Option<OutputPort>>,
}

impl EventSink {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared, recycler: OnceLock::new(), output: Mutex::new(None) }
    }

    /// Called by the decode thread once the decoder is configured.
    pub(crate) fn set_recycler(&self, recycler: Weak<dyn OutputRecycler>) {
        if self.recycler.set(recycler).is_err() {
            log::warn!("output recycler already set");
        }
    }

    /// Called by the decode thread once a new output format has been committed.
    pub(crate) fn set_output_port(&self, frame_pool: Pool<Frame>, format: OutputFormat) {
        *self.output.lock().unwrap() = Some(OutputPort { frame_pool, format });
    }

    /// Give `buffer` straight back to the decoder.
    fn recycle(recycler: &Weak<dyn OutputRecycler>, buffer: OutputBuffer) {
        match recycler.upgrade() {
            Some(recycler) => recycler.recycle(buffer),
            None => log::debug!("decoder gone, freeing output buffer {}", buffer.index),
        }
    }

    /// Take a frame from `pool`. Never blocks: the decoder thread must not wait on the
    /// presenter.
    fn acquire_frame(&self, pool: &Pool<Frame>) -> Option<Pooled<Frame>> {
        match pool.acquire() {
            Ok(frame) => Some(frame),
            Err(PoolError::Exhausted(n)) => {
                log::warn!("all {n} frames are in use, dropping decoded picture");
                None
            }
        }
    }

    /// Hand `item` to the presenter. Returns `false` if the output queue rejected it, in which
    /// case the item has already been released.
    fn queue(&self, item: VideoItem) -> bool {
        match self.shared.frames.put(item) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("output queue rejected {:?}: {}", e.item, e.error);
                false
            }
        }
    }
}

impl HwEventSink for EventSink {
    fn input_consumed(&self, buffer: Pooled<InputBuffer>) {
        self.shared.context.in_decoder.fetch_sub(1, Ordering::AcqRel);
        // The header goes back to its pool last, releasing the packet it carries. A flush waits
        // for that pool to be full again.
        drop(buffer);
    }

    fn frame_decoded(&self, buffer: OutputBuffer) {
        let context = &self.shared.context;
        let Some(recycler) = self.recycler.get().cloned() else {
            log::error!("output buffer {} returned by an unconfigured decoder", buffer.index);
            return;
        };
        let output = self.output.lock().unwrap();
        let Some(port) = output.as_ref() else {
            log::error!("output buffer {} returned before format negotiation", buffer.index);
            drop(output);
            Self::recycle(&recycler, buffer);
            return;
        };

        if buffer.length == 0 {
            log::debug!("empty output buffer {}", buffer.index);
            drop(output);
            Self::recycle(&recycler, buffer);
            return;
        }

        // From here on the buffer is in transit and goes back to the hardware when the frame is
        // released, wherever that happens.
        let hw_buffer = HwFrameBuffer::new(buffer, recycler, Arc::clone(&context.in_transit));
        let frame_pool = port.frame_pool.clone();
        let format = port.format;
        drop(output);

        if context.flushing.load(Ordering::Acquire) {
            log::debug!("dropping frame {:?} decoded before flush", hw_buffer.buffer().pts);
            return;
        }

        let Some(mut frame) = self.acquire_frame(&frame_pool) else {
            return;
        };
        frame.attach(hw_buffer, format.format, format.resolution);

        if !context.clock_set.load(Ordering::Acquire) {
            log::debug!("resetting presentation clock to {:?}", frame.pts);
            if !self.queue(VideoItem::SetClock(frame.pts)) {
                return;
            }
            context.clock_set.store(true, Ordering::Release);
        }

        self.queue(VideoItem::Frame(frame));
        thread::yield_now();
    }

    fn format_changed(&self, format: OutputFormat) {
        log::debug!(
            "output format changed: {} {:?}, {} buffers of {} bytes recommended",
            format.resolution,
            format.format,
            format.buffer_count_recommended,
            format.buffer_size_recommended
        );
        // Renegotiation needs the decoder itself, so it is left to the decode thread.
        *self.shared.context.pending_format.lock().unwrap() = Some(format);
    }

    fn error(&self, status: HwStatus) {
        log::error!("decoder reported an error: {status}");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use std::time::Instant;

    use super::*;
    use crate::pipeline::PipelineConfig;
    use crate::queue::TransferQueue;
    use crate::video_frame::frame_pool;
    use crate::PixelFormat;
    use crate::Resolution;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<usize>>);

    impl OutputRecycler for Recorder {
        fn recycle(&self, buffer: OutputBuffer) {
            self.0.lock().unwrap().push(buffer.index);
        }
    }

    fn sink_with_recorder() -> (EventSink, Arc<Recorder>) {
        let shared = Shared::new(
            PipelineConfig::default(),
            Arc::new(TransferQueue::new(4)),
            Arc::new(TransferQueue::new(4)),
        );
        let sink = EventSink::new(Arc::new(shared));
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<Recorder> = Arc::downgrade(&recorder);
        sink.set_recycler(weak);
        (sink, recorder)
    }

    fn output_buffer(index: usize) -> OutputBuffer {
        OutputBuffer { index, pts: Some(0), length: 16, pitch: 8, memory: Box::new(vec![0u8; 16]) }
    }

    fn format() -> OutputFormat {
        OutputFormat {
            resolution: Resolution::from((2, 2)),
            format: PixelFormat::XRGB8888,
            buffer_count_recommended: 1,
            buffer_size_recommended: 16,
        }
    }

    #[test]
    fn buffer_before_negotiation_goes_back_to_decoder() {
        let (sink, recorder) = sink_with_recorder();

        sink.frame_decoded(output_buffer(5));
        assert_eq!(*recorder.0.lock().unwrap(), vec![5]);
        assert_eq!(sink.shared.context.in_transit(), 0);
        assert!(sink.shared.frames.is_empty());
    }

    #[test]
    fn exhausted_frame_pool_drops_picture_without_waiting() {
        let (sink, recorder) = sink_with_recorder();
        let pool = frame_pool(1);
        sink.set_output_port(pool.clone(), format());
        let held = pool.acquire().unwrap();

        let start = Instant::now();
        sink.frame_decoded(output_buffer(2));
        assert!(start.elapsed() < Duration::from_secs(1));

        assert_eq!(*recorder.0.lock().unwrap(), vec![2]);
        assert_eq!(sink.shared.context.in_transit(), 0);
        assert!(sink.shared.frames.is_empty());

        drop(held);
        sink.frame_decoded(output_buffer(3));
        assert_eq!(sink.shared.context.in_transit(), 1);
        // Clock reset, then the frame.
        assert_eq!(sink.shared.frames.len(), 2);
    }
}
