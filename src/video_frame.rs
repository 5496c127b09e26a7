// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoded frames handed to the presenter.
//!
//! A [`Frame`] does not own pixel memory. It holds a [`HwFrameBuffer`], a token for a buffer that
//! still belongs to the hardware output port. Dropping the token, which happens when the frame
//! goes back to its pool, gives the buffer back to the decoder.

use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use crate::backend::OutputBuffer;
use crate::backend::OutputRecycler;
use crate::pool::Pool;
use crate::pool::Pooled;
use crate::PixelFormat;
use crate::Resolution;

/// Ownership token for a hardware output buffer lent to the application.
///
/// While the token exists the buffer is counted as in transit. Dropping it returns the buffer to
/// the decoder, or simply frees it if the decoder is already gone.
pub struct HwFrameBuffer {
    buffer: Option<OutputBuffer>,
    recycler: Weak<dyn OutputRecycler>,
    in_transit: Arc<AtomicUsize>,
}

impl HwFrameBuffer {
    pub fn new(
        buffer: OutputBuffer,
        recycler: Weak<dyn OutputRecycler>,
        in_transit: Arc<AtomicUsize>,
    ) -> Self {
        in_transit.fetch_add(1, Ordering::AcqRel);
        Self { buffer: Some(buffer), recycler, in_transit }
    }

    pub fn buffer(&self) -> &OutputBuffer {
        // `buffer` is only taken in `drop`.
        self.buffer.as_ref().unwrap()
    }
}

impl Drop for HwFrameBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            match self.recycler.upgrade() {
                Some(recycler) => recycler.recycle(buffer),
                None => log::debug!("decoder gone, freeing output buffer {}", buffer.index),
            }
        }
        self.in_transit.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for HwFrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HwFrameBuffer").field(&self.buffer).finish()
    }
}

/// A decoded picture.
#[derive(Debug, Default)]
pub struct Frame {
    pub hw_buffer: Option<HwFrameBuffer>,
    /// Presentation timestamp in microseconds.
    pub pts: Option<i64>,
    pub format: PixelFormat,
    pub resolution: Resolution,
}

impl Frame {
    pub fn attach(
        &mut self,
        hw_buffer: HwFrameBuffer,
        format: PixelFormat,
        resolution: Resolution,
    ) {
        self.pts = hw_buffer.buffer().pts;
        self.hw_buffer = Some(hw_buffer);
        self.format = format;
        self.resolution = resolution;
    }

    /// Pixel data of the picture, if it has any that can be read from the CPU.
    pub fn data(&self) -> Option<&[u8]> {
        match self.format {
            PixelFormat::Opaque => None,
            _ => self.hw_buffer.as_ref().map(|b| b.buffer().data()),
        }
    }

    /// Distance in bytes between two rows of the first plane.
    pub fn pitch(&self) -> usize {
        self.hw_buffer.as_ref().map(|b| b.buffer().pitch).unwrap_or(0)
    }

    /// Release the hardware buffer and forget the picture's properties.
    pub fn clear(&mut self) {
        self.hw_buffer = None;
        self.pts = None;
        self.format = PixelFormat::default();
        self.resolution = Resolution::default();
    }
}

pub fn frame_pool(capacity: usize) -> Pool<Frame> {
    Pool::with_reset(capacity, Frame::default, Frame::clear)
}

/// Item carried by the queue between the decoder and the presenter.
#[derive(Debug)]
pub enum VideoItem {
    /// Reset the presentation clock to this timestamp (in microseconds) before showing the next
    /// frame. Sent before the first frame and after every flush.
    SetClock(Option<i64>),
    Frame(Pooled<Frame>),
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<usize>>);

    impl OutputRecycler for Recorder {
        fn recycle(&self, buffer: OutputBuffer) {
            self.0.lock().unwrap().push(buffer.index);
        }
    }

    fn output_buffer(index: usize) -> OutputBuffer {
        OutputBuffer {
            index,
            pts: Some(40_000),
            length: 16,
            pitch: 8,
            memory: Box::new(vec![0xa5u8; 16]),
        }
    }

    #[test]
    fn returning_frame_recycles_hw_buffer() {
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<Recorder> = Arc::downgrade(&recorder);
        let recycler: Weak<dyn OutputRecycler> = weak;
        let in_transit = Arc::new(AtomicUsize::new(0));
        let pool = frame_pool(2);

        let mut frame = pool.acquire().unwrap();
        frame.attach(
            HwFrameBuffer::new(output_buffer(3), recycler, in_transit.clone()),
            PixelFormat::XRGB8888,
            Resolution::from((2, 2)),
        );
        assert_eq!(in_transit.load(Ordering::SeqCst), 1);
        assert_eq!(frame.pts, Some(40_000));
        assert_eq!(frame.pitch(), 8);
        assert!(frame.data().unwrap().iter().all(|b| *b == 0xa5));
        assert!(recorder.0.lock().unwrap().is_empty());

        drop(frame);
        assert_eq!(in_transit.load(Ordering::SeqCst), 0);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(*recorder.0.lock().unwrap(), vec![3]);
        assert!(pool.acquire().unwrap().hw_buffer.is_none());
    }

    #[test]
    fn buffer_outliving_decoder_is_freed() {
        let recorder: Arc<dyn OutputRecycler> = Arc::new(Recorder::default());
        let in_transit = Arc::new(AtomicUsize::new(0));
        let token =
            HwFrameBuffer::new(output_buffer(0), Arc::downgrade(&recorder), in_transit.clone());
        drop(recorder);
        drop(token);
        assert_eq!(in_transit.load(Ordering::SeqCst), 0);
    }
}
