// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory display device, used when no DRM device is available and in tests.

use std::sync::Arc;
use std::sync::Mutex;

use crate::display::DisplayDevice;
use crate::display::DisplayError;
use crate::display::MemoryBuffer;
use crate::display::SurfaceBuffer;
use crate::display::BYTES_PER_PIXEL;
use crate::utils::align_up;
use crate::Resolution;

/// Indices of the buffers flipped to, in order.
pub type FlipLog = Arc<Mutex<Vec<usize>>>;

/// Scanout rows are padded like most display controllers require.
const PITCH_ALIGNMENT: usize = 64;

pub struct DummyDisplay {
    resolution: Resolution,
    buffers: Vec<Box<dyn SurfaceBuffer>>,
    flips: FlipLog,
}

impl DummyDisplay {
    pub fn new(resolution: Resolution, buffer_count: usize) -> Self {
        let pitch = align_up(resolution.width as usize * BYTES_PER_PIXEL, PITCH_ALIGNMENT);
        let buffers = (0..buffer_count)
            .map(|_| {
                Box::new(MemoryBuffer::new(pitch, resolution.height as usize))
                    as Box<dyn SurfaceBuffer>
            })
            .collect();
        Self { resolution, buffers, flips: Default::default() }
    }

    pub fn flips(&self) -> FlipLog {
        Arc::clone(&self.flips)
    }
}

impl DisplayDevice for DummyDisplay {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn take_buffers(&mut self) -> Vec<Box<dyn SurfaceBuffer>> {
        std::mem::take(&mut self.buffers)
    }

    fn flip(&mut self, index: usize) -> Result<(), DisplayError> {
        log::trace!("dummy display flips to buffer {index}");
        self.flips.lock().unwrap().push(index);
        Ok(())
    }
}
