// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Display device driving a DRM/KMS output with two CPU-mapped dumb buffers.

use std::ffi::c_void;
use std::fs::File;
use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;

use ::drm::buffer::Buffer;
use ::drm::buffer::DrmFourcc;
use ::drm::control::connector;
use ::drm::control::crtc;
use ::drm::control::dumbbuffer::DumbBuffer;
use ::drm::control::framebuffer;
use ::drm::control::Device as ControlDevice;
use ::drm::control::Mode;
use ::drm::control::ResourceHandles;
use ::drm::Device;
use ::drm::DriverCapability;
use nix::errno::Errno;
use nix::ioctl_readwrite;
use nix::sys::mman::madvise;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::MmapAdvise;
use nix::sys::mman::ProtFlags;

use crate::display::DisplayConfig;
use crate::display::DisplayDevice;
use crate::display::DisplayError;
use crate::display::SurfaceBuffer;
use crate::Resolution;

const SCANOUT_BUFFERS: usize = 2;

struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

// Defined in include/uapi/drm/drm_mode.h
#[repr(C)]
struct drm_mode_map_dumb {
    handle: u32,
    pad: u32,
    offset: u64,
}
ioctl_readwrite!(drm_ioctl_mode_map_dumb, b'd', 0xB3, drm_mode_map_dumb);

/// CPU mapping of a dumb buffer.
struct DumbMapping {
    addr: NonNull<c_void>,
    len: usize,
    pitch: usize,
}

// SAFETY: the mapping is only reached through the surface storage mutex.
unsafe impl Send for DumbMapping {}

impl DumbMapping {
    fn new(card: &Card, handle: u32, len: usize, pitch: usize) -> Result<Self, DisplayError> {
        let mut req = drm_mode_map_dumb { handle, pad: 0, offset: 0 };
        // SAFETY: `req` is a valid `drm_mode_map_dumb` that lives across the call.
        unsafe { drm_ioctl_mode_map_dumb(card.as_fd().as_raw_fd(), &mut req) }?;

        let length = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        // SAFETY: the kernel prepared `offset` for this buffer object, which outlives the
        // mapping.
        let addr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                card.as_fd(),
                req.offset as nix::libc::off_t,
            )
        }?;
        Ok(Self { addr, len, pitch })
    }

    fn advise(&self, advice: MmapAdvise) {
        // SAFETY: `addr` and `len` describe a live mapping.
        if let Err(e) = unsafe { madvise(self.addr, self.len, advice) } {
            log::debug!("madvise({advice:?}) failed: {e}");
        }
    }
}

impl SurfaceBuffer for DumbMapping {
    fn pitch(&self) -> usize {
        self.pitch
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is `len` bytes long and stays valid until `self` is dropped.
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr() as *const u8, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: same as `as_slice`, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr() as *mut u8, self.len) }
    }

    fn will_need(&self) {
        self.advise(MmapAdvise::MADV_WILLNEED);
    }

    fn dont_need(&self) {
        self.advise(MmapAdvise::MADV_DONTNEED);
    }
}

impl Drop for DumbMapping {
    fn drop(&mut self) {
        // SAFETY: `addr` and `len` come from a successful `mmap` that was not unmapped yet.
        if let Err(e) = unsafe { munmap(self.addr, self.len) } {
            log::warn!("could not unmap dumb buffer: {e}");
        }
    }
}

/// First connected connector with at least one mode.
fn find_connector(
    card: &Card,
    resources: &ResourceHandles,
) -> Result<connector::Info, DisplayError> {
    for &handle in resources.connectors() {
        let info = card.get_connector(handle, false)?;
        if info.state() != connector::State::Connected {
            log::debug!("ignoring unused connector {handle:?}");
            continue;
        }
        if info.modes().is_empty() {
            log::debug!("no valid mode for connector {handle:?}");
            continue;
        }
        return Ok(info);
    }
    Err(DisplayError::NoConnector)
}

/// The CRTC already driving `connector`, or the first one its encoders can use.
fn find_crtc(
    card: &Card,
    resources: &ResourceHandles,
    connector: &connector::Info,
) -> Result<crtc::Handle, DisplayError> {
    let current = connector
        .current_encoder()
        .and_then(|encoder| card.get_encoder(encoder).ok())
        .and_then(|encoder| encoder.crtc());
    if let Some(crtc) = current {
        return Ok(crtc);
    }

    for &handle in connector.encoders() {
        let encoder = match card.get_encoder(handle) {
            Ok(encoder) => encoder,
            Err(e) => {
                log::warn!("cannot retrieve encoder {handle:?}: {e}");
                continue;
            }
        };
        if let Some(&crtc) = resources.filter_crtcs(encoder.possible_crtcs()).first() {
            return Ok(crtc);
        }
    }

    log::error!("cannot find a CRTC for connector {:?}", connector.handle());
    Err(DisplayError::NoCrtc)
}

pub struct DrmDisplay {
    card: Card,
    connector: connector::Handle,
    crtc: crtc::Handle,
    mode: Mode,
    /// CRTC configuration found at startup, restored on drop.
    saved_crtc: Option<crtc::Info>,
    mappings: Vec<DumbMapping>,
    framebuffers: Vec<framebuffer::Handle>,
    dumb_buffers: Vec<DumbBuffer>,
}

impl DrmDisplay {
    pub fn open(config: &DisplayConfig) -> Result<Self, DisplayError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.device)
            .map_err(|e| DisplayError::Open(config.device.clone(), e))?;
        let card = Card(file);

        if card.get_driver_capability(DriverCapability::DumbBuffer).unwrap_or(0) == 0 {
            return Err(DisplayError::NoDumbBuffers);
        }

        let resources = card.resource_handles()?;
        let connector = find_connector(&card, &resources)?;
        let modes = connector.modes();
        let mode = *modes
            .get(config.mode_index)
            .ok_or(DisplayError::NoMode { index: config.mode_index, available: modes.len() })?;
        let crtc = find_crtc(&card, &resources, &connector)?;
        let saved_crtc = card.get_crtc(crtc).ok();

        let (width, height) = mode.size();
        log::info!(
            "using connector {:?} on CRTC {crtc:?}, mode {width}x{height}",
            connector.handle()
        );

        let mut display = Self {
            card,
            connector: connector.handle(),
            crtc,
            mode,
            saved_crtc,
            mappings: Vec::with_capacity(SCANOUT_BUFFERS),
            framebuffers: Vec::with_capacity(SCANOUT_BUFFERS),
            dumb_buffers: Vec::with_capacity(SCANOUT_BUFFERS),
        };
        for _ in 0..SCANOUT_BUFFERS {
            display.add_buffer(u32::from(width), u32::from(height))?;
        }

        // Scan out a cleared buffer. The other one is the first to be drawn into.
        display.flip(SCANOUT_BUFFERS - 1)?;
        Ok(display)
    }

    fn add_buffer(&mut self, width: u32, height: u32) -> Result<(), DisplayError> {
        let buffer = self.card.create_dumb_buffer((width, height), DrmFourcc::Xrgb8888, 32)?;
        let framebuffer = match self.card.add_framebuffer(&buffer, 24, 32) {
            Ok(framebuffer) => framebuffer,
            Err(e) => {
                let _ = self.card.destroy_dumb_buffer(buffer);
                return Err(e.into());
            }
        };
        let pitch = buffer.pitch() as usize;
        let handle = u32::from(buffer.handle());
        log::debug!("framebuffer {framebuffer:?}: {width}x{height}, pitch {pitch}");
        self.framebuffers.push(framebuffer);
        self.dumb_buffers.push(buffer);

        let mut mapping = DumbMapping::new(&self.card, handle, pitch * height as usize, pitch)?;
        mapping.as_mut_slice().fill(0);
        self.mappings.push(mapping);
        Ok(())
    }
}

impl DisplayDevice for DrmDisplay {
    fn resolution(&self) -> Resolution {
        let (width, height) = self.mode.size();
        Resolution::from((u32::from(width), u32::from(height)))
    }

    fn take_buffers(&mut self) -> Vec<Box<dyn SurfaceBuffer>> {
        self.mappings.drain(..).map(|m| Box::new(m) as Box<dyn SurfaceBuffer>).collect()
    }

    fn flip(&mut self, index: usize) -> Result<(), DisplayError> {
        self.card
            .set_crtc(
                self.crtc,
                Some(self.framebuffers[index]),
                (0, 0),
                &[self.connector],
                Some(self.mode),
            )
            .map_err(|e| {
                log::error!("cannot flip CRTC for connector {:?}: {e}", self.connector);
                DisplayError::from(e)
            })
    }
}

impl Drop for DrmDisplay {
    fn drop(&mut self) {
        if let Some(saved) = self.saved_crtc.take() {
            log::info!("restoring mode {:?} on CRTC {:?}", saved.mode(), saved.handle());
            if let Err(e) = self.card.set_crtc(
                saved.handle(),
                saved.framebuffer(),
                saved.position(),
                &[self.connector],
                saved.mode(),
            ) {
                log::warn!("could not restore CRTC {:?}: {e}", saved.handle());
            }
        }

        self.mappings.clear();
        for framebuffer in self.framebuffers.drain(..) {
            if let Err(e) = self.card.destroy_framebuffer(framebuffer) {
                log::warn!("could not remove framebuffer {framebuffer:?}: {e}");
            }
        }
        for buffer in self.dumb_buffers.drain(..) {
            if let Err(e) = self.card.destroy_dumb_buffer(buffer) {
                log::warn!("could not destroy dumb buffer: {e}");
            }
        }
    }
}
