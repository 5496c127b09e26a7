// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Surface compositor.
//!
//! Every [`DisplaySession`] has a root surface backed by the scanout buffers of a
//! [`DisplayDevice`]. Other surfaces are either *real*, with memory of their own, or
//! *sub-surfaces*, i.e. rectangles inside the memory of their nearest real ancestor. Drawing
//! happens between [`Surface::lock`] and the drop of the returned [`SurfaceGuard`], and
//! [`DisplaySession::present`] makes the result visible: presenting the root flips its buffers,
//! presenting another real surface copies it into the root.

pub mod dummy;
#[cfg(feature = "drm")]
pub mod drm;

use std::fmt;
use std::ops::BitOr;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use thiserror::Error;

use crate::utils::copy_rows;
use crate::utils::copy_rows_within;
use crate::utils::fill_rows;
use crate::Resolution;

/// Every surface stores 32-bit XRGB pixels.
pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("could not open {0}: {1}")]
    Open(PathBuf, std::io::Error),
    #[error("the device does not support dumb buffers")]
    NoDumbBuffers,
    #[error("no connected output")]
    NoConnector,
    #[error("mode {index} requested but the output only has {available}")]
    NoMode { index: usize, available: usize },
    #[error("no CRTC can drive the output")]
    NoCrtc,
    #[error("{w}x{h} at ({x}, {y}) does not fit in a {width}x{height} surface")]
    OutOfBounds { x: u32, y: u32, w: u32, h: u32, width: u32, height: u32 },
    #[error("source buffer too small for {0} rows")]
    ShortBuffer(u32),
    #[error("source pitch {pitch} is shorter than a {row_bytes} bytes row")]
    ShortPitch { pitch: usize, row_bytes: usize },
    #[error("cannot create an empty {0}x{1} surface")]
    EmptySurface(u32, u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sys(#[from] nix::Error),
}

/// How the display device is opened.
#[derive(Clone, Debug)]
pub struct DisplayConfig {
    pub device: PathBuf,
    /// Index of the mode to use in the connector's mode list, the preferred one being first.
    pub mode_index: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self { device: PathBuf::from("/dev/dri/card0"), mode_index: 0 }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LockFlags(u32);

impl LockFlags {
    pub const READ: LockFlags = LockFlags(1 << 0);
    pub const WRITE: LockFlags = LockFlags(1 << 1);
    /// Lock the buffer currently on screen instead of the back buffer.
    pub const FRONT: LockFlags = LockFlags(1 << 2);

    pub fn contains(&self, other: LockFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for LockFlags {
    type Output = LockFlags;

    fn bitor(self, rhs: LockFlags) -> LockFlags {
        LockFlags(self.0 | rhs.0)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BlitFlags(u32);

impl BlitFlags {
    pub const NONE: BlitFlags = BlitFlags(0);
    /// Draw into the destination's on-screen buffer.
    pub const FRONT: BlitFlags = BlitFlags(1 << 0);

    pub fn contains(&self, other: BlitFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Memory backing a real surface.
pub trait SurfaceBuffer: Send {
    /// Distance in bytes between two rows.
    fn pitch(&self) -> usize;
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
    /// Called when the buffer is locked.
    fn will_need(&self) {}
    /// Called when the buffer is unlocked.
    fn dont_need(&self) {}
}

/// Surface memory allocated from the heap.
pub struct MemoryBuffer {
    data: Vec<u8>,
    pitch: usize,
}

impl MemoryBuffer {
    pub fn new(pitch: usize, height: usize) -> Self {
        Self { data: vec![0; pitch * height], pitch }
    }
}

impl SurfaceBuffer for MemoryBuffer {
    fn pitch(&self) -> usize {
        self.pitch
    }

    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// An output the root surface is scanned out on.
pub trait DisplayDevice: Send {
    /// Resolution of the mode being scanned out.
    fn resolution(&self) -> Resolution;

    /// Hand over the scanout buffers. Called once, when the session is created.
    fn take_buffers(&mut self) -> Vec<Box<dyn SurfaceBuffer>>;

    /// Scan out the buffer at `index`.
    fn flip(&mut self, index: usize) -> Result<(), DisplayError>;
}

struct RealStorage {
    buffers: Vec<Box<dyn SurfaceBuffer>>,
    /// Index of the buffer drawn into. The next one is on screen.
    active: usize,
    /// Only set on the root surface. Declared after `buffers` so the device outlives them.
    device: Option<Box<dyn DisplayDevice>>,
}

impl RealStorage {
    fn buffer_index(&self, front: bool) -> usize {
        match front {
            true => (self.active + 1) % self.buffers.len(),
            false => self.active,
        }
    }
}

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(0);

struct SurfaceInner {
    id: u64,
    width: u32,
    height: u32,
    /// Position relative to the parent.
    x: u32,
    y: u32,
    /// Position of the top-left pixel inside the storage.
    offset_x: u32,
    offset_y: u32,
    storage: Arc<Mutex<RealStorage>>,
    is_real: bool,
    is_root: bool,
    /// Keeps the storage of sub-surfaces and the device of the root alive.
    _parent: Option<Arc<SurfaceInner>>,
}

/// A rectangle that can be drawn into and presented.
///
/// Dropping the last handle to a surface destroys it. Sub-surfaces keep their parent alive, and
/// the root keeps the display device open.
#[derive(Clone)]
pub struct Surface {
    inner: Arc<SurfaceInner>,
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = &self.inner;
        f.debug_struct("Surface")
            .field("id", &inner.id)
            .field("size", &(inner.width, inner.height))
            .field("position", &(inner.x, inner.y))
            .field("offset", &(inner.offset_x, inner.offset_y))
            .field("real", &inner.is_real)
            .finish()
    }
}

impl Surface {
    fn real(
        width: u32,
        height: u32,
        x: u32,
        y: u32,
        storage: RealStorage,
        is_root: bool,
    ) -> Self {
        Self {
            inner: Arc::new(SurfaceInner {
                id: NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed),
                width,
                height,
                x,
                y,
                offset_x: 0,
                offset_y: 0,
                storage: Arc::new(Mutex::new(storage)),
                is_real: true,
                is_root,
                _parent: None,
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    /// Position relative to the parent, or to the screen for real surfaces.
    pub fn position(&self) -> (u32, u32) {
        (self.inner.x, self.inner.y)
    }

    pub fn is_real(&self) -> bool {
        self.inner.is_real
    }

    fn check_rect(&self, x: u32, y: u32, w: u32, h: u32) -> Result<(), DisplayError> {
        let (width, height) = (self.inner.width, self.inner.height);
        let fits = x.checked_add(w).map_or(false, |r| r <= width)
            && y.checked_add(h).map_or(false, |b| b <= height);
        match fits {
            true => Ok(()),
            false => Err(DisplayError::OutOfBounds { x, y, w, h, width, height }),
        }
    }

    /// Byte offset of pixel (`x`, `y`) of this surface in a buffer of its storage.
    fn byte_offset(&self, pitch: usize, x: u32, y: u32) -> usize {
        (self.inner.offset_y + y) as usize * pitch
            + (self.inner.offset_x + x) as usize * BYTES_PER_PIXEL
    }

    /// Lock the surface for drawing.
    ///
    /// Blocks while another surface sharing the same memory is locked.
    pub fn lock(&self, flags: LockFlags) -> SurfaceGuard<'_> {
        let storage = self.inner.storage.lock().unwrap();
        let index = storage.buffer_index(flags.contains(LockFlags::FRONT));
        storage.buffers[index].will_need();
        SurfaceGuard { surface: self, storage, index }
    }
}

/// Access to the pixels of a locked surface.
pub struct SurfaceGuard<'a> {
    surface: &'a Surface,
    storage: MutexGuard<'a, RealStorage>,
    index: usize,
}

impl SurfaceGuard<'_> {
    pub fn pitch(&self) -> usize {
        self.storage.buffers[self.index].pitch()
    }

    fn row_range(&self, y: u32) -> std::ops::Range<usize> {
        let start = self.surface.byte_offset(self.pitch(), 0, y);
        start..start + self.surface.width() as usize * BYTES_PER_PIXEL
    }

    /// Pixels of row `y` of the surface.
    pub fn row(&self, y: u32) -> &[u8] {
        let range = self.row_range(y);
        &self.storage.buffers[self.index].as_slice()[range]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let range = self.row_range(y);
        &mut self.storage.buffers[self.index].as_mut_slice()[range]
    }

    /// Read pixel (`x`, `y`).
    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        let start = x as usize * BYTES_PER_PIXEL;
        let mut bytes = [0u8; BYTES_PER_PIXEL];
        bytes.copy_from_slice(&self.row(y)[start..start + BYTES_PER_PIXEL]);
        u32::from_ne_bytes(bytes)
    }

    pub fn fill(&mut self, pixel: u32) {
        let pitch = self.pitch();
        let start = self.surface.byte_offset(pitch, 0, 0);
        let (width, height) = (self.surface.width() as usize, self.surface.height() as usize);
        let buffer = self.storage.buffers[self.index].as_mut_slice();
        fill_rows(&mut buffer[start..], pitch, width, height, pixel);
    }

    /// Copy a `w`x`h` block of pixels from `src`, whose rows are `src_pitch` bytes apart, to
    /// (`x`, `y`).
    pub fn write(
        &mut self,
        src: &[u8],
        src_pitch: usize,
        w: u32,
        h: u32,
        x: u32,
        y: u32,
    ) -> Result<(), DisplayError> {
        self.surface.check_rect(x, y, w, h)?;
        let row_bytes = w as usize * BYTES_PER_PIXEL;
        if src_pitch < row_bytes {
            return Err(DisplayError::ShortPitch { pitch: src_pitch, row_bytes });
        }
        if h > 0 && src.len() < (h as usize - 1) * src_pitch + row_bytes {
            return Err(DisplayError::ShortBuffer(h));
        }

        let pitch = self.pitch();
        let start = self.surface.byte_offset(pitch, x, y);
        let buffer = self.storage.buffers[self.index].as_mut_slice();
        copy_rows(&mut buffer[start..], pitch, src, src_pitch, row_bytes, h as usize);
        Ok(())
    }
}

impl Drop for SurfaceGuard<'_> {
    fn drop(&mut self) {
        self.storage.buffers[self.index].dont_need();
    }
}

/// Copy the back buffer of `src` to (`x`, `y`) in `dst`.
fn blit_locked(
    dst: &Surface,
    dst_storage: &mut RealStorage,
    src: &Surface,
    src_storage: &RealStorage,
    flags: BlitFlags,
    x: u32,
    y: u32,
) {
    let dst_index = dst_storage.buffer_index(flags.contains(BlitFlags::FRONT));
    let src_buffer = &src_storage.buffers[src_storage.active];
    let dst_buffer = &mut dst_storage.buffers[dst_index];

    let (src_pitch, dst_pitch) = (src_buffer.pitch(), dst_buffer.pitch());
    let src_start = src.byte_offset(src_pitch, 0, 0);
    let dst_start = dst.byte_offset(dst_pitch, x, y);
    copy_rows(
        &mut dst_buffer.as_mut_slice()[dst_start..],
        dst_pitch,
        &src_buffer.as_slice()[src_start..],
        src_pitch,
        src.width() as usize * BYTES_PER_PIXEL,
        src.height() as usize,
    );
}

/// Copy `src` between two surfaces sharing the same memory.
fn blit_shared(
    dst: &Surface,
    src: &Surface,
    storage: &mut RealStorage,
    flags: BlitFlags,
    x: u32,
    y: u32,
) {
    let src_index = storage.active;
    let dst_index = storage.buffer_index(flags.contains(BlitFlags::FRONT));
    let row_bytes = src.width() as usize * BYTES_PER_PIXEL;
    let rows = src.height() as usize;

    if src_index == dst_index {
        let buffer = &mut storage.buffers[src_index];
        let pitch = buffer.pitch();
        let src_start = src.byte_offset(pitch, 0, 0);
        let dst_start = dst.byte_offset(pitch, x, y);
        copy_rows_within(buffer.as_mut_slice(), pitch, src_start, dst_start, row_bytes, rows);
        return;
    }

    let (src_buffer, dst_buffer) = if src_index < dst_index {
        let (head, tail) = storage.buffers.split_at_mut(dst_index);
        (&head[src_index], &mut tail[0])
    } else {
        let (head, tail) = storage.buffers.split_at_mut(src_index);
        (&tail[0], &mut head[dst_index])
    };
    let (src_pitch, dst_pitch) = (src_buffer.pitch(), dst_buffer.pitch());
    let src_start = src.byte_offset(src_pitch, 0, 0);
    let dst_start = dst.byte_offset(dst_pitch, x, y);
    copy_rows(
        &mut dst_buffer.as_mut_slice()[dst_start..],
        dst_pitch,
        &src_buffer.as_slice()[src_start..],
        src_pitch,
        row_bytes,
        rows,
    );
}

/// A display output and the surfaces drawn on it.
pub struct DisplaySession {
    root: Surface,
}

impl DisplaySession {
    /// Create a session whose root surface covers `device`.
    pub fn new(mut device: Box<dyn DisplayDevice>) -> Self {
        let resolution = device.resolution();
        let buffers = device.take_buffers();
        assert!(!buffers.is_empty(), "display device without scanout buffers");
        log::info!("display session at {resolution} with {} buffers", buffers.len());

        let storage = RealStorage { buffers, active: 0, device: Some(device) };
        let root = Surface::real(resolution.width, resolution.height, 0, 0, storage, true);
        Self { root }
    }

    /// Open a DRM device and create a session on its first connected output.
    #[cfg(feature = "drm")]
    pub fn open_drm(config: &DisplayConfig) -> Result<Self, DisplayError> {
        let device = self::drm::DrmDisplay::open(config)?;
        Ok(Self::new(Box::new(device)))
    }

    pub fn root(&self) -> &Surface {
        &self.root
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::from((self.root.width(), self.root.height()))
    }

    /// Create a surface.
    ///
    /// Without a parent, the surface is real: it gets its own memory and is meant to be
    /// presented at (`x`, `y`) on the screen. With a parent, it is a sub-surface covering the
    /// given rectangle of the parent.
    pub fn surface_new(
        &self,
        parent: Option<&Surface>,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
    ) -> Result<Surface, DisplayError> {
        if w == 0 || h == 0 {
            return Err(DisplayError::EmptySurface(w, h));
        }
        let Some(parent) = parent else {
            let pitch = w as usize * BYTES_PER_PIXEL;
            let buffer: Box<dyn SurfaceBuffer> = Box::new(MemoryBuffer::new(pitch, h as usize));
            let storage = RealStorage { buffers: vec![buffer], active: 0, device: None };
            return Ok(Surface::real(w, h, x, y, storage, false));
        };

        parent.check_rect(x, y, w, h)?;
        let parent_inner = &parent.inner;
        Ok(Surface {
            inner: Arc::new(SurfaceInner {
                id: NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed),
                width: w,
                height: h,
                x,
                y,
                offset_x: parent_inner.offset_x + x,
                offset_y: parent_inner.offset_y + y,
                storage: Arc::clone(&parent_inner.storage),
                is_real: false,
                is_root: false,
                _parent: Some(Arc::clone(parent_inner)),
            }),
        })
    }

    /// Copy the back buffer of `src` to (`x`, `y`) in `dst`.
    pub fn blit(
        &self,
        dst: &Surface,
        src: &Surface,
        flags: BlitFlags,
        x: u32,
        y: u32,
    ) -> Result<(), DisplayError> {
        dst.check_rect(x, y, src.width(), src.height())?;

        let (dst_storage, src_storage) = (&dst.inner.storage, &src.inner.storage);
        if Arc::ptr_eq(dst_storage, src_storage) {
            let mut storage = dst_storage.lock().unwrap();
            blit_shared(dst, src, &mut storage, flags, x, y);
            return Ok(());
        }

        // Always lock in the same order so two opposite blits cannot deadlock.
        let (mut dst_guard, src_guard) = if Arc::as_ptr(dst_storage) < Arc::as_ptr(src_storage) {
            let dst_guard = dst_storage.lock().unwrap();
            (dst_guard, src_storage.lock().unwrap())
        } else {
            let src_guard = src_storage.lock().unwrap();
            (dst_storage.lock().unwrap(), src_guard)
        };
        blit_locked(dst, &mut dst_guard, src, &src_guard, flags, x, y);
        Ok(())
    }

    /// Copy `w`x`h` pixels from `src`, whose rows are `src_pitch` bytes apart, to (`x`, `y`) in
    /// `dst`.
    #[allow(clippy::too_many_arguments)]
    pub fn blit_raw(
        &self,
        dst: &Surface,
        src: &[u8],
        src_pitch: usize,
        w: u32,
        h: u32,
        flags: BlitFlags,
        x: u32,
        y: u32,
    ) -> Result<(), DisplayError> {
        let lock_flags = match flags.contains(BlitFlags::FRONT) {
            true => LockFlags::WRITE | LockFlags::FRONT,
            false => LockFlags::WRITE,
        };
        dst.lock(lock_flags).write(src, src_pitch, w, h, x, y)
    }

    /// Make `surface` visible.
    ///
    /// Presenting the root flips its buffers. Presenting another real surface copies it to its
    /// position on the root's back buffer, or straight to the screen if `update` is set.
    /// Sub-surfaces are presented with their real ancestor.
    pub fn present(&self, surface: &Surface, update: bool) -> Result<(), DisplayError> {
        let inner = &surface.inner;
        if !inner.is_real {
            log::trace!("surface {} is a sub-surface, nothing to present", inner.id);
            return Ok(());
        }

        if inner.is_root {
            let mut storage = inner.storage.lock().unwrap();
            let active = storage.active;
            if let Some(device) = storage.device.as_mut() {
                device.flip(active)?;
            }
            storage.active = (active + 1) % storage.buffers.len();
            return Ok(());
        }

        let flags = match update {
            true => BlitFlags::FRONT,
            false => BlitFlags::NONE,
        };
        self.blit(&self.root, surface, flags, inner.x, inner.y)
    }
}
