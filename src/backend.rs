// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Boundary with the hardware video decoder.
//!
//! A hardware decoder exposes an input port that accepts timestamped buffers and an output port
//! that hands decoded buffers back asynchronously, from a thread the decoder owns. Everything the
//! hardware reports goes through a [`HwEventSink`] registered when the input port is configured.

pub mod dummy;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use enumn::N;
use thiserror::Error;

use crate::packet::Packet;
use crate::pool::Pooled;
use crate::PixelFormat;
use crate::Rational;
use crate::Resolution;

/// Compressed formats the hardware decoders can be configured for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    /// MPEG-4 part 2, also used for H.263.
    MP4V,
    /// MPEG-1 and MPEG-2 video.
    MP2V,
    VP6,
    VP8,
    Theora,
    MJPEG,
    /// VC-1 and WMV3.
    WVC1,
}

impl FromStr for Codec {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(Codec::H264),
            "h263" | "mpeg4" | "mp4v" => Ok(Codec::MP4V),
            "mpeg1" | "mpeg2" | "mp2v" => Ok(Codec::MP2V),
            "vp6" | "VP6" => Ok(Codec::VP6),
            "vp8" | "VP8" => Ok(Codec::VP8),
            "theora" => Ok(Codec::Theora),
            "mjpeg" | "MJPEG" => Ok(Codec::MJPEG),
            "vc1" | "wmv3" | "wvc1" => Ok(Codec::WVC1),
            _ => Err(
                "unrecognized codec. Valid values: h264, mpeg4, mpeg2, vp6, vp8, theora, mjpeg, vc1",
            ),
        }
    }
}

/// Stream metadata provided by the demuxer.
#[derive(Clone, Debug)]
pub struct StreamParams {
    pub codec: Codec,
    /// Out-of-band codec configuration, e.g. the H.264 SPS/PPS.
    pub extradata: Bytes,
    pub frame_rate: Rational,
    /// Time base of the timestamps carried by the stream's packets.
    pub time_base: Rational,
}

/// Largest extradata block the decoders are known to accept.
pub const MAX_EXTRADATA_SIZE: usize = 128;

/// How the input port must be set up before the decoder is enabled.
#[derive(Clone, Debug)]
pub struct InputPortConfig {
    pub codec: Codec,
    pub extradata: Bytes,
    pub frame_rate: Rational,
    pub error_concealment: bool,
    pub interpolate_timestamps: bool,
}

impl From<&StreamParams> for InputPortConfig {
    fn from(params: &StreamParams) -> Self {
        let extradata = match params.codec {
            Codec::H264 => params.extradata.clone(),
            _ => Bytes::new(),
        };
        Self {
            codec: params.codec,
            extradata,
            frame_rate: params.frame_rate,
            error_concealment: false,
            interpolate_timestamps: false,
        }
    }
}

/// Input buffer geometry recommended by the hardware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InputPortInfo {
    pub buffer_size: usize,
    pub buffer_count: usize,
}

/// Output format announced by the hardware.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputFormat {
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub buffer_count_recommended: usize,
    pub buffer_size_recommended: usize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferFlags(pub u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    /// First buffer of a packet.
    pub const FRAME_START: BufferFlags = BufferFlags(1 << 0);
    /// Last buffer of a packet.
    pub const FRAME_END: BufferFlags = BufferFlags(1 << 1);

    pub fn contains(&self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: BufferFlags) {
        self.0 |= rhs.0;
    }
}

/// A buffer header submitted to the input port.
///
/// Large packets are split across several headers. The header carrying the last byte of a packet
/// also carries the packet itself, so the packet stays alive until the hardware has consumed it.
#[derive(Debug, Default)]
pub struct InputBuffer {
    pub data: Bytes,
    /// Presentation timestamp in microseconds.
    pub pts: Option<i64>,
    /// Decode timestamp in microseconds.
    pub dts: Option<i64>,
    pub flags: BufferFlags,
    pub packet: Option<Pooled<Packet>>,
}

impl InputBuffer {
    /// Drop the payload and release the attached packet, if any.
    pub fn reset(&mut self) {
        self.data = Bytes::new();
        self.pts = None;
        self.dts = None;
        self.flags = BufferFlags::NONE;
        self.packet = None;
    }
}

/// Memory owned by the hardware output port.
pub trait HwMemory: Send + Sync {
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
}

impl HwMemory for Vec<u8> {
    fn as_slice(&self) -> &[u8] {
        self
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        self
    }
}

/// A decoded buffer handed out by the output port.
pub struct OutputBuffer {
    /// Index of the buffer in the output port pool.
    pub index: usize,
    /// Presentation timestamp in microseconds.
    pub pts: Option<i64>,
    /// Number of valid bytes. Zero means the buffer carries no picture.
    pub length: usize,
    pub pitch: usize,
    pub memory: Box<dyn HwMemory>,
}

impl OutputBuffer {
    pub fn data(&self) -> &[u8] {
        &self.memory.as_slice()[..self.length]
    }
}

impl fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("index", &self.index)
            .field("pts", &self.pts)
            .field("length", &self.length)
            .field("pitch", &self.pitch)
            .finish()
    }
}

/// Status codes reported by the hardware.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
pub enum HwStatus {
    NoMemory = 1,
    NoSpace = 2,
    Invalid = 3,
    NotImplemented = 4,
    NotFound = 5,
    NoDevice = 6,
    Io = 7,
    IllegalSeek = 8,
    Corrupt = 9,
    NotReady = 10,
    BadConfig = 11,
    IsConnected = 12,
    NotConnected = 13,
    Again = 14,
    Fault = 15,
    Unknown = 0xffff_ffff,
}

impl HwStatus {
    /// Decode a raw status code. Zero is success.
    pub fn from_code(code: u32) -> std::result::Result<(), HwStatus> {
        match code {
            0 => Ok(()),
            code => Err(HwStatus::n(code).unwrap_or(HwStatus::Unknown)),
        }
    }
}

impl fmt::Display for HwStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HwStatus::NoMemory => "out of memory",
            HwStatus::NoSpace => "out of resources",
            HwStatus::Invalid => "invalid argument",
            HwStatus::NotImplemented => "function not implemented",
            HwStatus::NotFound => "not found",
            HwStatus::NoDevice => "no such device",
            HwStatus::Io => "I/O error",
            HwStatus::IllegalSeek => "illegal seek",
            HwStatus::Corrupt => "data is corrupt",
            HwStatus::NotReady => "component is not ready",
            HwStatus::BadConfig => "component is not configured",
            HwStatus::IsConnected => "port is already connected",
            HwStatus::NotConnected => "port is disconnected",
            HwStatus::Again => "resource temporarily unavailable",
            HwStatus::Fault => "bad address",
            HwStatus::Unknown => "unknown status",
        };
        f.write_str(text)
    }
}

/// Error returned by decoder backend methods.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("hardware error: {0}")]
    Status(HwStatus),
    #[error("codec {0:?} is not supported")]
    UnsupportedCodec(Codec),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<HwStatus> for BackendError {
    fn from(status: HwStatus) -> Self {
        BackendError::Status(status)
    }
}

impl BackendError {
    pub fn status(&self) -> HwStatus {
        match self {
            BackendError::Status(status) => *status,
            BackendError::UnsupportedCodec(_) => HwStatus::NotImplemented,
            BackendError::Other(_) => HwStatus::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Receives everything the hardware reports. Called from the hardware's own thread.
pub trait HwEventSink: Send + Sync {
    /// The hardware is done with `buffer`.
    fn input_consumed(&self, buffer: Pooled<InputBuffer>);
    /// A buffer left the output port.
    fn frame_decoded(&self, buffer: OutputBuffer);
    /// The output format changed and must be renegotiated before more frames can be produced.
    fn format_changed(&self, format: OutputFormat);
    /// The hardware reported an error outside of any submission.
    fn error(&self, status: HwStatus);
}

/// Gives output buffers back to the hardware once the application is done with them.
pub trait OutputRecycler: Send + Sync {
    fn recycle(&self, buffer: OutputBuffer);
}

/// A hardware decoder component.
pub trait DecoderBackend: Send {
    /// Configure the input port for `config` and register `events`.
    fn configure(
        &mut self,
        config: &InputPortConfig,
        events: Arc<dyn HwEventSink>,
    ) -> Result<InputPortInfo>;

    /// Start the component. Input can be submitted afterwards.
    fn enable(&mut self) -> Result<()>;

    /// Commit `format` on the output port and fill the port with `buffer_count` buffers.
    ///
    /// Returns the number of buffers actually allocated.
    fn set_output_format(&mut self, format: &OutputFormat, buffer_count: usize) -> Result<usize>;

    /// Object used to return output buffers to this component.
    fn recycler(&self) -> Arc<dyn OutputRecycler>;

    /// Queue `buffer` on the input port. It comes back through
    /// [`HwEventSink::input_consumed`].
    fn send_input(&mut self, buffer: Pooled<InputBuffer>) -> Result<()>;

    /// Discard every buffer queued on the input port and any partially decoded picture.
    fn flush(&mut self) -> Result<()>;

    /// Wait up to `timeout` for every submitted buffer to be decoded and its frame delivered.
    ///
    /// Returns `true` once the decoder is idle.
    fn drain(&mut self, timeout: Duration) -> Result<bool>;

    /// Stop the component and release its buffers.
    fn disable(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(HwStatus::from_code(0), Ok(()));
        assert_eq!(HwStatus::from_code(10), Err(HwStatus::NotReady));
        assert_eq!(HwStatus::from_code(1234), Err(HwStatus::Unknown));
    }

    #[test]
    fn codec_names() {
        assert_eq!("h264".parse::<Codec>(), Ok(Codec::H264));
        assert_eq!("h263".parse::<Codec>(), Ok(Codec::MP4V));
        assert_eq!("wmv3".parse::<Codec>(), Ok(Codec::WVC1));
        assert!("hevc".parse::<Codec>().is_err());
    }

    #[test]
    fn extradata_only_forwarded_for_h264() {
        let mut params = StreamParams {
            codec: Codec::H264,
            extradata: Bytes::from_static(&[0, 0, 0, 1, 0x67]),
            frame_rate: Rational::new(30, 1),
            time_base: Rational::new(1, 90_000),
        };
        assert_eq!(InputPortConfig::from(&params).extradata.len(), 5);

        params.codec = Codec::VP8;
        assert!(InputPortConfig::from(&params).extradata.is_empty());
    }

    #[test]
    fn buffer_flags() {
        let mut flags = BufferFlags::FRAME_START;
        assert!(!flags.contains(BufferFlags::FRAME_END));
        flags |= BufferFlags::FRAME_END;
        assert!(flags.contains(BufferFlags::FRAME_START | BufferFlags::FRAME_END));
    }
}
