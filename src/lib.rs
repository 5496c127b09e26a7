// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Real-time video decode and display pipeline for embedded players.
//!
//! Compressed [`packet::Packet`]s flow from a demuxer through a [`queue::TransferQueue`] into the
//! [`pipeline`] decode thread, which drives a hardware [`backend::DecoderBackend`]. Decoded
//! [`video_frame::Frame`]s wrap hardware memory without copying and are handed to a presenter
//! through a second queue. The presenter composites them with the [`display`] module.

pub mod backend;
pub mod checkpoint;
pub mod display;
pub mod packet;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod utils;
pub mod video_frame;

use std::fmt;
use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel layouts a decoder can hand out.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// The buffer is a hardware handle that cannot be read directly.
    #[default]
    Opaque,
    I420,
    NV12,
    /// 32 bits per pixel, the layout of display surfaces.
    XRGB8888,
}

impl PixelFormat {
    /// Bytes used by a `width`x`height` picture without any padding, or `None` for opaque
    /// buffers.
    pub fn frame_size(&self, width: usize, height: usize) -> Option<usize> {
        match self {
            PixelFormat::Opaque => None,
            PixelFormat::I420 | PixelFormat::NV12 => {
                // U and V planes need to be aligned to 2.
                let uv_size = ((width + 1) / 2) * ((height + 1) / 2) * 2;
                Some(width * height + uv_size)
            }
            PixelFormat::XRGB8888 => Some(width * height * 4),
        }
    }
}

impl FromStr for PixelFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opaque" => Ok(PixelFormat::Opaque),
            "i420" | "I420" => Ok(PixelFormat::I420),
            "nv12" | "NV12" => Ok(PixelFormat::NV12),
            "xrgb8888" | "XRGB8888" => Ok(PixelFormat::XRGB8888),
            _ => Err("unrecognized pixel format. Valid values: opaque, i420, nv12, xrgb8888"),
        }
    }
}

/// A rational number, used for time bases and frame rates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Rescales `value` expressed in units of `self` into units of `to`, rounding to the nearest
    /// integer with halves away from zero.
    pub fn rescale(&self, value: i64, to: Rational) -> i64 {
        let num = value as i128 * self.num as i128 * to.den as i128;
        let den = self.den as i128 * to.num as i128;
        if den == 0 {
            return 0;
        }
        let half = den.abs() / 2;
        let rounded = if (num < 0) != (den < 0) { (num - half) / den } else { (num + half) / den };
        rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

impl Default for Rational {
    fn default() -> Self {
        MICROSECONDS
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Time base of every timestamp that leaves the decoder.
pub const MICROSECONDS: Rational = Rational::new(1, 1_000_000);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_to_microseconds() {
        let ninety_khz = Rational::new(1, 90_000);
        assert_eq!(ninety_khz.rescale(90_000, MICROSECONDS), 1_000_000);
        assert_eq!(ninety_khz.rescale(3_003, MICROSECONDS), 33_367);
        assert_eq!(ninety_khz.rescale(-3_003, MICROSECONDS), -33_367);
        assert_eq!(MICROSECONDS.rescale(42, MICROSECONDS), 42);
    }

    #[test]
    fn frame_sizes() {
        assert_eq!(PixelFormat::I420.frame_size(3, 3), Some(9 + 8));
        assert_eq!(PixelFormat::XRGB8888.frame_size(2, 2), Some(16));
        assert_eq!(PixelFormat::Opaque.frame_size(2, 2), None);
    }

    #[test]
    fn parse_pixel_format() {
        assert_eq!("nv12".parse::<PixelFormat>(), Ok(PixelFormat::NV12));
        assert!("rgb565".parse::<PixelFormat>().is_err());
    }
}
