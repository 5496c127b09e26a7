// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use bytes::Bytes;

use crate::pool::Pool;
use crate::pool::Pooled;
use crate::Rational;
use crate::MICROSECONDS;

/// A compressed access unit produced by the demuxer.
///
/// Timestamps are expressed in the time base of the stream the packet belongs to. `None` means
/// the timestamp is unknown.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub data: Bytes,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub stream_index: usize,
}

impl Packet {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Presentation timestamp rescaled from `time_base` to microseconds.
    pub fn pts_us(&self, time_base: Rational) -> Option<i64> {
        self.pts.map(|pts| time_base.rescale(pts, MICROSECONDS))
    }

    /// Decode timestamp rescaled from `time_base` to microseconds.
    pub fn dts_us(&self, time_base: Rational) -> Option<i64> {
        self.dts.map(|dts| time_base.rescale(dts, MICROSECONDS))
    }

    pub fn clear(&mut self) {
        *self = Default::default();
    }
}

/// Create a pool of `capacity` packets that are cleared when they come back.
pub fn packet_pool(capacity: usize) -> Pool<Packet> {
    Pool::with_reset(capacity, Packet::default, Packet::clear)
}

pub type PooledPacket = Pooled<Packet>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returned_packets_are_cleared() {
        let pool = packet_pool(1);
        let mut packet = pool.acquire().unwrap();
        packet.data = Bytes::from_static(b"\x00\x00\x01\x65");
        packet.pts = Some(3003);
        drop(packet);

        let packet = pool.acquire().unwrap();
        assert!(packet.is_empty());
        assert_eq!(packet.pts, None);
    }

    #[test]
    fn unknown_timestamps_stay_unknown() {
        let packet = Packet { pts: None, dts: Some(90_000), ..Default::default() };
        let time_base = Rational::new(1, 90_000);
        assert_eq!(packet.pts_us(time_base), None);
        assert_eq!(packet.dts_us(time_base), Some(1_000_000));
    }
}
