// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Copy `rows` lines of `row_bytes` bytes between two buffers with their own pitches.
///
/// Both slices start at the first byte of the first row, and both pitches are at least
/// `row_bytes`.
pub fn copy_rows(
    dst: &mut [u8],
    dst_pitch: usize,
    src: &[u8],
    src_pitch: usize,
    row_bytes: usize,
    rows: usize,
) {
    if row_bytes == 0 || rows == 0 {
        return;
    }
    let src_lines = src.chunks(src_pitch).map(|line| &line[..row_bytes]);
    let dst_lines = dst.chunks_mut(dst_pitch).map(|line| &mut line[..row_bytes]);

    for (src_line, dst_line) in src_lines.zip(dst_lines).take(rows) {
        dst_line.copy_from_slice(src_line);
    }
}

/// Same as [`copy_rows`], with source and destination inside the same buffer and sharing its
/// pitch. The two areas may overlap.
pub fn copy_rows_within(
    buf: &mut [u8],
    pitch: usize,
    src_offset: usize,
    dst_offset: usize,
    row_bytes: usize,
    rows: usize,
) {
    let copy_row = |buf: &mut [u8], row: usize| {
        let src = src_offset + row * pitch;
        buf.copy_within(src..src + row_bytes, dst_offset + row * pitch);
    };

    // Go against the direction of the move so overlapping rows are read before being written.
    if dst_offset > src_offset {
        (0..rows).rev().for_each(|row| copy_row(buf, row));
    } else {
        (0..rows).for_each(|row| copy_row(buf, row));
    }
}

/// Fill `rows` lines of `width` 32-bit pixels with `pixel`.
pub fn fill_rows(dst: &mut [u8], pitch: usize, width: usize, rows: usize, pixel: u32) {
    if width == 0 || rows == 0 {
        return;
    }
    let pixel = pixel.to_ne_bytes();
    for line in dst.chunks_mut(pitch).take(rows) {
        for chunk in line[..width * 4].chunks_exact_mut(4) {
            chunk.copy_from_slice(&pixel);
        }
    }
}

/// Counts the iterations of a polling loop and tells when a diagnostic is due.
#[derive(Debug)]
pub struct PollCounter {
    threshold: u32,
    polls: u32,
}

impl PollCounter {
    pub fn new(threshold: u32) -> Self {
        Self { threshold: threshold.max(1), polls: 0 }
    }

    /// Record one poll. Returns `true` every `threshold` polls.
    pub fn tick(&mut self) -> bool {
        self.polls = self.polls.wrapping_add(1);
        self.polls % self.threshold == 0
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(128, 64), 128);
        assert_eq!(align_up(1920 * 4, 256), 7680);
    }

    #[test]
    fn copy_between_pitches() {
        let src = [1u8, 2, 0xff, 3, 4, 0xff];
        let mut dst = [0u8; 8];
        copy_rows(&mut dst, 4, &src, 3, 2, 2);
        assert_eq!(dst, [1, 2, 0, 0, 3, 4, 0, 0]);
    }

    #[test]
    fn overlapping_copy_moves_down() {
        // 4 rows of 2 bytes, move rows 0-1 onto rows 1-2.
        let mut buf = [1u8, 1, 2, 2, 3, 3, 4, 4];
        copy_rows_within(&mut buf, 2, 0, 2, 2, 2);
        assert_eq!(buf, [1, 1, 1, 1, 2, 2, 4, 4]);

        let mut buf = [1u8, 1, 2, 2, 3, 3, 4, 4];
        copy_rows_within(&mut buf, 2, 2, 0, 2, 2);
        assert_eq!(buf, [2, 2, 3, 3, 3, 3, 4, 4]);
    }

    #[test]
    fn fill_leaves_padding_alone() {
        let mut dst = [0u8; 12];
        fill_rows(&mut dst, 6, 1, 2, 0x01020304);
        let pixel = 0x01020304u32.to_ne_bytes();
        assert_eq!(&dst[0..4], &pixel);
        assert_eq!(&dst[4..6], &[0, 0]);
        assert_eq!(&dst[6..10], &pixel);
    }

    #[test]
    fn empty_rectangles_touch_nothing() {
        let mut dst = [7u8; 8];
        copy_rows(&mut dst, 0, &[], 0, 0, 2);
        copy_rows(&mut dst, 4, &[1, 2, 3, 4], 4, 4, 0);
        fill_rows(&mut dst, 0, 0, 2, 0);
        fill_rows(&mut dst, 4, 1, 0, 0);
        assert_eq!(dst, [7; 8]);
    }

    #[test]
    fn poll_counter_warns_periodically() {
        let mut counter = PollCounter::new(3);
        let due: Vec<bool> = (0..7).map(|_| counter.tick()).collect();
        assert_eq!(due, [false, false, true, false, false, true, false]);
        assert_eq!(counter.polls(), 7);

        // A zero threshold warns on every poll instead of dividing by zero.
        assert!(PollCounter::new(0).tick());
    }
}
