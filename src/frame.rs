//! Captured frame container.
//!
//! - `Frame`: one decoded sensor sample, 3 channels, 8 bits per channel, BGR order.
//!
//! Pixel bytes are laid out row-major with no padding, so the logical shape is
//! `(height, width, 3)`. Channel order is whatever the conversion stage produced
//! (BGR for the CSI pipeline); this crate treats the bytes as opaque.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

/// Channels per pixel in every produced frame.
pub const CHANNELS: usize = 3;

/// One captured frame.
#[derive(Clone)]
pub struct Frame {
    /// Tightly packed BGR bytes, `height * width * 3` long.
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Monotonic sensor sequence number (as assigned by the backend).
    pub sequence: u64,

    /// Instant the sensor exposure was taken (best effort per backend).
    pub captured_at: Instant,
}

impl Frame {
    /// Wrap packed BGR bytes. The length must be exactly `width * height * 3`.
    pub fn from_bgr(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        Self::from_bgr_at(data, width, height, sequence, Instant::now())
    }

    pub(crate) fn from_bgr_at(
        data: Vec<u8>,
        width: u32,
        height: u32,
        sequence: u64,
        captured_at: Instant,
    ) -> Result<Self> {
        let expected = packed_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "BGR frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            sequence,
            captured_at,
        })
    }

    /// Logical array shape: `(rows, cols, channels)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height as usize, self.width as usize, CHANNELS)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Pixel at `(row, col)`, or `None` when out of bounds.
    pub fn pixel(&self, row: usize, col: usize) -> Option<[u8; 3]> {
        let (rows, cols, _) = self.shape();
        if row >= rows || col >= cols {
            return None;
        }
        let start = (row * cols + col) * CHANNELS;
        let px = self.data.get(start..start + CHANNELS)?;
        Some([px[0], px[1], px[2]])
    }

    /// Time elapsed since the exposure was taken.
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

impl std::fmt::Debug for Frame {
    // Pixel bytes are deliberately left out; frames are large.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Number of bytes in a tightly packed BGR frame.
pub(crate) fn packed_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(CHANNELS))
        .ok_or_else(|| anyhow!("BGR frame dimensions overflow"))
}

/// Copy `height` rows of `width * 3` bytes out of a buffer whose rows are
/// `stride` bytes apart.
pub(crate) fn repack_rows(data: &[u8], width: u32, height: u32, stride: usize) -> Result<Vec<u8>> {
    let row_bytes = (width as usize) * CHANNELS;
    if stride == row_bytes {
        let expected = packed_len(width, height)?;
        return data
            .get(..expected)
            .map(|slice| slice.to_vec())
            .ok_or_else(|| anyhow!("frame buffer is shorter than {} bytes", expected));
    }
    if stride < row_bytes {
        return Err(anyhow!(
            "row stride {} is smaller than row width {}",
            stride,
            row_bytes
        ));
    }

    let mut pixels = Vec::with_capacity(packed_len(width, height)?);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .ok_or_else(|| anyhow!("frame buffer row {} is out of bounds", row))?,
        );
    }
    Ok(pixels)
}
