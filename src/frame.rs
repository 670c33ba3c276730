//! Owned frames, timestamps and rescaling

use crate::error::{RelayError, Result};
use crate::header::{payload_len, FrameRecord, BYTES_PER_PIXEL, NEVER_WRITTEN};
use std::io::{self, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock nanoseconds since the UNIX epoch
///
/// Used for `write_time` so that every process on the host agrees on it.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Validate dimensions and return the payload length they imply
pub fn checked_payload_len(width: u32, height: u32) -> Result<usize> {
    match payload_len(width, height) {
        Some(len) if len > 0 => Ok(len),
        _ => Err(RelayError::InvalidDimensions { width, height }),
    }
}

/// A 24-bit row-major frame owned by this process
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    capture_time: u64,
    write_time: u64,
    pixels: Vec<u8>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("capture_time", &self.capture_time)
            .field("write_time", &self.write_time)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

impl Frame {
    /// A black frame
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let len = checked_payload_len(width, height)?;
        Ok(Self {
            width,
            height,
            capture_time: 0,
            write_time: NEVER_WRITTEN,
            pixels: vec![0; len],
        })
    }

    /// Wrap an existing pixel buffer
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = checked_payload_len(width, height)?;
        if pixels.len() != expected {
            return Err(RelayError::FrameSizeMismatch {
                expected,
                got: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            capture_time: 0,
            write_time: NEVER_WRITTEN,
            pixels,
        })
    }

    pub(crate) fn from_record(record: &FrameRecord, pixels: Vec<u8>) -> Self {
        Self {
            width: record.width,
            height: record.height,
            capture_time: record.capture_time,
            write_time: record.write_time,
            pixels,
        }
    }

    pub fn with_capture_time(mut self, capture_time: u64) -> Self {
        self.capture_time = capture_time;
        self
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// When the frame was originally obtained, as given by the producer
    #[inline]
    pub fn capture_time(&self) -> u64 {
        self.capture_time
    }

    /// When the frame was published, 0 if it never went through a channel
    #[inline]
    pub fn write_time(&self) -> u64 {
        self.write_time
    }

    #[inline]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    #[inline]
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    /// RGB value at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let at = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        Some([self.pixels[at], self.pixels[at + 1], self.pixels[at + 2]])
    }

    /// Time from publication until now
    pub fn latency(&self) -> Option<Duration> {
        if self.write_time == NEVER_WRITTEN {
            return None;
        }
        Some(Duration::from_nanos(now_nanos().saturating_sub(self.write_time)))
    }

    /// A copy scaled to `width` x `height`
    pub fn resized(&self, width: u32, height: u32) -> Result<Self> {
        let mut out = Frame::new(width, height)?;
        resize_nearest(
            &self.pixels,
            self.width,
            self.height,
            &mut out.pixels,
            width,
            height,
        )?;
        out.capture_time = self.capture_time;
        Ok(out)
    }

    /// Write as binary PPM (P6)
    pub fn write_ppm<W: Write>(&self, mut out: W) -> io::Result<()> {
        write!(out, "P6\n{} {}\n255\n", self.width, self.height)?;
        out.write_all(&self.pixels)?;
        out.flush()
    }
}

fn check_buffer(buf: &[u8], width: u32, height: u32) -> Result<()> {
    let expected = checked_payload_len(width, height)?;
    if buf.len() != expected {
        return Err(RelayError::FrameSizeMismatch {
            expected,
            got: buf.len(),
        });
    }
    Ok(())
}

/// Nearest-neighbour rescale of a 24-bit frame
///
/// Fails if `src` or `dst` does not hold exactly `w * h * 3` bytes for its
/// dimensions.
pub fn resize_nearest(src: &[u8], sw: u32, sh: u32, dst: &mut [u8], dw: u32, dh: u32) -> Result<()> {
    check_buffer(src, sw, sh)?;
    check_buffer(dst, dw, dh)?;

    let (sw, sh, dw, dh) = (sw as usize, sh as usize, dw as usize, dh as usize);
    let src_stride = sw * BYTES_PER_PIXEL;
    let dst_stride = dw * BYTES_PER_PIXEL;

    for (y, dst_row) in dst.chunks_exact_mut(dst_stride).enumerate() {
        let sy = y * sh / dh;
        let src_row = &src[sy * src_stride..(sy + 1) * src_stride];
        for (x, dst_px) in dst_row.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
            let sx = x * sw / dw;
            dst_px.copy_from_slice(&src_row[sx * BYTES_PER_PIXEL..(sx + 1) * BYTES_PER_PIXEL]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Frame {
        let mut frame = Frame::new(width, height).unwrap();
        for (i, px) in frame.pixels_mut().chunks_exact_mut(3).enumerate() {
            let x = (i % width as usize) as u8;
            let y = (i / width as usize) as u8;
            px.copy_from_slice(&[x, y, 0x80]);
        }
        frame
    }

    #[test]
    fn test_rejects_bad_dimensions() {
        assert!(matches!(
            Frame::new(0, 10),
            Err(RelayError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            Frame::from_pixels(2, 2, vec![0; 11]),
            Err(RelayError::FrameSizeMismatch {
                expected: 12,
                got: 11
            })
        ));
    }

    #[test]
    fn test_downscale_picks_nearest() {
        let src = gradient(4, 4);
        let small = src.resized(2, 2).unwrap();
        assert_eq!(small.pixels().len(), 2 * 2 * 3);
        assert_eq!(small.pixel(0, 0), Some([0, 0, 0x80]));
        assert_eq!(small.pixel(1, 0), Some([2, 0, 0x80]));
        assert_eq!(small.pixel(0, 1), Some([0, 2, 0x80]));
        assert_eq!(small.pixel(1, 1), Some([2, 2, 0x80]));
    }

    #[test]
    fn test_upscale_repeats_pixels() {
        let src = gradient(2, 1);
        let big = src.resized(4, 2).unwrap();
        assert_eq!(big.pixel(0, 0), Some([0, 0, 0x80]));
        assert_eq!(big.pixel(1, 1), Some([0, 0, 0x80]));
        assert_eq!(big.pixel(2, 0), Some([1, 0, 0x80]));
        assert_eq!(big.pixel(3, 1), Some([1, 0, 0x80]));
        assert_eq!(big.pixel(4, 0), None);
    }

    #[test]
    fn test_resize_checks_buffers() {
        let mut dst = vec![0u8; 2 * 2 * 3];
        assert!(matches!(
            resize_nearest(&[0; 5], 1, 2, &mut dst, 2, 2),
            Err(RelayError::FrameSizeMismatch { expected: 6, got: 5 })
        ));
        assert!(matches!(
            resize_nearest(&[0; 6], 1, 2, &mut dst[..4], 2, 2),
            Err(RelayError::FrameSizeMismatch { expected: 12, got: 4 })
        ));
        assert!(matches!(
            resize_nearest(&[], 0, 2, &mut dst, 2, 2),
            Err(RelayError::InvalidDimensions { .. })
        ));
        resize_nearest(&[1, 2, 3, 4, 5, 6], 1, 2, &mut dst, 2, 2).unwrap();
        assert_eq!(dst, [1, 2, 3, 1, 2, 3, 4, 5, 6, 4, 5, 6]);
    }

    #[test]
    fn test_ppm_header() {
        let frame = Frame::from_pixels(1, 1, vec![1, 2, 3]).unwrap();
        let mut out = Vec::new();
        frame.write_ppm(&mut out).unwrap();
        assert_eq!(out, b"P6\n1 1\n255\n\x01\x02\x03");
    }

    #[test]
    fn test_latency_needs_write_time() {
        let frame = Frame::new(1, 1).unwrap();
        assert!(frame.latency().is_none());
    }
}
