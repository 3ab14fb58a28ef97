//! PNG encoding of engine pixmaps.
//!
//! The engine paints 32-bit pixels in the byte order reported by
//! `getTileMode()`; the encoder normalizes to RGBA and appends a complete
//! PNG stream to the caller's buffer.

use std::os::raw::c_int;

use crate::error::{KitError, Result};

/// Pixel byte order of an engine-painted pixmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileMode {
    Rgba,
    Bgra,
}

impl TileMode {
    pub fn from_raw(raw: c_int) -> Result<Self> {
        match raw {
            0 => Ok(Self::Rgba),
            1 => Ok(Self::Bgra),
            other => Err(KitError::Engine(format!("unknown tile mode {other}"))),
        }
    }
}

/// Encode a whole pixmap of `width` x `height` pixels.
pub fn encode_buffer(
    pixmap: &[u8],
    width: u32,
    height: u32,
    mode: TileMode,
    output: &mut Vec<u8>,
) -> Result<()> {
    encode_sub_buffer(pixmap, 0, 0, width, height, width, height, mode, output)
}

/// Encode the `width` x `height` rectangle at (`start_x`, `start_y`) of a
/// pixmap that is `buffer_width` x `buffer_height` pixels overall.
#[allow(clippy::too_many_arguments)]
pub fn encode_sub_buffer(
    pixmap: &[u8],
    start_x: u32,
    start_y: u32,
    width: u32,
    height: u32,
    buffer_width: u32,
    buffer_height: u32,
    mode: TileMode,
    output: &mut Vec<u8>,
) -> Result<()> {
    let needed = 4 * buffer_width as usize * buffer_height as usize;
    if pixmap.len() < needed
        || start_x + width > buffer_width
        || start_y + height > buffer_height
    {
        return Err(KitError::Engine(format!(
            "pixmap of {} bytes cannot hold {}x{} rect at ({}, {}) in a {}x{} buffer",
            pixmap.len(),
            width,
            height,
            start_x,
            start_y,
            buffer_width,
            buffer_height
        )));
    }

    let mut rgba = Vec::with_capacity(4 * width as usize * height as usize);
    let stride = 4 * buffer_width as usize;
    for row in start_y..start_y + height {
        let begin = row as usize * stride + 4 * start_x as usize;
        let line = &pixmap[begin..begin + 4 * width as usize];
        match mode {
            TileMode::Rgba => rgba.extend_from_slice(line),
            TileMode::Bgra => {
                for px in line.chunks_exact(4) {
                    rgba.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
                }
            }
        }
    }

    let mut encoder = png::Encoder::new(&mut *output, width, height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&rgba)?;
    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

    fn checker(width: u32, height: u32) -> Vec<u8> {
        let mut pixmap = Vec::with_capacity(4 * (width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = if (x + y) % 2 == 0 { 0xff } else { 0x00 };
                pixmap.extend_from_slice(&[v, 0x10, 0x20, 0xff]);
            }
        }
        pixmap
    }

    fn decode(data: &[u8]) -> (png::OutputInfo, Vec<u8>) {
        let decoder = png::Decoder::new(data);
        let mut reader = decoder.read_info().unwrap();
        let mut buf = vec![0; reader.output_buffer_size()];
        let info = reader.next_frame(&mut buf).unwrap();
        buf.truncate(info.buffer_size());
        (info, buf)
    }

    #[test]
    fn test_encode_produces_valid_png() {
        let pixmap = checker(8, 8);
        let mut out = Vec::new();
        encode_buffer(&pixmap, 8, 8, TileMode::Rgba, &mut out).unwrap();

        assert_eq!(&out[..8], &PNG_MAGIC);
        let (info, decoded) = decode(&out);
        assert_eq!((info.width, info.height), (8, 8));
        assert_eq!(decoded, pixmap);
    }

    #[test]
    fn test_bgra_swizzle() {
        let pixmap = vec![0x01, 0x02, 0x03, 0xff];
        let mut out = Vec::new();
        encode_buffer(&pixmap, 1, 1, TileMode::Bgra, &mut out).unwrap();

        let (_, decoded) = decode(&out);
        assert_eq!(decoded, vec![0x03, 0x02, 0x01, 0xff]);
    }

    #[test]
    fn test_sub_buffer_matches_direct_encode() {
        // Encoding a sub-rectangle of a large pixmap must equal encoding
        // the same pixels as a standalone buffer.
        let big = checker(16, 16);
        let mut sub = Vec::new();
        for y in 4..12 {
            let begin = (y * 16 + 8) * 4;
            sub.extend_from_slice(&big[begin..begin + 8 * 4]);
        }

        let mut from_sub_rect = Vec::new();
        encode_sub_buffer(&big, 8, 4, 8, 8, 16, 16, TileMode::Rgba, &mut from_sub_rect).unwrap();

        let mut from_direct = Vec::new();
        encode_buffer(&sub, 8, 8, TileMode::Rgba, &mut from_direct).unwrap();

        assert_eq!(from_sub_rect, from_direct);
    }

    #[test]
    fn test_encode_appends_after_existing_bytes() {
        let pixmap = checker(4, 4);
        let mut out = b"tile: header\n".to_vec();
        encode_buffer(&pixmap, 4, 4, TileMode::Rgba, &mut out).unwrap();
        assert!(out.starts_with(b"tile: header\n"));
        assert_eq!(&out[13..21], &PNG_MAGIC);
    }

    #[test]
    fn test_rejects_short_pixmap() {
        let pixmap = vec![0u8; 8];
        let mut out = Vec::new();
        assert!(encode_buffer(&pixmap, 4, 4, TileMode::Rgba, &mut out).is_err());
    }

    #[test]
    fn test_rejects_out_of_bounds_rect() {
        let pixmap = checker(4, 4);
        let mut out = Vec::new();
        assert!(
            encode_sub_buffer(&pixmap, 2, 2, 4, 4, 4, 4, TileMode::Rgba, &mut out).is_err()
        );
    }
}
