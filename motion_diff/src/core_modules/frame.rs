// THEORY:
// A `Frame` is a decoded pixel buffer: `width * height` RGBA8 pixels in row-major
// order. It is the only shape the diff engine understands. Frames are decoded on
// demand by whichever endpoint needs them and are never shared across endpoints;
// what crosses the fabric is always the encoded file bytes.
//
// Decoding and encoding go through the `image` crate. Every diff frame is written
// back as PNG, the same encoding the frame-extraction collaborator produces.

use crate::core_modules::pixel::pixel::CHANNELS;
use image::ImageEncoder;
use image::codecs::png::PngEncoder;
use std::path::Path;
use thiserror::Error;

/// A frame (or a pair of frames) that cannot be turned into pixels.
/// Recovered locally: the affected frame pair is skipped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame {name} is empty")]
    Empty { name: String },
    #[error("cannot read frame {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode frame {name}: {source}")]
    Image {
        name: String,
        #[source]
        source: image::ImageError,
    },
    #[error("frame size mismatch: {previous:?} vs {current:?}")]
    SizeMismatch {
        previous: (u32, u32),
        current: (u32, u32),
    },
    #[error("cannot encode diff frame: {0}")]
    Encode(#[source] image::ImageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Packed RGBA8, `width * height * 4` bytes.
    pub data: Vec<u8>,
}

impl Frame {
    /// Wraps an RGBA8 buffer. Returns `None` when the buffer length does not match.
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() != width as usize * height as usize * CHANNELS {
            return None;
        }
        Some(Self { width, height, data })
    }

    /// A frame filled with a single RGBA value.
    pub fn filled(width: u32, height: u32, rgba: [u8; CHANNELS]) -> Self {
        let data = rgba.repeat(width as usize * height as usize);
        Self { width, height, data }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Decodes an encoded image (any format `image` can guess) into RGBA8.
    /// `name` is only used to attribute errors.
    pub fn decode(name: &str, bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty { name: name.to_string() });
        }
        let decoded = image::load_from_memory(bytes).map_err(|source| DecodeError::Image {
            name: name.to_string(),
            source,
        })?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(Self {
            width,
            height,
            data: rgba.into_raw(),
        })
    }

    /// Reads and decodes a frame file.
    pub fn load(path: &Path) -> Result<Self, DecodeError> {
        let name = path.display().to_string();
        let bytes = std::fs::read(path).map_err(|source| DecodeError::Read {
            name: name.clone(),
            source,
        })?;
        Self::decode(&name, &bytes)
    }

    /// Encodes the frame as an RGBA8 PNG.
    pub fn encode_png(&self) -> Result<Vec<u8>, DecodeError> {
        let mut output = Vec::with_capacity(self.data.len() / 2);
        let encoder = PngEncoder::new(&mut output);
        encoder
            .write_image(
                &self.data,
                self.width,
                self.height,
                image::ExtendedColorType::Rgba8,
            )
            .map_err(DecodeError::Encode)?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for i in 0..width * height {
            let v = (i % 255) as u8;
            data.extend_from_slice(&[v, v / 2, 255 - v, 255]);
        }
        Frame::from_rgba(width, height, data).expect("valid buffer")
    }

    #[test]
    fn png_encoding_preserves_pixels() {
        let frame = gradient(37, 11);
        let png = frame.encode_png().expect("encode");
        let decoded = Frame::decode("gradient", &png).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn non_square_frames_keep_their_orientation() {
        let frame = Frame::filled(8, 3, [1, 2, 3, 255]);
        let decoded = Frame::decode("wide", &frame.encode_png().expect("encode")).expect("decode");
        assert_eq!((decoded.width, decoded.height), (8, 3));
    }

    #[test]
    fn empty_and_garbage_payloads_are_decode_errors() {
        assert!(matches!(Frame::decode("empty", &[]), Err(DecodeError::Empty { .. })));
        assert!(matches!(
            Frame::decode("garbage", b"definitely not a png"),
            Err(DecodeError::Image { .. })
        ));
    }

    #[test]
    fn from_rgba_rejects_short_buffers() {
        assert!(Frame::from_rgba(2, 2, vec![0; 15]).is_none());
    }
}
