//! Interleaved 8-bit, 3-channel pixel buffers with an explicit channel order.
//!
//! The swap backend works in BGR (the order its model pipeline was exported
//! for) while the `image` encoders expect RGB, so every buffer carries the
//! order it was produced in and is converted before encoding.

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

/// JPEG quality used for results unless configured otherwise.
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

#[derive(Error, Debug)]
pub enum PixelError {
    #[error("pixel buffer length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("image codec: {0}")]
    Codec(#[from] image::ImageError),
}

/// A decoded image as `width * height * 3` interleaved bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    order: ChannelOrder,
    data: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, order: ChannelOrder, data: Vec<u8>) -> Result<Self, PixelError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(PixelError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { width, height, order, data })
    }

    /// A buffer filled with zeros (black).
    pub fn zeroed(width: u32, height: u32, order: ChannelOrder) -> Self {
        Self {
            width,
            height,
            order,
            data: vec![0u8; width as usize * height as usize * 3],
        }
    }

    pub fn from_rgb_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            order: ChannelOrder::Rgb,
            data: image.into_raw(),
        }
    }

    /// Decode an image file from disk into the requested channel order.
    pub fn open(path: &Path, order: ChannelOrder) -> Result<Self, PixelError> {
        let rgb = image::open(path)?.to_rgb8();
        Ok(Self::from_rgb_image(rgb).into_order(order))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn order(&self) -> ChannelOrder {
        self.order
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Return the buffer in `order`, swapping the first and third channel
    /// of every pixel when it differs from the current one.
    pub fn into_order(mut self, order: ChannelOrder) -> Self {
        if self.order != order {
            for px in self.data.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            self.order = order;
        }
        self
    }

    pub fn into_rgb_image(self) -> Result<RgbImage, PixelError> {
        let rgb = self.into_order(ChannelOrder::Rgb);
        let actual = rgb.data.len();
        RgbImage::from_raw(rgb.width, rgb.height, rgb.data).ok_or(PixelError::LengthMismatch {
            expected: rgb.width as usize * rgb.height as usize * 3,
            actual,
        })
    }

    /// Encode as baseline JPEG, converting to RGB first.
    pub fn encode_jpeg(self, quality: u8) -> Result<Vec<u8>, PixelError> {
        let rgb = self.into_rgb_image()?;
        let mut out = Vec::new();
        rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))?;
        Ok(out)
    }
}
