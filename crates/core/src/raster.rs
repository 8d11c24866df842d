//! In-memory raster buffers exchanged between pipeline stages.

use anyhow::{bail, Result};
use image::{DynamicImage, RgbImage};
use ndarray::{Array3, ArrayView3};

/// Interleaved `height × width × channels` buffer of `f32` samples in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    data: Array3<f32>,
}

impl Image {
    /// Black image of the given size.
    pub fn new(width: u32, height: u32, channels: usize) -> Self {
        Self {
            data: Array3::zeros((height as usize, width as usize, channels)),
        }
    }

    /// Wrap an HWC array.
    pub fn from_array(data: Array3<f32>) -> Self {
        Self { data }
    }

    pub fn from_fn<F>(width: u32, height: u32, channels: usize, mut f: F) -> Self
    where
        F: FnMut(u32, u32, usize) -> f32,
    {
        let data = Array3::from_shape_fn(
            (height as usize, width as usize, channels),
            |(y, x, c)| f(x as u32, y as u32, c),
        );
        Self { data }
    }

    pub fn width(&self) -> u32 {
        self.data.shape()[1] as u32
    }

    pub fn height(&self) -> u32 {
        self.data.shape()[0] as u32
    }

    pub fn channels(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn get(&self, x: u32, y: u32, channel: usize) -> f32 {
        self.data[[y as usize, x as usize, channel]]
    }

    pub fn pixels(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// Bytes held by the sample buffer.
    pub fn byte_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    pub fn from_rgb8(rgb: &RgbImage) -> Self {
        let (width, height) = rgb.dimensions();
        let raw = rgb.as_raw();
        let data = Array3::from_shape_fn((height as usize, width as usize, 3), |(y, x, c)| {
            raw[(y * width as usize + x) * 3 + c] as f32 / 255.0
        });
        Self { data }
    }

    /// Any decoded image, flattened to 8-bit RGB first.
    pub fn from_dynamic(image: &DynamicImage) -> Self {
        Self::from_rgb8(&image.to_rgb8())
    }

    /// Quantize back to 8-bit RGB, rounding and clamping each sample.
    pub fn to_rgb8(&self) -> Result<RgbImage> {
        if self.channels() != 3 {
            bail!(
                "cannot encode a {}-channel image as RGB8",
                self.channels()
            );
        }

        let mut raw = Vec::with_capacity(self.data.len());
        for sample in self.data.iter() {
            raw.push(quantize_unit_sample(*sample));
        }

        match RgbImage::from_raw(self.width(), self.height(), raw) {
            Some(rgb) => Ok(rgb),
            None => bail!(
                "RGB8 buffer does not match {}x{} dimensions",
                self.width(),
                self.height()
            ),
        }
    }
}

fn quantize_unit_sample(sample: f32) -> u8 {
    (sample * 255.0).round().clamp(0.0, 255.0) as u8
}
