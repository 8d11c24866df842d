//! The contract between the tiling pipeline and whatever actually upscales
//! pixels.

use ndarray::Array3;

use crate::error::InferenceError;
use crate::raster::Image;

/// A fixed-factor upscaler applied to one tile at a time.
///
/// `upscale_tile` must return an image exactly `scale()` times the input in
/// each dimension with the same channel count. Implementations are shared
/// across worker threads; any interior state (a runtime session, a device
/// handle) must be synchronized by the implementation.
pub trait UpscaleModel: Send + Sync {
    fn name(&self) -> &str;

    fn scale(&self) -> u32;

    fn upscale_tile(&self, tile: &Image) -> Result<Image, InferenceError>;
}

/// Pixel replication. Every output pixel copies its source pixel, so tiled
/// and untiled runs must agree exactly.
#[derive(Debug, Clone)]
pub struct NearestNeighbor {
    name: String,
    scale: u32,
}

impl NearestNeighbor {
    pub fn new(scale: u32) -> Self {
        Self {
            name: format!("nearest-x{scale}"),
            scale,
        }
    }
}

impl UpscaleModel for NearestNeighbor {
    fn name(&self) -> &str {
        &self.name
    }

    fn scale(&self) -> u32 {
        self.scale
    }

    fn upscale_tile(&self, tile: &Image) -> Result<Image, InferenceError> {
        if self.scale == 0 {
            return Err(InferenceError::input("scale factor must be at least 1"));
        }
        let s = self.scale as usize;
        let src = tile.pixels();
        let (h, w, c) = src.dim();
        let out = Array3::from_shape_fn((h * s, w * s, c), |(y, x, ch)| src[[y / s, x / s, ch]]);
        Ok(Image::from_array(out))
    }
}
