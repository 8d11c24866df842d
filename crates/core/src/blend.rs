//! Weighted accumulation of upscaled tiles into the output canvas.
//!
//! Each tile contributes over its whole padded destination area, weighted by
//! a [`BlendWeightMask`]. Around every boundary shared by two tiles there is
//! a band `2 · overlap · scale` pixels wide in which one tile ramps down while
//! the other ramps up, so the weights at any output pixel sum to one and the
//! seam disappears after [`Canvas::normalize`].

use std::collections::HashMap;
use std::sync::Arc;

use ndarray::{Array2, Array3};

use crate::error::TileError;
use crate::extract::TileBuffer;
use crate::geometry::{Margins, TileDescriptor};
use crate::raster::Image;

/// Lower bound applied to every mask weight.
pub const BLEND_WEIGHT_FLOOR: f32 = 1e-4;

#[derive(Debug, Clone, PartialEq)]
pub struct BlendWeightMask {
    weights: Array2<f32>,
}

impl BlendWeightMask {
    /// Build the mask covering `descriptor.padded_rect` upscaled by `scale`.
    pub fn for_tile(descriptor: &TileDescriptor, scale: u32) -> Self {
        let padded = descriptor.padded_rect;
        let core = descriptor.source_rect;
        let overlap = descriptor.overlap;

        let horizontal = axis_profile(
            padded.x,
            padded.width,
            core.x,
            core.width,
            overlap.left,
            overlap.right,
            scale,
        );
        let vertical = axis_profile(
            padded.y,
            padded.height,
            core.y,
            core.height,
            overlap.top,
            overlap.bottom,
            scale,
        );

        let weights = Array2::from_shape_fn((vertical.len(), horizontal.len()), |(y, x)| {
            (vertical[y] * horizontal[x]).max(BLEND_WEIGHT_FLOOR)
        });
        Self { weights }
    }

    pub fn width(&self) -> u32 {
        self.weights.ncols() as u32
    }

    pub fn height(&self) -> u32 {
        self.weights.nrows() as u32
    }

    pub fn weight(&self, x: u32, y: u32) -> f32 {
        self.weights[[y as usize, x as usize]]
    }
}

/// Weight profile along one axis of a tile, in destination pixels.
///
/// `before`/`after` are the blend half-widths in source pixels on the low and
/// high side of the core. Positions are evaluated in absolute output
/// coordinates so both tiles sharing a band see the same `t`.
fn axis_profile(
    padded_origin: i64,
    padded_len: u32,
    core_start: u32,
    core_len: u32,
    before: u32,
    after: u32,
    scale: u32,
) -> Vec<f32> {
    let s = scale as i64;
    let core_lo = core_start as i64 * s;
    let core_hi = (core_start as i64 + core_len as i64) * s;
    let origin = padded_origin * s;

    (0..padded_len as i64 * s)
        .map(|i| {
            let a = origin + i;
            let mut w = 1.0f32;

            if before > 0 {
                let half = before as i64 * s;
                let band_lo = core_lo - half;
                if a < band_lo {
                    return 0.0;
                }
                if a < core_lo + half {
                    w *= ramp(a - band_lo, 2 * half);
                }
            } else if a < core_lo {
                return 0.0;
            }

            if after > 0 {
                let half = after as i64 * s;
                let band_lo = core_hi - half;
                if a >= core_hi + half {
                    return 0.0;
                }
                if a >= band_lo {
                    w *= 1.0 - ramp(a - band_lo, 2 * half);
                }
            } else if a >= core_hi {
                return 0.0;
            }

            w
        })
        .collect()
}

/// Rising edge of the cross-fade, sampled at pixel centres.
fn ramp(position: i64, band: i64) -> f32 {
    ((position as f64 + 0.5) / band as f64) as f32
}

/// Everything a mask depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MaskKey {
    padded_width: u32,
    padded_height: u32,
    core_width: u32,
    core_height: u32,
    pad_left: u32,
    pad_top: u32,
    overlap: Margins,
    scale: u32,
}

impl MaskKey {
    fn new(descriptor: &TileDescriptor, scale: u32) -> Self {
        let padding = descriptor.padding();
        Self {
            padded_width: descriptor.padded_rect.width,
            padded_height: descriptor.padded_rect.height,
            core_width: descriptor.source_rect.width,
            core_height: descriptor.source_rect.height,
            pad_left: padding.left,
            pad_top: padding.top,
            overlap: descriptor.overlap,
            scale,
        }
    }
}

/// Masks keyed by tile shape. Interior tiles of a grid all share one entry.
#[derive(Debug, Default)]
pub struct MaskCache {
    masks: HashMap<MaskKey, Arc<BlendWeightMask>>,
}

impl MaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, descriptor: &TileDescriptor, scale: u32) -> Arc<BlendWeightMask> {
        self.masks
            .entry(MaskKey::new(descriptor, scale))
            .or_insert_with(|| Arc::new(BlendWeightMask::for_tile(descriptor, scale)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }
}

/// Output accumulation buffer for one upscale call.
#[derive(Debug)]
pub struct Canvas {
    accum: Array3<f32>,
    weights: Array2<f32>,
    scale: u32,
}

impl Canvas {
    pub fn new(width: u32, height: u32, channels: usize, scale: u32) -> Self {
        Self {
            accum: Array3::zeros((height as usize, width as usize, channels)),
            weights: Array2::zeros((height as usize, width as usize)),
            scale,
        }
    }

    pub fn width(&self) -> u32 {
        self.weights.ncols() as u32
    }

    pub fn height(&self) -> u32 {
        self.weights.nrows() as u32
    }

    pub fn channels(&self) -> usize {
        self.accum.shape()[2]
    }

    /// Add an upscaled tile, weighted by `mask`, clipped to the canvas.
    pub fn blend(&mut self, tile: &TileBuffer, mask: &BlendWeightMask) -> Result<(), TileError> {
        let desc = &tile.descriptor;
        let expected_width = desc.padded_rect.width * self.scale;
        let expected_height = desc.padded_rect.height * self.scale;
        let pixels = &tile.pixels;

        if pixels.width() != expected_width
            || pixels.height() != expected_height
            || pixels.channels() != self.channels()
            || mask.width() != expected_width
            || mask.height() != expected_height
        {
            return Err(TileError::OutputShape {
                expected_width,
                expected_height,
                expected_channels: self.channels(),
                actual_width: pixels.width(),
                actual_height: pixels.height(),
                actual_channels: pixels.channels(),
            });
        }

        let (origin_x, origin_y) = desc.padded_dest_origin(self.scale);
        let canvas_w = self.width() as i64;
        let canvas_h = self.height() as i64;

        let x_lo = (-origin_x).clamp(0, expected_width as i64) as usize;
        let x_hi = (canvas_w - origin_x).clamp(0, expected_width as i64) as usize;
        let y_lo = (-origin_y).clamp(0, expected_height as i64) as usize;
        let y_hi = (canvas_h - origin_y).clamp(0, expected_height as i64) as usize;

        let src = pixels.pixels();
        let channels = self.channels();
        for ty in y_lo..y_hi {
            let cy = (origin_y + ty as i64) as usize;
            for tx in x_lo..x_hi {
                let cx = (origin_x + tx as i64) as usize;
                let w = mask.weights[[ty, tx]];
                self.weights[[cy, cx]] += w;
                for c in 0..channels {
                    self.accum[[cy, cx, c]] += src[[ty, tx, c]] * w;
                }
            }
        }

        Ok(())
    }

    /// Divide accumulated samples by their total weight.
    pub fn normalize(self) -> Result<Image, TileError> {
        let Canvas {
            mut accum, weights, ..
        } = self;

        for ((y, x), &w) in weights.indexed_iter() {
            if w <= 0.0 {
                return Err(TileError::Uncovered {
                    x: x as u32,
                    y: y as u32,
                });
            }
            for sample in accum.slice_mut(ndarray::s![y, x, ..]).iter_mut() {
                *sample /= w;
            }
        }

        Ok(Image::from_array(accum))
    }
}
