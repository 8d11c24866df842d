//! Copying a tile's padded region out of the source image.

use ndarray::Array3;

use crate::error::TileError;
use crate::geometry::TileDescriptor;
use crate::raster::Image;

/// Pixels of one tile in flight, together with where they belong.
///
/// Before inference `pixels` covers `descriptor.padded_rect`; after
/// inference it covers the same region scaled by the model factor.
#[derive(Debug, Clone)]
pub struct TileBuffer {
    pub descriptor: TileDescriptor,
    pub pixels: Image,
}

impl TileBuffer {
    pub fn new(descriptor: TileDescriptor, pixels: Image) -> Self {
        Self { descriptor, pixels }
    }
}

/// Read `descriptor.padded_rect` from `image`, replicating the nearest edge
/// pixel for coordinates that fall outside it.
pub fn extract(image: &Image, descriptor: &TileDescriptor) -> Result<TileBuffer, TileError> {
    let (width, height) = (image.width(), image.height());
    if !descriptor.source_rect.fits_within(width, height) {
        return Err(TileError::OutOfBounds {
            rect: descriptor.source_rect,
            width,
            height,
        });
    }

    let padded = descriptor.padded_rect;
    let channels = image.channels();
    let max_x = width as i64 - 1;
    let max_y = height as i64 - 1;

    // Column lookup is shared by every row of the tile.
    let source_columns: Vec<usize> = (0..padded.width as i64)
        .map(|dx| (padded.x + dx).clamp(0, max_x) as usize)
        .collect();

    let src = image.pixels();
    let mut out = Array3::<f32>::zeros((padded.height as usize, padded.width as usize, channels));
    for dy in 0..padded.height as usize {
        let sy = (padded.y + dy as i64).clamp(0, max_y) as usize;
        for (dx, &sx) in source_columns.iter().enumerate() {
            for c in 0..channels {
                out[[dy, dx, c]] = src[[sy, sx, c]];
            }
        }
    }

    Ok(TileBuffer::new(*descriptor, Image::from_array(out)))
}
