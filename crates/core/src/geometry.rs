//! Tile layout: where each tile reads from the source image and where its
//! upscaled result lands on the output canvas.
//!
//! Tiles form a row-major grid of core cells of `tile_size` pixels; the last
//! column and row are shrunk to end exactly at the image edge, so core cells
//! partition the image. Each core cell is read together with `overlap` pixels
//! of context on its interior-facing sides; the upscaled context is what the
//! blender cross-fades between neighbours.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Exclusive right edge.
    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && (x as u64) < self.right() && y >= self.y && (y as u64) < self.bottom()
    }

    /// True when the rect is non-empty and lies inside a `width × height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.right() <= width as u64
            && self.bottom() <= height as u64
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Region read from the source for one tile. The origin is signed because
/// replicated context may start left of or above the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaddedRect {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Margins {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Margins {
    pub const ZERO: Margins = Margins {
        left: 0,
        top: 0,
        right: 0,
        bottom: 0,
    };

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

/// What to do with context pixels on sides that face the image border.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgePadding {
    /// Only pad interior-facing sides, and never beyond the image.
    #[default]
    Omit,
    /// Pad every side with `overlap` pixels, replicating the edge row/column
    /// where the padding leaves the image.
    Replicate,
}

impl EdgePadding {
    /// Parse from string (case-insensitive). Returns `Omit` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "replicate" | "edge" => Self::Replicate,
            _ => Self::Omit,
        }
    }
}

impl fmt::Display for EdgePadding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replicate => write!(f, "replicate"),
            Self::Omit => write!(f, "omit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileDescriptor {
    /// Position in row-major order.
    pub index: usize,
    pub column: u32,
    pub row: u32,
    /// Core cell in source coordinates.
    pub source_rect: Rect,
    /// Core cell plus context, in source coordinates.
    pub padded_rect: PaddedRect,
    /// `source_rect` scaled into output coordinates.
    pub dest_rect: Rect,
    /// Blend half-width per side: `overlap` where a neighbour exists, 0 at the image edge.
    pub overlap: Margins,
}

impl TileDescriptor {
    /// Context pixels read around the core cell on each side.
    pub fn padding(&self) -> Margins {
        let left = (self.source_rect.x as i64 - self.padded_rect.x) as u32;
        let top = (self.source_rect.y as i64 - self.padded_rect.y) as u32;
        Margins {
            left,
            top,
            right: self.padded_rect.width - self.source_rect.width - left,
            bottom: self.padded_rect.height - self.source_rect.height - top,
        }
    }

    /// Output-space origin of the upscaled padded tile. May be negative.
    pub fn padded_dest_origin(&self, scale: u32) -> (i64, i64) {
        (
            self.padded_rect.x * scale as i64,
            self.padded_rect.y * scale as i64,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    pub columns: u32,
    pub rows: u32,
    pub scale: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub tiles: Vec<TileDescriptor>,
}

impl TileGrid {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

/// One axis of the grid: core start/length plus context and blend margins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AxisSpan {
    start: u32,
    len: u32,
    pad_before: u32,
    pad_after: u32,
    overlap_before: u32,
    overlap_after: u32,
}

fn axis_spans(extent: u32, tile_size: u32, overlap: u32, edge: EdgePadding) -> Vec<AxisSpan> {
    let count = extent.div_ceil(tile_size);
    (0..count)
        .map(|i| {
            let start = i * tile_size;
            let len = tile_size.min(extent - start);
            let end = start + len;
            let first = i == 0;
            let last = i + 1 == count;

            let (pad_before, pad_after) = match edge {
                EdgePadding::Replicate => (overlap, overlap),
                EdgePadding::Omit => (
                    if first { 0 } else { overlap.min(start) },
                    if last { 0 } else { overlap.min(extent - end) },
                ),
            };

            AxisSpan {
                start,
                len,
                pad_before,
                pad_after,
                overlap_before: if first { 0 } else { overlap },
                overlap_after: if last { 0 } else { overlap },
            }
        })
        .collect()
}

/// Lay out the tile grid for a `width × height` image.
pub fn compute_tiles(
    width: u32,
    height: u32,
    tile_size: u32,
    overlap: u32,
    scale: u32,
    edge: EdgePadding,
) -> Result<TileGrid, TileError> {
    if width == 0 || height == 0 {
        return Err(TileError::configuration(format!(
            "image must be non-empty, got {width}x{height}"
        )));
    }
    if scale == 0 {
        return Err(TileError::configuration("scale factor must be at least 1"));
    }
    if tile_size == 0 || tile_size as u64 <= 2 * overlap as u64 {
        return Err(TileError::configuration(format!(
            "tile_size ({tile_size}) must be greater than twice the overlap ({overlap})"
        )));
    }

    let output_width = width
        .checked_mul(scale)
        .ok_or_else(|| TileError::configuration(format!("output width {width}x{scale} overflows")))?;
    let output_height = height.checked_mul(scale).ok_or_else(|| {
        TileError::configuration(format!("output height {height}x{scale} overflows"))
    })?;

    let columns = axis_spans(width, tile_size, overlap, edge);
    let rows = axis_spans(height, tile_size, overlap, edge);

    let mut tiles = Vec::with_capacity(columns.len() * rows.len());
    for (row, ys) in rows.iter().enumerate() {
        for (column, xs) in columns.iter().enumerate() {
            let source_rect = Rect::new(xs.start, ys.start, xs.len, ys.len);
            let padded_rect = PaddedRect {
                x: xs.start as i64 - xs.pad_before as i64,
                y: ys.start as i64 - ys.pad_before as i64,
                width: xs.len + xs.pad_before + xs.pad_after,
                height: ys.len + ys.pad_before + ys.pad_after,
            };
            // Derived from the absolute offset so rounding never accumulates.
            let dest_rect = Rect::new(
                xs.start * scale,
                ys.start * scale,
                xs.len * scale,
                ys.len * scale,
            );

            tiles.push(TileDescriptor {
                index: tiles.len(),
                column: column as u32,
                row: row as u32,
                source_rect,
                padded_rect,
                dest_rect,
                overlap: Margins {
                    left: xs.overlap_before,
                    top: ys.overlap_before,
                    right: xs.overlap_after,
                    bottom: ys.overlap_after,
                },
            });
        }
    }

    Ok(TileGrid {
        columns: columns.len() as u32,
        rows: rows.len() as u32,
        scale,
        output_width,
        output_height,
        tiles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(w: u32, h: u32, tile: u32, overlap: u32, scale: u32) -> TileGrid {
        compute_tiles(w, h, tile, overlap, scale, EdgePadding::Replicate).unwrap()
    }

    #[test]
    fn test_300px_image_with_256_tiles_is_two_by_two() {
        let g = grid(300, 300, 256, 16, 4);
        assert_eq!((g.columns, g.rows), (2, 2));
        assert_eq!(g.len(), 4);
        assert_eq!((g.output_width, g.output_height), (1200, 1200));

        let last = g.tiles[3];
        assert_eq!(last.source_rect, Rect::new(256, 256, 44, 44));
        assert_eq!(last.dest_rect, Rect::new(1024, 1024, 176, 176));
    }

    #[test]
    fn test_single_tile_has_no_overlap() {
        let g = grid(100, 80, 256, 16, 2);
        assert_eq!(g.len(), 1);
        let tile = g.tiles[0];
        assert_eq!(tile.source_rect, Rect::new(0, 0, 100, 80));
        assert!(tile.overlap.is_zero());
        assert_eq!(tile.dest_rect, Rect::new(0, 0, 200, 160));

        let default = compute_tiles(100, 80, 256, 16, 2, EdgePadding::default()).unwrap();
        let tile = default.tiles[0];
        assert!(tile.overlap.is_zero());
        assert!(tile.padding().is_zero());
        assert_eq!(tile.padded_rect.width, 100);
        assert_eq!(tile.padded_rect.height, 80);
    }

    #[test]
    fn test_interior_sides_get_overlap_edges_do_not() {
        let g = grid(600, 300, 256, 16, 1);
        assert_eq!((g.columns, g.rows), (3, 2));

        let middle_top = g.tiles[1];
        assert_eq!(
            middle_top.overlap,
            Margins {
                left: 16,
                top: 0,
                right: 16,
                bottom: 16
            }
        );

        let bottom_right = g.tiles[5];
        assert_eq!(
            bottom_right.overlap,
            Margins {
                left: 16,
                top: 16,
                right: 0,
                bottom: 0
            }
        );
    }

    #[test]
    fn test_replicate_pads_every_side() {
        let g = grid(300, 300, 256, 16, 1);
        let first = g.tiles[0];
        assert_eq!(
            first.padded_rect,
            PaddedRect {
                x: -16,
                y: -16,
                width: 288,
                height: 288
            }
        );
        assert_eq!(
            first.padding(),
            Margins {
                left: 16,
                top: 16,
                right: 16,
                bottom: 16
            }
        );
    }

    #[test]
    fn test_omit_clips_padding_to_image() {
        // Last column is only 4px wide, so the first column's right padding
        // can only reach 4px into it.
        let g = compute_tiles(260, 100, 256, 16, 1, EdgePadding::Omit).unwrap();
        let first = g.tiles[0];
        assert_eq!(first.padded_rect.x, 0);
        assert_eq!(first.padding().right, 4);
        assert_eq!(first.overlap.right, 16);

        let last = g.tiles[1];
        assert_eq!(last.padded_rect.x, 240);
        assert_eq!(last.padded_rect.width, 20);
        assert_eq!(last.padding().right, 0);
    }

    #[test]
    fn test_dest_offsets_are_absolute() {
        let g = grid(1000, 10, 96, 8, 3);
        for tile in &g.tiles {
            assert_eq!(tile.dest_rect.x, tile.source_rect.x * 3);
            assert_eq!(tile.dest_rect.width, tile.source_rect.width * 3);
        }
        let last = g.tiles.last().unwrap();
        assert_eq!(last.dest_rect.right(), 3000);
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        let err = compute_tiles(100, 100, 32, 16, 4, EdgePadding::Replicate).unwrap_err();
        assert!(matches!(err, TileError::Configuration(_)));
        assert!(err.to_string().contains("twice the overlap"));

        assert!(compute_tiles(100, 100, 0, 0, 4, EdgePadding::Replicate).is_err());
        assert!(compute_tiles(0, 100, 64, 8, 4, EdgePadding::Replicate).is_err());
        assert!(compute_tiles(100, 0, 64, 8, 4, EdgePadding::Replicate).is_err());
        assert!(compute_tiles(100, 100, 64, 8, 0, EdgePadding::Replicate).is_err());
        assert!(compute_tiles(u32::MAX, 1, 64, 8, 2, EdgePadding::Replicate).is_err());
    }

    #[test]
    fn test_zero_overlap_is_allowed() {
        let g = grid(130, 64, 64, 0, 2);
        assert_eq!(g.columns, 3);
        assert!(g.tiles.iter().all(|t| t.overlap.is_zero() && t.padding().is_zero()));
    }

    #[test]
    fn test_edge_padding_parse_and_display() {
        assert_eq!(EdgePadding::from_str_lossy("omit"), EdgePadding::Omit);
        assert_eq!(EdgePadding::from_str_lossy("CLAMP"), EdgePadding::Omit);
        assert_eq!(EdgePadding::from_str_lossy("replicate"), EdgePadding::Replicate);
        assert_eq!(EdgePadding::from_str_lossy("???"), EdgePadding::Omit);
        assert_eq!(EdgePadding::default(), EdgePadding::Omit);
        assert_eq!(EdgePadding::Omit.to_string(), "omit");
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_core_cells_partition_the_image(
                width in 1u32..700,
                height in 1u32..700,
                tile_size in 8u32..300,
                overlap_frac in 0.0f64..0.49,
                scale in 1u32..5,
                omit in any::<bool>(),
            ) {
                let overlap = (tile_size as f64 * overlap_frac) as u32;
                let edge = if omit { EdgePadding::Omit } else { EdgePadding::Replicate };
                let g = compute_tiles(width, height, tile_size, overlap, scale, edge).unwrap();

                let covered: u64 = g.tiles.iter().map(|t| t.source_rect.area()).sum();
                prop_assert_eq!(covered, width as u64 * height as u64);

                let dest_covered: u64 = g.tiles.iter().map(|t| t.dest_rect.area()).sum();
                prop_assert_eq!(dest_covered, g.output_width as u64 * g.output_height as u64);

                for t in &g.tiles {
                    prop_assert!(t.source_rect.fits_within(width, height));
                    prop_assert!(t.dest_rect.fits_within(g.output_width, g.output_height));
                    prop_assert!(t.padded_rect.x <= t.source_rect.x as i64);
                    prop_assert!(t.padded_rect.y <= t.source_rect.y as i64);
                    if omit {
                        prop_assert!(t.padded_rect.x >= 0 && t.padded_rect.y >= 0);
                        prop_assert!(t.padded_rect.x + t.padded_rect.width as i64 <= width as i64);
                        prop_assert!(t.padded_rect.y + t.padded_rect.height as i64 <= height as i64);
                    }
                }

                // Sampled pixels land in exactly one core cell.
                for (px, py) in [(0, 0), (width - 1, height - 1), (width / 2, height / 3)] {
                    let hits = g.tiles.iter().filter(|t| t.source_rect.contains(px, py)).count();
                    prop_assert_eq!(hits, 1);
                }
            }

            #[test]
            fn test_layout_is_deterministic(
                width in 1u32..2000,
                height in 1u32..2000,
                tile_size in 33u32..512,
                overlap in 0u32..16,
            ) {
                let a = compute_tiles(width, height, tile_size, overlap, 4, EdgePadding::Replicate).unwrap();
                let b = compute_tiles(width, height, tile_size, overlap, 4, EdgePadding::Replicate).unwrap();
                prop_assert_eq!(a, b);
            }
        }
    }
}
