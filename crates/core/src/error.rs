//! Error taxonomy for the tiling pipeline.
//!
//! [`TileError`] and [`InferenceError`] describe what went wrong inside one
//! stage; [`UpscaleError`] is the single failure an `upscale` call surfaces,
//! with the failing tile and the underlying cause reachable through
//! [`std::error::Error::source`].

use crate::geometry::Rect;

/// Failure reported by an [`UpscaleModel`](crate::model::UpscaleModel).
#[derive(thiserror::Error, Debug)]
pub enum InferenceError {
    /// Runtime failure of the inference backend (allocation, device, session).
    /// Usually transient, so the pipeline retries it.
    #[error("inference backend error: {0}")]
    Backend(String),

    /// The model cannot accept this input at all; retrying will not help.
    #[error("unsupported tile input: {0}")]
    Input(String),
}

impl InferenceError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

impl From<ort::Error> for InferenceError {
    fn from(error: ort::Error) -> Self {
        Self::Backend(error.to_string())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TileError {
    #[error("invalid tiling configuration: {0}")]
    Configuration(String),

    #[error("tile rect {rect} lies outside the {width}x{height} image")]
    OutOfBounds { rect: Rect, width: u32, height: u32 },

    #[error(
        "model output has shape {actual_width}x{actual_height}x{actual_channels}, \
         expected {expected_width}x{expected_height}x{expected_channels}"
    )]
    OutputShape {
        expected_width: u32,
        expected_height: u32,
        expected_channels: usize,
        actual_width: u32,
        actual_height: u32,
        actual_channels: usize,
    },

    #[error("output pixel ({x}, {y}) received no tile contribution")]
    Uncovered { x: u32, y: u32 },

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

impl TileError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the pipeline may retry the tile that produced this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Inference(inner) => inner.is_transient(),
            _ => false,
        }
    }
}

/// The terminal failure of one `upscale` call. A partial image is never
/// returned alongside it.
#[derive(thiserror::Error, Debug)]
pub enum UpscaleError {
    #[error("upscale rejected before processing")]
    Rejected(#[source] TileError),

    #[error("tile {index} (column {column}, row {row}) failed after {attempts} attempt(s)")]
    TileFailed {
        index: usize,
        column: u32,
        row: u32,
        attempts: u32,
        #[source]
        source: TileError,
    },

    #[error("upscale produced an inconsistent canvas")]
    Assembly(#[source] TileError),

    #[error("upscale cancelled after {completed}/{total} tiles")]
    Cancelled { completed: usize, total: usize },
}

/// A batch file that was never attempted because the batch was cancelled
/// before reaching it.
#[derive(thiserror::Error, Debug)]
#[error("skipped: batch cancelled")]
pub struct BatchCancelled;

impl UpscaleError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Index of the tile that caused the failure, when one did.
    pub fn tile_index(&self) -> Option<usize> {
        match self {
            Self::TileFailed { index, .. } => Some(*index),
            _ => None,
        }
    }
}
