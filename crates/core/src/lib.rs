//! Tiled super-resolution: split an image into overlapping tiles, upscale
//! each tile with a model, and blend the results back into one seamless
//! image.

pub mod backend;
pub mod blend;
pub mod config;
pub mod error;
pub mod extract;
pub mod geometry;
pub mod logging;
pub mod model;
pub mod model_registry;
pub mod onnx;
pub mod pipeline;
pub mod raster;
pub mod runtime;
pub mod service;

pub use error::{BatchCancelled, InferenceError, TileError, UpscaleError};
pub use geometry::{compute_tiles, EdgePadding, Rect, TileDescriptor, TileGrid};
pub use model::{NearestNeighbor, UpscaleModel};
pub use pipeline::{CancelFlag, TilePipeline, TilingOptions, UpscaleContext, UpscaleEvent};
pub use raster::Image;
