//! [`UpscaleModel`] backed by an ONNX Runtime session.
//!
//! Supports FP32 models (e.g. Real-ESRGAN anime, value range 0–255) and FP16
//! models (value range 0–1). Tiles are reflection-padded up to the model's
//! spatial alignment before inference and cropped back afterwards.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{s, Array3, Array4, ArrayD, ArrayViewD, IxDyn};
use ort::{session::Session, value::Tensor};
use tracing::{debug, warn};

use crate::backend::{build_session, InferenceBackend, SessionConfig};
use crate::error::InferenceError;
use crate::model::UpscaleModel;
use crate::model_registry::ModelEntry;
use crate::raster::Image;

pub struct OnnxUpscaler {
    name: String,
    scale: u32,
    normalization_range: (f32, f32),
    pad_align: usize,
    is_fp16: bool,
    input_name: String,
    output_name: String,
    session: Mutex<Session>,
}

impl OnnxUpscaler {
    pub fn load(
        model_path: &Path,
        entry: &ModelEntry,
        backend: InferenceBackend,
        trt_cache_dir: Option<&Path>,
    ) -> Result<Self> {
        debug!(
            model = %model_path.display(),
            name = %entry.name,
            scale = entry.scale,
            backend = %backend,
            "Loading ONNX super-resolution model"
        );

        let session = build_session(&SessionConfig {
            model_path,
            backend,
            trt_cache_dir,
        })?;

        let input = session
            .inputs()
            .first()
            .context("ONNX model declares no inputs")?;
        let output = session
            .outputs()
            .first()
            .context("ONNX model declares no outputs")?;
        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        if is_fp16 != entry.is_fp16 {
            warn!(
                name = %entry.name,
                catalog_fp16 = entry.is_fp16,
                session_fp16 = is_fp16,
                "Model precision differs from catalog; using the session's"
            );
        }
        debug!(%input_name, %output_name, is_fp16, "Detected model IO");

        Ok(Self {
            name: entry.name.clone(),
            scale: entry.scale,
            normalization_range: entry.normalization_range,
            pad_align: entry.pad_align.max(1) as usize,
            is_fp16,
            input_name,
            output_name,
            session: Mutex::new(session),
        })
    }

    fn run_f32(&self, input: Array4<f32>) -> Result<ArrayD<f32>, InferenceError> {
        let tensor = Tensor::from_array(input)?;
        let mut session = self.lock_session()?;
        let outputs = session.run(ort::inputs![self.input_name.as_str() => &tensor])?;
        let view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(view.to_owned())
    }

    fn run_f16(&self, input: Array4<f32>) -> Result<ArrayD<f32>, InferenceError> {
        let shape = input.shape().to_vec();
        let contiguous = input.as_standard_layout();
        let f32_slice = contiguous
            .as_slice()
            .ok_or_else(|| InferenceError::backend("input tensor is not contiguous"))?;
        let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
        fp16_data.convert_from_f32_slice(f32_slice);
        let fp16_array = ArrayD::from_shape_vec(IxDyn(&shape), fp16_data)
            .map_err(|e| InferenceError::backend(e.to_string()))?;

        let tensor = Tensor::from_array(fp16_array)?;
        let mut session = self.lock_session()?;
        let outputs = session.run(ort::inputs![self.input_name.as_str() => &tensor])?;
        let view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
        f16_view_to_f32(view)
    }

    fn lock_session(&self) -> Result<std::sync::MutexGuard<'_, Session>, InferenceError> {
        self.session
            .lock()
            .map_err(|_| InferenceError::backend("ONNX session mutex poisoned"))
    }
}

impl UpscaleModel for OnnxUpscaler {
    fn name(&self) -> &str {
        &self.name
    }

    fn scale(&self) -> u32 {
        self.scale
    }

    fn upscale_tile(&self, tile: &Image) -> Result<Image, InferenceError> {
        if tile.channels() != 3 {
            return Err(InferenceError::input(format!(
                "expected 3 channels, got {}",
                tile.channels()
            )));
        }

        let h = tile.height() as usize;
        let w = tile.width() as usize;
        let input = pad_nchw(&image_to_nchw(tile, self.normalization_range), self.pad_align);

        let output = if self.is_fp16 {
            self.run_f16(input)?
        } else {
            self.run_f32(input)?
        };

        let scale = self.scale as usize;
        Ok(nchw_to_image(
            output.view(),
            h * scale,
            w * scale,
            self.normalization_range,
        ))
    }
}

/// HWC `[0, 1]` → NCHW `[1, 3, H, W]` in the model's value range.
fn image_to_nchw(image: &Image, (lo, hi): (f32, f32)) -> Array4<f32> {
    let src = image.pixels();
    let (h, w, _) = src.dim();
    let span = hi - lo;
    Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| src[[y, x, c]] * span + lo)
}

fn pad_amount(dim: usize, align: usize) -> usize {
    (align - (dim % align)) % align
}

/// Reflection-pad H and W of an NCHW array up to multiples of `align`.
fn pad_nchw(arr: &Array4<f32>, align: usize) -> Array4<f32> {
    let (n, c, h, w) = arr.dim();
    let pad_h = pad_amount(h, align);
    let pad_w = pad_amount(w, align);
    if pad_h == 0 && pad_w == 0 {
        return arr.clone();
    }

    let new_h = h + pad_h;
    let new_w = w + pad_w;
    // Mirror about the last row/column; tiny tiles fall back to clamping.
    let reflect = |i: usize, len: usize| -> usize {
        if i < len {
            i
        } else {
            (len - 1).saturating_sub(i - len)
        }
    };
    Array4::from_shape_fn((n, c, new_h, new_w), |(b, ch, y, x)| {
        arr[[b, ch, reflect(y, h), reflect(x, w)]]
    })
}

fn f16_view_to_f32(view: ArrayViewD<'_, f16>) -> Result<ArrayD<f32>, InferenceError> {
    let contiguous = view.as_standard_layout();
    let shape = contiguous.shape().to_vec();
    let f32_data: Vec<f32> = match contiguous.as_slice() {
        Some(slice) => {
            let mut out = vec![0.0f32; slice.len()];
            slice.convert_to_f32_slice(&mut out);
            out
        }
        None => contiguous.iter().map(|v| v.to_f32()).collect(),
    };
    ArrayD::from_shape_vec(IxDyn(&shape), f32_data)
        .map_err(|e| InferenceError::backend(e.to_string()))
}

/// Crop NCHW output to `out_h × out_w`, map back to `[0, 1]` and clamp.
///
/// Outputs smaller than the crop are returned at their own size so the
/// pipeline's shape check reports them.
fn nchw_to_image(
    arr: ArrayViewD<'_, f32>,
    out_h: usize,
    out_w: usize,
    (lo, hi): (f32, f32),
) -> Image {
    if arr.ndim() != 4 {
        return Image::new(0, 0, 3);
    }
    let shape = arr.shape();
    let channels = shape[1];
    let h = out_h.min(shape[2]);
    let w = out_w.min(shape[3]);
    let span = if hi > lo { hi - lo } else { 1.0 };

    let cropped = arr.slice(s![0, .., ..h, ..w]);
    let hwc = Array3::from_shape_fn((h, w, channels), |(y, x, c)| {
        ((cropped[[c, y, x]] - lo) / span).clamp(0.0, 1.0)
    });
    Image::from_array(hwc)
}
