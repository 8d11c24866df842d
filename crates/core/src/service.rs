//! File-level orchestration: resolve a model, decode an image file, run it
//! through the tiling pipeline and write the result.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::backend::resolve_trt_cache_dir;
use crate::config::{resolve_relative_to, AppConfig};
use crate::error::{BatchCancelled, UpscaleError};
use crate::model::{NearestNeighbor, UpscaleModel};
use crate::model_registry::ModelRegistry;
use crate::onnx::OnnxUpscaler;
use crate::pipeline::{TilePipeline, UpscaleContext};
use crate::raster::Image;

const NEAREST_PREFIX: &str = "nearest-x";
const OUTPUT_SUFFIX: &str = "_upscaled";
/// Auto-download log interval when the size is known.
const DOWNLOAD_LOG_PERCENT: u64 = 10;
/// Auto-download log interval when the server sends no length.
const DOWNLOAD_LOG_BYTES: u64 = 16 * 1024 * 1024;

/// Names of the models that need no file on disk.
pub fn builtin_model_names() -> Vec<String> {
    (2..=4).map(|s| format!("{NEAREST_PREFIX}{s}")).collect()
}

fn builtin_model(name: &str) -> Option<NearestNeighbor> {
    let scale: u32 = name.strip_prefix(NEAREST_PREFIX)?.parse().ok()?;
    (2..=4).contains(&scale).then(|| NearestNeighbor::new(scale))
}

/// `<dir>/<stem>_upscaled.<ext>`, keeping the input's extension (png if none).
pub fn default_output_path(input: &Path, output_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let ext = input
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "png".to_string());
    output_dir.join(format!("{stem}{OUTPUT_SUFFIX}.{ext}"))
}

#[derive(Debug, Clone)]
pub struct UpscaleReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub model: String,
    pub input_size: (u32, u32),
    pub output_size: (u32, u32),
    pub tiles: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<UpscaleReport>,
    pub failed: Vec<(PathBuf, String)>,
    pub cancelled: bool,
}

pub struct UpscaleService {
    config: AppConfig,
    data_dir: PathBuf,
    registry: ModelRegistry,
    loaded: Option<Arc<dyn UpscaleModel>>,
}

impl UpscaleService {
    pub fn new(config: AppConfig, data_dir: PathBuf) -> Result<Self> {
        let models_dir = resolve_relative_to(&data_dir, &config.paths.models_dir);
        let mut registry = ModelRegistry::with_builtin_models(models_dir);
        registry.discover()?;

        Ok(Self {
            config,
            data_dir,
            registry,
            loaded: None,
        })
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn output_dir(&self) -> PathBuf {
        resolve_relative_to(&self.data_dir, &self.config.paths.output_dir)
    }

    /// Download a catalogued model, reporting `(bytes received, content length)`.
    pub fn download_model<F>(&self, name: &str, on_progress: F) -> Result<PathBuf>
    where
        F: FnMut(u64, Option<u64>),
    {
        self.registry.download(name, on_progress)
    }

    /// Resolve `name` to a ready model. The most recently loaded model is
    /// kept, so repeated calls with the same name are free.
    pub fn load_model(&mut self, name: &str) -> Result<Arc<dyn UpscaleModel>> {
        if let Some(model) = self.loaded.as_ref().filter(|m| m.name() == name) {
            return Ok(Arc::clone(model));
        }

        let model: Arc<dyn UpscaleModel> = match builtin_model(name) {
            Some(nearest) => Arc::new(nearest),
            None => Arc::new(self.load_onnx(name)?),
        };
        info!(model = name, scale = model.scale(), "Model ready");
        self.loaded = Some(Arc::clone(&model));
        Ok(model)
    }

    fn load_onnx(&self, name: &str) -> Result<OnnxUpscaler> {
        let Some(entry) = self.registry.get(name) else {
            let mut known: Vec<String> =
                self.registry.list().iter().map(|e| e.name.clone()).collect();
            known.extend(builtin_model_names());
            bail!("Unknown model: {name} (available: {})", known.join(", "));
        };

        let path = if self.registry.is_downloaded(name) {
            self.registry
                .model_path(name)
                .with_context(|| format!("Unknown model: {name}"))?
        } else if entry.url.is_some() {
            info!(model = name, "Model file missing; downloading");
            self.registry
                .download(name, log_download_progress(name))?
        } else {
            bail!(
                "Model file for {name} not found; place {} in {}",
                entry.filename,
                self.registry.models_dir().display()
            );
        };

        let trt_base = resolve_relative_to(&self.data_dir, &self.config.paths.trt_cache_dir);
        let trt_dir = resolve_trt_cache_dir(&trt_base, Some(name));
        OnnxUpscaler::load(&path, entry, self.config.inference.backend, Some(&trt_dir))
    }

    /// Upscale one file. `output` defaults to
    /// `<output_dir>/<stem>_upscaled.<ext>`.
    pub fn upscale_file(
        &self,
        input: &Path,
        output: Option<&Path>,
        model: &dyn UpscaleModel,
        ctx: &UpscaleContext,
    ) -> Result<UpscaleReport> {
        let output = match output {
            Some(path) => path.to_path_buf(),
            None => default_output_path(input, &self.output_dir()),
        };
        let started = Instant::now();

        let decoded = image::open(input)
            .with_context(|| format!("failed to decode image: {}", input.display()))?;
        let source = Image::from_dynamic(&decoded);
        drop(decoded);

        let pipeline = TilePipeline::new(self.config.tiling.clone());
        let tiles = pipeline
            .plan(source.width(), source.height(), model.scale())
            .map(|grid| grid.len())
            .unwrap_or(0);

        let upscaled = pipeline
            .upscale_with(&source, model, ctx)
            .map_err(anyhow::Error::new)
            .with_context(|| format!("failed to upscale {}", input.display()))?;

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create output directory: {}", parent.display())
            })?;
        }
        upscaled
            .to_rgb8()?
            .save(&output)
            .with_context(|| format!("failed to write image: {}", output.display()))?;

        let report = UpscaleReport {
            input: input.to_path_buf(),
            output,
            model: model.name().to_string(),
            input_size: (source.width(), source.height()),
            output_size: (upscaled.width(), upscaled.height()),
            tiles,
            elapsed: started.elapsed(),
        };
        info!(
            input = %report.input.display(),
            output = %report.output.display(),
            model = %report.model,
            width = report.output_size.0,
            height = report.output_size.1,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Image written"
        );
        Ok(report)
    }

    /// Upscale files one after another, continuing past failures. Once
    /// `ctx.cancel` is set the remaining files are reported as cancelled.
    pub fn upscale_files<F>(
        &self,
        inputs: &[PathBuf],
        output_dir: Option<&Path>,
        model: &dyn UpscaleModel,
        ctx: &UpscaleContext,
        mut on_image: F,
    ) -> BatchReport
    where
        F: FnMut(usize, &Path, &Result<UpscaleReport>),
    {
        let output_dir = output_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.output_dir());
        let mut report = BatchReport::default();

        for (index, input) in inputs.iter().enumerate() {
            let result = if ctx.cancel.is_cancelled() {
                Err(anyhow::Error::new(BatchCancelled))
            } else {
                let output = default_output_path(input, &output_dir);
                self.upscale_file(input, Some(&output), model, ctx)
            };
            on_image(index, input, &result);

            match result {
                Ok(done) => report.succeeded.push(done),
                Err(error) => {
                    if is_cancellation(&error) {
                        report.cancelled = true;
                    } else {
                        warn!(input = %input.display(), error = %format!("{error:#}"), "Batch item failed");
                    }
                    report.failed.push((input.clone(), format!("{error:#}")));
                }
            }
        }

        info!(
            total = inputs.len(),
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled,
            "Batch complete"
        );
        report
    }
}

/// True when the error chain contains a pipeline cancellation or a file
/// skipped by a cancelled batch.
pub fn is_cancellation(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause.is::<BatchCancelled>()
            || matches!(cause.downcast_ref::<UpscaleError>(), Some(e) if e.is_cancelled())
    })
}

/// Which log step `downloaded` falls in: a percentage band when the size is
/// known, a byte band otherwise.
fn download_log_step(downloaded: u64, total: Option<u64>) -> u64 {
    match total {
        Some(total) if total > 0 => downloaded.min(total) * 100 / total / DOWNLOAD_LOG_PERCENT,
        _ => downloaded / DOWNLOAD_LOG_BYTES,
    }
}

/// Progress callback that logs once per step instead of once per chunk.
fn log_download_progress(name: &str) -> impl FnMut(u64, Option<u64>) + '_ {
    let mut last_step = None;
    move |downloaded, total| {
        let step = download_log_step(downloaded, total);
        if last_step.is_some_and(|last| last >= step) {
            return;
        }
        last_step = Some(step);
        match total {
            Some(total) if total > 0 => info!(
                model = name,
                downloaded,
                total,
                percent = downloaded.min(total) * 100 / total,
                "Downloading model"
            ),
            _ => info!(model = name, downloaded, "Downloading model"),
        }
    }
}
