//! ONNX Runtime session construction for the upscaling models.
//!
//! [`build_session`] registers execution providers in order of preference
//! (TensorRT → CUDA → CPU) depending on [`InferenceBackend`]; ORT itself falls
//! back to the next provider when one cannot be initialized.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Inference backend selection.
///
/// Default is `Cuda`. `Tensorrt` requires TensorRT runtime libraries
/// (`libnvinfer.so.10` or `nvinfer.dll`); without them the session falls back
/// to CUDA EP. `Cpu` skips GPU providers entirely.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

const DEFAULT_TRT_CACHE_DIR: &str = "trt_cache";

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

/// Engine cache directory for one model, so engines built for different
/// models never collide.
pub fn resolve_trt_cache_dir(base_dir: &Path, model_name: Option<&str>) -> PathBuf {
    match model_name {
        Some(name) => base_dir.join(name),
        None => base_dir.to_path_buf(),
    }
}

/// Files and bytes under `root`, recursively. Missing directories count as
/// empty.
fn dir_usage(root: &Path) -> (u64, u64) {
    let mut files = 0;
    let mut bytes = 0;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).into_iter().flatten().flatten() {
            match entry.metadata() {
                Ok(meta) if meta.is_dir() => pending.push(entry.path()),
                Ok(meta) => {
                    files += 1;
                    bytes += meta.len();
                }
                Err(_) => {}
            }
        }
    }
    (files, bytes)
}

/// Logs every [`HEARTBEAT_INTERVAL`] until dropped.
struct Heartbeat {
    stop: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

impl Heartbeat {
    fn start(what: &'static str) -> Self {
        let (stop, stopped) = channel::<()>();
        let handle = thread::spawn(move || {
            let started = Instant::now();
            while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(HEARTBEAT_INTERVAL) {
                info!(elapsed_secs = started.elapsed().as_secs(), "{what} still in progress");
            }
        });
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn tensorrt_session(builder: SessionBuilder, model_path: &Path, cache_dir: &Path) -> Result<Session> {
    if let Err(e) = std::fs::create_dir_all(cache_dir) {
        warn!(dir = %cache_dir.display(), error = %e, "Could not create TensorRT engine cache directory");
    }

    let (files_before, bytes_before) = dir_usage(cache_dir);
    info!(
        cache_dir = %cache_dir.display(),
        cache_files = files_before,
        cache_bytes = bytes_before,
        "Building TensorRT session; a cold engine cache can take minutes"
    );
    let started = Instant::now();

    let cache_path = cache_dir.to_string_lossy().to_string();
    let providers = [
        TensorRTExecutionProvider::default()
            .with_device_id(0)
            .with_fp16(true)
            .with_engine_cache(true)
            .with_engine_cache_path(&cache_path)
            .build(),
        CUDAExecutionProvider::default().build(),
    ];
    let session = {
        let _heartbeat = Heartbeat::start("TensorRT engine build");
        builder
            .with_execution_providers(providers)?
            .commit_from_file(model_path)
    };

    let elapsed_secs = started.elapsed().as_secs_f64();
    match session {
        Ok(session) => {
            let (files_after, bytes_after) = dir_usage(cache_dir);
            info!(
                elapsed_secs,
                engine_built = bytes_after != bytes_before,
                cache_files = files_after,
                cache_bytes = bytes_after,
                "TensorRT session ready"
            );
            Ok(session)
        }
        Err(e) => {
            error!(elapsed_secs, error = %e, "TensorRT session build failed");
            Err(e).with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))
        }
    }
}

/// Create an `ort::Session` for the configured backend. TensorRT falls back
/// to CUDA and CUDA falls back to CPU inside ORT when a provider cannot start.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let model_path = config.model_path;
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    debug!(backend = %config.backend, model = %model_path.display(), "Building ONNX session");

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config.trt_cache_dir.unwrap_or(Path::new(DEFAULT_TRT_CACHE_DIR));
            return tensorrt_session(builder, model_path, cache_dir);
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA execution provider unavailable; tiles will run on the CPU");
            }
            builder
                .with_execution_providers([cuda.build()])?
                .commit_from_file(model_path)
        }
        InferenceBackend::Cpu => builder.commit_from_file(model_path),
    };
    session.with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))
}
