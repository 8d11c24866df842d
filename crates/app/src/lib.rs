use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tilescale_core::backend::InferenceBackend;
use tilescale_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use tilescale_core::geometry::EdgePadding;
use tilescale_core::logging::{self, FilterSources, LogFile, LogSetup, DEFAULT_LOG_FILTER};
use tilescale_core::pipeline::{CancelFlag, UpscaleContext, UpscaleEvent};
use tilescale_core::service::{builtin_model_names, is_cancellation, UpscaleService};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp"];

#[derive(Parser, Debug)]
#[command(name = "tilescale", about = "Tiled AI image super-resolution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upscale a single image
    Upscale(UpscaleArgs),
    /// Upscale every image in the given files and directories
    Batch(BatchArgs),
    /// Inspect or fetch models
    #[command(subcommand)]
    Models(ModelsCommand),
}

#[derive(Subcommand, Debug)]
enum ModelsCommand {
    /// List built-in, catalogued and discovered models
    List,
    /// Download a catalogued model into the models directory
    Download { name: String },
}

#[derive(Args, Debug)]
struct UpscaleArgs {
    #[arg(help = "Input image")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Output image (default: <output_dir>/<stem>_upscaled.<ext>)")]
    output: Option<PathBuf>,
    #[command(flatten)]
    tiling: TilingArgs,
}

#[derive(Args, Debug)]
struct BatchArgs {
    #[arg(required = true, help = "Image files or directories")]
    inputs: Vec<PathBuf>,
    #[arg(short = 'o', long = "output-dir", help = "Directory for upscaled images")]
    output_dir: Option<PathBuf>,
    #[command(flatten)]
    tiling: TilingArgs,
}

/// Per-invocation overrides of the config file.
#[derive(Args, Debug, Default, Clone)]
struct TilingArgs {
    #[arg(short = 'm', long, help = "Model name (see `tilescale models list`)")]
    model: Option<String>,
    #[arg(long, value_name = "PIXELS")]
    tile_size: Option<u32>,
    #[arg(long, value_name = "PIXELS")]
    overlap: Option<u32>,
    #[arg(
        long,
        value_name = "POLICY",
        ignore_case = true,
        value_parser = ["omit", "replicate"]
    )]
    edge_padding: Option<String>,
    #[arg(short = 'j', long, value_name = "N", help = "Tiles processed concurrently")]
    jobs: Option<usize>,
    #[arg(long, value_name = "N", help = "Extra attempts for a failed tile")]
    retries: Option<u32>,
    #[arg(
        long,
        value_name = "BACKEND",
        ignore_case = true,
        value_parser = ["cuda", "tensorrt", "trt", "cpu"]
    )]
    backend: Option<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    tilescale_core::runtime::setup_runtime_libs(Some(resolved_data_dir.as_path()));
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    tilescale_core::runtime::log_runtime_lib_status();
    log_startup_metadata(&resolved_data_dir);

    let config = load_config(&resolved_data_dir);

    match cli.command {
        Commands::Upscale(args) => run_upscale(config, resolved_data_dir, args).await,
        Commands::Batch(args) => run_batch(config, resolved_data_dir, args).await,
        Commands::Models(ModelsCommand::List) => list_models(config, resolved_data_dir),
        Commands::Models(ModelsCommand::Download { name }) => {
            download_model(config, resolved_data_dir, name).await
        }
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let sources = FilterSources {
        explicit: cli_log_filter.map(ToString::to_string),
        verbose,
        env: std::env::var("RUST_LOG").ok(),
    };
    let LogSetup { filters, file } = logging::plan_logging(&sources, data_dir);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    let (installed, unavailable) = match file {
        LogFile::Ready { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(&filters.file, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            (tracing::subscriber::set_global_default(subscriber), None)
        }
        LogFile::Unavailable { dir, reason } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            (
                tracing::subscriber::set_global_default(subscriber),
                Some((dir, reason)),
            )
        }
    };

    if let Err(error) = installed {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }
    if let Some((dir, reason)) = unavailable {
        warn!(
            log_dir = ?dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Fold command-line overrides into the loaded config and pick the model.
fn apply_overrides(config: &mut AppConfig, args: &TilingArgs) -> Result<String> {
    if let Some(tile_size) = args.tile_size {
        config.tiling.tile_size = tile_size;
    }
    if let Some(overlap) = args.overlap {
        config.tiling.overlap = overlap;
    }
    if let Some(ref policy) = args.edge_padding {
        config.tiling.edge_padding = EdgePadding::from_str_lossy(policy);
    }
    if let Some(jobs) = args.jobs {
        config.tiling.max_in_flight = jobs;
    }
    if let Some(retries) = args.retries {
        config.tiling.max_retries = retries;
    }
    if let Some(ref backend) = args.backend {
        config.inference.backend = InferenceBackend::from_str_lossy(backend);
    }
    config
        .tiling
        .validate()
        .context("invalid tiling options")?;

    Ok(args
        .model
        .clone()
        .unwrap_or_else(|| config.inference.default_model.clone()))
}

/// Cancel `flag` on Ctrl-C. The returned handle should be aborted once the
/// job finishes.
fn spawn_interrupt_watcher(flag: CancelFlag) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            warn!("Interrupt received; stopping after the current tile");
            flag.cancel();
        }
    })
}

async fn run_upscale(mut config: AppConfig, data_dir: PathBuf, args: UpscaleArgs) -> Result<()> {
    if !args.input.is_file() {
        bail!("Input image does not exist: {}", args.input.display());
    }
    let model_name = apply_overrides(&mut config, &args.tiling)?;

    let cancel = CancelFlag::new();
    let watcher = spawn_interrupt_watcher(cancel.clone());

    let job = tokio::task::spawn_blocking(move || -> Result<()> {
        let mut service = UpscaleService::new(config, data_dir)?;
        let model = service.load_model(&model_name)?;
        let ctx = make_progress_context(cancel);

        let report = service.upscale_file(&args.input, args.output.as_deref(), model.as_ref(), &ctx);
        eprintln!();
        let report = report?;
        info!(
            output = %report.output.display(),
            width = report.output_size.0,
            height = report.output_size.1,
            tiles = report.tiles,
            elapsed = %format_duration(report.elapsed.as_secs_f64()),
            "Upscale finished"
        );
        Ok(())
    });

    let result = job.await.context("upscale task panicked");
    watcher.abort();
    result?
}

async fn run_batch(mut config: AppConfig, data_dir: PathBuf, args: BatchArgs) -> Result<()> {
    let model_name = apply_overrides(&mut config, &args.tiling)?;
    let inputs = collect_inputs(&args.inputs)?;
    if inputs.is_empty() {
        bail!("No images found in the given inputs");
    }
    info!(images = inputs.len(), model = %model_name, "Starting batch");

    let cancel = CancelFlag::new();
    let watcher = spawn_interrupt_watcher(cancel.clone());
    let output_dir = args.output_dir;

    let job = tokio::task::spawn_blocking(move || -> Result<(usize, usize, bool)> {
        let mut service = UpscaleService::new(config, data_dir)?;
        let model = service.load_model(&model_name)?;
        let ctx = make_progress_context(cancel);
        let total = inputs.len();

        let report = service.upscale_files(
            &inputs,
            output_dir.as_deref(),
            model.as_ref(),
            &ctx,
            |index, input, result| {
                eprintln!();
                match result {
                    Ok(done) => info!(
                        image = index + 1,
                        total,
                        output = %done.output.display(),
                        "Image done"
                    ),
                    Err(error) if is_cancellation(error) => {}
                    Err(error) => warn!(
                        image = index + 1,
                        total,
                        input = %input.display(),
                        error = %format!("{error:#}"),
                        "Image failed"
                    ),
                }
            },
        );
        Ok((report.succeeded.len(), report.failed.len(), report.cancelled))
    });

    let result = job.await.context("batch task panicked");
    watcher.abort();
    let (succeeded, failed, cancelled) = result??;

    info!(succeeded, failed, cancelled, "Batch finished");
    if cancelled {
        bail!("Batch cancelled after {succeeded} image(s)");
    }
    if failed > 0 {
        bail!("{failed} image(s) failed");
    }
    Ok(())
}

fn list_models(config: AppConfig, data_dir: PathBuf) -> Result<()> {
    let service = UpscaleService::new(config, data_dir)?;
    let registry = service.registry();

    println!("{:<28} {:>5}  {:<6} {:<10} DESCRIPTION", "NAME", "SCALE", "KIND", "STATUS");
    for name in builtin_model_names() {
        let scale = name.trim_start_matches("nearest-x");
        println!(
            "{:<28} {:>5}  {:<6} {:<10} Pixel replication (no model file)",
            name, scale, "-", "built-in"
        );
    }
    for entry in registry.list() {
        let status = if registry.is_downloaded(&entry.name) {
            "ready"
        } else if entry.url.is_some() {
            "download"
        } else {
            "missing"
        };
        println!(
            "{:<28} {:>5}  {:<6} {:<10} {}",
            entry.name, entry.scale, entry.kind.to_string(), status, entry.description
        );
    }
    println!("\nModels directory: {}", registry.models_dir().display());
    Ok(())
}

async fn download_model(config: AppConfig, data_dir: PathBuf, name: String) -> Result<()> {
    let path = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
        let service = UpscaleService::new(config, data_dir)?;
        let start = Instant::now();
        let path = service.download_model(&name, |downloaded, total| {
            eprint!(
                "\r{}    ",
                format_download_progress(downloaded, total, start.elapsed().as_secs_f64())
            );
        });
        eprintln!();
        path
    })
    .await
    .context("download task panicked")??;

    info!(path = %path.display(), "Model downloaded");
    Ok(())
}

/// Expand directories (non-recursively) to their image files, sorted.
fn collect_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut inputs = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = std::fs::read_dir(path)
                .with_context(|| format!("Failed to read directory: {}", path.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_image_path(p))
                .collect();
            found.sort();
            inputs.extend(found);
        } else if path.is_file() {
            inputs.push(path.clone());
        } else {
            bail!("Input does not exist: {}", path.display());
        }
    }
    Ok(inputs)
}

fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

/// One-line bar for `completed` of `total` units; `counter` describes them
/// (`Tile 3/12`, `4.0/16.0 MiB`).
fn format_progress(completed: u64, total: u64, counter: &str, elapsed: f64) -> String {
    let fraction = if total > 0 {
        (completed as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    let eta = if completed > 0 && completed < total {
        let per_unit = elapsed / completed as f64;
        format!(" | ETA: {}", format_duration(per_unit * (total - completed) as f64))
    } else {
        String::new()
    };

    format!(
        "[{}] {:5.1}% | {} | Elapsed: {}{}",
        bar,
        fraction * 100.0,
        counter,
        format_duration(elapsed),
        eta,
    )
}

fn format_tile_progress(completed: usize, total: usize, elapsed: f64) -> String {
    format_progress(
        completed as u64,
        total as u64,
        &format!("Tile {completed}/{total}"),
        elapsed,
    )
}

const MIB: f64 = 1024.0 * 1024.0;

/// Without a `Content-Length` the bar stays empty and only the byte count moves.
fn format_download_progress(downloaded: u64, total: Option<u64>, elapsed: f64) -> String {
    let received = downloaded as f64 / MIB;
    match total {
        Some(total) => format_progress(
            downloaded,
            total,
            &format!("{received:.1}/{:.1} MiB", total as f64 / MIB),
            elapsed,
        ),
        None => format_progress(downloaded, 0, &format!("{received:.1} MiB"), elapsed),
    }
}

fn make_progress_context(cancel: CancelFlag) -> UpscaleContext {
    let start = Arc::new(std::sync::Mutex::new(Instant::now()));
    UpscaleContext::new()
        .with_cancel(cancel)
        .on_event(move |event| match event {
            UpscaleEvent::Started { .. } => {
                if let Ok(mut start) = start.lock() {
                    *start = Instant::now();
                }
            }
            UpscaleEvent::Progress(p) => {
                let elapsed = start
                    .lock()
                    .map(|s| s.elapsed().as_secs_f64())
                    .unwrap_or(0.0);
                eprint!(
                    "\r{}    ",
                    format_tile_progress(p.tiles_completed, p.total_tiles, elapsed)
                );
            }
            UpscaleEvent::Completed { .. } | UpscaleEvent::Failed(_) => {}
        })
}
