//! Tiled upscaling: geometry → extract → infer → blend → normalize.
//!
//! [`TilePipeline::upscale_with`] drives one image through an
//! [`UpscaleModel`]. With `max_in_flight == 1` every stage runs on the calling
//! thread. With more, scoped worker threads extract and infer tiles and hand
//! them over a bounded channel to the calling thread, which is the only one
//! touching the canvas. At most `max_in_flight` tiles are being inferred and
//! at most `max_in_flight` more are queued for blending at any time.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::blend::{Canvas, MaskCache};
use crate::error::{TileError, UpscaleError};
use crate::extract::{extract, TileBuffer};
use crate::geometry::{compute_tiles, EdgePadding, TileDescriptor, TileGrid};
use crate::model::UpscaleModel;
use crate::raster::Image;

pub const DEFAULT_TILE_SIZE: u32 = 512;
pub const DEFAULT_OVERLAP: u32 = 32;

/// Tiling parameters. Also the `[tiling]` section of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingOptions {
    /// Core tile edge length in source pixels.
    pub tile_size: u32,
    /// Context pixels shared with each neighbour.
    pub overlap: u32,
    pub edge_padding: EdgePadding,
    /// Extra attempts for a tile whose inference failed transiently.
    pub max_retries: u32,
    /// Tiles allowed in extraction/inference at once.
    pub max_in_flight: usize,
}

impl Default for TilingOptions {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            overlap: DEFAULT_OVERLAP,
            edge_padding: EdgePadding::default(),
            max_retries: 1,
            max_in_flight: 1,
        }
    }
}

impl TilingOptions {
    pub fn validate(&self) -> Result<(), TileError> {
        if self.tile_size == 0 || self.tile_size as u64 <= 2 * self.overlap as u64 {
            return Err(TileError::configuration(format!(
                "tile_size ({}) must be greater than twice the overlap ({})",
                self.tile_size, self.overlap
            )));
        }
        if self.max_in_flight == 0 {
            return Err(TileError::configuration("max_in_flight must be at least 1"));
        }
        Ok(())
    }
}

/// Shared cancellation switch. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileProgress {
    pub tiles_completed: usize,
    pub total_tiles: usize,
}

impl TileProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_tiles == 0 {
            return 1.0;
        }
        self.tiles_completed as f64 / self.total_tiles as f64
    }
}

#[derive(Debug, Clone, Copy)]
pub enum UpscaleEvent<'a> {
    Started { total_tiles: usize },
    /// Emitted after each tile is blended; `tiles_completed` only grows.
    Progress(TileProgress),
    Completed { width: u32, height: u32 },
    Failed(&'a UpscaleError),
}

pub type EventCallback = Box<dyn Fn(UpscaleEvent<'_>) + Send + Sync>;

/// Per-call hooks: a cancellation flag and an optional event observer.
#[derive(Default)]
pub struct UpscaleContext {
    pub cancel: CancelFlag,
    on_event: Option<EventCallback>,
}

impl UpscaleContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(UpscaleEvent<'_>) + Send + Sync + 'static,
    {
        self.on_event = Some(Box::new(callback));
        self
    }

    fn emit(&self, event: UpscaleEvent<'_>) {
        if let Some(ref cb) = self.on_event {
            cb(event);
        }
    }
}

/// Owns the canvas for one call and counts blended tiles.
struct Assembler<'a> {
    canvas: Canvas,
    masks: MaskCache,
    scale: u32,
    completed: usize,
    total: usize,
    ctx: &'a UpscaleContext,
}

impl Assembler<'_> {
    fn blend(&mut self, tile: TileBuffer) -> Result<(), UpscaleError> {
        let mask = self.masks.get(&tile.descriptor, self.scale);
        self.canvas
            .blend(&tile, &mask)
            .map_err(UpscaleError::Assembly)?;
        self.completed += 1;

        debug!(
            tile = tile.descriptor.index,
            column = tile.descriptor.column,
            row = tile.descriptor.row,
            completed = self.completed,
            total = self.total,
            "Tile blended"
        );
        self.ctx.emit(UpscaleEvent::Progress(TileProgress {
            tiles_completed: self.completed,
            total_tiles: self.total,
        }));
        Ok(())
    }

    fn cancelled(&self) -> UpscaleError {
        UpscaleError::Cancelled {
            completed: self.completed,
            total: self.total,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TilePipeline {
    options: TilingOptions,
}

impl TilePipeline {
    pub fn new(options: TilingOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TilingOptions {
        &self.options
    }

    /// Tile layout this pipeline would use for a `width × height` image.
    pub fn plan(&self, width: u32, height: u32, scale: u32) -> Result<TileGrid, TileError> {
        self.options.validate()?;
        compute_tiles(
            width,
            height,
            self.options.tile_size,
            self.options.overlap,
            scale,
            self.options.edge_padding,
        )
    }

    pub fn upscale(&self, image: &Image, model: &dyn UpscaleModel) -> Result<Image, UpscaleError> {
        self.upscale_with(image, model, &UpscaleContext::default())
    }

    pub fn upscale_with(
        &self,
        image: &Image,
        model: &dyn UpscaleModel,
        ctx: &UpscaleContext,
    ) -> Result<Image, UpscaleError> {
        let result = self.run(image, model, ctx);
        match &result {
            Ok(output) => ctx.emit(UpscaleEvent::Completed {
                width: output.width(),
                height: output.height(),
            }),
            Err(error) => ctx.emit(UpscaleEvent::Failed(error)),
        }
        result
    }

    /// Upscale each image in turn. A failed image does not stop the batch;
    /// after cancellation every remaining image reports `Cancelled`.
    pub fn upscale_batch(
        &self,
        images: &[Image],
        model: &dyn UpscaleModel,
        ctx: &UpscaleContext,
    ) -> Vec<Result<Image, UpscaleError>> {
        let started = Instant::now();
        let mut results = Vec::with_capacity(images.len());

        for (index, image) in images.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                let total = self
                    .plan(image.width(), image.height(), model.scale())
                    .map(|grid| grid.len())
                    .unwrap_or(0);
                results.push(Err(UpscaleError::Cancelled {
                    completed: 0,
                    total,
                }));
                continue;
            }

            let result = self.upscale_with(image, model, ctx);
            if let Err(ref error) = result {
                warn!(image = index, error = %error, "Batch image failed");
            }
            results.push(result);
        }

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        info!(
            images = images.len(),
            succeeded,
            failed = images.len() - succeeded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch finished"
        );
        results
    }

    fn run(
        &self,
        image: &Image,
        model: &dyn UpscaleModel,
        ctx: &UpscaleContext,
    ) -> Result<Image, UpscaleError> {
        if image.channels() == 0 {
            return Err(UpscaleError::Rejected(TileError::configuration(
                "image has no channels",
            )));
        }
        let scale = model.scale();
        let grid = self
            .plan(image.width(), image.height(), scale)
            .map_err(UpscaleError::Rejected)?;
        let total = grid.len();
        let started = Instant::now();

        info!(
            model = model.name(),
            width = image.width(),
            height = image.height(),
            scale,
            columns = grid.columns,
            rows = grid.rows,
            tiles = total,
            tile_size = self.options.tile_size,
            overlap = self.options.overlap,
            max_in_flight = self.options.max_in_flight,
            "Upscaling image"
        );
        ctx.emit(UpscaleEvent::Started { total_tiles: total });

        let mut assembler = Assembler {
            canvas: Canvas::new(grid.output_width, grid.output_height, image.channels(), scale),
            masks: MaskCache::new(),
            scale,
            completed: 0,
            total,
            ctx,
        };

        if self.options.max_in_flight <= 1 || total == 1 {
            self.run_sequential(image, model, &grid, &mut assembler)?;
        } else {
            self.run_concurrent(image, model, &grid, &mut assembler)?;
        }

        if assembler.completed < total {
            return Err(assembler.cancelled());
        }

        let output = assembler
            .canvas
            .normalize()
            .map_err(UpscaleError::Assembly)?;

        info!(
            out_width = output.width(),
            out_height = output.height(),
            tiles = total,
            masks = assembler.masks.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upscale complete"
        );
        Ok(output)
    }

    fn run_sequential(
        &self,
        image: &Image,
        model: &dyn UpscaleModel,
        grid: &TileGrid,
        assembler: &mut Assembler<'_>,
    ) -> Result<(), UpscaleError> {
        let ctx = assembler.ctx;
        let cancel = &ctx.cancel;
        for desc in &grid.tiles {
            if cancel.is_cancelled() {
                return Err(assembler.cancelled());
            }
            let tile = self.process_tile(image, desc, model)?;
            if cancel.is_cancelled() {
                return Err(assembler.cancelled());
            }
            assembler.blend(tile)?;
        }
        Ok(())
    }

    fn run_concurrent(
        &self,
        image: &Image,
        model: &dyn UpscaleModel,
        grid: &TileGrid,
        assembler: &mut Assembler<'_>,
    ) -> Result<(), UpscaleError> {
        let workers = self.options.max_in_flight.min(grid.len());
        let cursor = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let cancel = assembler.ctx.cancel.clone();

        thread::scope(|scope| {
            let (tx, rx) = mpsc::sync_channel::<Result<TileBuffer, UpscaleError>>(workers);

            for _ in 0..workers {
                let tx = tx.clone();
                let (cursor, stop, cancel) = (&cursor, &stop, &cancel);
                scope.spawn(move || loop {
                    if stop.load(Ordering::SeqCst) || cancel.is_cancelled() {
                        break;
                    }
                    let next = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(desc) = grid.tiles.get(next) else {
                        break;
                    };
                    let result = self.process_tile(image, desc, model);
                    let failed = result.is_err();
                    if tx.send(result).is_err() || failed {
                        break;
                    }
                });
            }
            drop(tx);

            let outcome = drain(rx, &cancel, assembler);
            if outcome.is_err() {
                stop.store(true, Ordering::SeqCst);
            }
            outcome
        })
    }

    /// Extract and infer one tile, retrying transient inference failures.
    fn process_tile(
        &self,
        image: &Image,
        desc: &TileDescriptor,
        model: &dyn UpscaleModel,
    ) -> Result<TileBuffer, UpscaleError> {
        let fail = |attempts: u32, source: TileError| UpscaleError::TileFailed {
            index: desc.index,
            column: desc.column,
            row: desc.row,
            attempts,
            source,
        };

        let input = extract(image, desc).map_err(|e| fail(0, e))?;
        let scale = model.scale();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match infer_tile(model, &input.pixels, scale) {
                Ok(pixels) => {
                    debug!(
                        tile = desc.index,
                        attempts,
                        width = pixels.width(),
                        height = pixels.height(),
                        "Tile inferred"
                    );
                    return Ok(TileBuffer::new(*desc, pixels));
                }
                Err(error) if error.is_transient() && attempts <= self.options.max_retries => {
                    warn!(
                        tile = desc.index,
                        column = desc.column,
                        row = desc.row,
                        attempt = attempts,
                        max_retries = self.options.max_retries,
                        error = %error,
                        "Tile inference failed; retrying"
                    );
                }
                Err(error) => return Err(fail(attempts, error)),
            }
        }
    }
}

/// Blend tiles as workers deliver them. Consumes `rx` so that returning
/// early unblocks any worker waiting in `send`.
fn drain(
    rx: mpsc::Receiver<Result<TileBuffer, UpscaleError>>,
    cancel: &CancelFlag,
    assembler: &mut Assembler<'_>,
) -> Result<(), UpscaleError> {
    for result in rx {
        if cancel.is_cancelled() {
            return Err(assembler.cancelled());
        }
        assembler.blend(result?)?;
    }
    Ok(())
}

/// Run the model and check the returned shape.
fn infer_tile(model: &dyn UpscaleModel, input: &Image, scale: u32) -> Result<Image, TileError> {
    let output = model.upscale_tile(input)?;

    let expected_width = input.width() * scale;
    let expected_height = input.height() * scale;
    if output.width() != expected_width
        || output.height() != expected_height
        || output.channels() != input.channels()
    {
        return Err(TileError::OutputShape {
            expected_width,
            expected_height,
            expected_channels: input.channels(),
            actual_width: output.width(),
            actual_height: output.height(),
            actual_channels: output.channels(),
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::InferenceError;
    use crate::model::NearestNeighbor;

    fn options(tile_size: u32, overlap: u32) -> TilingOptions {
        TilingOptions {
            tile_size,
            overlap,
            ..Default::default()
        }
    }

    fn checker(width: u32, height: u32) -> Image {
        Image::from_fn(width, height, 3, |x, y, c| {
            (((x / 3 + y / 5) % 2) as f32 * 0.6 + c as f32 * 0.1).min(1.0)
        })
    }

    /// Returns a wrong-sized tile.
    struct Shrinker;

    impl UpscaleModel for Shrinker {
        fn name(&self) -> &str {
            "shrinker"
        }
        fn scale(&self) -> u32 {
            2
        }
        fn upscale_tile(&self, tile: &Image) -> Result<Image, InferenceError> {
            Ok(Image::new(tile.width(), tile.height(), tile.channels()))
        }
    }

    /// Records the size of every tile it is handed.
    struct Recorder {
        inner: NearestNeighbor,
        seen: Mutex<Vec<(u32, u32)>>,
    }

    impl UpscaleModel for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn scale(&self) -> u32 {
            self.inner.scale()
        }
        fn upscale_tile(&self, tile: &Image) -> Result<Image, InferenceError> {
            self.seen.lock().unwrap().push((tile.width(), tile.height()));
            self.inner.upscale_tile(tile)
        }
    }

    #[test]
    fn test_default_options_do_not_pad_past_image_edges() {
        let pipeline = TilePipeline::new(options(256, 16));
        let model = Recorder {
            inner: NearestNeighbor::new(2),
            seen: Mutex::new(Vec::new()),
        };

        pipeline.upscale(&checker(100, 80), &model).unwrap();
        assert_eq!(*model.seen.lock().unwrap(), [(100, 80)]);

        model.seen.lock().unwrap().clear();
        pipeline.upscale(&checker(300, 300), &model).unwrap();
        assert_eq!(
            *model.seen.lock().unwrap(),
            [(272, 272), (60, 272), (272, 60), (60, 60)]
        );
    }

    #[test]
    fn test_default_options() {
        let opts = TilingOptions::default();
        assert_eq!(opts.tile_size, 512);
        assert_eq!(opts.overlap, 32);
        assert_eq!(opts.edge_padding, EdgePadding::Omit);
        assert_eq!(opts.max_retries, 1);
        assert_eq!(opts.max_in_flight, 1);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        assert!(options(64, 32).validate().is_err());
        assert!(options(0, 0).validate().is_err());
        let opts = TilingOptions {
            max_in_flight: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_tiled_matches_whole_image_nearest_neighbor() {
        let img = checker(70, 45);
        let model = NearestNeighbor::new(2);
        let expected = model.upscale_tile(&img).unwrap();

        let out = TilePipeline::new(options(16, 4)).upscale(&img, &model).unwrap();
        assert_eq!((out.width(), out.height()), (140, 90));
        for (a, b) in out.pixels().iter().zip(expected.pixels().iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rejects_invalid_configuration_before_work() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let ctx = UpscaleContext::new().on_event(move |e| {
            sink.lock().unwrap().push(format!("{e:?}"));
        });

        let err = TilePipeline::new(options(8, 4))
            .upscale_with(&checker(10, 10), &NearestNeighbor::new(2), &ctx)
            .unwrap_err();
        assert!(matches!(err, UpscaleError::Rejected(TileError::Configuration(_))));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].starts_with("Failed"));
    }

    #[test]
    fn test_wrong_output_shape_is_not_retried() {
        let err = TilePipeline::new(options(16, 2))
            .upscale(&checker(20, 20), &Shrinker)
            .unwrap_err();
        match err {
            UpscaleError::TileFailed {
                index,
                attempts,
                source: TileError::OutputShape { expected_width, .. },
                ..
            } => {
                assert_eq!(index, 0);
                assert_eq!(attempts, 1);
                assert_eq!(expected_width, 2 * (16 + 2));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_progress_is_monotonic_and_complete() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = UpscaleContext::new().on_event(move |e| {
            if let UpscaleEvent::Progress(p) = e {
                sink.lock().unwrap().push(p);
            }
        });

        TilePipeline::new(options(16, 4))
            .upscale_with(&checker(40, 40), &NearestNeighbor::new(1), &ctx)
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 9);
        for (i, p) in seen.iter().enumerate() {
            assert_eq!(p.tiles_completed, i + 1);
            assert_eq!(p.total_tiles, 9);
        }
        assert_eq!(seen.last().unwrap().fraction(), 1.0);
    }

    #[test]
    fn test_precancelled_call_does_no_work() {
        let ctx = UpscaleContext::new();
        ctx.cancel.cancel();
        let err = TilePipeline::new(options(16, 4))
            .upscale_with(&checker(40, 40), &NearestNeighbor::new(2), &ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            UpscaleError::Cancelled {
                completed: 0,
                total: 9
            }
        ));
    }

    #[test]
    fn test_plan_reports_grid() {
        let grid = TilePipeline::new(options(256, 16)).plan(300, 300, 4).unwrap();
        assert_eq!(grid.len(), 4);
        assert_eq!(grid.output_width, 1200);
    }
}
