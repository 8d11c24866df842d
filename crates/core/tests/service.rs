use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use tempfile::tempdir;
use tilescale_core::config::AppConfig;
use tilescale_core::pipeline::UpscaleContext;
use tilescale_core::service::{is_cancellation, UpscaleService};

fn write_fixture(path: &Path, width: u32, height: u32) {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
    });
    img.save(path).expect("write fixture");
}

fn small_tiles() -> AppConfig {
    let mut config = AppConfig::default();
    config.tiling.tile_size = 16;
    config.tiling.overlap = 4;
    config
}

#[test]
fn png_round_trip_with_builtin_model() {
    let temp = tempdir().expect("tempdir");
    let input = temp.path().join("photo.png");
    write_fixture(&input, 45, 30);

    let mut service = UpscaleService::new(small_tiles(), temp.path().to_path_buf()).unwrap();
    let model = service.load_model("nearest-x2").unwrap();
    let report = service
        .upscale_file(&input, None, model.as_ref(), &UpscaleContext::new())
        .unwrap();

    assert_eq!(report.output, temp.path().join("output").join("photo_upscaled.png"));
    assert_eq!(report.input_size, (45, 30));
    assert_eq!(report.output_size, (90, 60));
    assert_eq!(report.tiles, 6);
    assert_eq!(report.model, "nearest-x2");

    let source = image::open(&input).unwrap().to_rgb8();
    let written = image::open(&report.output).unwrap().to_rgb8();
    assert_eq!(written.dimensions(), (90, 60));
    for (x, y, pixel) in written.enumerate_pixels() {
        assert_eq!(pixel, source.get_pixel(x / 2, y / 2), "pixel ({x}, {y})");
    }
}

#[test]
fn explicit_output_path_is_used() {
    let temp = tempdir().expect("tempdir");
    let input = temp.path().join("in.png");
    let output = temp.path().join("nested").join("big.png");
    write_fixture(&input, 10, 10);

    let mut service = UpscaleService::new(small_tiles(), temp.path().to_path_buf()).unwrap();
    let model = service.load_model("nearest-x3").unwrap();
    let report = service
        .upscale_file(&input, Some(&output), model.as_ref(), &UpscaleContext::new())
        .unwrap();

    assert_eq!(report.output, output);
    assert_eq!(image::image_dimensions(&output).unwrap(), (30, 30));
}

#[test]
fn batch_continues_after_unreadable_file() {
    let temp = tempdir().expect("tempdir");
    let good = temp.path().join("good.png");
    let bad = temp.path().join("bad.png");
    write_fixture(&good, 12, 12);
    std::fs::write(&bad, b"not an image").unwrap();
    let out_dir = temp.path().join("batch");

    let mut service = UpscaleService::new(small_tiles(), temp.path().to_path_buf()).unwrap();
    let model = service.load_model("nearest-x2").unwrap();
    let inputs: Vec<PathBuf> = vec![bad.clone(), good.clone()];
    let mut seen = Vec::new();
    let report = service.upscale_files(
        &inputs,
        Some(&out_dir),
        model.as_ref(),
        &UpscaleContext::new(),
        |index, path, result| seen.push((index, path.to_path_buf(), result.is_ok())),
    );

    assert_eq!(seen, vec![(0, bad.clone(), false), (1, good, true)]);
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.succeeded[0].output, out_dir.join("good_upscaled.png"));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, bad);
    assert!(report.failed[0].1.contains("failed to decode image"));
    assert!(!report.cancelled);
}

#[test]
fn cancelled_batch_skips_remaining_files() {
    let temp = tempdir().expect("tempdir");
    let inputs: Vec<PathBuf> = (0..3)
        .map(|i| {
            let path = temp.path().join(format!("img{i}.png"));
            write_fixture(&path, 8, 8);
            path
        })
        .collect();

    let mut service = UpscaleService::new(small_tiles(), temp.path().to_path_buf()).unwrap();
    let model = service.load_model("nearest-x2").unwrap();
    let ctx = UpscaleContext::new();
    let cancel = ctx.cancel.clone();

    let report = service.upscale_files(&inputs, None, model.as_ref(), &ctx, |index, _, result| {
        if index == 0 {
            assert!(result.is_ok());
            cancel.cancel();
        } else {
            let error = result.as_ref().err().expect("cancelled");
            assert!(is_cancellation(error));
            assert_eq!(error.to_string(), "skipped: batch cancelled");
        }
    });

    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.failed.len(), 2);
    assert!(report.failed.iter().all(|(_, msg)| msg == "skipped: batch cancelled"));
    assert!(report.cancelled);
    assert!(!temp.path().join("output").join("img1_upscaled.png").exists());
}
