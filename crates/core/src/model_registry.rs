use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Content the model was trained for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Photo,
    Anime,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Photo => write!(f, "photo"),
            Self::Anime => write!(f, "anime"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    pub display_name: String,
    pub kind: ModelKind,
    pub filename: String,
    pub url: Option<String>,
    pub sha256: Option<String>,
    /// Upscale factor (2, 3 or 4).
    pub scale: u32,
    /// Value range the model expects/produces: `(0.0, 255.0)` or `(0.0, 1.0)`.
    pub normalization_range: (f32, f32),
    /// Spatial dimensions must be multiples of this (4 for ESRGAN, 8 for SwinIR).
    pub pad_align: u32,
    /// Whether the model uses FP16 (half-precision) inputs/outputs.
    pub is_fp16: bool,
    pub description: String,
}

fn builtin_catalog() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            name: "realesrgan-x4plus".into(),
            display_name: "RealESRGAN x4plus".into(),
            kind: ModelKind::Photo,
            filename: "RealESRGAN_x4plus.onnx".into(),
            url: None,
            sha256: None,
            scale: 4,
            normalization_range: (0.0, 1.0),
            pad_align: 4,
            is_fp16: false,
            description: "General-purpose 4x photo model (RRDB, 23 blocks)".into(),
        },
        ModelEntry {
            name: "realesrgan-x4plus-anime".into(),
            display_name: "RealESRGAN x4plus Anime".into(),
            kind: ModelKind::Anime,
            filename: "RealESRGAN_x4plus_anime_6B.onnx".into(),
            url: Some("https://huggingface.co/deepghs/imgutils-models/resolve/main/onnx/realesrgan/RealESRGAN_x4plus_anime_6B.onnx".into()),
            sha256: None,
            scale: 4,
            normalization_range: (0.0, 255.0),
            pad_align: 4,
            is_fp16: false,
            description: "4x anime-optimized model (6-block variant, 17.9 MB)".into(),
        },
        ModelEntry {
            name: "realesrgan-x2plus".into(),
            display_name: "RealESRGAN x2plus".into(),
            kind: ModelKind::Photo,
            filename: "RealESRGAN_x2plus.onnx".into(),
            url: None,
            sha256: None,
            scale: 2,
            normalization_range: (0.0, 1.0),
            pad_align: 4,
            is_fp16: false,
            description: "General-purpose 2x photo model".into(),
        },
        ModelEntry {
            name: "swinir-large".into(),
            display_name: "SwinIR Large".into(),
            kind: ModelKind::Photo,
            filename: "SwinIR-L_x4_GAN.onnx".into(),
            url: None,
            sha256: None,
            scale: 4,
            normalization_range: (0.0, 1.0),
            pad_align: 8,
            is_fp16: false,
            description: "SwinIR-L real-world 4x model (window size 8)".into(),
        },
    ]
}

/// Upscale factor from an `x2`/`x3`/`x4` marker in a file name; 4 when absent.
fn scale_from_filename(lower: &str) -> u32 {
    for (marker, scale) in [("x2", 2), ("x3", 3), ("x4", 4)] {
        if lower.contains(marker) {
            return scale;
        }
    }
    4
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn with_builtin_models(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: builtin_catalog(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Register `*.onnx` files in the models directory that no entry claims.
    pub fn discover(&mut self) -> Result<()> {
        let dir = &self.models_dir;
        if !dir.exists() {
            return Ok(());
        }

        let read_dir = fs::read_dir(dir)
            .with_context(|| format!("Failed to read models directory: {}", dir.display()))?;

        let mut found = Vec::new();
        for entry in read_dir {
            let path = entry?.path();
            let is_onnx = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("onnx"))
                .unwrap_or(false);
            if !is_onnx {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if self.entries.iter().any(|e| e.filename == filename) {
                continue;
            }
            found.push(filename.to_string());
        }
        // read_dir order is platform-dependent.
        found.sort();

        for filename in found {
            let name = Path::new(&filename)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(&filename)
                .to_string();
            let lower = filename.to_lowercase();
            let scale = scale_from_filename(&lower);

            info!(filename = %filename, scale, "Discovered unknown ONNX model");

            self.entries.push(ModelEntry {
                display_name: name.clone(),
                name,
                kind: if lower.contains("anime") {
                    ModelKind::Anime
                } else {
                    ModelKind::Photo
                },
                filename,
                url: None,
                sha256: None,
                scale,
                normalization_range: (0.0, 1.0),
                pad_align: 4,
                is_fp16: lower.contains("fp16"),
                description: "Discovered model (metadata inferred from file name)".into(),
            });
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn is_downloaded(&self, name: &str) -> bool {
        self.get(name)
            .map(|e| self.models_dir.join(&e.filename).is_file())
            .unwrap_or(false)
    }

    pub fn model_path(&self, name: &str) -> Option<PathBuf> {
        self.get(name).map(|e| self.models_dir.join(&e.filename))
    }

    /// Fetch the model file into the models directory, calling `on_progress`
    /// with the bytes received so far and the response's `Content-Length`
    /// after every chunk.
    ///
    /// The body is streamed to `<file>.part`, checked against the configured
    /// SHA-256 when there is one, then renamed into place.
    pub fn download<F>(&self, name: &str, mut on_progress: F) -> Result<PathBuf>
    where
        F: FnMut(u64, Option<u64>),
    {
        let entry = self
            .get(name)
            .with_context(|| format!("Unknown model: {name}"))?;

        let url = entry
            .url
            .as_deref()
            .with_context(|| format!("No download URL for model: {name}"))?;

        fs::create_dir_all(&self.models_dir).with_context(|| {
            format!(
                "Failed to create models directory: {}",
                self.models_dir.display()
            )
        })?;

        let final_path = self.models_dir.join(&entry.filename);
        let tmp_path = self.models_dir.join(format!("{}.part", entry.filename));

        info!(model = %name, url = %url, "Downloading model");

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30 * 60))
            .build()
            .context("Failed to build HTTP client for model download")?;

        let mut response = client
            .get(url)
            .send()
            .with_context(|| format!("Failed to start download for model {name}"))?;

        if !response.status().is_success() {
            bail!(
                "Download request for model {name} returned HTTP {}",
                response.status().as_u16()
            );
        }

        let total = response.content_length();
        let result = (|| -> Result<()> {
            let mut tmp_file = fs::File::create(&tmp_path)
                .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;
            let written = copy_with_progress(&mut response, &mut tmp_file, total, &mut on_progress)
                .with_context(|| format!("Failed while downloading model {name} from {url}"))?;
            if let Some(expected) = total.filter(|&t| t != written) {
                bail!("Download of model {name} truncated: got {written} of {expected} bytes");
            }
            tmp_file
                .sync_all()
                .with_context(|| format!("Failed to flush temp file: {}", tmp_path.display()))?;
            verify_sha256(name, &tmp_path, entry.sha256.as_deref())
        })();

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "Failed to move {} → {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;

        info!(model = %name, path = %final_path.display(), "Download complete");
        Ok(final_path)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("Failed to serialize model catalog")
    }

    /// Merge entries from a JSON catalog; names already present are kept as is.
    pub fn load_json(&mut self, json: &str) -> Result<()> {
        let loaded: Vec<ModelEntry> =
            serde_json::from_str(json).context("Failed to parse model catalog JSON")?;
        for entry in loaded {
            if !self.entries.iter().any(|e| e.name == entry.name) {
                self.entries.push(entry);
            }
        }
        Ok(())
    }
}

/// `io::copy` in fixed chunks, reporting the running byte count. Reports 0
/// before the first read so callers can draw an empty bar.
fn copy_with_progress<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    total: Option<u64>,
    on_progress: &mut F,
) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    F: FnMut(u64, Option<u64>),
{
    let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];
    let mut copied = 0u64;
    on_progress(copied, total);
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        writer.write_all(&buf[..n])?;
        copied += n as u64;
        on_progress(copied, total);
    }
    writer.flush()?;
    Ok(copied)
}

fn verify_sha256(name: &str, path: &Path, expected: Option<&str>) -> Result<()> {
    let Some(expected) = expected else {
        warn!(model = %name, "No SHA256 hash configured; skipping verification");
        return Ok(());
    };

    info!(model = %name, "Verifying SHA256 hash");
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        bail!("SHA256 mismatch for {name}: expected {expected}, got {actual}");
    }
    info!(model = %name, "Hash verified OK");
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_WORLD_SHA256: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_builtin_catalog() {
        let catalog = builtin_catalog();
        let names: Vec<&str> = catalog.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "realesrgan-x4plus",
                "realesrgan-x4plus-anime",
                "realesrgan-x2plus",
                "swinir-large"
            ]
        );
        assert!(catalog.iter().all(|e| e.filename.ends_with(".onnx")));
    }

    #[test]
    fn test_get_existing() {
        let reg = ModelRegistry::with_builtin_models(PathBuf::from("models"));

        let anime = reg.get("realesrgan-x4plus-anime").unwrap();
        assert_eq!(anime.scale, 4);
        assert_eq!(anime.kind, ModelKind::Anime);
        assert_eq!(anime.normalization_range, (0.0, 255.0));
        assert!(anime.url.is_some());

        let x2 = reg.get("realesrgan-x2plus").unwrap();
        assert_eq!(x2.scale, 2);
        assert_eq!(x2.kind, ModelKind::Photo);

        let swinir = reg.get("swinir-large").unwrap();
        assert_eq!(swinir.pad_align, 8);

        assert!(reg.get("NonExistentModel").is_none());
    }

    #[test]
    fn test_model_path() {
        let reg = ModelRegistry::with_builtin_models(PathBuf::from("models"));
        assert_eq!(
            reg.model_path("realesrgan-x2plus"),
            Some(PathBuf::from("models/RealESRGAN_x2plus.onnx"))
        );
        assert!(reg.model_path("FakeModel").is_none());
    }

    #[test]
    fn test_is_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ModelRegistry::with_builtin_models(dir.path().to_path_buf());
        assert!(!reg.is_downloaded("realesrgan-x4plus"));

        fs::write(dir.path().join("RealESRGAN_x4plus.onnx"), b"fake model data").unwrap();
        assert!(reg.is_downloaded("realesrgan-x4plus"));
        assert!(!reg.is_downloaded("unknown"));
    }

    #[test]
    fn test_discover_unknown_models() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("RealESRGAN_x4plus.onnx"), b"known").unwrap();
        fs::write(dir.path().join("4xNomos_anime_fp16.onnx"), b"data").unwrap();
        fs::write(dir.path().join("custom_x2_compact.ONNX"), b"data").unwrap();
        fs::write(dir.path().join("plain.onnx"), b"data").unwrap();
        fs::write(dir.path().join("readme.txt"), b"hello").unwrap();

        let mut reg = ModelRegistry::with_builtin_models(dir.path().to_path_buf());
        reg.discover().unwrap();
        assert_eq!(reg.list().len(), 7);

        let nomos = reg.get("4xNomos_anime_fp16").unwrap();
        assert!(nomos.is_fp16);
        assert_eq!(nomos.kind, ModelKind::Anime);
        assert_eq!(nomos.scale, 4);

        let compact = reg.get("custom_x2_compact").unwrap();
        assert_eq!(compact.scale, 2);
        assert!(!compact.is_fp16);

        assert_eq!(reg.get("plain").unwrap().scale, 4);

        // A second pass finds nothing new.
        reg.discover().unwrap();
        assert_eq!(reg.list().len(), 7);
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = ModelRegistry::with_builtin_models(dir.path().join("missing"));
        reg.discover().unwrap();
        assert_eq!(reg.list().len(), 4);
    }

    #[test]
    fn test_scale_from_filename() {
        assert_eq!(scale_from_filename("realesrgan_x2plus.onnx"), 2);
        assert_eq!(scale_from_filename("model_x3.onnx"), 3);
        assert_eq!(scale_from_filename("swinir-l_x4_gan.onnx"), 4);
        assert_eq!(scale_from_filename("mystery.onnx"), 4);
    }

    #[test]
    fn test_sha256_file_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testfile.bin");
        fs::write(&path, b"hello world").unwrap();

        assert_eq!(sha256_file(&path).unwrap(), HELLO_WORLD_SHA256);
        assert!(verify_sha256("t", &path, Some(HELLO_WORLD_SHA256)).is_ok());
        assert!(verify_sha256("t", &path, Some(&HELLO_WORLD_SHA256.to_uppercase())).is_ok());
        assert!(verify_sha256("t", &path, None).is_ok());

        let err = verify_sha256("t", &path, Some("deadbeef")).unwrap_err();
        assert!(err.to_string().contains("SHA256 mismatch"));
    }

    #[test]
    fn test_json_roundtrip_without_duplicates() {
        let reg = ModelRegistry::with_builtin_models(PathBuf::from("models"));
        let json = reg.to_json().unwrap();

        let mut reg2 = ModelRegistry {
            models_dir: PathBuf::from("models"),
            entries: Vec::new(),
        };
        reg2.load_json(&json).unwrap();
        assert_eq!(reg2.list(), reg.list());

        reg2.load_json(&json).unwrap();
        assert_eq!(reg2.list().len(), 4);
    }

    #[test]
    fn test_download_errors() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ModelRegistry::with_builtin_models(dir.path().to_path_buf());

        let err = reg.download("swinir-large", |_, _| {}).unwrap_err();
        assert!(err.to_string().contains("No download URL"), "got: {err}");

        let err = reg.download("NonExistentModel", |_, _| {}).unwrap_err();
        assert!(err.to_string().contains("Unknown model"), "got: {err}");
    }

    #[test]
    fn test_copy_with_progress_reports_every_chunk() {
        let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = io::Cursor::new(body.clone());
        let mut written = Vec::new();
        let mut seen = Vec::new();

        let copied = copy_with_progress(
            &mut reader,
            &mut written,
            Some(body.len() as u64),
            &mut |done, total| seen.push((done, total)),
        )
        .unwrap();

        assert_eq!(copied, 200_000);
        assert_eq!(written, body);
        let chunk = DOWNLOAD_CHUNK_SIZE as u64;
        let total = Some(200_000);
        assert_eq!(
            seen,
            [
                (0, total),
                (chunk, total),
                (2 * chunk, total),
                (3 * chunk, total),
                (200_000, total)
            ]
        );
    }

    #[test]
    fn test_copy_with_progress_without_content_length() {
        let mut written = Vec::new();
        let mut seen = Vec::new();
        let copied = copy_with_progress(
            &mut io::Cursor::new(Vec::<u8>::new()),
            &mut written,
            None,
            &mut |done, total| seen.push((done, total)),
        )
        .unwrap();

        assert_eq!(copied, 0);
        assert!(written.is_empty());
        assert_eq!(seen, [(0, None)]);
    }

    #[test]
    fn test_copy_with_progress_retries_interrupted_reads() {
        struct Flaky {
            interrupted: bool,
            inner: io::Cursor<Vec<u8>>,
        }
        impl Read for Flaky {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if !self.interrupted {
                    self.interrupted = true;
                    return Err(io::ErrorKind::Interrupted.into());
                }
                self.inner.read(buf)
            }
        }

        let mut reader = Flaky {
            interrupted: false,
            inner: io::Cursor::new(b"hello world".to_vec()),
        };
        let mut written = Vec::new();
        let mut last = 0;
        let copied =
            copy_with_progress(&mut reader, &mut written, None, &mut |done, _| last = done)
                .unwrap();

        assert_eq!(copied, 11);
        assert_eq!(last, 11);
        assert_eq!(written, b"hello world");
    }

    #[test]
    fn test_model_kind_display() {
        assert_eq!(ModelKind::Photo.to_string(), "photo");
        assert_eq!(ModelKind::Anime.to_string(), "anime");
    }

    #[test]
    #[ignore]
    fn test_download_real() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ModelRegistry::with_builtin_models(dir.path().to_path_buf());
        let mut last = (0, None);
        let path = reg
            .download("realesrgan-x4plus-anime", |done, total| last = (done, total))
            .unwrap();
        assert!(path.is_file());
        let size = fs::metadata(&path).unwrap().len();
        assert!(size > 1_000_000);
        assert_eq!(last.0, size);
        assert!(!dir.path().join("RealESRGAN_x4plus_anime_6B.onnx.part").exists());
    }
}
