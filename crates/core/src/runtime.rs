//! Locating the ONNX Runtime shared library.
//!
//! `ort` is built with `load-dynamic`, so the library is resolved at run time
//! from `ORT_DYLIB_PATH`. When that is unset we look next to the executable,
//! in the working directory and in the data directory, and set it ourselves.

use std::env;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

#[cfg(all(unix, not(target_os = "macos")))]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

/// Searched in order:
///   1. `<exe_dir>/` (Windows only)
///   2. `<exe_dir>/lib/`
///   3. `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `<data_dir>/lib/` when given
///   6. `/opt/homebrew/lib/` (macOS only)
///   7. `/usr/local/lib/` and `/usr/lib/` (Unix only)
fn candidate_lib_dirs(data_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut push = |dir: PathBuf| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            push(exe_dir.to_path_buf());
            push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"));
    }
    if let Some(data_dir) = data_dir {
        push(data_dir.join("lib"));
    }
    #[cfg(target_os = "macos")]
    push(PathBuf::from("/opt/homebrew/lib"));
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"));
        push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Point `ORT_DYLIB_PATH` at a discovered ONNX Runtime library unless the
/// user already set it. Call before the first session is built.
pub fn setup_runtime_libs(data_dir: Option<&Path>) {
    if env::var_os(ORT_DYLIB_ENV).is_some() {
        return;
    }
    if let Some(path) = find_ort_dylib_in_dirs(&candidate_lib_dirs(data_dir)) {
        env::set_var(ORT_DYLIB_ENV, &path);
    }
}

/// Log which runtime library was resolved. Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match env::var(ORT_DYLIB_ENV) {
        Ok(ort) if Path::new(&ort).is_file() => info!(path = %ort, "ORT library resolved"),
        Ok(ort) => warn!(path = %ort, "ORT_DYLIB_PATH is set but the file does not exist"),
        Err(_) => warn!("ORT_DYLIB_PATH not set; ORT will try default search paths"),
    }
}
