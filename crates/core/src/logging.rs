//! Log filter selection and the rotating log file.
//!
//! The CLI builds a [`LogSetup`] from its flags and installs the subscriber
//! itself; this module only decides what to install.

use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// Prepended to the console filter unless the user chose one explicitly.
pub const CONSOLE_NOISE_FILTER: &str = "ort=error";
/// The log file keeps ORT warnings (provider fallbacks, TRT engine builds).
pub const FILE_NOISE_FILTER: &str = "ort=warn";
pub const LOG_RETENTION_DAYS: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
const LOG_FILE_PREFIX: &str = "tilescale";
const LOG_FILE_SUFFIX: &str = "log";

/// Where filter directives can come from, highest priority first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSources {
    /// `--log-filter`
    pub explicit: Option<String>,
    /// Count of `-v` flags.
    pub verbose: u8,
    /// `RUST_LOG`
    pub env: Option<String>,
}

impl FilterSources {
    /// Filter the user asked for, and whether they asked on the command line.
    fn user_filter(&self) -> (String, bool) {
        match (&self.explicit, self.verbose, &self.env) {
            (Some(filter), _, _) => (filter.clone(), true),
            (None, 0, Some(filter)) => (filter.clone(), false),
            (None, 0, None) => (DEFAULT_LOG_FILTER.to_string(), false),
            (None, 1, _) => ("debug".to_string(), true),
            (None, _, _) => ("trace".to_string(), true),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub user: String,
    pub console: String,
    pub file: String,
}

/// `--log-filter` > `-v`/`-vv` > `RUST_LOG` > `info`. Noise directives are
/// added only when nothing was chosen on the command line.
pub fn resolve_filters(sources: &FilterSources) -> LogFilters {
    let (user, from_cli) = sources.user_filter();
    let with_noise = |noise: &str| {
        if from_cli {
            user.clone()
        } else {
            format!("{noise},{user}")
        }
    };

    LogFilters {
        console: with_noise(CONSOLE_NOISE_FILTER),
        file: with_noise(FILE_NOISE_FILTER),
        user,
    }
}

/// Outcome of preparing `<data_dir>/logs`.
#[derive(Debug)]
pub enum LogFile {
    Ready {
        dir: PathBuf,
        appender: RollingFileAppender,
    },
    Unavailable {
        dir: Option<PathBuf>,
        reason: String,
    },
}

impl LogFile {
    pub fn dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { dir, .. } => Some(dir),
            Self::Unavailable { dir, .. } => dir.as_deref(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Daily-rotated log file keeping the last `retention_days` files.
pub fn open_log_file(data_dir: Option<&Path>, retention_days: usize) -> LogFile {
    let Some(data_dir) = data_dir else {
        return LogFile::Unavailable {
            dir: None,
            reason: "no data directory configured".to_string(),
        };
    };

    let dir = data_dir.join(LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&dir) {
        return LogFile::Unavailable {
            dir: Some(dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention_days.max(1))
        .build(&dir);

    match built {
        Ok(appender) => LogFile::Ready { dir, appender },
        Err(error) => LogFile::Unavailable {
            dir: Some(dir),
            reason: format!("failed to open rolling log file: {error}"),
        },
    }
}

#[derive(Debug)]
pub struct LogSetup {
    pub filters: LogFilters,
    pub file: LogFile,
}

pub fn plan_logging(sources: &FilterSources, data_dir: Option<&Path>) -> LogSetup {
    LogSetup {
        filters: resolve_filters(sources),
        file: open_log_file(data_dir, LOG_RETENTION_DAYS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources(explicit: Option<&str>, verbose: u8, env: Option<&str>) -> FilterSources {
        FilterSources {
            explicit: explicit.map(str::to_string),
            verbose,
            env: env.map(str::to_string),
        }
    }

    #[test]
    fn explicit_filter_wins_and_skips_noise() {
        let filters = resolve_filters(&sources(Some("tilescale_core=trace"), 2, Some("error")));
        assert_eq!(filters.user, "tilescale_core=trace");
        assert_eq!(filters.console, "tilescale_core=trace");
        assert_eq!(filters.file, "tilescale_core=trace");
    }

    #[test]
    fn verbosity_beats_rust_log() {
        assert_eq!(resolve_filters(&sources(None, 1, Some("warn"))).console, "debug");
        assert_eq!(resolve_filters(&sources(None, 3, None)).console, "trace");
    }

    #[test]
    fn rust_log_keeps_noise_directives() {
        let filters = resolve_filters(&sources(None, 0, Some("warn,tilescale_core=debug")));
        assert_eq!(filters.user, "warn,tilescale_core=debug");
        assert_eq!(filters.console, "ort=error,warn,tilescale_core=debug");
        assert_eq!(filters.file, "ort=warn,warn,tilescale_core=debug");
    }

    #[test]
    fn default_is_info_with_noise() {
        let filters = resolve_filters(&FilterSources::default());
        assert_eq!(filters.user, "info");
        assert_eq!(filters.console, "ort=error,info");
        assert_eq!(filters.file, "ort=warn,info");
    }

    #[test]
    fn log_file_lives_under_data_dir() {
        let data_dir = tempfile::tempdir().unwrap();
        let file = open_log_file(Some(data_dir.path()), 0);
        assert!(file.is_ready());
        assert_eq!(file.dir(), Some(data_dir.path().join(LOG_DIR_NAME).as_path()));
        assert!(data_dir.path().join(LOG_DIR_NAME).is_dir());
    }

    #[test]
    fn log_file_unavailable_without_data_dir() {
        let file = open_log_file(None, LOG_RETENTION_DAYS);
        assert!(!file.is_ready());
        assert!(file.dir().is_none());
    }

    #[test]
    fn log_file_unavailable_when_dir_cannot_be_created() {
        let not_a_dir = tempfile::NamedTempFile::new().unwrap();
        match open_log_file(Some(not_a_dir.path()), LOG_RETENTION_DAYS) {
            LogFile::Unavailable { dir, reason } => {
                assert_eq!(dir, Some(not_a_dir.path().join(LOG_DIR_NAME)));
                assert!(reason.contains("failed to create log directory"));
            }
            LogFile::Ready { .. } => panic!("expected the log file to be unavailable"),
        }
    }
}
