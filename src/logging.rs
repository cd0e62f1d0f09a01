//! Logging initialisation for luna-vm.
//!
//! When the `LUNA_VM_LOG` environment variable is set to `1`, structured
//! logs are also written to `<logs>/luna-vm.log`. Otherwise only stderr
//! output (filtered by `RUST_LOG`) is enabled.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::{Path, PathBuf};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_NAME: &str = "luna-vm.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// `log_dir` is where the file layer writes when enabled; it falls back to
/// the system temp directory. Call once from `main`.
pub fn init(log_dir: Option<&Path>) -> LogGuard {
    let file_guard = if file_logging_enabled() {
        let dir = log_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| std::env::temp_dir().join("luna-vm"));
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::never(&dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(filter_or("info"))
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter_or("warn"))
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}

/// Path of the log file inside `log_dir`.
pub fn log_file(log_dir: &Path) -> PathBuf {
    log_dir.join(LOG_FILE_NAME)
}

fn file_logging_enabled() -> bool {
    std::env::var("LUNA_VM_LOG").as_deref() == Ok("1")
}

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}
