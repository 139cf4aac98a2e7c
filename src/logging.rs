use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Logging setup for the client binary. Logs always go to stderr or a file,
/// never stdout, which may be carrying protocol traffic.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive (e.g. "debug", "acp_client=trace,info")
    pub level: String,
    /// Log to this file instead of stderr
    pub file_path: Option<PathBuf>,
    /// Emit one JSON object per event
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Read `RUST_LOG`, `ACP_LOG_FILE`, `ACP_LOG_UNIQUE` and `ACP_LOG_JSON`
    pub fn from_env() -> Self {
        let level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let unique = env::var("ACP_LOG_UNIQUE").unwrap_or_default() == "true";

        let file_path = env::var("ACP_LOG_FILE").ok().map(|path| {
            let path = PathBuf::from(path);
            if unique {
                unique_log_path(&path, std::process::id())
            } else {
                path
            }
        });

        let json_format = env::var("ACP_LOG_JSON").unwrap_or_default() == "true";

        Self {
            level,
            file_path,
            json_format,
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// `client.log` becomes `client.<pid>.log`, so concurrent runs don't interleave
fn unique_log_path(path: &Path, pid: u32) -> PathBuf {
    let Some(stem) = path.file_stem() else {
        return path.to_path_buf();
    };

    let file_name = match path.extension().and_then(|ext| ext.to_str()) {
        Some(extension) => format!("{}.{}.{}", stem.to_string_lossy(), pid, extension),
        None => format!("{}.{}", stem.to_string_lossy(), pid),
    };
    path.with_file_name(file_name)
}

/// Install the global subscriber described by `config`
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;
    let subscriber = tracing_subscriber::registry().with(env_filter);

    match (&config.file_path, config.json_format) {
        (Some(file_path), true) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer().json().with_writer(file).with_ansi(false);
            subscriber.with(file_layer).init();
        }
        (Some(file_path), false) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);
            subscriber.with(file_layer).init();
        }
        (None, true) => {
            let stderr_layer = fmt::layer().json().with_writer(io::stderr).with_ansi(false);
            subscriber.with(stderr_layer).init();
        }
        (None, false) => {
            let stderr_layer = fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(true)
                .with_target(true)
                .with_line_number(true);
            subscriber.with(stderr_layer).init();
        }
    }

    Ok(())
}

/// Log one protocol message in a single structured event
#[macro_export]
macro_rules! log_acp_message {
    ($level:expr, $direction:expr, $method:expr, $data:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            method = %$method,
            data = ?$data,
            "ACP message"
        );
    };
}

/// Log how long an operation took
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis() as u64,
            "Performance timing"
        );
    };
}
