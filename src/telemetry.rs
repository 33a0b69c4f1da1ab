//! Installs the global `tracing` subscriber per `Config`'s log knobs
//! (spec §6: log level, log format, log file).

use crate::config::{Config, LogFormat};
use tracing_subscriber::EnvFilter;

/// Returns a guard that must be held for the process lifetime when
/// logging to a file (the non-blocking writer flushes on drop).
pub fn init(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_file {
        Some(path) => {
            let directory = std::path::Path::new(path)
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = std::path::Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "clank.log".to_string());
            let file_appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(file_appender);

            let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer);
            match config.log_format {
                LogFormat::Json => subscriber.json().init(),
                LogFormat::Text => subscriber.init(),
            }
            Some(guard)
        }
        None => {
            let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
            match config.log_format {
                LogFormat::Json => subscriber.json().init(),
                LogFormat::Text => subscriber.init(),
            }
            None
        }
    }
}
