//! Logging setup.

use chrono::Local;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::setting::Settings;

/// Log level constants (compatible with Python logging module)
pub const DEBUG: i32 = 10;
pub const INFO: i32 = 20;
pub const WARNING: i32 = 30;
pub const ERROR: i32 = 40;
pub const CRITICAL: i32 = 50;

/// Convert integer log level to tracing Level
pub fn level_from_int(level: i32) -> Level {
    match level {
        i32::MIN..=10 => Level::DEBUG,
        11..=20 => Level::INFO,
        21..=30 => Level::WARN,
        _ => Level::ERROR,
    }
}

/// Initialize the global tracing subscriber from settings.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_logger(settings: &Settings) -> bool {
    let log_level = settings.get_int("log.level").unwrap_or(INFO as i64) as i32;
    let log_console = settings.get_bool("log.console").unwrap_or(true);
    let log_file = settings.get_bool("log.file").unwrap_or(false);

    let filter = EnvFilter::from_default_env().add_directive(level_from_int(log_level).into());
    let console_layer = log_console.then(|| fmt::layer().with_target(true).with_ansi(true));
    let file_layer = if log_file {
        open_log_file().map(|file| fmt::layer().with_writer(std::sync::Mutex::new(file)).with_ansi(false))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok()
}

fn open_log_file() -> Option<fs::File> {
    let path = log_file_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok()?;
    }
    OpenOptions::new().create(true).append(true).open(&path).ok()
}

/// Get the log file path for today
pub fn log_file_path() -> Option<PathBuf> {
    let today = Local::now().format("%Y%m%d").to_string();
    let folder = dirs::home_dir()?.join(".topic_rpc").join("log");
    Some(folder.join(format!("rpc_{}.log", today)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_int() {
        assert_eq!(level_from_int(DEBUG), Level::DEBUG);
        assert_eq!(level_from_int(INFO), Level::INFO);
        assert_eq!(level_from_int(WARNING), Level::WARN);
        assert_eq!(level_from_int(ERROR), Level::ERROR);
        assert_eq!(level_from_int(CRITICAL), Level::ERROR);
    }

    #[test]
    fn test_log_file_name() {
        if let Some(path) = log_file_path() {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            assert!(name.starts_with("rpc_"));
            assert!(name.ends_with(".log"));
        }
    }
}
