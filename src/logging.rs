//! Logging configuration for Discwright
//!
//! Logs are written to both the terminal and a file at:
//! `<local data dir>/Discwright/logs/discwright.log`
//!
//! The file keeps debug output, so it is the one to attach to bug reports.

use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

const LOG_FILE_NAME: &str = "discwright.log";

/// Log files above this size are moved to `.old` at startup
pub const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Get the log directory path
pub fn get_log_directory() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("Discwright").join("logs"))
}

/// Get the current log file path
pub fn get_log_file_path() -> Option<PathBuf> {
    get_log_directory().map(|d| d.join(LOG_FILE_NAME))
}

/// Move `log_path` aside to `<name>.old` if it is larger than `limit` bytes
///
/// Returns true if the file was rotated.
pub fn rotate_if_large(log_path: &Path, limit: u64) -> bool {
    let Ok(metadata) = fs::metadata(log_path) else {
        return false;
    };
    if metadata.len() <= limit {
        return false;
    }

    let mut backup = log_path.as_os_str().to_owned();
    backup.push(".old");
    fs::rename(log_path, PathBuf::from(backup)).is_ok()
}

/// Initialize the logging system
///
/// Sets up combined logging to:
/// - Terminal (info and above, debug with `verbose`)
/// - File (debug and above)
///
/// Returns the path to the log file on success
pub fn init_logging(verbose: bool) -> Option<PathBuf> {
    let terminal_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let Some(log_dir) = get_log_directory() else {
        eprintln!("Warning: Could not determine log directory");
        init_terminal_only(terminal_level);
        return None;
    };

    if let Err(e) = fs::create_dir_all(&log_dir) {
        eprintln!("Warning: Could not create log directory: {}", e);
        init_terminal_only(terminal_level);
        return None;
    }

    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_if_large(&log_path, MAX_LOG_SIZE);

    let log_file = match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not open log file: {}", e);
            init_terminal_only(terminal_level);
            return None;
        }
    };

    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_thread_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .build();

    let loggers: Vec<Box<dyn SharedLogger>> = vec![
        TermLogger::new(terminal_level, config.clone(), TerminalMode::Stderr, ColorChoice::Auto),
        WriteLogger::new(LevelFilter::Debug, config, log_file),
    ];

    if CombinedLogger::init(loggers).is_err() {
        eprintln!("Warning: Logger already initialized");
    }

    log::info!("=== Discwright {} session started ===", env!("CARGO_PKG_VERSION"));
    log::debug!("Log file: {}", log_path.display());

    Some(log_path)
}

/// Initialize terminal-only logging (fallback if file logging fails)
fn init_terminal_only(level: LevelFilter) {
    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_thread_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .build();

    let term_logger = TermLogger::new(level, config, TerminalMode::Stderr, ColorChoice::Auto);
    let _ = CombinedLogger::init(vec![term_logger]);
}
