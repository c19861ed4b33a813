//! Session logger: a `log` backend that writes to a single file.
//!
//! The file is **truncated (overwritten) on each `init`**, so it only ever
//! contains output from the most recent session.
//!
//! Default location:
//!   Windows:  `%APPDATA%\LayerStack\layerstack.log`
//!   Linux:    `~/.local/share/LayerStack/layerstack.log`
//!   macOS:    `~/Library/Application Support/LayerStack/layerstack.log`
//!
//! The crate itself only uses the `log` macros; embedding applications may
//! install this logger or any other `log` implementation.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{LevelFilter, Log, Metadata, Record};

use crate::error::Result;

static LOG_FILE: OnceLock<Mutex<File>> = OnceLock::new();
static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOGGER: SessionLogger = SessionLogger;

struct SessionLogger;

impl Log for SessionLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        write_line(&format!(
            "[{}] [{}] [{}] {}",
            timestamp(),
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {
        if let Some(mutex) = LOG_FILE.get()
            && let Ok(mut file) = mutex.lock()
        {
            let _ = file.flush();
        }
    }
}

/// Returns the path to the current session log file.
pub fn log_path() -> Option<&'static Path> {
    LOG_PATH.get().map(PathBuf::as_path)
}

/// Write a raw line to the session log. I/O errors are ignored so that
/// logging never takes the caller down.
fn write_line(line: &str) {
    if let Some(mutex) = LOG_FILE.get()
        && let Ok(mut file) = mutex.lock()
    {
        let _ = writeln!(file, "{}", line);
    }
}

/// Install the session logger writing to `path` (or [`default_log_path`]).
///
/// * Creates (or truncates) the log file.
/// * Registers with the `log` facade at `level`.
/// * Installs a panic hook that mirrors the panic message into the log
///   before running the previous hook.
///
/// Only the first call per process takes effect; later calls return the
/// path that is already in use.
pub fn init(path: Option<&Path>, level: LevelFilter) -> Result<PathBuf> {
    if let Some(existing) = LOG_PATH.get() {
        return Ok(existing.clone());
    }
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_log_path);

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)?;
    let _ = LOG_PATH.set(path.clone());
    let _ = LOG_FILE.set(Mutex::new(file));

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    } else {
        write_line("another logger is already registered; only panics are recorded here");
    }

    write_line(&format!("=== LayerStack session started {} ===", human_timestamp()));
    write_line(&format!("Log file: {}", path.display()));
    write_line("");

    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        write_line(&format!("[{}] [PANIC] {}", timestamp(), info));
        prev(info);
    }));

    Ok(path)
}

/// `<data dir>/LayerStack/layerstack.log`
pub fn default_log_path() -> PathBuf {
    data_dir().join("LayerStack").join("layerstack.log")
}

/// Platform data directory (without the app sub-folder).
fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library").join("Application Support");
        }
    }
    // Linux / fallback
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    PathBuf::from(".")
}

/// HH:MM:SS.mmm within the current UTC day.
fn timestamp() -> String {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => {
            let secs = d.as_secs();
            let h = (secs % 86400) / 3600;
            let m = (secs % 3600) / 60;
            let s = secs % 60;
            format!("{:02}:{:02}:{:02}.{:03}", h, m, s, d.subsec_millis())
        }
        Err(_) => "??:??:??".to_string(),
    }
}

fn human_timestamp() -> String {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => format!("(unix {})", d.as_secs()),
        Err(_) => "(unknown time)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_ends_in_app_folder() {
        let path = default_log_path();
        assert!(path.ends_with("LayerStack/layerstack.log"));
    }

    #[test]
    fn timestamp_shape() {
        let ts = timestamp();
        assert_eq!(ts.len(), 12);
        assert_eq!(&ts[2..3], ":");
        assert_eq!(&ts[8..9], ".");
    }
}
