//! File logging setup
//!
//! The app log is written next to the executable (`logs/app.log`) so release
//! builds without a console can still be debugged. The core child process
//! gets its own log file through launcher redirection.

use std::path::Path;

use crate::config::LogLevel;

/// Rotate the log file if it exceeds this size.
const MAX_LOG_SIZE: u64 = 1024 * 1024;

/// Renames an oversized log to `<name>.old` (replacing any previous one) so
/// the active log stays bounded.
pub fn rotate_log_if_needed(path: &Path) -> std::io::Result<()> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(_) => return Ok(()),
    };
    if metadata.len() <= MAX_LOG_SIZE {
        return Ok(());
    }
    let mut rotated = path.as_os_str().to_os_string();
    rotated.push(".old");
    std::fs::rename(path, rotated)?;
    Ok(())
}

/// Initializes the global logger, piping records into `log_file` in append
/// mode. Falls back to stderr if the file cannot be opened.
pub fn init(log_file: &Path, level: LogLevel) {
    if let Err(error) = rotate_log_if_needed(log_file) {
        eprintln!("failed to rotate log {}: {}", log_file.display(), error);
    }

    let filter = level.to_filter();
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
    {
        Ok(file) => {
            env_logger::Builder::from_default_env()
                .filter_level(filter)
                .format_timestamp_millis()
                .target(env_logger::Target::Pipe(Box::new(file)))
                .init();
        }
        Err(error) => {
            env_logger::Builder::from_default_env()
                .filter_level(filter)
                .format_timestamp_millis()
                .init();
            log::warn!(
                "failed to open log file {}: {}, logging to stderr",
                log_file.display(),
                error
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_is_a_noop_for_missing_file() {
        let path = std::env::temp_dir().join("customvpn-no-such-log.log");
        assert!(rotate_log_if_needed(&path).is_ok());
    }

    #[test]
    fn rotate_moves_oversized_log() {
        let dir = std::env::temp_dir().join(format!("customvpn-logrotate-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("app.log");
        std::fs::write(&path, vec![b'x'; (MAX_LOG_SIZE + 1) as usize]).unwrap();

        rotate_log_if_needed(&path).unwrap();
        assert!(!path.exists());
        let mut rotated = path.as_os_str().to_os_string();
        rotated.push(".old");
        assert!(Path::new(&rotated).exists());

        std::fs::remove_dir_all(&dir).ok();
    }
}
