//! Application configuration (`config.yaml`)
//!
//! The config file lives alongside the executable; relative paths inside it
//! resolve against the executable's directory (`app_dir`).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Problems loading or validating `config.yaml`. Any of these surface to the
/// user as a `ConfigFailed` initialization error (exit code 1).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("config {path}: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("create log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("detect executable directory: {0}")]
    AppDir(std::io::Error),
}

/// Minimum log level accepted in `config.yaml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    control_server_url: Option<String>,
    core_path: Option<PathBuf>,
    #[serde(default)]
    log_level: Option<String>,
    log_file: Option<PathBuf>,
}

/// User settings plus the derived paths the rest of the application uses.
#[derive(Debug, Clone)]
pub struct Config {
    pub control_server_url: String,
    pub core_path: PathBuf,
    pub log_level: LogLevel,
    pub log_file: PathBuf,

    /// Directory containing the executable; every relative path resolves here.
    pub app_dir: PathBuf,
    /// Where the supervised core binary's stdout/stderr land.
    pub core_log_file: PathBuf,
}

impl Config {
    /// Loads and validates `config.yaml`, resolving relative paths against
    /// `app_dir` and ensuring the log directories exist.
    pub fn load(path: &Path, app_dir: &Path) -> Result<Config, ConfigError> {
        let invalid = |message: &str| ConfigError::Invalid {
            path: path.to_path_buf(),
            message: message.to_string(),
        };
        if app_dir.as_os_str().is_empty() {
            return Err(invalid("app directory is empty"));
        }

        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let control_server_url = raw
            .control_server_url
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if control_server_url.is_empty() {
            return Err(invalid("control_server_url is required"));
        }
        let core_path = raw.core_path.filter(|p| !p.as_os_str().is_empty());
        let core_path = core_path.ok_or_else(|| invalid("core_path is required"))?;
        let log_file = raw.log_file.filter(|p| !p.as_os_str().is_empty());
        let log_file = log_file.ok_or_else(|| invalid("log_file is required"))?;
        let log_level = parse_log_level(raw.log_level.as_deref())
            .map_err(|message| invalid(&message))?;

        let app_dir = app_dir.to_path_buf();
        let core_log_file = app_dir.join("logs").join("core.log");
        let config = Config {
            control_server_url,
            core_path: make_absolute(&core_path, &app_dir),
            log_level,
            log_file: make_absolute(&log_file, &app_dir),
            app_dir,
            core_log_file,
        };
        config.ensure_log_directories()?;
        Ok(config)
    }

    /// `config.yaml` next to the executable.
    pub fn default_path(app_dir: &Path) -> PathBuf {
        app_dir.join("config.yaml")
    }

    /// Directory of the running executable, with symlinks resolved.
    pub fn detect_app_dir() -> Result<PathBuf, ConfigError> {
        let exe = std::env::current_exe().map_err(ConfigError::AppDir)?;
        let exe = std::fs::canonicalize(&exe).unwrap_or(exe);
        Ok(exe
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")))
    }

    /// Where core-engine config files for profiles are written.
    pub fn core_config_dir(&self) -> PathBuf {
        self.app_dir.join("core_config")
    }

    /// Cached side-effect list for opportunistic cleanup after a crash.
    pub fn cleanup_state_path(&self) -> PathBuf {
        self.app_dir.join("cleanup_state.json")
    }

    fn ensure_log_directories(&self) -> Result<(), ConfigError> {
        for file in [&self.log_file, &self.core_log_file] {
            if let Some(dir) = file.parent() {
                std::fs::create_dir_all(dir).map_err(|source| ConfigError::LogDir {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
        }
        Ok(())
    }
}

fn parse_log_level(value: Option<&str>) -> Result<LogLevel, String> {
    let value = value.map(str::trim).unwrap_or_default().to_lowercase();
    match value.as_str() {
        "" | "info" => Ok(LogLevel::Info),
        "debug" => Ok(LogLevel::Debug),
        "error" => Ok(LogLevel::Error),
        other => Err(format!("unsupported log_level {:?}", other)),
    }
}

fn make_absolute(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_app_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("customvpn-config-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.yaml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = temp_app_dir("minimal");
        let path = write_config(
            &dir,
            "control_server_url: http://127.0.0.1:8080\ncore_path: core.exe\nlog_file: logs/app.log\n",
        );

        let config = Config::load(&path, &dir).unwrap();
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.core_path, dir.join("core.exe"));
        assert_eq!(config.log_file, dir.join("logs").join("app.log"));
        assert_eq!(config.core_log_file, dir.join("logs").join("core.log"));
        assert!(config.log_file.parent().unwrap().exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rejects_missing_required_fields() {
        let dir = temp_app_dir("missing");
        let path = write_config(&dir, "core_path: core.exe\nlog_file: app.log\n");
        let err = Config::load(&path, &dir).unwrap_err();
        assert!(err.to_string().contains("control_server_url"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rejects_unknown_log_level() {
        let dir = temp_app_dir("level");
        let path = write_config(
            &dir,
            "control_server_url: http://x\ncore_path: core\nlog_file: app.log\nlog_level: verbose\n",
        );
        let err = Config::load(&path, &dir).unwrap_err();
        assert!(err.to_string().contains("log_level"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn absolute_paths_are_kept() {
        let dir = temp_app_dir("abs");
        let abs_core = dir.join("bin").join("core");
        let body = format!(
            "control_server_url: http://x\ncore_path: {:?}\nlog_file: app.log\n",
            abs_core
        );
        let path = write_config(&dir, &body);
        let config = Config::load(&path, &dir).unwrap();
        assert_eq!(config.core_path, abs_core);
        std::fs::remove_dir_all(&dir).ok();
    }
}
