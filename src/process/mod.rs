//! Supervised child-process launcher
//!
//! Starts the core data-plane binary with stdout/stderr redirected into its
//! log file and the child placed in its own process group, then supervises
//! it: a reaper task awaits exit, updates bookkeeping and invokes the exit
//! callback bound at construction. Stop sends a soft interrupt (CTRL-BREAK
//! on Windows, SIGINT elsewhere), waits out the timeout and hard-kills.

mod interrupt;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};

use crate::state::{ProcessName, ProcessRecord, ProcessStatus};

/// Default budget for a graceful stop before the hard kill.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for one-shot invocations (core config check).
const RUN_ONCE_TIMEOUT: Duration = Duration::from_secs(15);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Invoked by the supervisor when a child exits: `(name, exit_code, reason)`.
pub type ExitCallback = Arc<dyn Fn(ProcessName, i32, String) + Send + Sync>;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("binary path is empty")]
    EmptyBinary,

    #[error("process {0} already running")]
    AlreadyRunning(ProcessName),

    #[error("open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("start {name}: {source}")]
    Spawn {
        name: ProcessName,
        source: std::io::Error,
    },

    #[error("{binary}: {message}")]
    RunFailed { binary: String, message: String },
}

/// Capability contract for launching and stopping supervised processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Binds the exit callback; later calls replace it.
    fn set_exit_callback(&self, callback: ExitCallback);

    /// Starts `binary` under supervision with output appended to `log_file`.
    async fn start(
        &self,
        name: ProcessName,
        binary: &Path,
        args: &[String],
        log_file: &Path,
    ) -> Result<ProcessRecord, ProcessError>;

    /// Soft-interrupts the process, waits up to `timeout`, then hard-kills
    /// and reaps. Stopping an unknown process is a no-op.
    async fn stop(&self, name: ProcessName, timeout: Duration);

    /// Runs `binary args` to completion without supervision, failing on a
    /// non-zero exit with the combined output as the message.
    async fn run_once(&self, binary: &Path, args: &[String]) -> Result<(), ProcessError>;
}

/// Signals child exit to any number of waiters.
struct ExitSignal {
    done: AtomicBool,
    notify: Notify,
}

impl ExitSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            done: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn fire(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.done.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

struct ProcHandle {
    generation: u64,
    pid: u32,
    kill: Option<oneshot::Sender<()>>,
    exited: Arc<ExitSignal>,
}

/// The real launcher.
pub struct Launcher {
    procs: Arc<Mutex<HashMap<ProcessName, ProcHandle>>>,
    on_exit: RwLock<Option<ExitCallback>>,
    generation: AtomicU64,
}

impl Launcher {
    pub fn new() -> Self {
        Self {
            procs: Arc::new(Mutex::new(HashMap::new())),
            on_exit: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    fn exit_callback(&self) -> Option<ExitCallback> {
        self.on_exit.read().expect("exit callback poisoned").clone()
    }

    fn open_log_file(path: &Path) -> Result<std::fs::File, ProcessError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| ProcessError::LogFile {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let mut options = std::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o644);
        }
        options.open(path).map_err(|source| ProcessError::LogFile {
            path: path.to_path_buf(),
            source,
        })
    }

    fn configure(command: &mut tokio::process::Command, binary: &Path) {
        if let Some(dir) = binary.parent() {
            if !dir.as_os_str().is_empty() {
                command.current_dir(dir);
            }
        }
        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
        #[cfg(unix)]
        command.process_group(0);
    }
}

impl Default for Launcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessLauncher for Launcher {
    fn set_exit_callback(&self, callback: ExitCallback) {
        *self.on_exit.write().expect("exit callback poisoned") = Some(callback);
    }

    async fn start(
        &self,
        name: ProcessName,
        binary: &Path,
        args: &[String],
        log_file: &Path,
    ) -> Result<ProcessRecord, ProcessError> {
        if binary.as_os_str().is_empty() {
            return Err(ProcessError::EmptyBinary);
        }

        let log_writer = Self::open_log_file(log_file)?;
        let log_clone = log_writer
            .try_clone()
            .map_err(|source| ProcessError::LogFile {
                path: log_file.to_path_buf(),
                source,
            })?;

        let mut command = tokio::process::Command::new(binary);
        command.args(args);
        command.stdin(std::process::Stdio::null());
        command.stdout(std::process::Stdio::from(log_writer));
        command.stderr(std::process::Stdio::from(log_clone));
        Self::configure(&mut command, binary);

        log::debug!("launch {}: {} {}", name, binary.display(), args.join(" "));

        let mut procs = self.procs.lock().expect("launcher registry poisoned");
        if procs.contains_key(&name) {
            return Err(ProcessError::AlreadyRunning(name));
        }
        let mut child = command
            .spawn()
            .map_err(|source| ProcessError::Spawn { name, source })?;
        let pid = child.id().unwrap_or_default();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (kill_tx, kill_rx) = oneshot::channel();
        let exited = ExitSignal::new();
        procs.insert(
            name,
            ProcHandle {
                generation,
                pid,
                kill: Some(kill_tx),
                exited: exited.clone(),
            },
        );
        drop(procs);

        let record = ProcessRecord {
            name,
            command: binary.display().to_string(),
            args: args.to_vec(),
            pid,
            started_at: Utc::now(),
            exited_at: None,
            status: ProcessStatus::Running,
            exit_code: None,
            exit_reason: String::new(),
        };

        // Supervisor: reap the child, drop it from the table, signal waiters
        // and fire the exit callback.
        let callback = self.exit_callback();
        let table = self.procs.clone();
        tokio::spawn(async move {
            let mut kill_rx = kill_rx;
            let status = tokio::select! {
                status = child.wait() => status,
                _ = &mut kill_rx => {
                    log::info!("process {} timeout, killing", name);
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let (exit_code, reason) = match status {
                Ok(status) => match status.code() {
                    Some(0) => (0, "process exited normally".to_string()),
                    Some(code) => (code, format!("process exited with code {}", code)),
                    None => (-1, "process terminated by signal".to_string()),
                },
                Err(error) => (-1, format!("wait failed: {}", error)),
            };
            if exit_code == 0 {
                log::info!("process {} exited", name);
            } else {
                log::error!("process {} exited with error: {}", name, reason);
            }

            {
                let mut procs = table.lock().expect("launcher registry poisoned");
                if procs
                    .get(&name)
                    .map(|handle| handle.generation == generation)
                    .unwrap_or(false)
                {
                    procs.remove(&name);
                }
            }
            exited.fire();
            if let Some(callback) = callback {
                callback(name, exit_code, reason);
            }
        });

        Ok(record)
    }

    async fn stop(&self, name: ProcessName, timeout: Duration) {
        let timeout = if timeout.is_zero() {
            DEFAULT_STOP_TIMEOUT
        } else {
            timeout
        };
        let (pid, kill, exited) = {
            let mut procs = self.procs.lock().expect("launcher registry poisoned");
            match procs.get_mut(&name) {
                Some(handle) => (handle.pid, handle.kill.take(), handle.exited.clone()),
                None => return,
            }
        };

        if let Err(error) = interrupt::send_interrupt(pid) {
            log::debug!("send interrupt to {} failed: {}", name, error);
        }

        if tokio::time::timeout(timeout, exited.wait()).await.is_ok() {
            return;
        }
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        exited.wait().await;
    }

    async fn run_once(&self, binary: &Path, args: &[String]) -> Result<(), ProcessError> {
        if binary.as_os_str().is_empty() {
            return Err(ProcessError::EmptyBinary);
        }
        let mut command = crate::platform::command::hidden_command(binary);
        command.args(args);
        if let Some(dir) = binary.parent() {
            if !dir.as_os_str().is_empty() {
                command.current_dir(dir);
            }
        }
        let output = crate::platform::command::run_with_timeout(command, RUN_ONCE_TIMEOUT)
            .await
            .map_err(|error| ProcessError::RunFailed {
                binary: binary.display().to_string(),
                message: error.to_string(),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let text = crate::platform::command::combined_output(&output);
        Err(ProcessError::RunFailed {
            binary: binary.display().to_string(),
            message: if text.is_empty() {
                format!("exit {:?}", output.status.code())
            } else {
                text
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_rejects_empty_binary() {
        let launcher = Launcher::new();
        let result = launcher
            .start(
                ProcessName::Core,
                Path::new(""),
                &[],
                Path::new("core.log"),
            )
            .await;
        assert!(matches!(result, Err(ProcessError::EmptyBinary)));
    }

    #[tokio::test]
    async fn stop_unknown_process_is_noop() {
        let launcher = Launcher::new();
        launcher
            .stop(ProcessName::Core, Duration::from_millis(10))
            .await;
    }

    #[tokio::test]
    async fn run_once_reports_missing_binary() {
        let launcher = Launcher::new();
        let missing = std::env::temp_dir().join("customvpn-no-such-binary");
        let result = launcher.run_once(&missing, &["check".to_string()]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn exit_signal_wakes_waiters() {
        let signal = ExitSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        signal.fire();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must wake")
            .unwrap();
    }
}
