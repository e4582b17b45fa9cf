//! Shell-out helpers for the platform effectors
//!
//! Commands run with hidden windows on Windows (a GUI process must never
//! flash console windows) and a hard deadline; output is decoded lossily for
//! error reporting.

use std::ffi::OsStr;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;

/// Deadline for route/firewall/DNS utility invocations.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Builds a command that will not open a console window on Windows.
pub fn hidden_command(program: impl AsRef<OsStr>) -> Command {
    #[allow(unused_mut)]
    let mut command = Command::new(program);
    #[cfg(windows)]
    command.creation_flags(CREATE_NO_WINDOW);
    command
}

/// Outcome of a deadline-capped command run.
#[derive(Debug)]
pub enum CommandError {
    Io(std::io::Error),
    Timeout,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Io(error) => write!(f, "{}", error),
            CommandError::Timeout => f.write_str("command timed out"),
        }
    }
}

/// Runs the command to completion, killing it on deadline expiry.
pub async fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
) -> Result<Output, CommandError> {
    command.kill_on_drop(true);
    command.stdin(std::process::Stdio::null());
    let future = command.output();
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result.map_err(CommandError::Io),
        Err(_) => Err(CommandError::Timeout),
    }
}

/// Combined stdout+stderr, lossily decoded and trimmed.
pub fn combined_output(output: &Output) -> String {
    let mut text = String::new();
    text.push_str(String::from_utf8_lossy(&output.stdout).trim());
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr);
    }
    text
}

/// Doubles single quotes for interpolation into single-quoted PowerShell
/// string literals.
pub fn escape_single_quotes(value: &str) -> String {
    value.replace('\'', "''")
}

/// Runs a PowerShell script with a hidden window and the given deadline.
/// Returns the combined output on a non-zero exit.
#[cfg(windows)]
pub async fn run_powershell(script: &str, timeout: Duration) -> Result<(), String> {
    let mut command = hidden_command("powershell.exe");
    command.args(["-NoProfile", "-NonInteractive", "-Command", script]);
    match run_with_timeout(command, timeout).await {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => {
            let text = combined_output(&output);
            if text.is_empty() {
                Err(format!("powershell failed: exit {:?}", output.status.code()))
            } else {
                Err(format!("powershell failed: {}", text))
            }
        }
        Err(error) => Err(format!("powershell failed: {}", error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_single_quotes_doubles_them() {
        assert_eq!(escape_single_quotes("it's"), "it''s");
        assert_eq!(escape_single_quotes("plain"), "plain");
    }

    #[tokio::test]
    async fn combined_output_merges_streams() {
        let output = Output {
            status: exit_status_ok(),
            stdout: b"  out text \n".to_vec(),
            stderr: b" err text ".to_vec(),
        };
        assert_eq!(combined_output(&output), "out text\nerr text");
    }

    #[cfg(unix)]
    fn exit_status_ok() -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(0)
    }

    #[cfg(windows)]
    fn exit_status_ok() -> std::process::ExitStatus {
        use std::os::windows::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(0)
    }
}
