//! Soft-interrupt delivery to the supervised child
//!
//! The core binary shuts down cleanly on a console break; it runs in its own
//! process group so the interrupt never reaches this process.

#[cfg(windows)]
pub fn send_interrupt(pid: u32) -> Result<(), String> {
    use windows::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};

    if pid == 0 {
        return Ok(());
    }
    unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) }.map_err(|error| error.to_string())
}

#[cfg(unix)]
pub fn send_interrupt(pid: u32) -> Result<(), String> {
    if pid == 0 {
        return Ok(());
    }
    let result = unsafe { libc::killpg(pid as i32, libc::SIGINT) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().to_string())
    }
}

#[cfg(not(any(windows, unix)))]
pub fn send_interrupt(_pid: u32) -> Result<(), String> {
    Err("soft interrupt is not supported on this platform".to_string())
}
