//! Process lifecycle helpers.
//!
//! A process-wide running flag flipped by SIGINT/SIGTERM, a PID-file guard
//! for single-instance servers, and a best-effort real-time priority helper
//! for latency-sensitive reader threads. Long-running server loops poll
//! [`main_running`] and exit at their next suspension point once a shutdown
//! signal lands.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use libc::c_int;
use log::{error, warn};
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use crate::errors::{PipeError, Result};

static MAIN_RUNNING: AtomicBool = AtomicBool::new(true);

/// True until a shutdown signal arrives or [`request_shutdown`] is called.
pub fn main_running() -> bool {
    MAIN_RUNNING.load(Ordering::Acquire)
}

/// Ask every loop polling [`main_running`] to wind down.
pub fn request_shutdown() {
    MAIN_RUNNING.store(false, Ordering::Release);
}

extern "C" fn on_shutdown_signal(_sig: c_int) {
    // Only the atomic store is allowed here.
    MAIN_RUNNING.store(false, Ordering::Release);
}

/// Route SIGINT and SIGTERM into the process-wide running flag.
pub fn enable_signal_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        if let Err(e) = unsafe { sigaction(sig, &action) } {
            error!("failed to install {} handler: {}", sig, e);
            return Err(PipeError::Other);
        }
    }
    Ok(())
}

fn pid_path(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/run/{}.pid", name)
    }
}

fn pid_alive(pid: i32) -> bool {
    pid > 0 && kill(Pid::from_raw(pid), None).is_ok()
}

/// Record this process's pid at `/run/<name>.pid` (or at `name` itself when
/// given an absolute path).
pub fn make_pid_file(name: &str) -> Result<()> {
    let path = pid_path(name);
    fs::write(&path, format!("{}\n", std::process::id())).map_err(|e| {
        error!("failed to write {}: {}", path, e);
        PipeError::FileIo
    })
}

/// Remove a pid file written by [`make_pid_file`]. Missing files are fine.
pub fn remove_pid_file(name: &str) {
    let _ = fs::remove_file(pid_path(name));
}

/// Stop a previous instance recorded in the pid file, if one is running.
///
/// Sends SIGINT, polls for exit for up to `timeout_s` seconds (floored at
/// 0.1), then escalates to SIGKILL. The pid file is removed either way.
/// Returns `true` if an instance had to be stopped.
pub fn kill_existing_process(name: &str, timeout_s: f32) -> Result<bool> {
    let path = pid_path(name);
    let pid: i32 = match fs::read_to_string(&path) {
        Ok(s) => s.trim().parse().unwrap_or(0),
        Err(_) => return Ok(false),
    };
    if !pid_alive(pid) {
        // Stale file from an unclean exit.
        let _ = fs::remove_file(&path);
        return Ok(false);
    }

    let target = Pid::from_raw(pid);
    if let Err(e) = kill(target, Signal::SIGINT) {
        error!("failed to interrupt pid {}: {}", pid, e);
        return Err(PipeError::Other);
    }
    let deadline = Instant::now() + Duration::from_secs_f32(timeout_s.max(0.1));
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            let _ = fs::remove_file(&path);
            return Ok(true);
        }
        thread::sleep(Duration::from_millis(100));
    }
    warn!("pid {} ignored SIGINT, killing it", pid);
    let _ = kill(target, Signal::SIGKILL);
    let _ = fs::remove_file(&path);
    Ok(true)
}

/// Move the calling thread onto the SCHED_FIFO real-time scheduler.
///
/// Requires privilege; callers treat failure as advisory.
pub fn set_realtime_priority(priority: i32) -> Result<()> {
    let max = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
    let min = unsafe { libc::sched_get_priority_min(libc::SCHED_FIFO) };
    if max < 0 || min < 0 {
        return Err(PipeError::Other);
    }
    let param = libc::sched_param {
        sched_priority: priority.clamp(min, max),
    };
    let rc = unsafe {
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
    };
    if rc != 0 {
        warn!(
            "failed to set SCHED_FIFO priority {}: {}",
            priority,
            std::io::Error::from_raw_os_error(rc)
        );
        return Err(PipeError::Other);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn running_flag_toggles() {
        assert!(main_running());
        request_shutdown();
        assert!(!main_running());
        MAIN_RUNNING.store(true, Ordering::Release);
    }

    #[test]
    fn pid_file_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("svc.pid");
        let path = path.to_str().unwrap();
        make_pid_file(path).unwrap();
        let written: i32 = fs::read_to_string(path).unwrap().trim().parse().unwrap();
        assert_eq!(written, std::process::id() as i32);
        remove_pid_file(path);
        assert!(!std::path::Path::new(path).exists());
        // A second removal is fine.
        remove_pid_file(path);
    }

    #[test]
    fn kill_existing_without_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("none.pid");
        let path = path.to_str().unwrap();
        assert_eq!(kill_existing_process(path, 0.2).unwrap(), false);

        // A stale pid file is removed and reported as not running.
        fs::write(path, "999999999\n").unwrap();
        assert_eq!(kill_existing_process(path, 0.2).unwrap(), false);
        assert!(!std::path::Path::new(path).exists());
    }
}
