//! Best-effort kill of a child and everything it spawned.
//!
//! Descendants are found by the `PA_PROCESS_TAG` variable the supervisor puts
//! into the child's environment, which every descendant inherits unless it
//! clears its environment. The child also leads its own process group.

use std::ffi::OsStr;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

/// Environment variable carrying the supervisor-assigned tag.
pub const PROCESS_TAG_ENV: &str = "PA_PROCESS_TAG";

/// Kill every process whose environment carries `tag`, except this one.
/// Returns the number of processes signalled.
pub fn kill_tagged(tag: &str) -> usize {
    let marker = format!("{}={}", PROCESS_TAG_ENV, tag);
    let own_pid = sysinfo::get_current_pid().ok();

    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::everything(),
    );

    let mut killed = 0;
    for (pid, process) in system.processes() {
        if Some(*pid) == own_pid || !has_marker(process.environ(), &marker) {
            continue;
        }
        if process.kill() {
            killed += 1;
        }
    }
    debug!(tag, killed, "Killed tagged processes");
    killed
}

fn has_marker<S: AsRef<OsStr>>(environ: &[S], marker: &str) -> bool {
    environ
        .iter()
        .any(|entry| entry.as_ref().to_string_lossy() == marker)
}

/// SIGKILL the process group led by `pgid`.
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) {
    let Ok(pgid) = i32::try_from(pgid) else {
        return;
    };
    if pgid <= 1 {
        return;
    }
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pgid: u32) {}
