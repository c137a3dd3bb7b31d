use std::fs;
use std::path::{Path, PathBuf};

use crate::log_warn;

const LOCK_FILE: &str = "scope-relay.lock";
const PID_FILE: &str = "scope-relay.pid";

/// Exclusive ownership of the data directory for the guard's lifetime.
///
/// Startup consolidation renames spool files and the outbox store is
/// rewritten in place; two processes over one directory would corrupt
/// both. Released on drop.
#[must_use = "the data directory is only owned while the guard is alive"]
pub struct InstanceLock {
    lock: fslock::LockFile,
    pid_path: PathBuf,
}

impl std::fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLock")
            .field("pid_path", &self.pid_path)
            .finish()
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            log_warn!("Failed to release instance lock: {}", e);
        }
        if let Err(e) = fs::remove_file(&self.pid_path) {
            log_warn!(
                "Failed to remove PID file {}: {}",
                self.pid_path.display(),
                e
            );
        }
    }
}

/// Takes exclusive ownership of `data_dir`, creating it if needed.
///
/// The file lock provides the atomic mutual exclusion; the PID file
/// exists purely so a contending process can name the current holder.
pub fn try_acquire(data_dir: &Path) -> Result<InstanceLock, String> {
    fs::create_dir_all(data_dir)
        .map_err(|e| format!("Failed to create {}: {}", data_dir.display(), e))?;

    let lock_path = data_dir.join(LOCK_FILE);
    let pid_path = data_dir.join(PID_FILE);

    let mut lock = fslock::LockFile::open(&lock_path)
        .map_err(|e| format!("Failed to open lock file {}: {}", lock_path.display(), e))?;

    if !lock
        .try_lock()
        .map_err(|e| format!("Failed to acquire lock: {}", e))?
    {
        return Err(holder_diagnosis(data_dir, &lock_path, &pid_path));
    }

    // We hold the lock; safe to write PID
    fs::write(&pid_path, std::process::id().to_string())
        .map_err(|e| format!("Failed to write PID file: {}", e))?;

    Ok(InstanceLock { lock, pid_path })
}

/// Actionable message about whoever holds the contended lock.
fn holder_diagnosis(data_dir: &Path, lock_path: &Path, pid_path: &Path) -> String {
    let recorded_pid = fs::read_to_string(pid_path)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok());

    match recorded_pid {
        Some(pid) if is_pid_alive(pid) => format!(
            "Another scope-relay instance owns {} (PID {})",
            data_dir.display(),
            pid
        ),
        // The OS releases flock on process death, so a dead holder
        // means something outside this crate is keeping the lock.
        Some(pid) => format!(
            "Lock file is held but recorded PID {} is not alive. \
             Remove {} and {} to recover",
            pid,
            lock_path.display(),
            pid_path.display()
        ),
        None => format!(
            "Another scope-relay instance holds the lock. \
             If this is stale, remove {}",
            lock_path.display()
        ),
    }
}

fn is_pid_alive(pid: i32) -> bool {
    // signal 0 checks if process exists without sending a signal
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}
