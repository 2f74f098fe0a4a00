use std::fs;
use std::path::{Path, PathBuf};

use crate::log_warn;

const LOCK_FILE: &str = "feature-golem.lock";
const HOLDER_FILE: &str = "feature-golem.pid";

/// Exclusive claim on a project's runtime directory. Released on drop.
#[must_use = "lock is released when LockGuard is dropped"]
pub struct LockGuard {
    lock: fslock::LockFile,
    holder_path: PathBuf,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("holder_path", &self.holder_path)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            log_warn!("[lock] Failed to release lock: {}", e);
        }
        if let Err(e) = fs::remove_file(&self.holder_path) {
            log_warn!(
                "[lock] Failed to remove {}: {}",
                self.holder_path.display(),
                e
            );
        }
    }
}

/// Who holds the lock, as recorded in the holder file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub pid: i32,
    pub command: String,
}

impl LockHolder {
    fn current(command: &str) -> Self {
        Self {
            pid: std::process::id() as i32,
            command: command.to_string(),
        }
    }

    fn render(&self) -> String {
        format!("{}\n{}\n", self.pid, self.command)
    }

    /// First line is the PID; the optional second line names the command.
    fn parse(contents: &str) -> Option<Self> {
        let mut lines = contents.lines();
        let pid = lines.next()?.trim().parse::<i32>().ok()?;
        let command = lines.next().map(str::trim).unwrap_or("").to_string();
        Some(Self { pid, command })
    }
}

/// Read the holder file under `runtime_dir`, if one exists and parses.
pub fn read_holder(runtime_dir: &Path) -> Option<LockHolder> {
    fs::read_to_string(runtime_dir.join(HOLDER_FILE))
        .ok()
        .and_then(|contents| LockHolder::parse(&contents))
}

/// Claim the project at `runtime_dir` for `command` (e.g. `"run"`).
///
/// Every command that starts executors or commits takes this lock, so two
/// processes never admit or commit against the same feature list. On
/// contention the holder file names the process and command in the way.
pub fn try_acquire(runtime_dir: &Path, command: &str) -> Result<LockGuard, String> {
    fs::create_dir_all(runtime_dir)
        .map_err(|e| format!("Failed to create {}: {}", runtime_dir.display(), e))?;

    let lock_path = runtime_dir.join(LOCK_FILE);
    let holder_path = runtime_dir.join(HOLDER_FILE);

    let mut lock = fslock::LockFile::open(&lock_path)
        .map_err(|e| format!("Failed to open lock file {}: {}", lock_path.display(), e))?;

    let acquired = lock
        .try_lock()
        .map_err(|e| format!("Failed to acquire lock: {}", e))?;

    if !acquired {
        return Err(match read_holder(runtime_dir) {
            Some(holder) if is_pid_alive(holder.pid) => {
                let what = if holder.command.is_empty() {
                    "feature-golem".to_string()
                } else {
                    format!("feature-golem {}", holder.command)
                };
                format!("Another {} is running (PID {})", what, holder.pid)
            }
            Some(holder) => format!(
                "Lock file is held but recorded PID {} is not alive. Remove {} and {} to recover",
                holder.pid,
                lock_path.display(),
                holder_path.display()
            ),
            None => format!(
                "Another feature-golem process holds the lock. If this is stale, remove {}",
                lock_path.display()
            ),
        });
    }

    fs::write(&holder_path, LockHolder::current(command).render())
        .map_err(|e| format!("Failed to write {}: {}", holder_path.display(), e))?;

    Ok(LockGuard { lock, holder_path })
}

fn is_pid_alive(pid: i32) -> bool {
    // signal 0 only probes for existence
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_pid_alive(std::process::id() as i32));
    }

    #[test]
    fn absurd_pid_is_not_alive() {
        assert!(!is_pid_alive(99_999_999));
    }

    #[test]
    fn holder_parses_bare_pid_and_pid_with_command() {
        assert_eq!(
            LockHolder::parse("42"),
            Some(LockHolder {
                pid: 42,
                command: String::new()
            })
        );
        assert_eq!(
            LockHolder::parse("42\nresume\n"),
            Some(LockHolder {
                pid: 42,
                command: "resume".to_string()
            })
        );
        assert_eq!(LockHolder::parse("not a pid"), None);
    }
}
