//! Storage-root lock serializing pipeline runs.
//!
//! The lock file records the owning pid and acquisition time. A lock whose
//! owner is no longer running, or that is older than [`STALE_AFTER_HOURS`],
//! is left over from a crashed run and gets taken over.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::PipelineError;

pub const LOCK_FILE_NAME: &str = ".medallion.lock";

/// Age after which a lock is considered abandoned regardless of its owner.
pub const STALE_AFTER_HOURS: i64 = 12;

/// Exclusive hold on a storage root. Released when dropped.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Take the lock for `root`, failing fast if another live run holds it.
    pub fn acquire(root: &Path, run_id: &str) -> Result<Self, PipelineError> {
        fs::create_dir_all(root)?;
        let path = root.join(LOCK_FILE_NAME);

        // One takeover attempt; a second AlreadyExists means another run won the race.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Self::claim(path, file, run_id),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let Some(reason) = stale_reason(&path) else {
                        return Err(PipelineError::Locked { path });
                    };
                    warn!(path = %path.display(), reason = %reason, "Taking over stale run lock");
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(PipelineError::Locked { path })
    }

    fn claim(path: PathBuf, mut file: fs::File, run_id: &str) -> Result<Self, PipelineError> {
        let owner = format!(
            "pid={}\nrun_id={}\nacquired_at={}\n",
            std::process::id(),
            run_id,
            Utc::now().to_rfc3339()
        );
        // From here the file exists; dropping `lock` removes it on error.
        let lock = Self { path };
        file.write_all(owner.as_bytes())?;
        debug!(path = %lock.path.display(), "Run lock acquired");
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Run lock released"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to release run lock"),
        }
    }
}

/// Why the lock at `path` may be taken over, or `None` if it must be honoured.
fn stale_reason(path: &Path) -> Option<String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Some("lock released".to_string()),
        Err(_) => return None,
    };
    let field = |key: &str| lock_field(&contents, key);

    if let Some(pid) = field("pid").and_then(|v| v.parse::<u32>().ok()) {
        if pid != std::process::id() && process_alive(pid) == Some(false) {
            return Some(format!("owner process {pid} is not running"));
        }
    }

    let acquired_at = field("acquired_at")
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
        .or_else(|| {
            let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
            Some(DateTime::<Utc>::from(modified))
        })?;
    let age = Utc::now() - acquired_at;
    (age > chrono::Duration::hours(STALE_AFTER_HOURS))
        .then(|| format!("acquired {} hour(s) ago", age.num_hours()))
}

fn lock_field<'a>(contents: &'a str, key: &str) -> Option<&'a str> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix(key)?.strip_prefix('='))
        .map(str::trim)
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> Option<bool> {
    Some(Path::new("/proc").join(pid.to_string()).exists())
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> Option<bool> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plant(root: &Path, pid: u32, acquired_at: DateTime<Utc>) -> PathBuf {
        let path = root.join(LOCK_FILE_NAME);
        fs::write(
            &path,
            format!("pid={pid}\nrun_id=crashed\nacquired_at={}\n", acquired_at.to_rfc3339()),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_second_acquire_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let first = RunLock::acquire(dir.path(), "run-a").unwrap();
        match RunLock::acquire(dir.path(), "run-b") {
            Err(PipelineError::Locked { path }) => assert_eq!(path, first.path()),
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[test]
    fn test_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let lock = RunLock::acquire(dir.path(), "run-a").unwrap();
            let contents = fs::read_to_string(lock.path()).unwrap();
            assert!(contents.contains("run_id=run-a"));
            lock.path().to_path_buf()
        };
        assert!(!path.exists());
        RunLock::acquire(dir.path(), "run-b").unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_lock_of_dead_process_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        // Above any kernel pid_max.
        plant(dir.path(), 4_000_000_000, Utc::now());

        let lock = RunLock::acquire(dir.path(), "run-b").unwrap();
        let contents = fs::read_to_string(lock.path()).unwrap();
        assert!(contents.contains("run_id=run-b"));
        assert!(contents.contains(&format!("pid={}", std::process::id())));
    }

    #[test]
    fn test_expired_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        plant(
            dir.path(),
            std::process::id(),
            Utc::now() - chrono::Duration::hours(STALE_AFTER_HOURS + 1),
        );
        RunLock::acquire(dir.path(), "run-b").unwrap();
    }

    #[test]
    fn test_recent_lock_of_live_process_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let planted = plant(dir.path(), std::process::id(), Utc::now());
        assert!(matches!(
            RunLock::acquire(dir.path(), "run-b"),
            Err(PipelineError::Locked { .. })
        ));
        assert!(fs::read_to_string(planted).unwrap().contains("run_id=crashed"));
    }

    #[test]
    fn test_empty_lock_file_is_honoured_until_expired() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE_NAME), b"").unwrap();
        assert!(matches!(
            RunLock::acquire(dir.path(), "run-b"),
            Err(PipelineError::Locked { .. })
        ));
    }
}
