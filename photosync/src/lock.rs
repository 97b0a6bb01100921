use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::IdentityConfig;

pub const LOCK_FILE: &str = "photosync.lock";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("identity {identity} is already being synced (pid {pid:?})")]
    AlreadyRunning { identity: String, pid: Option<u32> },
    #[error("lock file error: {0}")]
    Io(#[from] io::Error),
}

/// Held for the duration of a run; releases the lock when dropped.
pub trait RunGuard: Send {}

/// Prevents two runs from touching the same identity's data directory.
pub trait RunLock: Send + Sync {
    fn acquire(&self, identity: &IdentityConfig) -> Result<Box<dyn RunGuard>, LockError>;
}

/// Lock file in the data directory holding the owner's pid.
///
/// A lock whose owner is gone, or which is older than the identity's
/// `lock_timeout`, is taken over.
#[derive(Debug, Clone, Copy, Default)]
pub struct PidFileLock;

struct PidFileGuard {
    path: PathBuf,
}

impl RunGuard for PidFileGuard {}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}

impl RunLock for PidFileLock {
    fn acquire(&self, identity: &IdentityConfig) -> Result<Box<dyn RunGuard>, LockError> {
        fs::create_dir_all(&identity.data_dir)?;
        let path = identity.data_dir.join(LOCK_FILE);

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    debug!(identity = %identity.name, "acquired run lock");
                    return Ok(Box::new(PidFileGuard { path }));
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let pid = read_pid(&path);
                    if !is_abandoned(&path, pid, identity.lock_timeout) {
                        return Err(LockError::AlreadyRunning {
                            identity: identity.name.clone(),
                            pid,
                        });
                    }
                    warn!(identity = %identity.name, pid = ?pid, "taking over abandoned run lock");
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(LockError::AlreadyRunning {
            identity: identity.name.clone(),
            pid: read_pid(&path),
        })
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn is_abandoned(path: &Path, pid: Option<u32>, timeout: Duration) -> bool {
    let expired = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > timeout);
    expired || pid.is_some_and(|pid| !process_alive(pid))
}

fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn second_acquire_fails_until_guard_drops() {
        let dir = tempdir().unwrap();
        let identity = IdentityConfig::new("main", dir.path());

        let guard = PidFileLock.acquire(&identity).unwrap();
        let err = PidFileLock.acquire(&identity).err().unwrap();
        assert!(matches!(
            err,
            LockError::AlreadyRunning { pid: Some(pid), .. } if pid == std::process::id()
        ));

        drop(guard);
        assert!(!dir.path().join(LOCK_FILE).exists());
        assert!(PidFileLock.acquire(&identity).is_ok());
    }

    #[test]
    fn dead_owner_lock_is_taken_over() {
        let dir = tempdir().unwrap();
        let identity = IdentityConfig::new("main", dir.path());
        // Larger than any pid the kernel hands out.
        fs::write(dir.path().join(LOCK_FILE), "4294967295\n").unwrap();

        let _guard = PidFileLock.acquire(&identity).unwrap();
        assert_eq!(read_pid(&dir.path().join(LOCK_FILE)), Some(std::process::id()));
    }

    #[test]
    fn expired_lock_is_taken_over() {
        let dir = tempdir().unwrap();
        let mut identity = IdentityConfig::new("main", dir.path());
        identity.lock_timeout = Duration::ZERO;
        fs::write(dir.path().join(LOCK_FILE), format!("{}\n", std::process::id())).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        assert!(PidFileLock.acquire(&identity).is_ok());
    }
}
