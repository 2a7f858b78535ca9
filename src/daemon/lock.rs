//! Single-instance lock
//!
//! An exclusive `flock` on the lock file in the working directory. The lock
//! lives as long as the returned guard holds the open file.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

/// Held exclusive lock; released on drop
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
}

impl InstanceLock {
    /// One non-blocking attempt. `None` means another instance holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(Some(Self { _file: file })),
            Err(Errno::EWOULDBLOCK) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to lock {}", path.display())),
        }
    }

    /// Retry up to `attempts` times, sleeping `delay` between attempts
    pub fn acquire(path: &Path, attempts: u32, delay: Duration) -> Result<Option<Self>> {
        for attempt in 1..=attempts {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(Some(lock));
            }
            log::warn!("Another instance holds {} (attempt {}/{})", path.display(), attempt, attempts);
            if attempt < attempts {
                std::thread::sleep(delay);
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_holder_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("process.lock");

        let held = InstanceLock::try_acquire(&path).unwrap();
        assert!(held.is_some());
        assert!(InstanceLock::try_acquire(&path).unwrap().is_none());
        assert!(InstanceLock::acquire(&path, 2, Duration::from_millis(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("process.lock");

        let held = InstanceLock::acquire(&path, 1, Duration::ZERO).unwrap().unwrap();
        assert!(path.exists());
        drop(held);

        assert!(InstanceLock::try_acquire(&path).unwrap().is_some());
    }
}
