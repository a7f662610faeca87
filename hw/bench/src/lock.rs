// Licensed under the Apache-2.0 license

//! Cross-process exclusive ownership of the test bench.
//!
//! The lock is an advisory `flock` on a shared file. Acquisition never
//! blocks, and the kernel drops the lock if the owning process dies.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

use crate::error::LockError;

pub const DEFAULT_LOCK_PATH: &str = "/tmp/hil-runner.lock";

#[derive(Debug)]
pub struct DeviceLock {
    path: PathBuf,
    file: Option<File>,
}

impl DeviceLock {
    /// Take the lock at `path`, failing immediately if someone else holds it.
    pub fn acquire(path: &Path) -> Result<DeviceLock, LockError> {
        let existed = path.exists();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::PermissionDenied => LockError::PermissionDenied(path.to_path_buf()),
                _ => LockError::Io {
                    path: path.to_path_buf(),
                    source: e,
                },
            })?;

        if !existed {
            // Other accounts sharing the bench must be able to open it too.
            if let Err(e) = file.set_permissions(std::fs::Permissions::from_mode(0o666)) {
                warn!("Cannot make {} world-writable: {e}", path.display());
            }
        }

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(Errno::EWOULDBLOCK) => return Err(LockError::AlreadyLocked),
            Err(e) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source: e.into(),
                })
            }
        }

        debug!("Acquired device lock {}", path.display());
        Ok(DeviceLock {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Give the lock back. Calling this more than once is harmless.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = flock(file.as_raw_fd(), FlockArg::Unlock) {
                warn!("Unlocking {} failed: {e}", self.path.display());
            }
            debug!("Released device lock {}", self.path.display());
        }
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lock_file_is_world_writable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.lock");
        let lock = DeviceLock::acquire(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert!(lock.is_held());
        assert_eq!(mode & 0o777, 0o666);
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.lock");
        let mut lock = DeviceLock::acquire(&path).unwrap();
        lock.release();
        lock.release();
        assert!(!lock.is_held());
        assert!(path.exists());
    }
}
