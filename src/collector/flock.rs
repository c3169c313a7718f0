use std::{
    fs::{File, OpenOptions},
    io,
    os::fd::AsRawFd,
    path::Path,
};

/// An exclusive advisory lock on a file, released when dropped.
///
/// The lock file itself is left in place: unlinking it while another process holds an open
/// handle to the old inode would let two processes believe they hold the lock.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl LockGuard {
    /// Tries to take the lock without blocking.
    ///
    /// Returns `Ok(None)` when another open handle already holds it.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        // SAFETY: `file` owns a valid descriptor for the duration of the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(Some(Self { file }));
        }

        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err)
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // SAFETY: the descriptor stays open until `self.file` is dropped after this returns.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            log::warn!("Failed to release lock: {}", io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_handle_cannot_take_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leader.lock");

        let first = LockGuard::try_acquire(&path).unwrap();
        assert!(first.is_some());
        assert!(LockGuard::try_acquire(&path).unwrap().is_none());

        drop(first);
        assert!(LockGuard::try_acquire(&path).unwrap().is_some());
        assert!(path.exists());
    }
}
