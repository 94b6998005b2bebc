//! Advisory lock on the index directory.
//!
//! Writers hold it for one catch-up and append cycle, so processes sharing a
//! `vectors.bin` never interleave records. The lock lives on an open file
//! description and is released when the file is closed.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Lock file placed next to the index
const LOCK_FILE_NAME: &str = "index.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Block,
    Fail,
}

/// An exclusive lock on an index directory, held until dropped.
pub struct FileLock {
    _file: File,
}

impl FileLock {
    /// Take the lock or fail with [`io::ErrorKind::WouldBlock`] if another
    /// holder has it.
    pub fn try_acquire(dir: &Path) -> io::Result<Self> {
        Self::acquire(dir, Wait::Fail)
    }

    /// Take the lock, waiting for the current holder.
    pub fn acquire_blocking(dir: &Path) -> io::Result<Self> {
        Self::acquire(dir, Wait::Block)
    }

    fn acquire(dir: &Path, wait: Wait) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE_NAME))?;
        flock_exclusive(&file, wait)?;
        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
fn flock_exclusive(file: &File, wait: Wait) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let operation = match wait {
        Wait::Block => libc::LOCK_EX,
        Wait::Fail => libc::LOCK_EX | libc::LOCK_NB,
    };
    // EWOULDBLOCK surfaces as io::ErrorKind::WouldBlock
    match unsafe { libc::flock(file.as_raw_fd(), operation) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

// Single writer assumed off unix.
#[cfg(not(unix))]
fn flock_exclusive(_file: &File, _wait: Wait) -> io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_second_holder_is_refused_until_drop() {
        let dir = tempfile::tempdir().unwrap();

        let held = FileLock::try_acquire(dir.path()).unwrap();
        let refused = FileLock::try_acquire(dir.path()).err().unwrap();
        assert_eq!(refused.kind(), io::ErrorKind::WouldBlock);

        drop(held);
        assert!(FileLock::try_acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_blocking_waiter_gets_lock_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let held = FileLock::acquire_blocking(dir.path()).unwrap();

        let (sender, receiver) = mpsc::channel();
        let path = dir.path().to_path_buf();
        let waiter = std::thread::spawn(move || {
            let lock = FileLock::acquire_blocking(&path);
            sender.send(()).unwrap();
            lock.is_ok()
        });

        assert!(receiver.recv_timeout(Duration::from_millis(50)).is_err());
        drop(held);
        assert!(waiter.join().unwrap());
        assert!(receiver.try_recv().is_ok());
    }
}
