//! Single-instance lock
//!
//! The daemon and the one-shot `cleanup` command both mutate the volume, and
//! each owns a separate safety guard. Holding this lock for the whole run keeps
//! them from acting at the same time.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Why the lock was not taken
#[derive(Error, Debug)]
pub enum LockError {
    /// Another process holds the lock
    #[error("another btrmind process holds {}", .0.display())]
    Held(PathBuf),
    /// The lock file could not be opened
    #[error("cannot lock {}: {source}", .path.display())]
    Io {
        /// Lock file
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
}

/// Exclusive lock held until dropped
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: File,
}

impl InstanceLock {
    /// Lock file belonging to a policy blob
    #[must_use]
    pub fn path_for(model_path: &Path) -> PathBuf {
        model_path.with_extension("lock")
    }

    /// Take the lock without waiting
    ///
    /// # Errors
    ///
    /// `Held` when another process has it, `Io` when the file cannot be
    /// created.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let mut file = Self::open_exclusive(path)?;
        file.set_len(0).map_err(io)?;
        write!(file, "{}", std::process::id()).map_err(io)?;
        debug!(path = %path.display(), "Instance lock taken");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    #[cfg(unix)]
    fn open_exclusive(path: &Path) -> Result<File, LockError> {
        use nix::errno::Errno;
        use nix::fcntl::{flock, FlockArg};
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(file),
            Err(errno) if errno == Errno::EWOULDBLOCK => Err(LockError::Held(path.to_path_buf())),
            Err(errno) => Err(LockError::Io {
                path: path.to_path_buf(),
                source: errno.into(),
            }),
        }
    }

    #[cfg(not(unix))]
    fn open_exclusive(path: &Path) -> Result<File, LockError> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::AlreadyExists {
                    LockError::Held(path.to_path_buf())
                } else {
                    LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    }
                }
            })
    }

    /// Lock file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // The flock is released with the descriptor
        if let Err(e) = self.file.flush() {
            debug!(path = %self.path.display(), error = %e, "Lock file flush failed");
        }
        if cfg!(not(unix)) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                debug!(path = %self.path.display(), error = %e, "Lock file not removed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = InstanceLock::path_for(&dir.path().join("state/policy.json"));
        assert_eq!(path, dir.path().join("state/policy.lock"));

        let first = InstanceLock::acquire(&path).unwrap();
        assert_eq!(first.path(), path.as_path());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
        assert!(matches!(InstanceLock::acquire(&path), Err(LockError::Held(_))));

        drop(first);
        let again = InstanceLock::acquire(&path).unwrap();
        drop(again);
    }
}
