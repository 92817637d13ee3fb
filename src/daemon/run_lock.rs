//! Exclusive run lock so overlapping scheduled passes cannot race on flags.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::core::errors::{DsnError, Result};

/// Held for the duration of one pass; released on drop.
#[derive(Debug)]
pub struct RunLock {
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock without blocking. `RunLocked` if another process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| DsnError::io(parent, source))?;
        }
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            opts.mode(0o600);
        }
        let file = opts.open(path).map_err(|source| DsnError::io(path, source))?;

        #[cfg(unix)]
        {
            #[allow(deprecated)]
            let lock = nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusiveNonblock)
                .map_err(|(_file, errno)| {
                    if errno == nix::errno::Errno::EWOULDBLOCK {
                        DsnError::RunLocked {
                            path: path.to_path_buf(),
                        }
                    } else {
                        DsnError::Runtime {
                            details: format!("failed to lock {}: {errno}", path.display()),
                        }
                    }
                })?;
            Ok(Self {
                _lock: lock,
                path: path.to_path_buf(),
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {
                _file: file,
                path: path.to_path_buf(),
            })
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
