//! Persisted per-mount alert flags with a volatile fallback location.
//!
//! The primary directory normally lives on durable storage, which may be the
//! very filesystem that is full. When a write there fails the record goes to
//! the fallback directory (tmpfs by default), and from then on the fallback
//! record wins until the flag is deleted. Deletion always clears both.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::errors::{DsnError, Result};
use crate::core::paths::sanitize_mount_path;

/// "Alerted since T" marker for one mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertState {
    pub mount_path: PathBuf,
    pub is_active: bool,
    pub first_alerted_at: DateTime<Utc>,
    pub last_notified_at: DateTime<Utc>,
}

impl AlertState {
    /// Fresh alert opened and notified at `now`.
    #[must_use]
    pub fn opened(mount: &Path, now: DateTime<Utc>) -> Self {
        Self {
            mount_path: mount.to_path_buf(),
            is_active: true,
            first_alerted_at: now,
            last_notified_at: now,
        }
    }

    /// Same alert, notified again at `now`.
    #[must_use]
    pub fn renotified(&self, now: DateTime<Utc>) -> Self {
        Self {
            last_notified_at: now,
            ..self.clone()
        }
    }
}

/// Where a flag record ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagLocation {
    Primary,
    Fallback,
}

/// Persistence seam for alert flags.
pub trait FlagStore: Send + Sync {
    /// Current flag for `mount`, if any.
    fn exists(&self, mount: &Path) -> Option<AlertState>;
    fn put(&self, state: &AlertState) -> Result<FlagLocation>;
    /// Remove every record for `mount`. Missing records are not an error.
    fn delete(&self, mount: &Path) -> Result<()>;
}

/// Record filename: sanitized mount path plus a short digest of the raw path.
#[must_use]
pub fn flag_key(mount: &Path) -> String {
    let digest = Sha256::digest(mount.as_os_str().as_encoded_bytes());
    let suffix: String = digest[..4].iter().map(|byte| format!("{byte:02x}")).collect();
    format!("{}-{suffix}.json", sanitize_mount_path(mount))
}

// ──────────────────── file store ────────────────────

/// JSON-file flag store over a primary and a fallback directory.
#[derive(Debug, Clone)]
pub struct FileFlagStore {
    primary_dir: PathBuf,
    fallback_dir: PathBuf,
}

impl FileFlagStore {
    #[must_use]
    pub fn new(primary_dir: &Path, fallback_dir: &Path) -> Self {
        Self {
            primary_dir: primary_dir.to_path_buf(),
            fallback_dir: fallback_dir.to_path_buf(),
        }
    }

    #[must_use]
    pub fn primary_path(&self, mount: &Path) -> PathBuf {
        self.primary_dir.join(flag_key(mount))
    }

    #[must_use]
    pub fn fallback_path(&self, mount: &Path) -> PathBuf {
        self.fallback_dir.join(flag_key(mount))
    }

    /// Location `exists` would read from for `mount`.
    #[must_use]
    pub fn locate(&self, mount: &Path) -> Option<FlagLocation> {
        if self.fallback_path(mount).exists() {
            Some(FlagLocation::Fallback)
        } else if self.primary_path(mount).exists() {
            Some(FlagLocation::Primary)
        } else {
            None
        }
    }
}

impl FlagStore for FileFlagStore {
    fn exists(&self, mount: &Path) -> Option<AlertState> {
        read_record(&self.fallback_path(mount), mount)
            .or_else(|| read_record(&self.primary_path(mount), mount))
    }

    fn put(&self, state: &AlertState) -> Result<FlagLocation> {
        let mount = &state.mount_path;
        let fallback = self.fallback_path(mount);

        if fallback.exists() {
            return write_record_atomic(&fallback, state)
                .map(|()| FlagLocation::Fallback)
                .map_err(|error| DsnError::Persistence {
                    mount: mount.clone(),
                    details: format!("fallback {}: {error}", fallback.display()),
                });
        }

        let primary = self.primary_path(mount);
        let primary_error = match write_record_atomic(&primary, state) {
            Ok(()) => return Ok(FlagLocation::Primary),
            Err(error) => error,
        };
        eprintln!(
            "[DSN-FLAGS] warning: primary flag write failed at {}: {primary_error}; \
             using volatile fallback",
            primary.display()
        );

        write_record_atomic(&fallback, state)
            .map(|()| FlagLocation::Fallback)
            .map_err(|fallback_error| DsnError::Persistence {
                mount: mount.clone(),
                details: format!(
                    "primary {}: {primary_error}; fallback {}: {fallback_error}",
                    primary.display(),
                    fallback.display()
                ),
            })
    }

    fn delete(&self, mount: &Path) -> Result<()> {
        let failures: Vec<String> = [self.fallback_path(mount), self.primary_path(mount)]
            .iter()
            .filter_map(|path| match fs::remove_file(path) {
                Ok(()) => None,
                Err(error) if error.kind() == io::ErrorKind::NotFound => None,
                Err(error) => Some(format!("{}: {error}", path.display())),
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DsnError::Persistence {
                mount: mount.to_path_buf(),
                details: failures.join("; "),
            })
        }
    }
}

/// Parse a record; an unparseable one still counts as active as of its mtime.
fn read_record(path: &Path, mount: &Path) -> Option<AlertState> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return None,
        Err(error) => {
            eprintln!("[DSN-FLAGS] warning: cannot stat {}: {error}", path.display());
            return None;
        }
    };

    let parsed = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AlertState>(&raw).ok());
    if let Some(state) = parsed {
        return Some(state);
    }

    eprintln!(
        "[DSN-FLAGS] warning: unreadable flag record {}; treating alert as active",
        path.display()
    );
    let stamped = meta
        .modified()
        .map_or_else(|_| Utc::now(), DateTime::<Utc>::from);
    Some(AlertState::opened(mount, stamped))
}

fn write_record_atomic(path: &Path, state: &AlertState) -> io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(state).map_err(io::Error::other)?;

    let result = (|| {
        {
            use std::io::Write;
            let mut opts = OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt as _;
                opts.mode(0o644);
            }
            let mut file = opts.open(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

// ──────────────────── memory store ────────────────────

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryFlagStore {
    records: Mutex<HashMap<PathBuf, AlertState>>,
    fail_writes: AtomicBool,
}

impl MemoryFlagStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put`/`delete` fail with a persistence error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn check_writable(&self, mount: &Path) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DsnError::Persistence {
                mount: mount.to_path_buf(),
                details: "memory store configured to fail".to_string(),
            });
        }
        Ok(())
    }
}

impl FlagStore for MemoryFlagStore {
    fn exists(&self, mount: &Path) -> Option<AlertState> {
        self.records.lock().get(mount).cloned()
    }

    fn put(&self, state: &AlertState) -> Result<FlagLocation> {
        self.check_writable(&state.mount_path)?;
        self.records
            .lock()
            .insert(state.mount_path.clone(), state.clone());
        Ok(FlagLocation::Primary)
    }

    fn delete(&self, mount: &Path) -> Result<()> {
        self.check_writable(mount)?;
        self.records.lock().remove(mount);
        Ok(())
    }
}
