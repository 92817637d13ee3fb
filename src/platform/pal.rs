//! PAL trait and platform implementations (Linux `/proc` + `statvfs`, in-memory mock).

#![allow(missing_docs)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::errors::{DsnError, Result};

/// Block-level accounting for the filesystem holding a path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FsStats {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
    pub fs_type: String,
    pub mount_point: PathBuf,
    /// `st_dev` of the queried path; scopes open-handle attribution.
    pub device_id: u64,
    pub is_readonly: bool,
}

impl FsStats {
    /// Bytes in use, reserved blocks included (`total - free`).
    #[must_use]
    pub const fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }
}

/// Mount-point metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountPoint {
    pub path: PathBuf,
    pub device: String,
    pub fs_type: String,
}

/// Aggregate allocated size of one first-level child of a mount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirUsage {
    pub label: String,
    pub bytes: u64,
}

/// Label under which loose top-level files are folded together.
pub const LOOSE_FILES_LABEL: &str = "(files)";

/// An open descriptor whose target has been unlinked. No path is retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenHandle {
    pub pid: u32,
    pub uid: u32,
    pub process_name: String,
    pub device_id: u64,
    pub inode: u64,
    pub size_bytes: u64,
}

/// OS abstraction used by the sampler, the ghost attributor, and the CLI.
pub trait Platform: Send + Sync {
    fn fs_stats(&self, path: &Path) -> Result<FsStats>;
    fn mount_points(&self) -> Result<Vec<MountPoint>>;
    /// Recursive allocated size per first-level child of `root`, staying on `device_id`.
    fn top_level_usage(&self, root: &Path, device_id: u64) -> Result<Vec<DirUsage>>;
    /// Every open descriptor (system-wide) pointing at a deleted file.
    fn open_deleted_handles(&self, budget: Duration) -> Result<Vec<OpenHandle>>;
    fn user_name(&self, uid: u32) -> Option<String>;
    fn hostname(&self) -> String;
}

/// Sort usage entries largest first, label ascending on ties.
pub fn sort_usage(entries: &mut [DirUsage]) {
    entries.sort_by(|left, right| {
        right
            .bytes
            .cmp(&left.bytes)
            .then_with(|| left.label.cmp(&right.label))
    });
}

// ──────────────────── Linux ────────────────────

#[cfg(target_os = "linux")]
pub use linux::LinuxPlatform;

#[cfg(target_os = "linux")]
mod linux {
    use std::collections::HashSet;
    use std::fs;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::MetadataExt;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, Instant};

    use parking_lot::RwLock;

    use super::{
        DirUsage, FsStats, LOOSE_FILES_LABEL, MountPoint, OpenHandle, Platform, find_mount,
        parse_mount_table, sort_usage,
    };
    use crate::core::errors::{DsnError, Result};

    /// Linux platform implementation using `/proc` + `statvfs`.
    #[derive(Debug)]
    pub struct LinuxPlatform {
        mounts_cache: RwLock<Option<(Vec<MountPoint>, Instant)>>,
        cache_ttl: Duration,
    }

    impl Default for LinuxPlatform {
        fn default() -> Self {
            Self::new()
        }
    }

    impl LinuxPlatform {
        #[must_use]
        pub fn new() -> Self {
            Self {
                mounts_cache: RwLock::new(None),
                cache_ttl: Duration::from_secs(5),
            }
        }

        fn get_cached_mounts(&self) -> Result<Vec<MountPoint>> {
            {
                let cache = self.mounts_cache.read();
                if let Some((mounts, collected_at)) = &*cache
                    && collected_at.elapsed() < self.cache_ttl
                {
                    return Ok(mounts.clone());
                }
            }

            let raw = fs::read_to_string("/proc/self/mounts")
                .map_err(|source| DsnError::io("/proc/self/mounts", source))?;
            let mounts = parse_mount_table(&raw)?;

            *self.mounts_cache.write() = Some((mounts.clone(), Instant::now()));
            Ok(mounts)
        }
    }

    impl Platform for LinuxPlatform {
        fn fs_stats(&self, path: &Path) -> Result<FsStats> {
            let meta = fs::metadata(path).map_err(|error| map_sample_io(path, error))?;
            let mounts = self.mount_points()?;
            let mount = find_mount(path, &mounts).ok_or_else(|| DsnError::MountNotFound {
                path: path.to_path_buf(),
            })?;
            let stat = nix::sys::statvfs::statvfs(path).map_err(|error| DsnError::FsStats {
                path: path.to_path_buf(),
                details: error.to_string(),
            })?;
            let fragment = stat.fragment_size();
            Ok(FsStats {
                total_bytes: stat.blocks().saturating_mul(fragment),
                free_bytes: stat.blocks_free().saturating_mul(fragment),
                available_bytes: stat.blocks_available().saturating_mul(fragment),
                fs_type: mount.fs_type.clone(),
                mount_point: mount.path.clone(),
                device_id: meta.dev(),
                is_readonly: stat.flags().contains(nix::sys::statvfs::FsFlags::ST_RDONLY),
            })
        }

        fn mount_points(&self) -> Result<Vec<MountPoint>> {
            self.get_cached_mounts()
        }

        fn top_level_usage(&self, root: &Path, device_id: u64) -> Result<Vec<DirUsage>> {
            let entries = fs::read_dir(root).map_err(|error| map_sample_io(root, error))?;
            let mut hardlinks = HashSet::<(u64, u64)>::new();
            let mut loose_files: u64 = 0;
            let mut usage = Vec::new();

            for entry in entries.flatten() {
                // DirEntry::metadata does not follow symlinks.
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if meta.dev() != device_id {
                    continue;
                }
                if meta.is_dir() {
                    let bytes = allocated_bytes(&meta)
                        .saturating_add(subtree_bytes(&entry.path(), device_id, &mut hardlinks));
                    usage.push(DirUsage {
                        label: entry.file_name().to_string_lossy().into_owned(),
                        bytes,
                    });
                } else if first_link(&meta, &mut hardlinks) {
                    loose_files = loose_files.saturating_add(allocated_bytes(&meta));
                }
            }

            if loose_files > 0 {
                usage.push(DirUsage {
                    label: LOOSE_FILES_LABEL.to_string(),
                    bytes: loose_files,
                });
            }
            sort_usage(&mut usage);
            Ok(usage)
        }

        fn open_deleted_handles(&self, budget: Duration) -> Result<Vec<OpenHandle>> {
            let proc_dir = fs::read_dir("/proc").map_err(|error| DsnError::Attribution {
                details: format!("/proc unreadable: {error}"),
            })?;

            let deadline = Instant::now() + budget;
            let mut handles = Vec::new();
            let mut pids_scanned: usize = 0;

            for proc_entry in proc_dir.flatten() {
                if Instant::now() >= deadline {
                    eprintln!(
                        "[DSN-GHOST] handle scan budget reached after {pids_scanned} PIDs; \
                         attribution is partial"
                    );
                    break;
                }

                let pid_name = proc_entry.file_name();
                let pid_bytes = pid_name.as_bytes();
                if pid_bytes.is_empty() || !pid_bytes.iter().all(u8::is_ascii_digit) {
                    continue;
                }
                let Ok(pid) = pid_name.to_string_lossy().parse::<u32>() else {
                    continue;
                };

                let proc_path = proc_entry.path();
                let Ok(fd_entries) = fs::read_dir(proc_path.join("fd")) else {
                    continue;
                };
                pids_scanned += 1;

                let uid = fs::metadata(&proc_path).map(|m| m.uid()).unwrap_or(u32::MAX);
                let mut process_name: Option<String> = None;

                for fd_entry in fd_entries.flatten() {
                    let Ok(target) = fs::read_link(fd_entry.path()) else {
                        continue;
                    };
                    if !target.as_os_str().as_bytes().ends_with(b" (deleted)") {
                        continue;
                    }
                    // Following the /proc/<pid>/fd link reaches the unlinked inode.
                    let Ok(meta) = fs::metadata(fd_entry.path()) else {
                        continue;
                    };
                    if !meta.is_file() {
                        continue;
                    }
                    let name = process_name.get_or_insert_with(|| read_comm(&proc_path));
                    handles.push(OpenHandle {
                        pid,
                        uid,
                        process_name: name.clone(),
                        device_id: meta.dev(),
                        inode: meta.ino(),
                        size_bytes: meta.len(),
                    });
                }
            }

            Ok(handles)
        }

        fn user_name(&self, uid: u32) -> Option<String> {
            nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
                .ok()
                .flatten()
                .map(|user| user.name)
        }

        fn hostname(&self) -> String {
            nix::unistd::gethostname()
                .ok()
                .and_then(|name| name.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        }
    }

    fn map_sample_io(path: &Path, error: io::Error) -> DsnError {
        match error.kind() {
            io::ErrorKind::NotFound => DsnError::MountNotFound {
                path: path.to_path_buf(),
            },
            io::ErrorKind::PermissionDenied => DsnError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => DsnError::FsStats {
                path: path.to_path_buf(),
                details: error.to_string(),
            },
        }
    }

    fn allocated_bytes(meta: &fs::Metadata) -> u64 {
        meta.blocks().saturating_mul(512)
    }

    /// True the first time a multiply-linked inode is seen.
    fn first_link(meta: &fs::Metadata, seen: &mut HashSet<(u64, u64)>) -> bool {
        meta.nlink() <= 1 || seen.insert((meta.dev(), meta.ino()))
    }

    fn subtree_bytes(dir: &Path, device_id: u64, seen: &mut HashSet<(u64, u64)>) -> u64 {
        let mut total: u64 = 0;
        let mut stack: Vec<PathBuf> = vec![dir.to_path_buf()];

        while let Some(current) = stack.pop() {
            // Unreadable subtrees are skipped, as `du` does.
            let Ok(entries) = fs::read_dir(&current) else {
                continue;
            };
            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if meta.dev() != device_id {
                    continue;
                }
                if meta.is_dir() {
                    total = total.saturating_add(allocated_bytes(&meta));
                    stack.push(entry.path());
                } else if first_link(&meta, seen) {
                    total = total.saturating_add(allocated_bytes(&meta));
                }
            }
        }

        total
    }

    fn read_comm(proc_path: &Path) -> String {
        let comm = fs::read_to_string(proc_path.join("comm")).unwrap_or_default();
        let trimmed = comm.trim();
        if trimmed.is_empty() {
            "?".to_string()
        } else {
            trimmed.to_string()
        }
    }
}

// ──────────────────── mock ────────────────────

#[derive(Debug, Clone)]
struct MockMount {
    stats: FsStats,
    usage: Vec<DirUsage>,
}

/// In-memory platform for deterministic tests.
///
/// Usage figures can be changed between passes through a shared `Arc`.
#[derive(Debug)]
pub struct MockPlatform {
    mounts: RwLock<HashMap<PathBuf, MockMount>>,
    handles: RwLock<Option<Vec<OpenHandle>>>,
    users: HashMap<u32, String>,
    host: String,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new("testhost")
    }
}

impl MockPlatform {
    /// Mock with no mounts, no readable handles, and the given hostname.
    #[must_use]
    pub fn new(host: &str) -> Self {
        Self {
            mounts: RwLock::new(HashMap::new()),
            handles: RwLock::new(None),
            users: HashMap::new(),
            host: host.to_string(),
        }
    }

    /// Register (or replace) a mount with raw byte figures.
    pub fn set_mount(&self, path: &Path, total_bytes: u64, used_bytes: u64, usage: Vec<DirUsage>) {
        let stats = FsStats {
            total_bytes,
            free_bytes: total_bytes.saturating_sub(used_bytes),
            available_bytes: total_bytes.saturating_sub(used_bytes),
            fs_type: "mockfs".to_string(),
            mount_point: path.to_path_buf(),
            device_id: mock_device_id(path),
            is_readonly: false,
        };
        self.mounts
            .write()
            .insert(path.to_path_buf(), MockMount { stats, usage });
    }

    /// Make handle enumeration succeed with `handles`.
    pub fn set_handles(&self, handles: Vec<OpenHandle>) {
        *self.handles.write() = Some(handles);
    }

    /// Make handle enumeration fail.
    pub fn deny_handles(&self) {
        *self.handles.write() = None;
    }

    #[must_use]
    pub fn with_user(mut self, uid: u32, name: &str) -> Self {
        self.users.insert(uid, name.to_string());
        self
    }
}

/// Deterministic fake `st_dev` derived from the mount path.
#[must_use]
pub fn mock_device_id(path: &Path) -> u64 {
    path.as_os_str()
        .to_string_lossy()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
        })
}

impl Platform for MockPlatform {
    fn fs_stats(&self, path: &Path) -> Result<FsStats> {
        self.mounts
            .read()
            .get(path)
            .map(|mount| mount.stats.clone())
            .ok_or_else(|| DsnError::MountNotFound {
                path: path.to_path_buf(),
            })
    }

    fn mount_points(&self) -> Result<Vec<MountPoint>> {
        Ok(self
            .mounts
            .read()
            .values()
            .map(|mount| MountPoint {
                path: mount.stats.mount_point.clone(),
                device: "mock".to_string(),
                fs_type: mount.stats.fs_type.clone(),
            })
            .collect())
    }

    fn top_level_usage(&self, root: &Path, _device_id: u64) -> Result<Vec<DirUsage>> {
        let mut usage = self
            .mounts
            .read()
            .get(root)
            .map(|mount| mount.usage.clone())
            .ok_or_else(|| DsnError::MountNotFound {
                path: root.to_path_buf(),
            })?;
        sort_usage(&mut usage);
        Ok(usage)
    }

    fn open_deleted_handles(&self, _budget: Duration) -> Result<Vec<OpenHandle>> {
        self.handles
            .read()
            .clone()
            .ok_or_else(|| DsnError::Attribution {
                details: "mock handle enumeration denied".to_string(),
            })
    }

    fn user_name(&self, uid: u32) -> Option<String> {
        self.users.get(&uid).cloned()
    }

    fn hostname(&self) -> String {
        self.host.clone()
    }
}

/// Detect active platform implementation.
pub fn detect_platform() -> Result<Arc<dyn Platform>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxPlatform::new()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(DsnError::UnsupportedPlatform {
            details: "only Linux is currently implemented".to_string(),
        })
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_mounts(raw: &str) -> Vec<MountPoint> {
    let mut mounts = Vec::new();
    for line in raw.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            eprintln!("[DSN-MOUNTS] warning: skipping malformed mount line: {line}");
            continue;
        }
        mounts.push(MountPoint {
            path: unescape_mount_path(fields[1]),
            device: fields[0].to_string(),
            fs_type: fields[2].to_string(),
        });
    }
    mounts
}

/// Parse the mount table; a table with no usable line is an error.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_mount_table(raw: &str) -> Result<Vec<MountPoint>> {
    let mounts = parse_proc_mounts(raw);
    if mounts.is_empty() {
        return Err(DsnError::MountParse {
            details: format!("no mount entries in {} bytes of mount table", raw.len()),
        });
    }
    Ok(mounts)
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn find_mount<'a>(path: &Path, mounts: &'a [MountPoint]) -> Option<&'a MountPoint> {
    mounts
        .iter()
        .filter(|mount| path.starts_with(&mount.path))
        .max_by_key(|mount| mount.path.as_os_str().len())
}

/// Decode the kernel's `\NNN` octal escapes, keeping raw bytes.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn unescape_mount_path(raw: &str) -> PathBuf {
    let raw_bytes = raw.as_bytes();
    let mut bytes = Vec::with_capacity(raw_bytes.len());
    let mut i = 0;
    while i < raw_bytes.len() {
        if raw_bytes[i] == b'\\' && i + 3 < raw_bytes.len() {
            let digits = &raw_bytes[i + 1..=i + 3];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = (digits[0] - b'0') * 64 + (digits[1] - b'0') * 8 + (digits[2] - b'0');
                bytes.push(value);
                i += 4;
                continue;
            }
        }
        bytes.push(raw_bytes[i]);
        i += 1;
    }

    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStringExt;
        PathBuf::from(std::ffi::OsString::from_vec(bytes))
    }
    #[cfg(not(unix))]
    {
        PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mount_table() {
        let sample = "/dev/sda1 / ext4 rw,relatime 0 0\n\
                      tmpfs /dev/shm tmpfs rw,nosuid,nodev 0 0\n\
                      garbage\n";
        let mounts = parse_proc_mounts(sample);
        assert_eq!(mounts.len(), 2);
        assert!(mounts.iter().any(|m| m.path == Path::new("/dev/shm")));
        assert!(mounts.iter().any(|m| m.fs_type == "ext4"));
    }

    #[test]
    fn empty_or_garbage_mount_table_is_parse_error() {
        for raw in ["", "garbage\n\n"] {
            let err = parse_mount_table(raw).expect_err("no entries");
            assert_eq!(err.code(), "DSN-2002");
            assert!(err.is_sample_error());
        }
        assert_eq!(parse_mount_table("/dev/sda1 / ext4 rw 0 0\n").unwrap().len(), 1);
    }

    #[test]
    fn find_mount_prefers_longest_prefix() {
        let mounts = parse_proc_mounts(
            "/dev/sda1 / ext4 rw 0 0\n/dev/sdb1 /data xfs rw 0 0\n/dev/sdc1 /data2 xfs rw 0 0\n",
        );
        let mount = find_mount(Path::new("/data/pg"), &mounts).expect("mount expected");
        assert_eq!(mount.path, Path::new("/data"));
        let root = find_mount(Path::new("/home"), &mounts).expect("mount expected");
        assert_eq!(root.path, Path::new("/"));
    }

    #[test]
    fn unescapes_octal_sequences() {
        assert_eq!(
            unescape_mount_path("/mnt/my\\040dir"),
            PathBuf::from("/mnt/my dir")
        );
        assert_eq!(
            unescape_mount_path("/mnt/a\\04").to_string_lossy(),
            "/mnt/a\\04"
        );
    }

    #[test]
    fn used_bytes_counts_reserved_blocks() {
        let stats = FsStats {
            total_bytes: 100,
            free_bytes: 10,
            available_bytes: 5,
            fs_type: "ext4".to_string(),
            mount_point: PathBuf::from("/"),
            device_id: 1,
            is_readonly: false,
        };
        assert_eq!(stats.used_bytes(), 90);
    }

    #[test]
    fn sort_usage_orders_by_size_then_label() {
        let mut entries = vec![
            DirUsage {
                label: "b".to_string(),
                bytes: 10,
            },
            DirUsage {
                label: "a".to_string(),
                bytes: 10,
            },
            DirUsage {
                label: "c".to_string(),
                bytes: 30,
            },
        ];
        sort_usage(&mut entries);
        let labels: Vec<&str> = entries.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, ["c", "a", "b"]);
    }

    #[test]
    fn mock_platform_reports_registered_mount() {
        let platform = MockPlatform::default();
        platform.set_mount(Path::new("/data"), 1_000, 400, Vec::new());
        let stats = platform.fs_stats(Path::new("/data")).unwrap();
        assert_eq!(stats.used_bytes(), 400);
        assert_eq!(stats.device_id, mock_device_id(Path::new("/data")));
        assert!(matches!(
            platform.fs_stats(Path::new("/other")),
            Err(DsnError::MountNotFound { .. })
        ));
    }

    #[test]
    fn mock_handles_denied_by_default() {
        let platform = MockPlatform::default();
        let err = platform
            .open_deleted_handles(Duration::from_secs(1))
            .expect_err("denied");
        assert_eq!(err.code(), "DSN-2004");
    }

    #[cfg(target_os = "linux")]
    mod linux_live {
        use super::super::{LOOSE_FILES_LABEL, LinuxPlatform, Platform};
        use std::os::unix::fs::MetadataExt;

        #[test]
        fn top_level_usage_aggregates_children_without_filenames() {
            let dir = tempfile::tempdir().unwrap();
            let nested = dir.path().join("build").join("deep");
            std::fs::create_dir_all(&nested).unwrap();
            std::fs::write(nested.join("secret-report.bin"), vec![7u8; 64 * 1024]).unwrap();
            std::fs::write(dir.path().join("notes.txt"), vec![1u8; 16 * 1024]).unwrap();

            let device = std::fs::metadata(dir.path()).unwrap().dev();
            let usage = LinuxPlatform::new()
                .top_level_usage(dir.path(), device)
                .expect("usage");

            let labels: Vec<&str> = usage.iter().map(|u| u.label.as_str()).collect();
            assert!(labels.contains(&"build"));
            assert!(labels.contains(&LOOSE_FILES_LABEL));
            assert!(!labels.iter().any(|l| l.contains("secret") || l.contains("notes")));
            assert!(usage.windows(2).all(|w| w[0].bytes >= w[1].bytes));
        }

        #[test]
        fn fs_stats_of_writable_tempdir() {
            let dir = tempfile::tempdir().unwrap();
            let stats = LinuxPlatform::new().fs_stats(dir.path()).expect("stats");
            assert!(stats.total_bytes > 0);
            assert!(stats.available_bytes <= stats.free_bytes);
            assert!(!stats.is_readonly);
            assert!(!stats.fs_type.is_empty());
        }

        #[test]
        fn fs_stats_reports_missing_path_as_mount_not_found() {
            let err = LinuxPlatform::new()
                .fs_stats(std::path::Path::new("/nonexistent_dsn_mount"))
                .expect_err("missing");
            assert_eq!(err.code(), "DSN-2003");
        }

        #[test]
        fn deleted_open_file_is_enumerated() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("held.log");
            std::fs::write(&path, vec![0u8; 8192]).unwrap();
            let held = std::fs::File::open(&path).unwrap();
            let meta = held.metadata().unwrap();
            std::fs::remove_file(&path).unwrap();

            let handles = LinuxPlatform::new()
                .open_deleted_handles(std::time::Duration::from_secs(10))
                .expect("own /proc entry is readable");
            let own = handles
                .iter()
                .find(|h| h.pid == std::process::id() && h.inode == meta.ino())
                .expect("our deleted handle should be listed");
            assert_eq!(own.size_bytes, 8192);
            assert_eq!(own.device_id, meta.dev());
            drop(held);
        }
    }
}
