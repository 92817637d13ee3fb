//! Usage sampling: block-level totals plus a first-level visible-size breakdown.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::core::errors::Result;
use crate::platform::pal::{DirUsage, Platform};

/// One point-in-time measurement of a mount.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MountSample {
    pub mount_path: PathBuf,
    pub total_bytes: u64,
    pub used_bytes: u64,
    /// Sum of the first-level child aggregates.
    pub visible_bytes: u64,
    /// `used - visible`, floored at zero.
    pub hidden_bytes: u64,
    /// `None` when `total_bytes == 0`.
    pub percent_used: Option<f64>,
    #[serde(skip)]
    pub device_id: u64,
    /// First-level breakdown, largest first.
    pub top_entries: Vec<DirUsage>,
}

impl MountSample {
    /// Assemble a sample, deriving `hidden_bytes` and `percent_used`.
    #[must_use]
    pub fn from_parts(
        mount_path: &Path,
        total_bytes: u64,
        used_bytes: u64,
        visible_bytes: u64,
        device_id: u64,
        top_entries: Vec<DirUsage>,
    ) -> Self {
        // Multiply before dividing so whole-number ratios come out exact.
        let percent_used =
            (total_bytes > 0).then(|| used_bytes as f64 * 100.0 / total_bytes as f64);
        Self {
            mount_path: mount_path.to_path_buf(),
            total_bytes,
            used_bytes,
            visible_bytes,
            hidden_bytes: used_bytes.saturating_sub(visible_bytes),
            percent_used,
            device_id,
            top_entries,
        }
    }

    /// Percent with two decimals, or `n/a`.
    #[must_use]
    pub fn percent_display(&self) -> String {
        self.percent_used
            .map_or_else(|| "n/a".to_string(), |percent| format!("{percent:.2}%"))
    }
}

/// Samples mounts through the platform layer. Failures surface immediately.
pub struct UsageSampler {
    platform: Arc<dyn Platform>,
}

impl UsageSampler {
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    /// Measure `mount`.
    ///
    /// Errors are `MountNotFound`, `PermissionDenied` or `FsStats`; the caller
    /// skips the mount for this pass.
    pub fn sample(&self, mount: &Path) -> Result<MountSample> {
        let stats = self.platform.fs_stats(mount)?;
        if stats.mount_point != mount {
            eprintln!(
                "[DSN-SAMPLE] warning: {} is not a mount root (filesystem at {}); \
                 usage outside the path counts as hidden",
                mount.display(),
                stats.mount_point.display()
            );
        }

        // Pseudo filesystems report zero blocks; nothing worth walking.
        if stats.total_bytes == 0 {
            return Ok(MountSample::from_parts(mount, 0, 0, 0, stats.device_id, Vec::new()));
        }

        let top_entries = self.platform.top_level_usage(mount, stats.device_id)?;
        let visible_bytes = top_entries
            .iter()
            .fold(0_u64, |acc, entry| acc.saturating_add(entry.bytes));

        Ok(MountSample::from_parts(
            mount,
            stats.total_bytes,
            stats.used_bytes(),
            visible_bytes,
            stats.device_id,
            top_entries,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::DsnError;
    use crate::platform::pal::MockPlatform;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn entry(label: &str, gib: u64) -> DirUsage {
        DirUsage {
            label: label.to_string(),
            bytes: gib * GIB,
        }
    }

    #[test]
    fn hidden_bytes_is_used_minus_visible() {
        let platform = Arc::new(MockPlatform::default());
        platform.set_mount(
            Path::new("/data"),
            100 * GIB,
            92 * GIB,
            vec![entry("pg", 50), entry("logs", 30)],
        );
        let sample = UsageSampler::new(platform).sample(Path::new("/data")).unwrap();

        assert_eq!(sample.total_bytes, 100 * GIB);
        assert_eq!(sample.used_bytes, 92 * GIB);
        assert_eq!(sample.visible_bytes, 80 * GIB);
        assert_eq!(sample.hidden_bytes, 12 * GIB);
        assert_eq!(sample.percent_display(), "92.00%");
        assert_eq!(sample.top_entries[0].label, "pg");
    }

    #[test]
    fn visible_exceeding_used_floors_hidden_at_zero() {
        let sample = MountSample::from_parts(Path::new("/"), 100, 40, 55, 1, Vec::new());
        assert_eq!(sample.hidden_bytes, 0);
    }

    #[test]
    fn zero_total_has_no_percent() {
        let platform = Arc::new(MockPlatform::default());
        platform.set_mount(Path::new("/proc"), 0, 0, vec![entry("never-walked", 1)]);
        let sample = UsageSampler::new(platform).sample(Path::new("/proc")).unwrap();
        assert!(sample.percent_used.is_none());
        assert!(sample.top_entries.is_empty());
        assert_eq!(sample.percent_display(), "n/a");
    }

    #[test]
    fn missing_mount_is_sample_error() {
        let platform = Arc::new(MockPlatform::default());
        let err = UsageSampler::new(platform)
            .sample(Path::new("/missing"))
            .expect_err("unknown mount");
        assert!(err.is_sample_error());
        assert!(matches!(err, DsnError::MountNotFound { .. }));
    }

    #[test]
    fn whole_percentages_are_exact() {
        for percent in 0..=100_u64 {
            let sample = MountSample::from_parts(Path::new("/"), 100, percent, 0, 1, Vec::new());
            assert_eq!(sample.percent_used, Some(percent as f64), "at {percent}%");

            let scaled =
                MountSample::from_parts(Path::new("/"), 100 * GIB, percent * GIB, 0, 1, Vec::new());
            assert_eq!(scaled.percent_used, Some(percent as f64), "at {percent}% of 100 GiB");
        }
    }

    #[test]
    fn percent_is_byte_ratio() {
        let sample = MountSample::from_parts(Path::new("/"), 3, 1, 0, 1, Vec::new());
        let percent = sample.percent_used.unwrap();
        assert!((percent - 33.333_333).abs() < 1e-4);
        assert_eq!(sample.percent_display(), "33.33%");
    }
}
