//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{DsnError, Result};
use crate::core::paths::resolve_absolute_path;
use crate::monitor::hysteresis::Thresholds;
use crate::notify::sink::{NotificationConfig, SinkKind};

/// Full disk sentinel configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    /// Mounts checked each pass, in order.
    pub mount_points: Vec<PathBuf>,
    pub thresholds: ThresholdsConfig,
    pub notifications: NotificationConfig,
    pub ghost: GhostConfig,
    pub paths: PathsConfig,
}

/// Alert thresholds as written in the config file.
///
/// `high_percent` has no default: a run without one is a configuration error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ThresholdsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_percent: Option<u32>,
    pub recovery_offset_percent: u32,
    pub nag_interval_minutes: u64,
}

/// Ghost-usage attribution knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GhostConfig {
    pub enabled: bool,
    /// Entries surfaced in notifications.
    pub top_n: usize,
    /// Wall-clock budget for the `/proc` handle scan.
    pub scan_budget_ms: u64,
}

/// Filesystem paths used by dsn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    /// Durable flag location.
    pub flag_dir: PathBuf,
    /// Volatile flag location used when `flag_dir` is unwritable.
    pub fallback_flag_dir: PathBuf,
    pub activity_log: PathBuf,
    pub activity_log_fallback: PathBuf,
    pub lock_file: PathBuf,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            high_percent: None,
            recovery_offset_percent: 5,
            nag_interval_minutes: 480,
        }
    }
}

impl Default for GhostConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_n: 5,
            scan_budget_ms: 5_000,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[DSN-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir
            .join(".config")
            .join("disk-sentinel")
            .join("config.toml");
        let data = home_dir.join(".local").join("share").join("disk-sentinel");
        let volatile = PathBuf::from("/dev/shm").join("disk-sentinel");
        Self {
            config_file: cfg,
            flag_dir: data.join("flags"),
            fallback_flag_dir: volatile.join("flags"),
            activity_log: data.join("activity.jsonl"),
            activity_log_fallback: volatile.join("activity.jsonl"),
            lock_file: data.join("run.lock"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults
    /// plus environment are used (and must still name a threshold and mounts).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| DsnError::Io {
                path: path_buf.clone(),
                source,
            })?;
            Self::parse(&raw)?
        } else if is_explicit_path {
            return Err(DsnError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse TOML without env overrides or validation.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Validated thresholds for the hysteresis gate.
    pub fn thresholds(&self) -> Result<Thresholds> {
        let high_percent =
            self.thresholds
                .high_percent
                .ok_or_else(|| DsnError::InvalidConfig {
                    details: "thresholds.high_percent is required".to_string(),
                })?;
        Ok(Thresholds {
            high_percent,
            recovery_offset_percent: self.thresholds.recovery_offset_percent,
            nag_interval_minutes: self.thresholds.nag_interval_minutes,
        })
    }

    /// Deterministic hash of the effective config for the activity log.
    ///
    /// FNV-1a, so the value is stable across processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("DSN_HIGH_PERCENT") {
            self.thresholds.high_percent = Some(parse_env("DSN_HIGH_PERCENT", &raw)?);
        }
        if let Some(raw) = lookup("DSN_RECOVERY_OFFSET_PERCENT") {
            self.thresholds.recovery_offset_percent =
                parse_env("DSN_RECOVERY_OFFSET_PERCENT", &raw)?;
        }
        if let Some(raw) = lookup("DSN_NAG_INTERVAL_MINUTES") {
            self.thresholds.nag_interval_minutes = parse_env("DSN_NAG_INTERVAL_MINUTES", &raw)?;
        }
        if let Some(raw) = lookup("DSN_MOUNT_POINTS") {
            self.mount_points = raw
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(raw) = lookup("DSN_WEBHOOK_URL") {
            self.notifications.webhook_url = raw;
        }
        if let Some(raw) = lookup("DSN_CHANNEL") {
            self.notifications.channel = raw;
        }
        if let Some(raw) = lookup("DSN_SINK") {
            self.notifications.sink = raw.parse::<SinkKind>()?;
        }
        Ok(())
    }

    /// Strip trailing slashes, absolutize, and drop duplicate mounts (first wins).
    fn normalize_paths(&mut self) {
        let mut seen = Vec::<PathBuf>::with_capacity(self.mount_points.len());
        for path in self.mount_points.drain(..) {
            let path = if path.is_absolute() {
                path
            } else {
                resolve_absolute_path(&path)
            };
            let s = path.to_string_lossy();
            let normalized = match s.strip_suffix('/') {
                Some(stripped) if s.len() > 1 => PathBuf::from(stripped),
                _ => path.clone(),
            };
            if !seen.contains(&normalized) {
                seen.push(normalized);
            }
        }
        self.mount_points = seen;
    }

    fn validate(&self) -> Result<()> {
        if self.mount_points.is_empty() {
            return Err(DsnError::InvalidConfig {
                details: "mount_points must list at least one path".to_string(),
            });
        }

        let thresholds = self.thresholds()?;
        if thresholds.high_percent > 100 {
            return Err(DsnError::InvalidConfig {
                details: format!(
                    "thresholds.high_percent must be in [0, 100], got {}",
                    thresholds.high_percent
                ),
            });
        }
        if thresholds.nag_interval_minutes == 0 {
            return Err(DsnError::InvalidConfig {
                details: "thresholds.nag_interval_minutes must be > 0".to_string(),
            });
        }
        if thresholds.is_degenerate() {
            eprintln!(
                "[DSN-CONFIG] WARNING: recovery threshold is {:.2}% (high {} - offset {}); \
                 alerts will never resolve",
                thresholds.recovery_percent(),
                thresholds.high_percent,
                thresholds.recovery_offset_percent
            );
        }

        if self.ghost.top_n == 0 {
            return Err(DsnError::InvalidConfig {
                details: "ghost.top_n must be > 0".to_string(),
            });
        }

        self.notifications.validate()
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|error| DsnError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}
