//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use disk_sentinel::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{DsnError, Result};

// Platform
pub use crate::platform::pal::{FsStats, MountPoint, Platform, detect_platform};

// Monitor
pub use crate::monitor::ghost::{GhostAttributor, GhostEntry};
pub use crate::monitor::hysteresis::{Decision, HysteresisGate, Thresholds};
pub use crate::monitor::sampler::{MountSample, UsageSampler};

// State
pub use crate::state::flags::{AlertState, FileFlagStore, FlagStore, MemoryFlagStore};

// Notify
pub use crate::notify::message::{AlertKind, AlertMessage};
pub use crate::notify::sink::{Notifier, build_notifier};

// Orchestration
pub use crate::daemon::cycle::{PassReport, Sentinel};
