#![forbid(unsafe_code)]

//! Disk Sentinel (dsn): disk-usage alerting for shared hosts.
//!
//! Each pass samples the configured mounts, attributes space that is used
//! but not visible in the directory tree to processes still holding deleted
//! files open, and runs every sample through a hysteresis gate so that a
//! mount hovering near its threshold produces one alert, a reminder per nag
//! interval, and one recovery notice.
//!
//! # Library usage
//!
//! Use the [`prelude`] for convenient access to the most common types:
//!
//! ```rust,no_run
//! use disk_sentinel::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use disk_sentinel::core::config::Config;
//! use disk_sentinel::monitor::hysteresis::{HysteresisGate, Thresholds};
//! ```

pub mod prelude;

pub mod core;
pub mod daemon;
pub mod logger;
pub mod monitor;
pub mod notify;
pub mod platform;
pub mod state;
