//! Pass orchestration: one-shot runs under a run lock, and the watch loop
//! with signal-driven shutdown and config reload.

pub mod cycle;
pub mod run_lock;
#[cfg(feature = "daemon")]
pub mod signals;
