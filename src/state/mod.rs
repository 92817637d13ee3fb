//! Persisted alert state.

pub mod flags;
