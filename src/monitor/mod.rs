//! Per-mount monitoring: usage sampling, ghost attribution, alert hysteresis.

pub mod ghost;
pub mod hysteresis;
pub mod sampler;
