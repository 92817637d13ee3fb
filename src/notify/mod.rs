//! Alert messages and the sinks that deliver them.

pub mod message;
pub mod sink;
