//! Platform abstraction: filesystem stats, mount table, directory walks,
//! and open-handle enumeration.

pub mod pal;
