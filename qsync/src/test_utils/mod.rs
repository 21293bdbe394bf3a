//! Testing helpers: an in-memory cluster implementing the session interfaces.

pub mod cluster;
