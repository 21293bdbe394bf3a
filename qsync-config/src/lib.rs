//! Configuration management for the replication consistency checker.
//!
//! Provides environment detection, configuration loading from a job's YAML file with
//! environment variable overrides, secret handling and the shared configuration types
//! used by the checker and its library.

mod environment;
mod load;
mod secret;
pub mod shared;

pub use environment::*;
pub use load::*;
pub use secret::*;
