//! Structured logging for the consistency checker.
//!
//! Production environments write JSON lines to daily rolling files, development prints
//! pretty output to the terminal. See [`tracing::init_tracing`].

pub mod tracing;

pub use crate::tracing::{LogFlusher, TracingError, init_test_tracing, init_tracing, init_tracing_with_job};
