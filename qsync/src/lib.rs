//! Consistency checks for tables replicated through a queue.
//!
//! Finds, table by table, a point at which a provider and a subscriber look at
//! equivalent snapshots and compares them there. On a root provider the table is locked
//! against writers, on a relaying provider the upstream worker is paused, and in both
//! cases the checker waits for the subscriber's consumer to replay everything written
//! before that point. Every lock or pause is released on every exit path.
//!
//! The entry point is [`driver::Driver`], working over the session traits of
//! [`session`] which [`postgres::PgSession`] implements.

pub mod catalog;
pub mod compare;
pub mod concurrency;
pub mod context;
pub mod driver;
pub mod error;
pub mod health;
mod macros;
pub mod postgres;
pub mod queue;
pub mod session;
pub mod sync;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
