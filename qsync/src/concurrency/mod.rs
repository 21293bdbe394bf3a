pub mod poll;
pub mod shutdown;
pub mod signal;
