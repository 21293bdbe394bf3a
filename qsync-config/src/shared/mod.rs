mod base;
mod connection;
mod syncer;

pub use base::*;
pub use connection::*;
pub use syncer::*;
