//! Postgres implementation of the session interfaces, over `tokio-postgres`.

mod connect;
mod session;

pub use connect::provider_connect_options;
pub use session::PgSession;
pub use tokio_postgres::Config as ConnectOptions;
