use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("Invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,

    /// A required name is empty.
    #[error("`{0}` cannot be empty")]
    EmptyName(&'static str),

    /// A timeout is negative, not a finite number or too large for a duration.
    #[error("`{0}` must be a non-negative number of seconds within range")]
    InvalidTimeout(&'static str),

    /// Polling would spin without pause.
    #[error("`poll_interval_ms` cannot be zero")]
    PollIntervalZero,
}
