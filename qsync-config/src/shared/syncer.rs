use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::shared::{PgConnectionConfig, ValidationError};

/// Suffix appended to the configured pidfile, so that a checker can run next to the
/// replication worker of the same job.
pub const PIDFILE_SUFFIX: &str = ".repair";

/// Configuration of a consistency check job.
///
/// Loaded from the job's YAML file. `queue_name` and `consumer_name` also accept the
/// older `pgq_queue_name` and `pgq_consumer_id` keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SyncerConfig {
    /// Name of the job, also the default consumer name.
    pub job_name: String,
    /// Queue the subscriber consumes from.
    #[serde(alias = "pgq_queue_name")]
    pub queue_name: String,
    /// Consumer registered on the provider queue for this subscriber.
    #[serde(default, alias = "pgq_consumer_id")]
    pub consumer_name: Option<String>,
    /// Maximum time in seconds a table lock or relay pause may be held while waiting for
    /// the consumer. Values `<= 0` disable the statement timeout on the lock session.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: f64,
    /// Maximum time in seconds to wait for the ticker to produce a new tick.
    #[serde(default = "default_tick_timeout_secs")]
    pub tick_timeout_secs: f64,
    /// Interval between two polls of the queue.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Allowed difference between consumer lag and ticker lag for a consumer to be
    /// considered healthy.
    #[serde(default = "default_lag_margin_secs")]
    pub lag_margin_secs: f64,
    /// Pidfile of the job. [`PIDFILE_SUFFIX`] is appended to it.
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
    /// Comparison performed once both sides are on equivalent snapshots.
    #[serde(default)]
    pub comparator: ComparatorKind,
    /// Connection to the subscriber database.
    pub connection: PgConnectionConfig,
    /// Explicit provider connection. When absent, the provider location is read from the
    /// subscriber's node metadata.
    #[serde(default)]
    pub provider: Option<PgConnectionConfig>,
}

/// Available table comparators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparatorKind {
    /// Row count and sum of row hashes on each side.
    #[default]
    Checksum,
}

fn default_lock_timeout_secs() -> f64 {
    10.0
}

fn default_tick_timeout_secs() -> f64 {
    10.0
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_lag_margin_secs() -> f64 {
    5.0
}

impl SyncerConfig {
    /// Validates the loaded configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.job_name.is_empty() {
            return Err(ValidationError::EmptyName("job_name"));
        }
        if self.queue_name.is_empty() {
            return Err(ValidationError::EmptyName("queue_name"));
        }
        if let Some(consumer_name) = &self.consumer_name
            && consumer_name.is_empty()
        {
            return Err(ValidationError::EmptyName("consumer_name"));
        }

        // A negative lock timeout is allowed and disables the statement timeout.
        if self.lock_timeout_secs.is_nan() {
            return Err(ValidationError::InvalidTimeout("lock_timeout_secs"));
        }
        check_secs("lock_timeout_secs", self.lock_timeout_secs.max(0.0))?;
        check_secs("tick_timeout_secs", self.tick_timeout_secs)?;
        check_secs("lag_margin_secs", self.lag_margin_secs)?;
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::PollIntervalZero);
        }

        self.connection.tls.validate()?;
        if let Some(provider) = &self.provider {
            provider.tls.validate()?;
        }

        Ok(())
    }

    /// Consumer name, falling back to the job name.
    pub fn consumer_name(&self) -> &str {
        self.consumer_name.as_deref().unwrap_or(&self.job_name)
    }

    /// Lock timeout as a [`Duration`], zero when the statement timeout is disabled.
    pub fn lock_timeout(&self) -> Duration {
        secs_to_duration(self.lock_timeout_secs.max(0.0))
    }

    pub fn tick_timeout(&self) -> Duration {
        secs_to_duration(self.tick_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lag_margin(&self) -> Duration {
        secs_to_duration(self.lag_margin_secs)
    }

    /// Pidfile path with [`PIDFILE_SUFFIX`] appended, if a pidfile is configured.
    pub fn repair_pidfile(&self) -> Option<PathBuf> {
        self.pidfile.as_ref().map(|pidfile| {
            let mut path = pidfile.clone().into_os_string();
            path.push(PIDFILE_SUFFIX);
            PathBuf::from(path)
        })
    }
}

fn check_secs(key: &'static str, secs: f64) -> Result<(), ValidationError> {
    match Duration::try_from_secs_f64(secs) {
        Ok(_) => Ok(()),
        Err(_) => Err(ValidationError::InvalidTimeout(key)),
    }
}

/// Saturating conversion for values already accepted by [`SyncerConfig::validate`].
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::TlsConfig;

    fn sample_config() -> SyncerConfig {
        SyncerConfig {
            job_name: "sync_q1".to_owned(),
            queue_name: "q1".to_owned(),
            consumer_name: None,
            lock_timeout_secs: default_lock_timeout_secs(),
            tick_timeout_secs: default_tick_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            lag_margin_secs: default_lag_margin_secs(),
            pidfile: Some(PathBuf::from("/tmp/sync_q1.pid")),
            comparator: ComparatorKind::Checksum,
            connection: PgConnectionConfig {
                host: "localhost".to_owned(),
                port: 5432,
                name: "subscriber".to_owned(),
                username: "postgres".to_owned(),
                password: None,
                tls: TlsConfig::default(),
            },
            provider: None,
        }
    }

    #[test]
    fn test_consumer_name_defaults_to_job_name() {
        let mut config = sample_config();
        assert_eq!(config.consumer_name(), "sync_q1");

        config.consumer_name = Some("other".to_owned());
        assert_eq!(config.consumer_name(), "other");
    }

    #[test]
    fn test_repair_pidfile_appends_suffix() {
        let config = sample_config();
        assert_eq!(
            config.repair_pidfile(),
            Some(PathBuf::from("/tmp/sync_q1.pid.repair"))
        );
    }

    #[test]
    fn test_negative_lock_timeout_is_zero() {
        let mut config = sample_config();
        config.lock_timeout_secs = -1.0;
        assert!(config.validate().is_ok());
        assert_eq!(config.lock_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = sample_config();
        config.queue_name = String::new();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::EmptyName("queue_name"))
        ));

        let mut config = sample_config();
        config.poll_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::PollIntervalZero)
        ));

        let mut config = sample_config();
        config.tick_timeout_secs = -1.0;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidTimeout("tick_timeout_secs"))
        ));

        let mut config = sample_config();
        config.lock_timeout_secs = 1e20;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidTimeout("lock_timeout_secs"))
        ));

        let mut config = sample_config();
        config.lag_margin_secs = f64::NAN;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidTimeout("lag_margin_secs"))
        ));

        let mut config = sample_config();
        config.connection.tls.enabled = true;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::MissingTrustedRootCerts)
        ));
    }
}
