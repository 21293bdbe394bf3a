use qsync_config::load_config;
use qsync_config::shared::SyncerConfig;
use std::path::Path;

/// Loads the [`SyncerConfig`] of a job, applies the command line override and validates
/// the result.
pub fn load_syncer_config(path: &Path, lock_timeout: Option<f64>) -> anyhow::Result<SyncerConfig> {
    let mut config = load_config::<SyncerConfig>(path)?;
    if let Some(lock_timeout) = lock_timeout {
        config.lock_timeout_secs = lock_timeout;
    }
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    const JOB_FILE: &str = r#"
job_name: sync_q1
pgq_queue_name: q1
connection:
  host: localhost
  port: 5432
  name: subdb
  username: replicator
"#;

    #[test]
    fn test_loads_job_file_with_legacy_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync_q1.yaml");
        fs::write(&path, JOB_FILE).unwrap();

        let config = load_syncer_config(&path, None).unwrap();

        assert_eq!(config.queue_name, "q1");
        assert_eq!(config.consumer_name(), "sync_q1");
        assert_eq!(config.lock_timeout(), Duration::from_secs(10));
        assert!(config.provider.is_none());
    }

    #[test]
    fn test_lock_timeout_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync_q1.yaml");
        fs::write(&path, JOB_FILE).unwrap();

        let config = load_syncer_config(&path, Some(2.5)).unwrap();
        assert_eq!(config.lock_timeout(), Duration::from_millis(2_500));

        assert!(load_syncer_config(&path, Some(f64::NAN)).is_err());
        assert!(load_syncer_config(&path, Some(1e20)).is_err());
    }

    #[test]
    fn test_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_syncer_config(&dir.path().join("absent.yaml"), None).is_err());
    }
}
