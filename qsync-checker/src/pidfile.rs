use anyhow::Context;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Pidfile held for the lifetime of the process, removed on drop.
#[derive(Debug)]
pub struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    /// Writes the current process id to `path`, failing if the file already exists.
    pub fn create(path: PathBuf) -> anyhow::Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| {
                format!(
                    "could not create pidfile {}, is another check of this job running?",
                    path.display()
                )
            })?;
        writeln!(file, "{}", std::process::id())?;

        debug!(path = %path.display(), "pidfile created");

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to remove pidfile: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pidfile_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync_q1.pid.repair");

        let pidfile = Pidfile::create(path.clone()).unwrap();
        let content = fs::read_to_string(pidfile.path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        assert!(Pidfile::create(path.clone()).is_err());

        drop(pidfile);
        assert!(!path.exists());
    }
}
