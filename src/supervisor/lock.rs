use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

// ---------------------------------------------------------------------------
// JobLock: per-job single-instance sentinel
// ---------------------------------------------------------------------------

/// Zero-byte `<job>.lock` file; its presence means the job is running.
///
/// Acquisition uses exclusive creation (CREATE_NEW / O_EXCL) so two
/// invocations racing on the same job cannot both win.
pub struct JobLock {
    path: PathBuf,
}

/// Outcome of trying to take a lock.
pub enum LockAttempt {
    Acquired(LockGuard),
    /// Another invocation holds it; `age` is how long ago it was created.
    Held { age: Option<Duration> },
}

impl JobLock {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn for_job(state_dir: &Path, job: &str) -> Self {
        Self::new(state_dir.join(format!("{}.lock", job)))
    }

    /// Try to take the lock.
    ///
    /// With `stale_after` set, a lock file older than that is treated as
    /// left behind by a killed run: it is removed and acquisition retried
    /// once.
    pub fn try_acquire(&self, stale_after: Option<Duration>) -> Result<LockAttempt> {
        match self.create() {
            Ok(guard) => return Ok(LockAttempt::Acquired(guard)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to create lock file {}", self.path.display())
                })
            }
        }

        let age = self.age();
        match (stale_after, age) {
            (Some(limit), Some(age)) if age > limit => {
                tracing::warn!(
                    "Removing stale lock {} (age {}s exceeds {}s)",
                    self.path.display(),
                    age.as_secs(),
                    limit.as_secs()
                );
                match std::fs::remove_file(&self.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e).context("Failed to remove stale lock file");
                    }
                }
                match self.create() {
                    Ok(guard) => Ok(LockAttempt::Acquired(guard)),
                    // Someone else replaced it between our remove and create.
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        Ok(LockAttempt::Held { age: self.age() })
                    }
                    Err(e) => Err(e).context("Failed to create lock file"),
                }
            }
            _ => Ok(LockAttempt::Held { age }),
        }
    }

    fn create(&self) -> std::io::Result<LockGuard> {
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        tracing::debug!("Lock acquired: {}", self.path.display());
        Ok(LockGuard {
            path: self.path.clone(),
        })
    }

    pub fn is_held(&self) -> bool {
        self.path.exists()
    }

    /// Time since the lock file was last modified, if it exists.
    pub fn age(&self) -> Option<Duration> {
        let modified = std::fs::metadata(&self.path).ok()?.modified().ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }

    /// Remove the lock regardless of who holds it (operator override).
    pub fn force_release(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!("Lock removed: {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context("Failed to remove lock file"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Held lock. Dropping it removes the lock file.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Lock released: {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!("Lock {} was already removed", self.path.display())
            }
            Err(e) => tracing::error!("Failed to release lock {}: {}", self.path.display(), e),
        }
    }
}
