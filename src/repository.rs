//! Experiment repository with reference-counted checkouts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::RepositoryError;

/// Revision name used when the repository is not versioned.
pub const UNVERSIONED: &str = "N/A";

/// A checked-out revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkout {
    /// Working directory the worker is started in.
    pub wd: PathBuf,
    /// Commit message, if the backend has one.
    pub message: Option<String>,
}

/// Version-control backend behind [`ExperimentRepo`].
#[async_trait]
pub trait RepositoryBackend: Send + Sync {
    /// Current head revision.
    async fn head(&self) -> Result<String, RepositoryError>;

    /// Materialize `rev` on disk.
    async fn checkout(&self, rev: &str) -> Result<Checkout, RepositoryError>;

    /// Called once the last run referencing `rev` is gone.
    async fn release(&self, rev: &str) -> Result<(), RepositoryError>;
}

/// Plain directory backend.
///
/// An optional `HEAD` file names the head revision; revision `r` lives in
/// the subdirectory `r` with an optional `MESSAGE` file. Without `HEAD`,
/// the root itself is the only revision, [`UNVERSIONED`].
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RepositoryBackend for FilesystemBackend {
    async fn head(&self) -> Result<String, RepositoryError> {
        match tokio::fs::read_to_string(self.root.join("HEAD")).await {
            Ok(head) => Ok(head.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(UNVERSIONED.to_string()),
            Err(e) => Err(e.into()),
        }
    }

    async fn checkout(&self, rev: &str) -> Result<Checkout, RepositoryError> {
        if rev == UNVERSIONED {
            return Ok(Checkout {
                wd: self.root.clone(),
                message: None,
            });
        }
        if rev.is_empty() || rev.contains(['/', '\\']) || rev == ".." {
            return Err(RepositoryError::Checkout {
                rev: rev.to_string(),
                reason: "invalid revision name".to_string(),
            });
        }

        let wd = self.root.join(rev);
        if !tokio::fs::metadata(&wd)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(RepositoryError::Checkout {
                rev: rev.to_string(),
                reason: format!("{} is not a directory", wd.display()),
            });
        }
        let message = tokio::fs::read_to_string(wd.join("MESSAGE"))
            .await
            .ok()
            .map(|m| m.trim().to_string());
        Ok(Checkout { wd, message })
    }

    async fn release(&self, _rev: &str) -> Result<(), RepositoryError> {
        Ok(())
    }
}

struct Entry {
    checkout: Checkout,
    refs: usize,
}

/// Shares checkouts between runs; a revision is released only when the
/// last run holding it is deleted.
pub struct ExperimentRepo {
    backend: Arc<dyn RepositoryBackend>,
    checkouts: Mutex<HashMap<String, Entry>>,
}

impl ExperimentRepo {
    pub fn new(backend: Arc<dyn RepositoryBackend>) -> Self {
        Self {
            backend,
            checkouts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn head(&self) -> Result<String, RepositoryError> {
        self.backend.head().await
    }

    /// Take a reference on `rev`, checking it out on first use.
    pub async fn request_rev(&self, rev: &str) -> Result<Checkout, RepositoryError> {
        let mut checkouts = self.checkouts.lock().await;
        if let Some(entry) = checkouts.get_mut(rev) {
            entry.refs += 1;
            return Ok(entry.checkout.clone());
        }
        let checkout = self.backend.checkout(rev).await?;
        debug!(rev, wd = %checkout.wd.display(), "revision checked out");
        checkouts.insert(
            rev.to_string(),
            Entry {
                checkout: checkout.clone(),
                refs: 1,
            },
        );
        Ok(checkout)
    }

    /// Drop one reference on `rev`.
    pub async fn release_rev(&self, rev: &str) {
        let mut checkouts = self.checkouts.lock().await;
        let Some(entry) = checkouts.get_mut(rev) else {
            warn!(rev, "{}", RepositoryError::NotCheckedOut { rev: rev.to_string() });
            return;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return;
        }
        checkouts.remove(rev);
        if let Err(e) = self.backend.release(rev).await {
            warn!(rev, error = %e, "failed to release revision");
        } else {
            debug!(rev, "revision released");
        }
    }

    /// Live references on `rev`.
    pub async fn refcount(&self, rev: &str) -> usize {
        self.checkouts
            .lock()
            .await
            .get(rev)
            .map(|e| e.refs)
            .unwrap_or(0)
    }
}
