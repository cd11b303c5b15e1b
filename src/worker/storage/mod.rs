//! Input/output staging.
//!
//! A [`Storage`] moves files between a URL and a host path. The [`Mux`]
//! built for each task routes every URL to the first backend that
//! supports it and retries transient failures.

pub mod http;
pub mod local;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{HttpStorageConfig, LocalStorageConfig};
use crate::error::{Error, Result};
use crate::model::FileType;
use crate::retry::Retrier;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Put,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Download `url` to `path`. Directories are copied recursively.
    async fn get(&self, url: &str, path: &Path, class: FileType) -> Result<()>;

    /// Upload the single file at `path` to `url`. Returns its size.
    async fn put(&self, url: &str, path: &Path) -> Result<u64>;

    /// Whether this backend can perform `op` on `url`.
    fn supports(&self, url: &str, op: Op) -> bool;
}

/// Routes transfers to the first supporting backend.
pub struct Mux {
    backends: Vec<Arc<dyn Storage>>,
    retrier: Retrier,
    cancel: CancellationToken,
}

impl Mux {
    pub fn new(backends: Vec<Arc<dyn Storage>>, retrier: Retrier, cancel: CancellationToken) -> Self {
        Self {
            backends,
            retrier,
            cancel,
        }
    }

    /// Backends enabled by configuration, scoped to one task run.
    pub fn from_config(
        local: &LocalStorageConfig,
        http: &HttpStorageConfig,
        retrier: Retrier,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Ok(Self::new(enabled_backends(local, http)?, retrier, cancel))
    }

    fn find(&self, url: &str, op: Op) -> Result<&Arc<dyn Storage>> {
        self.backends
            .iter()
            .find(|b| b.supports(url, op))
            .ok_or_else(|| {
                let verb = match op {
                    Op::Get => "downloading",
                    Op::Put => "uploading",
                };
                Error::Unsupported(format!("no storage backend supports {verb} {url}"))
            })
    }

    /// Fail fast if `url` cannot be transferred.
    pub fn check(&self, url: &str, op: Op) -> Result<()> {
        self.find(url, op).map(|_| ())
    }
}

#[async_trait]
impl Storage for Mux {
    async fn get(&self, url: &str, path: &Path, class: FileType) -> Result<()> {
        let backend = self.find(url, Op::Get)?;
        self.retrier
            .retry(&self.cancel, || backend.get(url, path, class))
            .await
    }

    async fn put(&self, url: &str, path: &Path) -> Result<u64> {
        let backend = self.find(url, Op::Put)?;
        self.retrier
            .retry(&self.cancel, || backend.put(url, path))
            .await
    }

    fn supports(&self, url: &str, op: Op) -> bool {
        self.backends.iter().any(|b| b.supports(url, op))
    }
}

/// Storage backends enabled by configuration.
pub fn enabled_backends(
    local: &LocalStorageConfig,
    http: &HttpStorageConfig,
) -> Result<Vec<Arc<dyn Storage>>> {
    let mut backends: Vec<Arc<dyn Storage>> = Vec::new();
    if !local.disabled {
        backends.push(Arc::new(local::LocalStorage::new(&local.allowed_dirs)?));
    }
    if !http.disabled {
        backends.push(Arc::new(http::HttpStorage::new(http)?));
    }
    Ok(backends)
}

/// URL schemes the enabled backends accept.
pub fn enabled_schemes(local: &LocalStorageConfig, http: &HttpStorageConfig) -> Vec<String> {
    let mut schemes = Vec::new();
    if !local.disabled {
        schemes.push("file".to_string());
    }
    if !http.disabled {
        schemes.extend(["http".to_string(), "https".to_string()]);
    }
    schemes
}

/// Regular files under `dir`, as paths relative to it, sorted.
///
/// Symlinks are followed when they point at regular files and skipped
/// otherwise; subdirectories are descended into.
pub async fn walk_files(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![std::path::PathBuf::new()];
    while let Some(rel) = pending.pop() {
        let mut entries = tokio::fs::read_dir(dir.join(&rel)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let child = rel.join(entry.file_name());
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(child);
            } else if file_type.is_file() {
                files.push(child);
            } else if file_type.is_symlink() {
                if let Ok(meta) = tokio::fs::metadata(entry.path()).await {
                    if meta.is_file() {
                        files.push(child);
                    }
                }
            }
        }
    }
    files.sort();
    Ok(files)
}
