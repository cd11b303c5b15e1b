//! `file://` storage on a filesystem shared with the server.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{Op, Storage, walk_files};
use crate::error::{Error, Result};
use crate::model::FileType;

/// Copies files to and from host directories listed in `allowed_dirs`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    allowed_dirs: Vec<PathBuf>,
}

impl LocalStorage {
    pub fn new(allowed_dirs: &[PathBuf]) -> Result<Self> {
        let allowed_dirs = allowed_dirs
            .iter()
            .map(|d| std::path::absolute(d).map(|p| normalize(&p)))
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self { allowed_dirs })
    }

    /// The host path a URL names, if it is a local URL.
    pub fn url_path(url: &str) -> Option<PathBuf> {
        let raw = url.strip_prefix("file://").unwrap_or(url);
        raw.starts_with('/').then(|| normalize(Path::new(raw)))
    }

    fn allowed(&self, path: &Path) -> bool {
        self.allowed_dirs.iter().any(|dir| path.starts_with(dir))
    }

    fn resolve(&self, url: &str) -> Result<PathBuf> {
        let path = Self::url_path(url)
            .ok_or_else(|| Error::Unsupported(format!("not a local URL: {url}")))?;
        if !self.allowed(&path) {
            return Err(Error::Permanent(format!(
                "{} is not under an allowed directory",
                path.display()
            )));
        }
        Ok(path)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn get(&self, url: &str, path: &Path, class: FileType) -> Result<()> {
        let src = self.resolve(url)?;
        match class {
            FileType::File => copy_file(&src, path).await.map(|_| ()),
            FileType::Directory => {
                tokio::fs::create_dir_all(path).await?;
                for rel in walk_files(&src).await? {
                    copy_file(&src.join(&rel), &path.join(&rel)).await?;
                }
                Ok(())
            }
        }
    }

    async fn put(&self, url: &str, path: &Path) -> Result<u64> {
        let dest = self.resolve(url)?;
        copy_file(path, &dest).await
    }

    fn supports(&self, url: &str, _op: Op) -> bool {
        Self::url_path(url).is_some_and(|p| self.allowed(&p))
    }
}

async fn copy_file(src: &Path, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    debug!(src = %src.display(), dest = %dest.display(), "copy");
    Ok(tokio::fs::copy(src, dest).await?)
}

/// Resolve `.` and `..` lexically.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_paths_outside_allowed_dirs() {
        let storage = LocalStorage::new(&[PathBuf::from("/data")]).unwrap();
        assert!(storage.supports("file:///data/in.txt", Op::Get));
        assert!(storage.supports("/data/sub/in.txt", Op::Put));
        assert!(!storage.supports("file:///data/../etc/passwd", Op::Get));
        assert!(!storage.supports("file:///database/x", Op::Get));
        assert!(!storage.supports("http://example.com/x", Op::Get));
    }
}
