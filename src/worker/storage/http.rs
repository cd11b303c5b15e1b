//! Read-only `http://` / `https://` storage.

use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use super::{Op, Storage};
use crate::config::HttpStorageConfig;
use crate::error::{Error, Result};
use crate::model::FileType;

pub struct HttpStorage {
    client: reqwest::Client,
}

impl HttpStorage {
    pub fn new(conf: &HttpStorageConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(conf.timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Storage for HttpStorage {
    async fn get(&self, url: &str, path: &Path, class: FileType) -> Result<()> {
        if class == FileType::Directory {
            return Err(Error::Unsupported(format!("directory download over HTTP: {url}")));
        }
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(Error::Transient(format!("GET {url}: {status}")));
        }
        if !status.is_success() {
            return Err(Error::Permanent(format!("GET {url}: {status}")));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn put(&self, url: &str, _path: &Path) -> Result<u64> {
        Err(Error::Unsupported(format!("upload over HTTP: {url}")))
    }

    fn supports(&self, url: &str, op: Op) -> bool {
        op == Op::Get && (url.starts_with("http://") || url.starts_with("https://"))
    }
}
