//! Executor drivers: how a worker runs one container.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// A host directory bound into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub host_path: PathBuf,
    pub container_path: String,
    pub readonly: bool,
}

/// Everything needed to start one executor's container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Unique container name, `{task_id}-{index}`.
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub workdir: String,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<Volume>,
    /// Run as this user so files written to volumes keep the worker's
    /// ownership.
    pub user: Option<u32>,
}

/// The container's standard streams.
pub struct ContainerIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Box<dyn AsyncWrite + Send + Unpin>,
}

impl ContainerIo {
    /// Streams that go nowhere.
    pub fn sink() -> Self {
        Self {
            stdin: None,
            stdout: Box::new(tokio::io::sink()),
            stderr: Box::new(tokio::io::sink()),
        }
    }
}

/// Network details of a running container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub ip: String,
    /// Container port (e.g. `80/tcp`) to host port.
    pub ports: BTreeMap<String, String>,
}

#[async_trait]
pub trait ExecutorDriver: Send + Sync {
    /// Run the container to completion and return its exit code.
    async fn run(&self, spec: &ContainerSpec, io: ContainerIo) -> Result<i32>;

    /// Wait until the container is running and report its network details.
    async fn inspect(&self, name: &str) -> Result<ContainerInfo>;

    /// Stop the container, with a grace period.
    async fn stop(&self, name: &str) -> Result<()>;
}

/// Runs nothing and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDriver;

#[async_trait]
impl ExecutorDriver for NoopDriver {
    async fn run(&self, _spec: &ContainerSpec, _io: ContainerIo) -> Result<i32> {
        Ok(0)
    }

    async fn inspect(&self, _name: &str) -> Result<ContainerInfo> {
        Ok(ContainerInfo::default())
    }

    async fn stop(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}
