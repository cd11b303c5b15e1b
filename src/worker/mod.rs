//! Task execution on a worker node.
//!
//! A [`runner::Runner`] takes one task from `QUEUED`/`INITIALIZING` to a
//! terminal state: it lays out the working directory, stages inputs,
//! runs each executor through an [`driver::ExecutorDriver`], uploads
//! outputs and reports every step as events.

pub mod docker;
pub mod driver;
pub mod file_mapper;
pub mod reader;
pub mod runner;
pub mod storage;

use std::sync::Arc;

use crate::config::{
    Config, ContainerConfig, DriverKind, HttpStorageConfig, LocalStorageConfig, RetryConfig,
    WorkerConfig,
};

pub use reader::{DbTaskReader, TaskReader};
pub use runner::Runner;

/// The slice of configuration a runner needs.
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    pub worker: WorkerConfig,
    pub local_storage: LocalStorageConfig,
    pub http_storage: HttpStorageConfig,
    pub retry: RetryConfig,
}

impl From<&Config> for RunnerConfig {
    fn from(conf: &Config) -> Self {
        Self {
            worker: conf.worker.clone(),
            local_storage: conf.local_storage.clone(),
            http_storage: conf.http_storage.clone(),
            retry: conf.retry.clone(),
        }
    }
}

/// The executor driver selected by configuration.
pub fn driver_from_config(conf: &ContainerConfig) -> Arc<dyn driver::ExecutorDriver> {
    match conf.driver {
        DriverKind::Docker => Arc::new(docker::DockerDriver::new(conf)),
        DriverKind::Noop => Arc::new(driver::NoopDriver),
    }
}
