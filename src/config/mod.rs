//! Typed configuration.
//!
//! Runtime behaviour comes from a TOML file in which every section has
//! defaults, so an empty file is valid. The environment carries only
//! secrets (database URL, basic-auth passwords) and a few overrides.
//! Sensitive values are wrapped in `secrecy::SecretString` to keep them
//! out of logs.

pub mod secrets;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub compute: ComputeConfig,
    pub htcondor: HpcConfig,
    pub slurm: HpcConfig,
    pub pbs: HpcConfig,
    pub gridengine: HpcConfig,
    pub kubernetes: KubernetesConfig,
    pub worker: WorkerConfig,
    pub local_storage: LocalStorageConfig,
    pub http_storage: HttpStorageConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        let mut config = Self::from_toml(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without touching the environment.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("invalid config: {e}")))
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("TES_DATABASE_URL") {
            self.database.postgres.url = Some(SecretString::from(url));
        }
        if let Ok(endpoint) = std::env::var("OTEL_ENDPOINT") {
            self.logging.otel_endpoint = Some(endpoint);
        }
        for cred in &mut self.server.basic_auth {
            let var = format!("TES_BASIC_AUTH_PASSWORD_{}", cred.user.to_ascii_uppercase());
            if let Ok(password) = std::env::var(var) {
                cred.password = SecretString::from(password);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.schedule_chunk == 0 {
            return Err(Error::Config("scheduler.schedule_chunk must be positive".into()));
        }
        if self.worker.max_log_size == 0 {
            return Err(Error::Config("worker.max_log_size must be positive".into()));
        }
        if self.worker.work_dir.as_os_str().is_empty() {
            return Err(Error::Config("worker.work_dir must be set".into()));
        }
        if self.database.backend == DatabaseBackend::Postgres && self.database.postgres.url.is_none() {
            return Err(Error::Config(
                "database.backend = \"postgres\" requires TES_DATABASE_URL".into(),
            ));
        }
        Ok(())
    }

    /// The HPC section for a scheduler backend, if `backend` names one.
    pub fn hpc(&self, backend: ComputeBackendKind) -> Option<&HpcConfig> {
        match backend {
            ComputeBackendKind::Htcondor => Some(&self.htcondor),
            ComputeBackendKind::Slurm => Some(&self.slurm),
            ComputeBackendKind::Pbs => Some(&self.pbs),
            ComputeBackendKind::Gridengine => Some(&self.gridengine),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host_name: String,
    pub http_port: u16,
    pub service_name: String,
    /// When non-empty, every API request needs one of these credentials.
    pub basic_auth: Vec<BasicCredential>,
    pub disable_http_cache: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host_name: "localhost".to_string(),
            http_port: 8000,
            service_name: "tes-rs".to_string(),
            basic_auth: Vec::new(),
            disable_http_cache: true,
        }
    }
}

impl ServerConfig {
    pub fn http_address(&self) -> String {
        format!("http://{}:{}", self.host_name, self.http_port)
    }
}

#[derive(Debug, Deserialize)]
pub struct BasicCredential {
    pub user: String,
    pub password: SecretString,
    #[serde(default)]
    pub admin: bool,
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    Embedded,
    Postgres,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub embedded: EmbeddedConfig,
    pub postgres: PostgresConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EmbeddedConfig {
    pub path: PathBuf,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./tes-work-dir/tes.db"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// Read from `TES_DATABASE_URL`, never from the file.
    #[serde(skip)]
    pub url: Option<SecretString>,
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduling + compute
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "humantime_serde")]
    pub schedule_rate: Duration,
    pub schedule_chunk: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_rate: Duration::from_secs(1),
            schedule_chunk: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeBackendKind {
    #[default]
    Local,
    Noop,
    Htcondor,
    Slurm,
    Pbs,
    Gridengine,
    Kubernetes,
}

impl std::fmt::Display for ComputeBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ComputeBackendKind::Local => "local",
            ComputeBackendKind::Noop => "noop",
            ComputeBackendKind::Htcondor => "htcondor",
            ComputeBackendKind::Slurm => "slurm",
            ComputeBackendKind::Pbs => "pbs",
            ComputeBackendKind::Gridengine => "gridengine",
            ComputeBackendKind::Kubernetes => "kubernetes",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    pub backend: ComputeBackendKind,
}

/// Settings shared by the batch-scheduler backends.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HpcConfig {
    /// Submit-script template. Empty selects the built-in one.
    pub template: String,
    /// Path to a file overriding `template`.
    pub template_file: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub reconcile_rate: Duration,
    pub disable_reconciler: bool,
}

impl Default for HpcConfig {
    fn default() -> Self {
        Self {
            template: String::new(),
            template_file: None,
            reconcile_rate: Duration::from_secs(600),
            disable_reconciler: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub namespace: String,
    /// Worker image run by each job.
    pub image: String,
    /// Optional JSON job manifest template; empty uses the built-in one.
    pub template: String,
    pub kubectl: String,
    pub service_account: String,
    #[serde(with = "humantime_serde")]
    pub reconcile_rate: Duration,
    pub disable_reconciler: bool,
    pub disable_cleanup: bool,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            image: "tes-rs:latest".to_string(),
            template: String::new(),
            kubectl: "kubectl".to_string(),
            service_account: String::new(),
            reconcile_rate: Duration::from_secs(600),
            disable_reconciler: false,
            disable_cleanup: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub work_dir: PathBuf,
    /// How often a worker checks whether its task was canceled.
    #[serde(with = "humantime_serde")]
    pub poll_rate: Duration,
    #[serde(with = "humantime_serde")]
    pub log_update_rate: Duration,
    pub max_log_size: usize,
    #[serde(with = "humantime_serde")]
    pub update_timeout: Duration,
    pub leave_work_dir: bool,
    pub container: ContainerConfig,
    /// Server a remote worker reports to.
    pub server_address: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./tes-work-dir"),
            poll_rate: Duration::from_secs(5),
            log_update_rate: Duration::from_secs(5),
            max_log_size: 10_000,
            update_timeout: Duration::from_secs(5),
            leave_work_dir: false,
            container: ContainerConfig::default(),
            server_address: "http://localhost:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Docker,
    Noop,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub driver: DriverKind,
    pub docker_command: String,
    /// Extra arguments inserted after `run`.
    pub run_args: Vec<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Docker,
            docker_command: "docker".to_string(),
            run_args: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalStorageConfig {
    /// Host directories that `file://` URLs may read from or write to.
    pub allowed_dirs: Vec<PathBuf>,
    pub disabled: bool,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            allowed_dirs: vec![PathBuf::from("./")],
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpStorageConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub disabled: bool,
}

impl Default for HttpStorageConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            disabled: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry + logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub max_tries: u32,
    #[serde(with = "humantime_serde")]
    pub max_elapsed: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(60),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_tries: 10,
            max_elapsed: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub otel_endpoint: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            otel_endpoint: None,
        }
    }
}
