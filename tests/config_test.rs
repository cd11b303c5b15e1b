use std::time::Duration;

use secrecy::ExposeSecret;
use tes_rs::config::{ComputeBackendKind, Config, DatabaseBackend, DriverKind};

#[test]
fn empty_file_gives_defaults() {
    let config = Config::from_toml("").unwrap();
    config.validate().unwrap();

    assert_eq!(config.server.http_port, 8000);
    assert_eq!(config.server.host_name, "localhost");
    assert!(config.server.disable_http_cache);
    assert_eq!(config.scheduler.schedule_rate, Duration::from_secs(1));
    assert_eq!(config.scheduler.schedule_chunk, 10);
    assert_eq!(config.compute.backend, ComputeBackendKind::Local);
    assert_eq!(config.database.backend, DatabaseBackend::Embedded);
    assert_eq!(config.worker.poll_rate, Duration::from_secs(5));
    assert_eq!(config.worker.max_log_size, 10_000);
    assert_eq!(config.worker.container.driver, DriverKind::Docker);
    assert_eq!(config.retry.initial_interval, Duration::from_millis(500));
    assert_eq!(config.retry.max_tries, 10);
    assert!(config.slurm.disable_reconciler);
    assert_eq!(config.kubernetes.namespace, "default");
    assert_eq!(config.logging.level, "info");
}

#[test]
fn sections_override_defaults() {
    let config = Config::from_toml(
        r#"
        [server]
        http_port = 9090

        [[server.basic_auth]]
        user = "admin"
        password = "hunter2"
        admin = true

        [scheduler]
        schedule_rate = "250ms"

        [compute]
        backend = "slurm"

        [slurm]
        reconcile_rate = "30s"
        disable_reconciler = false

        [worker]
        leave_work_dir = true

        [worker.container]
        driver = "noop"
        "#,
    )
    .unwrap();

    assert_eq!(config.server.http_port, 9090);
    assert_eq!(config.server.http_address(), "http://localhost:9090");
    let cred = &config.server.basic_auth[0];
    assert_eq!(cred.user, "admin");
    assert_eq!(cred.password.expose_secret(), "hunter2");
    assert!(cred.admin);
    assert_eq!(config.scheduler.schedule_rate, Duration::from_millis(250));
    assert_eq!(config.compute.backend, ComputeBackendKind::Slurm);
    let slurm = config.hpc(ComputeBackendKind::Slurm).unwrap();
    assert_eq!(slurm.reconcile_rate, Duration::from_secs(30));
    assert!(!slurm.disable_reconciler);
    assert!(config.hpc(ComputeBackendKind::Kubernetes).is_none());
    assert!(config.worker.leave_work_dir);
    assert_eq!(config.worker.container.driver, DriverKind::Noop);
}

#[test]
fn unknown_backend_is_a_config_error() {
    let err = Config::from_toml("[compute]\nbackend = \"mesos\"\n").unwrap_err();
    assert!(err.to_string().contains("invalid config"), "{err}");
}

#[test]
fn invalid_values_fail_validation() {
    let mut config = Config::default();
    config.scheduler.schedule_chunk = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.worker.max_log_size = 0;
    assert!(config.validate().is_err());

    // Postgres needs its URL from the environment.
    let config = Config::from_toml("[database]\nbackend = \"postgres\"\n").unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("TES_DATABASE_URL"), "{err}");
}

#[test]
fn config_file_is_read_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tes.toml");
    std::fs::write(&path, "[server]\nservice_name = \"lab-tes\"\n").unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.server.service_name, "lab-tes");

    let err = Config::from_file(&dir.path().join("missing.toml")).unwrap_err();
    assert!(err.to_string().contains("missing.toml"), "{err}");
}
