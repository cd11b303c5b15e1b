//! Scheduler output parsing and submit-file rendering.

use std::collections::BTreeMap;
use std::sync::Arc;

use tes_rs::compute::hpc::{
    Flavor, HpcBackend, parse_condor_json, parse_gridengine, parse_pbs_json, parse_sacct,
    parse_squeue,
};
use tes_rs::compute::kubernetes::{KubernetesBackend, parse_job_list};
use tes_rs::compute::reconcile::JobState;
use tes_rs::config::{ComputeBackendKind, HpcConfig, KubernetesConfig};
use tes_rs::db::EmbeddedDb;
use tes_rs::model::{Resources, Task};

fn task_with_resources() -> Task {
    Task {
        id: "d2c8h0r2l0p0000000000000".into(),
        resources: Some(Resources {
            cpu_cores: 4,
            ram_gb: 8.0,
            zones: vec!["gpu".into()],
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[test]
fn submit_ids_are_extracted_per_scheduler() {
    assert_eq!(
        Flavor::Htcondor.extract_id("1 job(s) submitted to cluster 42.\n").as_deref(),
        Some("42")
    );
    assert_eq!(Flavor::Slurm.extract_id("Submitted batch job 42\n").as_deref(), Some("42"));
    assert_eq!(Flavor::Pbs.extract_id("42.server\n").as_deref(), Some("42.server"));
    assert_eq!(
        Flavor::Gridengine
            .extract_id("Your job 42 (\"tes\") has been submitted\n")
            .as_deref(),
        Some("42")
    );
    assert_eq!(Flavor::Slurm.extract_id(""), None);
}

#[test]
fn flavors_follow_backend_kind() {
    assert_eq!(Flavor::from_kind(ComputeBackendKind::Pbs), Some(Flavor::Pbs));
    assert_eq!(Flavor::from_kind(ComputeBackendKind::Local), None);
    assert_eq!(Flavor::Gridengine.id_key(), "gridengine_id");
}

#[test]
fn squeue_flags_unschedulable_jobs() {
    let jobs = parse_squeue("42 PENDING PartitionConfig\n43 RUNNING None\n44 PENDING Priority\n");
    assert_eq!(jobs.len(), 3);
    assert_eq!(jobs[0].state, JobState::Failed);
    assert!(jobs[0].remove);
    assert_eq!(jobs[0].reason, "No suitable partition available");
    assert_eq!(jobs[1].state, JobState::Running);
    assert_eq!(jobs[2].state, JobState::Queued);
    assert!(!jobs[2].remove);
}

#[test]
fn sacct_reports_finished_jobs() {
    let jobs = parse_sacct("42 COMPLETED\n42.batch COMPLETED\n43 NODE_FAIL\n44 WEIRD\n");
    let states: Vec<(&str, JobState)> = jobs.iter().map(|j| (j.id.as_str(), j.state)).collect();
    assert_eq!(
        states,
        vec![
            ("42", JobState::Succeeded),
            ("42.batch", JobState::Succeeded),
            ("43", JobState::Failed),
        ]
    );
    assert_eq!(jobs[2].native, "NODE_FAIL");
}

#[test]
fn condor_status_codes() {
    let out = r#"[
        {"ClusterId": 1, "JobStatus": 1},
        {"ClusterId": 2, "JobStatus": 2},
        {"ClusterId": 3, "JobStatus": 3},
        {"ClusterId": 4, "JobStatus": 4, "ExitCode": 0},
        {"ClusterId": 5, "JobStatus": 4, "ExitCode": 1},
        {"ClusterId": 6, "JobStatus": 5},
        {"ClusterId": 7, "JobStatus": 6}
    ]"#;
    let states: Vec<JobState> = parse_condor_json(out).unwrap().iter().map(|j| j.state).collect();
    assert_eq!(
        states,
        vec![
            JobState::Queued,
            JobState::Running,
            JobState::Failed,
            JobState::Succeeded,
            JobState::Failed,
            JobState::Running,
            JobState::Failed,
        ]
    );
    assert!(parse_condor_json("  ").unwrap().is_empty());
    assert!(parse_condor_json("not json").is_err());
}

#[test]
fn pbs_exit_status_decides_completion() {
    let out = r#"{"Jobs": {
        "1.server": {"job_state": "C", "Exit_status": 0},
        "2.server": {"job_state": "F", "Exit_status": 271},
        "3.server": {"job_state": "Q"},
        "4.server": {"job_state": "R"}
    }}"#;
    let jobs = parse_pbs_json(out).unwrap();
    let states: BTreeMap<&str, JobState> = jobs.iter().map(|j| (j.id.as_str(), j.state)).collect();
    assert_eq!(states["1.server"], JobState::Succeeded);
    assert_eq!(states["2.server"], JobState::Failed);
    assert_eq!(states["3.server"], JobState::Queued);
    assert_eq!(states["4.server"], JobState::Running);
}

#[test]
fn gridengine_skips_header() {
    let out = "\
job-ID  prior   name       user         state submit/start at     queue
-----------------------------------------------------------------------
     42 0.55500 tes        alice        r     10/19/2026 10:00:00 all.q@node1
     43 0.55500 tes        alice        qw    10/19/2026 10:00:01
     44 0.55500 tes        alice        Eqw   10/19/2026 10:00:02
";
    let jobs = parse_gridengine(out);
    let states: Vec<(&str, JobState)> = jobs.iter().map(|j| (j.id.as_str(), j.state)).collect();
    assert_eq!(
        states,
        vec![
            ("42", JobState::Running),
            ("43", JobState::Queued),
            ("44", JobState::Failed),
        ]
    );
}

#[test]
fn slurm_script_drops_unset_directives() {
    let work = tempfile::tempdir().unwrap();
    let db = Arc::new(EmbeddedDb::temporary().unwrap());
    let backend = HpcBackend::new(
        Flavor::Slurm,
        &HpcConfig::default(),
        work.path(),
        "tes worker run --config /etc/tes.toml".into(),
        db,
    )
    .unwrap();
    let task = task_with_resources();
    let script = backend.submit_script(&task);

    assert!(script.starts_with("#!/bin/bash\n"));
    assert!(script.contains(&format!("#SBATCH --job-name {}", task.id)));
    assert!(script.contains("#SBATCH --cpus-per-task 4\n"));
    assert!(script.contains("#SBATCH --mem 8GB\n"));
    assert!(script.contains("#SBATCH --partition gpu\n"));
    assert!(!script.contains("--tmp"));
    assert!(!script.contains("--account"));
    assert!(script.contains(&format!(
        "tes worker run --config /etc/tes.toml --task-id {}",
        task.id
    )));
}

#[test]
fn custom_template_replaces_builtin() {
    let work = tempfile::tempdir().unwrap();
    let db = Arc::new(EmbeddedDb::temporary().unwrap());
    let conf = HpcConfig {
        template: "#!/bin/sh\n#PBS -N {{TaskId}}\n#PBS -l walltime={{Walltime}}\n{{WorkerCommand}}\n"
            .into(),
        ..Default::default()
    };
    let backend = HpcBackend::new(Flavor::Pbs, &conf, work.path(), "tes worker run".into(), db).unwrap();
    let task = task_with_resources();
    assert_eq!(
        backend.submit_script(&task),
        format!(
            "#!/bin/sh\n#PBS -N {id}\ntes worker run --task-id {id}\n",
            id = task.id
        )
    );
}

#[test]
fn kubernetes_job_list_maps_counts() {
    let out = r#"{"items": [
        {"metadata": {"name": "a"}, "status": {"active": 1}},
        {"metadata": {"name": "b"}, "status": {"succeeded": 1}},
        {"metadata": {"name": "c"}, "status": {"failed": 1, "conditions": [{"type": "Failed", "reason": "BackoffLimitExceeded"}]}},
        {"metadata": {"name": "d"}, "status": {}}
    ]}"#;
    let jobs = parse_job_list(out).unwrap();
    let states: Vec<(&str, JobState)> = jobs.iter().map(|j| (j.task_id.as_str(), j.state)).collect();
    assert_eq!(
        states,
        vec![
            ("a", JobState::Running),
            ("b", JobState::Succeeded),
            ("c", JobState::Failed),
            ("d", JobState::Queued),
        ]
    );
    assert!(jobs[2].detail.contains("BackoffLimitExceeded"));
}

#[test]
fn kubernetes_manifest_requests_resources() {
    let backend = KubernetesBackend::new(&KubernetesConfig::default(), "http://tes:8000");
    let task = task_with_resources();
    let manifest: serde_json::Value = serde_json::from_str(&backend.manifest(&task).unwrap()).unwrap();

    assert_eq!(manifest["kind"], "Job");
    assert_eq!(manifest["metadata"]["name"], task.id.as_str());
    assert_eq!(manifest["metadata"]["namespace"], "default");
    let container = &manifest["spec"]["template"]["spec"]["containers"][0];
    assert_eq!(container["resources"]["requests"]["cpu"], "4");
    assert_eq!(container["resources"]["requests"]["memory"], "8192Mi");
    assert!(container["resources"]["requests"].get("ephemeral-storage").is_none());
    let args: Vec<&str> = container["args"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a.as_str().unwrap())
        .collect();
    assert!(args.windows(2).any(|w| w == ["--task-id", task.id.as_str()]));
    assert!(args.windows(2).any(|w| w == ["--server-address", "http://tes:8000"]));
}
