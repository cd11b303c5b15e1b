use std::collections::BTreeMap;

use tes_rs::error::Error;
use tes_rs::model::validate::{problems, validate};
use tes_rs::model::{
    ExecutorLog, Executor, Input, ListTasksRequest, Output, State, Task, TaskLog, View,
    new_task_id,
};

fn hello_world() -> Task {
    Task {
        name: "hello".into(),
        executors: vec![Executor {
            image: "alpine".into(),
            command: vec!["echo".into(), "hello world".into()],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn finished_task() -> Task {
    Task {
        id: new_task_id(),
        state: State::Complete,
        inputs: vec![Input {
            path: "/in/a.txt".into(),
            content: "inline".into(),
            ..Default::default()
        }],
        tags: BTreeMap::from([("env".to_string(), "prod".to_string())]),
        logs: vec![TaskLog {
            logs: vec![ExecutorLog {
                stdout: "out".into(),
                stderr: "err".into(),
                exit_code: 3,
                ..Default::default()
            }],
            system_logs: vec!["level='info' msg='x'".into()],
            metadata: BTreeMap::from([("hostname".to_string(), "node-1".to_string())]),
            ..Default::default()
        }],
        ..hello_world()
    }
}

#[test]
fn valid_task_passes() {
    assert!(validate(&hello_world()).is_ok());
}

#[test]
fn empty_executors_are_rejected() {
    let task = Task {
        executors: vec![],
        ..hello_world()
    };
    match validate(&task) {
        Err(Error::Validation(msgs)) => {
            assert!(msgs.contains(&"Task.Executors: at least one executor is required".to_string()));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn every_problem_is_reported() {
    let task = Task {
        executors: vec![Executor {
            workdir: "relative".into(),
            ..Default::default()
        }],
        inputs: vec![Input {
            url: "file:///a".into(),
            content: "both".into(),
            path: "/in".into(),
            ..Default::default()
        }],
        outputs: vec![Output {
            path: "out".into(),
            ..Default::default()
        }],
        volumes: vec!["vol".into()],
        ..Default::default()
    };
    assert_eq!(
        problems(&task),
        vec![
            "Task.Executors[0].Image: required, but empty",
            "Task.Executors[0].Command: required, but empty",
            "Task.Executors[0].Workdir: must be an absolute path",
            "Task.Inputs[0].Content: Url is non-empty",
            "Task.Outputs[0].Url: required, but empty",
            "Task.Outputs[0].Path: must be an absolute path",
            "Task.Volumes[0]: must be an absolute path",
        ]
    );
}

#[test]
fn minimal_view_keeps_id_and_state() {
    let task = finished_task();
    let minimal = View::Minimal.apply(task.clone());
    assert_eq!(
        minimal,
        Task {
            id: task.id,
            state: task.state,
            ..Default::default()
        }
    );
}

#[test]
fn basic_view_drops_contents_and_logs() {
    let task = finished_task();
    let basic = View::Basic.apply(task.clone());
    assert!(basic.inputs.iter().all(|i| i.content.is_empty()));
    for log in &basic.logs {
        assert!(log.system_logs.is_empty());
        for exec in &log.logs {
            assert!(exec.stdout.is_empty() && exec.stderr.is_empty());
            assert_eq!(exec.exit_code, 3);
        }
        assert_eq!(log.metadata.get("hostname").map(String::as_str), Some("node-1"));
    }
    assert_eq!(basic.tags, task.tags);
}

#[test]
fn full_view_is_identity() {
    let task = finished_task();
    assert_eq!(View::Full.apply(task.clone()), task);
}

#[test]
fn views_and_states_parse_case_insensitively() {
    assert_eq!("basic".parse::<View>().unwrap(), View::Basic);
    assert_eq!("".parse::<View>().unwrap(), View::Minimal);
    assert!("everything".parse::<View>().is_err());
    assert_eq!("executor_error".parse::<State>().unwrap(), State::ExecutorError);
}

#[test]
fn task_ids_sort_by_creation() {
    let ids: Vec<String> = (0..50).map(|_| new_task_id()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
}

#[test]
fn list_filters_match_prefix_state_and_tags() {
    let task = finished_task();
    let req = |name_prefix: &str, state, tags: Vec<(&str, &str)>| ListTasksRequest {
        name_prefix: name_prefix.into(),
        state,
        tags: tags.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        ..Default::default()
    };
    assert!(req("hel", None, vec![]).matches(&task));
    assert!(req("", Some(State::Complete), vec![("env", "")]).matches(&task));
    assert!(!req("", None, vec![("env", "dev")]).matches(&task));
    assert!(!req("", None, vec![("team", "")]).matches(&task));
    assert!(!req("bye", None, vec![]).matches(&task));
    assert!(!req("", Some(State::Running), vec![]).matches(&task));
}

#[test]
fn task_json_uses_tes_field_names() {
    let json = serde_json::to_value(finished_task()).unwrap();
    assert_eq!(json["state"], "COMPLETE");
    assert_eq!(json["inputs"][0]["type"], "FILE");
    assert_eq!(json["logs"][0]["logs"][0]["exit_code"], 3);
}
