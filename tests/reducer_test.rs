//! Reducer behaviour: the transition matrix, event application and
//! properties that must hold for any event stream.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use tes_rs::error::Error;
use tes_rs::events::{Event, EventKind, fields};
use tes_rs::model::{Executor, State, Task};
use tes_rs::reducer::{Reducer, reduce};

fn task_in(state: State) -> Task {
    Task {
        id: "t1".to_string(),
        state,
        executors: vec![Executor {
            image: "alpine".into(),
            command: vec!["true".into()],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// The transition table, written out independently of the model code.
fn expected(from: State, to: State) -> Option<State> {
    use State::*;
    if from == Paused || to == Paused {
        return None;
    }
    if from == to {
        return Some(from);
    }
    if from.is_terminal() && to == Canceled {
        return Some(from);
    }
    let ok = match from {
        Unknown | Queued => to != Unknown,
        Initializing => matches!(to, Running | ExecutorError | SystemError | Canceled),
        Running => matches!(to, Complete | ExecutorError | SystemError | Canceled),
        _ => false,
    };
    ok.then_some(to)
}

#[test]
fn transition_matrix_is_enforced() {
    for from in State::ALL {
        for to in State::ALL {
            let result = reduce(task_in(from), &Event::state("t1", 0, to));
            match (expected(from, to), result) {
                (Some(state), Ok(task)) => {
                    assert_eq!(task.state, state, "{from} -> {to}");
                }
                (None, Err(Error::InvalidTransition { from: f, to: t })) => {
                    assert_eq!((f, t), (from, to));
                }
                (want, got) => panic!("{from} -> {to}: expected {want:?}, got {got:?}"),
            }
        }
    }
}

#[test]
fn complete_task_rejects_running() {
    let err = reduce(task_in(State::Complete), &Event::state("t1", 0, State::Running)).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: State::Complete,
            to: State::Running
        }
    ));
}

#[test]
fn created_task_starts_queued_with_server_id() {
    let mut submitted = task_in(State::Complete);
    submitted.id = "client-chosen".into();
    submitted.logs = vec![Default::default()];
    let mut ev = Event::task_created(submitted);
    ev.id = "server-id".into();

    let task = reduce(Task::default(), &ev).unwrap();
    assert_eq!(task.id, "server-id");
    assert_eq!(task.state, State::Queued);
    assert!(task.logs.is_empty());
    assert_eq!(task.creation_time, Some(ev.timestamp));

    let again = reduce(task, &ev).unwrap_err();
    assert!(matches!(again, Error::AlreadyExists(_)));
}

#[test]
fn events_for_unknown_task_are_not_found() {
    let err = reduce(Task::default(), &Event::state("nope", 0, State::Running)).unwrap_err();
    assert!(matches!(err, Error::NotFound(id) if id == "nope"));
}

#[test]
fn logs_extend_for_out_of_order_events() {
    let task = task_in(State::Running);
    let task = reduce(task, &Event::exit_code("t1", 1, 2, 7)).unwrap();
    assert_eq!(task.logs.len(), 2);
    assert_eq!(task.logs[1].logs.len(), 3);
    assert_eq!(task.logs[1].logs[2].exit_code, 7);
    assert_eq!(task.current_attempt(), 1);
}

#[test]
fn metadata_merges_and_outputs_replace() {
    let task = task_in(State::Running);
    let task = reduce(task, &Event::metadata("t1", 0, fields([("a", "1"), ("b", "2")]))).unwrap();
    let task = reduce(task, &Event::metadata("t1", 0, fields([("b", "3")]))).unwrap();
    let meta = task.metadata().unwrap();
    assert_eq!(meta.get("a").map(String::as_str), Some("1"));
    assert_eq!(meta.get("b").map(String::as_str), Some("3"));

    let out = |url: &str| tes_rs::model::OutputFileLog {
        url: url.into(),
        path: "/out".into(),
        size_bytes: "1".into(),
    };
    let task = reduce(task, &Event::outputs("t1", 0, vec![out("file:///a"), out("file:///b")])).unwrap();
    let task = reduce(task, &Event::outputs("t1", 0, vec![out("file:///c")])).unwrap();
    assert_eq!(task.logs[0].outputs, vec![out("file:///c")]);
}

#[test]
fn system_log_lines_carry_level_and_fields() {
    let ev = Event::system_log("t1", 0, 1, "error", "it's broken", fields([("error", "boom")]));
    let task = reduce(task_in(State::Running), &ev).unwrap();
    let line = &task.logs[0].system_logs[0];
    assert!(line.starts_with("level='error' msg='it\\'s broken' timestamp='"), "{line}");
    assert!(line.ends_with("task_attempt='0' executor_index='1' error='boom'"), "{line}");
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

fn arb_state() -> impl Strategy<Value = State> {
    proptest::sample::select(State::ALL.to_vec())
}

fn arb_kind() -> impl Strategy<Value = EventKind> {
    let t = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    prop_oneof![
        arb_state().prop_map(EventKind::TaskState),
        Just(EventKind::TaskStartTime(t)),
        Just(EventKind::ExecutorEndTime(t)),
        any::<i32>().prop_map(EventKind::ExecutorExitCode),
        "[a-z ]{0,20}".prop_map(EventKind::ExecutorStdout),
        "[a-z ]{0,20}".prop_map(EventKind::ExecutorStderr),
        ("[a-z]{1,4}", "[a-z]{0,4}")
            .prop_map(|(k, v)| EventKind::TaskMetadata(fields([(k, v)]))),
    ]
}

fn arb_events() -> impl Strategy<Value = Vec<Event>> {
    let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    proptest::collection::vec((0u32..2, 0u32..3, arb_kind()), 0..40).prop_map(move |items| {
        let mut events = vec![Event {
            timestamp: t,
            ..Event::task_created(task_in(State::Unknown))
        }];
        events.extend(items.into_iter().map(|(attempt, index, kind)| Event {
            id: "t1".to_string(),
            attempt,
            index,
            timestamp: t,
            kind,
        }));
        events
    })
}

/// Fold events, skipping the ones the reducer rejects.
fn apply_all(reducer: &Reducer, events: &[Event]) -> Task {
    events.iter().fold(Task::default(), |task, ev| {
        reducer.reduce(task.clone(), ev).unwrap_or(task)
    })
}

proptest! {
    #[test]
    fn reducer_is_deterministic(events in arb_events()) {
        let reducer = Reducer::new(64);
        let first = apply_all(&reducer, &events);
        let second = apply_all(&reducer, &events);
        prop_assert_eq!(&first, &second);

        let wire = serde_json::to_string(&events).unwrap();
        let decoded: Vec<Event> = serde_json::from_str(&wire).unwrap();
        prop_assert_eq!(first, apply_all(&reducer, &decoded));
    }

    #[test]
    fn stdout_keeps_the_tail(chunks in proptest::collection::vec("[ -~]{0,40}", 0..30), max in 1usize..64) {
        let reducer = Reducer::new(max);
        let mut task = task_in(State::Running);
        let mut all = String::new();
        for chunk in &chunks {
            all.push_str(chunk);
            task = reducer.reduce(task, &Event::stdout("t1", 0, 0, chunk.clone())).unwrap();
        }
        let stored = task.logs.first().and_then(|l| l.logs.first()).map(|e| e.stdout.clone()).unwrap_or_default();
        let keep = all.len().min(max);
        prop_assert_eq!(stored.len(), keep);
        prop_assert_eq!(stored.as_str(), &all[all.len() - keep..]);
    }
}
