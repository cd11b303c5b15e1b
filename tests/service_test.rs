//! Task API operations against the embedded store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tes_rs::compute::{ComputeBackend, ComputeSink, Dispatcher};
use tes_rs::config::Config;
use tes_rs::db::{Database, EmbeddedDb, TaskQueue};
use tes_rs::error::{Error, Result};
use tes_rs::events::{Event, EventWriter};
use tes_rs::model::{Executor, ListTasksRequest, State, Task, View};
use tes_rs::retry::Retrier;
use tes_rs::server::service::service_info;
use tes_rs::server::{Caller, TaskService};

/// Records submissions and cancellations.
#[derive(Default)]
struct RecordingBackend {
    submitted: AtomicUsize,
    canceled: AtomicUsize,
    reject: bool,
    /// Submissions left to fail with a transient error.
    flaky: AtomicUsize,
}

#[async_trait]
impl ComputeBackend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    async fn submit(&self, _task: &Task) -> Result<()> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        if self
            .flaky
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Transient("scheduler busy".into()));
        }
        if self.reject {
            return Err(Error::Permanent("no such image".into()));
        }
        Ok(())
    }

    async fn cancel(&self, _id: &str) -> Result<()> {
        self.canceled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    db: Arc<dyn Database>,
    backend: Arc<RecordingBackend>,
    sink: Arc<ComputeSink>,
    service: TaskService,
}

fn harness(backend: RecordingBackend) -> Harness {
    harness_with(backend, |sink| sink)
}

fn harness_with(backend: RecordingBackend, f: impl FnOnce(ComputeSink) -> ComputeSink) -> Harness {
    let db: Arc<dyn Database> = Arc::new(EmbeddedDb::temporary().unwrap());
    let backend = Arc::new(backend);
    let events: Arc<dyn EventWriter> = Arc::new(db.clone());
    let sink = Arc::new(f(ComputeSink::new(backend.clone(), events)));
    let service = TaskService::new(db.clone(), Some(sink.clone()), service_info(&Config::default()));
    Harness {
        db,
        backend,
        sink,
        service,
    }
}

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

#[tokio::test]
async fn create_assigns_a_fresh_id() {
    let h = harness(RecordingBackend::default());
    let caller = Caller::anonymous();
    let mut task = hello_world();
    task.id = "chosen-by-client".into();
    task.state = State::Complete;

    let resp = h.service.create_task(task, &caller).await.unwrap();
    assert_ne!(resp.id, "chosen-by-client");
    let stored = h.service.get_task(&resp.id, View::Basic, &caller).await.unwrap();
    assert_eq!(stored.state, State::Queued);
    assert_eq!(stored.name, "hello");
}

#[tokio::test]
async fn invalid_task_is_rejected_before_storage() {
    let h = harness(RecordingBackend::default());
    let task = Task {
        executors: vec![],
        ..hello_world()
    };
    let err = h
        .service
        .create_task(task, &Caller::anonymous())
        .await
        .unwrap_err();
    match err {
        Error::Validation(msgs) => assert!(
            msgs.iter()
                .any(|m| m == "Task.Executors: at least one executor is required")
        ),
        other => panic!("expected validation error, got {other:?}"),
    }
    let listed = h
        .db
        .list_tasks(&ListTasksRequest::default())
        .await
        .unwrap();
    assert!(listed.tasks.is_empty());
}

#[tokio::test]
async fn cancel_queued_task() {
    let h = harness(RecordingBackend::default());
    let caller = Caller::anonymous();
    let id = h.service.create_task(hello_world(), &caller).await.unwrap().id;

    h.service.cancel_task(&id, &caller).await.unwrap();

    let task = h.service.get_task(&id, View::Full, &caller).await.unwrap();
    assert_eq!(task.state, State::Canceled);
    assert!(task.logs.iter().all(|l| l.logs.is_empty()));
    assert_eq!(h.backend.canceled.load(Ordering::SeqCst), 1);
    // Canceled tasks leave the queue.
    assert!(h.db.queue().unwrap().read_queue(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn cancel_on_finished_task_changes_nothing() {
    for terminal in [
        State::Complete,
        State::ExecutorError,
        State::SystemError,
        State::Canceled,
    ] {
        let h = harness(RecordingBackend::default());
        let caller = Caller::anonymous();
        let id = h.service.create_task(hello_world(), &caller).await.unwrap().id;
        h.db.write_event(&Event::state(&id, 0, terminal)).await.unwrap();
        let before = h.db.get_task(&id, View::Full).await.unwrap();

        h.service.cancel_task(&id, &caller).await.unwrap();

        let after = h.db.get_task(&id, View::Full).await.unwrap();
        assert_eq!(after, before, "{terminal}");
        assert_eq!(h.backend.canceled.load(Ordering::SeqCst), 0, "{terminal}");
    }
}

#[tokio::test]
async fn cancel_unknown_task_is_not_found() {
    let h = harness(RecordingBackend::default());
    let err = h
        .service
        .cancel_task("nope", &Caller::anonymous())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn users_only_see_their_own_tasks() {
    let h = harness(RecordingBackend::default());
    let alice = Caller::user("alice", false);
    let bob = Caller::user("bob", false);
    let admin = Caller::user("root", true);

    let id = h.service.create_task(hello_world(), &alice).await.unwrap().id;
    h.service.create_task(hello_world(), &bob).await.unwrap();

    assert!(h.service.get_task(&id, View::Minimal, &alice).await.is_ok());
    let err = h.service.get_task(&id, View::Minimal, &bob).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    let err = h.service.cancel_task(&id, &bob).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let mine = h
        .service
        .list_tasks(ListTasksRequest::default(), &alice)
        .await
        .unwrap();
    assert_eq!(mine.tasks.len(), 1);
    assert_eq!(mine.tasks[0].id, id);

    let all = h
        .service
        .list_tasks(ListTasksRequest::default(), &admin)
        .await
        .unwrap();
    assert_eq!(all.tasks.len(), 2);
    assert!(h.service.get_task(&id, View::Minimal, &admin).await.is_ok());
}

#[tokio::test]
async fn ingested_events_are_applied() {
    let h = harness(RecordingBackend::default());
    let caller = Caller::anonymous();
    let id = h.service.create_task(hello_world(), &caller).await.unwrap().id;

    h.service
        .write_event(&Event::state(&id, 0, State::Initializing), &caller)
        .await
        .unwrap();
    h.service
        .write_event(&Event::stdout(&id, 0, 0, "hi\n"), &caller)
        .await
        .unwrap();
    let task = h.service.get_task(&id, View::Full, &caller).await.unwrap();
    assert_eq!(task.state, State::Initializing);
    assert_eq!(task.logs[0].logs[0].stdout, "hi\n");

    let err = h
        .service
        .write_event(&Event::task_created(hello_world()), &caller)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn dispatcher_submits_queued_tasks_once() {
    let h = harness(RecordingBackend::default());
    let caller = Caller::anonymous();
    let a = h.service.create_task(hello_world(), &caller).await.unwrap().id;
    let b = h.service.create_task(hello_world(), &caller).await.unwrap().id;

    let dispatcher = Dispatcher::new(
        h.db.clone(),
        h.sink.clone(),
        std::time::Duration::from_millis(10),
        10,
    );
    assert_eq!(dispatcher.dispatch_once().await.unwrap(), 2);
    assert_eq!(dispatcher.dispatch_once().await.unwrap(), 0);
    assert_eq!(h.backend.submitted.load(Ordering::SeqCst), 2);

    for id in [a, b] {
        let task = h.db.get_task(&id, View::Minimal).await.unwrap();
        assert_eq!(task.state, State::Initializing);
    }
}

#[tokio::test]
async fn rejected_submission_fails_the_task() {
    let h = harness(RecordingBackend {
        reject: true,
        ..Default::default()
    });
    let id = h
        .service
        .create_task(hello_world(), &Caller::anonymous())
        .await
        .unwrap()
        .id;

    let dispatcher = Dispatcher::new(h.db.clone(), h.sink.clone(), std::time::Duration::from_secs(1), 10);
    assert_eq!(dispatcher.dispatch_once().await.unwrap(), 0);

    let task = h.db.get_task(&id, View::Full).await.unwrap();
    assert_eq!(task.state, State::SystemError);
    assert!(
        task.logs[0]
            .system_logs
            .iter()
            .any(|l| l.contains("error submitting task to recording"))
    );
    assert!(h.db.queue().unwrap().read_queue(10).await.unwrap().is_empty());
}

#[test]
fn service_info_advertises_tes() {
    let info = service_info(&Config::default());
    assert_eq!(info.service_type.artifact, "tes");
    assert_eq!(info.id, "org.ga4gh.tes.localhost");
    assert_eq!(info.storage, vec!["file", "http", "https"]);
}

fn submit_on_create(sink: ComputeSink) -> ComputeSink {
    sink.submit_on_create(true).with_retrier(
        Retrier::default()
            .max_tries(3)
            .initial_interval(Duration::from_millis(1)),
    )
}

#[tokio::test]
async fn submit_on_create_retries_transient_errors() {
    let h = harness_with(
        RecordingBackend {
            flaky: AtomicUsize::new(2),
            ..Default::default()
        },
        submit_on_create,
    );
    let caller = Caller::anonymous();
    let resp = h.service.create_task(hello_world(), &caller).await.unwrap();

    assert_eq!(h.backend.submitted.load(Ordering::SeqCst), 3);
    let task = h.db.get_task(&resp.id, View::Basic).await.unwrap();
    assert_eq!(task.state, State::Initializing);
}

#[tokio::test]
async fn submit_on_create_fails_task_after_last_try() {
    let h = harness_with(
        RecordingBackend {
            flaky: AtomicUsize::new(10),
            ..Default::default()
        },
        submit_on_create,
    );
    let caller = Caller::anonymous();
    let resp = h.service.create_task(hello_world(), &caller).await.unwrap();

    assert_eq!(h.backend.submitted.load(Ordering::SeqCst), 3);
    let task = h.db.get_task(&resp.id, View::Full).await.unwrap();
    assert_eq!(task.state, State::SystemError);
    let logs = &task.logs[0].system_logs;
    assert!(logs.iter().any(|l| l.contains("scheduler busy")), "{logs:?}");
}
