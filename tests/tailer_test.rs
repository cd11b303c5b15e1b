//! Executor log tailing into events.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tes_rs::error::Result;
use tes_rs::events::tailer::{LogTailer, Tee};
use tes_rs::events::{Event, EventKind, EventWriter, TaskWriter};
use tokio::io::AsyncWriteExt;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn stdout(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::ExecutorStdout(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    fn stderr(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::ExecutorStderr(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventWriter for Recorder {
    async fn write_event(&self, event: &Event) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[tokio::test]
async fn close_flushes_only_the_tail() {
    let rec = Arc::new(Recorder::default());
    let tw = TaskWriter::new("t1", 0, rec.clone());
    let tailer = LogTailer::start(tw.executor(2), 5, Duration::from_secs(60));

    let mut out = tailer.stdout();
    out.write_all(b"hello world").await.unwrap();
    let mut err = tailer.stderr();
    err.write_all(b"oops").await.unwrap();
    tailer.close().await.unwrap();

    assert_eq!(rec.stdout(), vec!["world"]);
    assert_eq!(rec.stderr(), vec!["oops"]);
    let events = rec.events.lock().unwrap();
    assert!(events.iter().all(|e| e.id == "t1" && e.index == 2));
}

#[tokio::test]
async fn periodic_flush_sends_only_new_bytes() {
    let rec = Arc::new(Recorder::default());
    let tw = TaskWriter::new("t1", 0, rec.clone());
    let tailer = LogTailer::start(tw.executor(0), 1024, Duration::from_millis(10));

    let mut out = tailer.stdout();
    out.write_all(b"first\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    out.write_all(b"second\n").await.unwrap();
    tailer.close().await.unwrap();

    assert_eq!(rec.stdout().concat(), "first\nsecond\n");
    assert!(rec.stdout().len() >= 2);
    assert!(rec.stderr().is_empty());
}

#[tokio::test]
async fn tee_writes_to_both_sides() {
    let rec = Arc::new(Recorder::default());
    let tw = TaskWriter::new("t1", 0, rec.clone());
    let tailer = LogTailer::start(tw.executor(0), 1024, Duration::from_secs(60));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stdout.txt");

    let file = tokio::fs::File::create(&path).await.unwrap();
    let mut tee = Tee::new(file, tailer.stdout());
    tee.write_all(b"to disk and tail\n").await.unwrap();
    tee.flush().await.unwrap();
    drop(tee);
    tailer.flush().await.unwrap();

    assert_eq!(
        tokio::fs::read_to_string(&path).await.unwrap(),
        "to disk and tail\n"
    );
    assert_eq!(rec.stdout(), vec!["to disk and tail\n"]);
}

#[tokio::test]
async fn characters_split_across_flushes_stay_whole() {
    let rec = Arc::new(Recorder::default());
    let tw = TaskWriter::new("t1", 0, rec.clone());
    let tailer = LogTailer::start(tw.executor(0), 1024, Duration::from_secs(60));
    let mut out = tailer.stdout();

    let bytes = "né".as_bytes();
    out.write_all(&bytes[..2]).await.unwrap();
    tailer.flush().await.unwrap();
    out.write_all(&bytes[2..]).await.unwrap();
    tailer.flush().await.unwrap();
    tailer.close().await.unwrap();

    assert_eq!(rec.stdout(), vec!["n".to_string(), "é".to_string()]);
}

#[tokio::test]
async fn truncated_head_drops_partial_character() {
    let rec = Arc::new(Recorder::default());
    let tw = TaskWriter::new("t1", 0, rec.clone());
    let tailer = LogTailer::start(tw.executor(0), 3, Duration::from_secs(60));
    let mut out = tailer.stdout();

    // The last three bytes start inside "é".
    out.write_all("éab".as_bytes()).await.unwrap();
    tailer.close().await.unwrap();

    assert_eq!(rec.stdout(), vec!["ab".to_string()]);
}

#[tokio::test]
async fn close_sends_a_dangling_partial_character() {
    let rec = Arc::new(Recorder::default());
    let tw = TaskWriter::new("t1", 0, rec.clone());
    let tailer = LogTailer::start(tw.executor(0), 1024, Duration::from_secs(60));
    let mut out = tailer.stdout();

    out.write_all(&[b'x', 0xC3]).await.unwrap();
    tailer.flush().await.unwrap();
    tailer.close().await.unwrap();

    assert_eq!(rec.stdout(), vec!["x".to_string(), "\u{FFFD}".to_string()]);
}
