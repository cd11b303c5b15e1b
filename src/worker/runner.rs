//! Runs one task attempt from start to a terminal state.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use opentelemetry::KeyValue;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::driver::{ContainerIo, ContainerSpec, ExecutorDriver};
use super::file_mapper::FileMapper;
use super::reader::TaskReader;
use super::storage::{self, Mux, Op, Storage};
use super::{RunnerConfig, driver_from_config};
use crate::error::{Error, Result};
use crate::events::tailer::{LogTailer, Tee};
use crate::events::{Event, EventWriter, TaskWriter, fields};
use crate::model::{FileType, OutputFileLog, State, Task};
use crate::retry::Retrier;
use crate::telemetry::{metrics, task as task_telemetry};

/// How an attempt ended, before it is reported.
enum Outcome {
    Complete,
    ExecutorError(String),
    SystemError(String),
    Canceled,
}

impl Outcome {
    fn state(&self) -> State {
        match self {
            Outcome::Complete => State::Complete,
            Outcome::ExecutorError(_) => State::ExecutorError,
            Outcome::SystemError(_) => State::SystemError,
            Outcome::Canceled => State::Canceled,
        }
    }
}

/// Executes tasks on this host.
pub struct Runner {
    conf: RunnerConfig,
    reader: Arc<dyn TaskReader>,
    events: Arc<dyn EventWriter>,
    driver: Arc<dyn ExecutorDriver>,
    /// Replaces the configured storage backends when set.
    storage: Option<Vec<Arc<dyn Storage>>>,
}

impl Runner {
    pub fn new(
        conf: RunnerConfig,
        reader: Arc<dyn TaskReader>,
        events: Arc<dyn EventWriter>,
    ) -> Self {
        let driver = driver_from_config(&conf.worker.container);
        Self {
            conf,
            reader,
            events,
            driver,
            storage: None,
        }
    }

    pub fn with_driver(mut self, driver: Arc<dyn ExecutorDriver>) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_storage(mut self, backends: Vec<Arc<dyn Storage>>) -> Self {
        self.storage = Some(backends);
        self
    }

    /// Run `task_id` and return the state it finished in.
    ///
    /// Failures during the run are reported as events and end in
    /// `SYSTEM_ERROR`; an error is returned only when the task itself
    /// cannot be read. Cancelling `cancel` stops the run.
    pub async fn run(&self, task_id: &str, cancel: CancellationToken) -> Result<State> {
        let task = match self.reader.task(task_id).await {
            Ok(task) => task,
            Err(e) => {
                let ev = Event::system_log(
                    task_id,
                    0,
                    0,
                    "error",
                    "failed to get task",
                    fields([("error", e.to_string())]),
                );
                emit(self.events.write_event(&ev)).await;
                return Err(e);
            }
        };

        let attempt = task.current_attempt();
        let tw = TaskWriter::new(&task.id, attempt, self.events.clone());
        let span = task_telemetry::start_task_span(&task.id, "worker");
        let work_dir = std::path::absolute(self.conf.worker.work_dir.join(&task.id))?;

        emit(tw.state(State::Initializing)).await;
        emit(tw.start_time(Utc::now())).await;
        emit(tw.metadata(host_metadata().await)).await;

        let run_cancel = cancel.child_token();
        let watcher = self.watch_for_cancel(task.id.clone(), run_cancel.clone());

        let result = std::panic::AssertUnwindSafe(self.execute(&task, &tw, &work_dir, &run_cancel))
            .catch_unwind()
            .instrument(span.clone())
            .await;
        watcher.abort();

        let outcome = match result {
            _ if run_cancel.is_cancelled() => self.cancel_outcome(&task.id, Error::Canceled).await,
            Ok(Ok(outcome)) => outcome,
            // A write rejected mid-run usually means the task was canceled.
            Ok(Err(e)) => self.cancel_outcome(&task.id, e).await,
            Err(_) => {
                error!(task_id = %task.id, "task runner panicked");
                Outcome::SystemError("worker panicked".to_string())
            }
        };

        emit(tw.end_time(Utc::now())).await;
        match &outcome {
            Outcome::Complete => {}
            Outcome::ExecutorError(msg) => {
                emit(tw.error("exec error", fields([("error", msg)]))).await
            }
            Outcome::SystemError(msg) => {
                emit(tw.error("system error", fields([("error", msg)]))).await
            }
            Outcome::Canceled => emit(tw.info("canceled", BTreeMap::new())).await,
        }
        let state = outcome.state();
        emit(tw.state(state)).await;
        task_telemetry::record_state_transition(&span, task.state.as_str(), state.as_str());

        if !self.conf.worker.leave_work_dir {
            if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(task_id = %task.id, "removing work dir: {e}");
                }
            }
        }
        Ok(state)
    }

    /// An interrupted run is `CANCELED` only if the task was; otherwise
    /// the worker itself was stopped and the attempt is a system error.
    async fn cancel_outcome(&self, id: &str, cause: Error) -> Outcome {
        match self.reader.state(id).await {
            Ok(State::Canceled) => Outcome::Canceled,
            _ => Outcome::SystemError(cause.to_string()),
        }
    }

    fn watch_for_cancel(&self, id: String, run_cancel: CancellationToken) -> JoinHandle<()> {
        let reader = self.reader.clone();
        let rate = self.conf.worker.poll_rate;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(rate);
            loop {
                tokio::select! {
                    _ = run_cancel.cancelled() => return,
                    _ = ticker.tick() => match reader.state(&id).await {
                        Ok(State::Canceled) => {
                            info!(task_id = %id, "task canceled, stopping");
                            run_cancel.cancel();
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => debug!(task_id = %id, "polling task state: {e}"),
                    }
                }
            }
        })
    }

    async fn execute(
        &self,
        task: &Task,
        tw: &TaskWriter,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        prepare_dir(work_dir).await?;

        let mut mapper = FileMapper::new(work_dir);
        mapper.map_task(task)?;
        let input_paths: Vec<_> = mapper.inputs.iter().map(|i| i.host_path.clone()).collect();
        for vol in &mapper.volumes {
            // Input volumes are bind-mounted files or directories created
            // by the download itself.
            if input_paths.contains(&vol.host_path) {
                continue;
            }
            if mapper.file_mounts.contains(&vol.host_path) {
                prepare_file(&vol.host_path).await?;
            } else {
                prepare_dir(&vol.host_path).await?;
            }
        }

        let backends = match &self.storage {
            Some(backends) => backends.clone(),
            None => storage::enabled_backends(&self.conf.local_storage, &self.conf.http_storage)?,
        };
        let store = Mux::new(backends, Retrier::from(&self.conf.retry), cancel.clone());
        let uid = worker_uid(work_dir).await;

        for input in &mapper.inputs {
            if input.input.content.is_empty() {
                store.check(&input.input.url, Op::Get)?;
            }
        }
        for output in &mapper.outputs {
            store.check(&output.output.url, Op::Put)?;
        }

        for input in &mapper.inputs {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            if !input.input.content.is_empty() {
                if let Some(parent) = input.host_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&input.host_path, input.input.content.as_bytes()).await?;
                continue;
            }
            debug!(task_id = %task.id, url = %input.input.url, "downloading input");
            store
                .get(&input.input.url, &input.host_path, input.input.file_type)
                .await?;
        }

        tw.state(State::Running).await?;

        for (i, exec) in task.executors.iter().enumerate() {
            let index = i as u32;
            let spec = ContainerSpec {
                name: format!("{}-{}", task.id, i),
                image: exec.image.clone(),
                command: exec.command.clone(),
                workdir: exec.workdir.clone(),
                env: exec.env.clone(),
                volumes: mapper.volumes.clone(),
                user: uid,
            };
            let span = task_telemetry::start_executor_span(&task.id, tw.attempt(), index, &exec.image);
            let code = self
                .run_executor(tw, index, &spec, &mapper, exec, cancel)
                .instrument(span)
                .await?;
            if code != 0 && !exec.ignore_error {
                return Ok(Outcome::ExecutorError(format!(
                    "executor {i} exited with code {code}"
                )));
            }
        }

        let mut logs = Vec::new();
        for output in &mapper.outputs {
            let out = &output.output;
            if tokio::fs::metadata(&output.host_path).await.is_err() {
                return Err(Error::Permanent(format!("output path does not exist: {}", out.path)));
            }
            match out.file_type {
                FileType::File => {
                    let size = store.put(&out.url, &output.host_path).await?;
                    logs.push(OutputFileLog {
                        url: out.url.clone(),
                        path: out.path.clone(),
                        size_bytes: size.to_string(),
                    });
                }
                FileType::Directory => {
                    for rel in storage::walk_files(&output.host_path).await? {
                        let rel_str = rel.to_string_lossy();
                        let url = format!("{}/{rel_str}", out.url.trim_end_matches('/'));
                        let size = store.put(&url, &output.host_path.join(&rel)).await?;
                        logs.push(OutputFileLog {
                            url,
                            path: format!("{}/{rel_str}", out.path.trim_end_matches('/')),
                            size_bytes: size.to_string(),
                        });
                    }
                }
            }
        }
        if !logs.is_empty() {
            tw.outputs(logs).await?;
        }
        Ok(Outcome::Complete)
    }

    /// Run one executor and return its exit code.
    async fn run_executor(
        &self,
        tw: &TaskWriter,
        index: u32,
        spec: &ContainerSpec,
        mapper: &FileMapper,
        exec: &crate::model::Executor,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        let ew = tw.executor(index);
        emit(ew.start_time(Utc::now())).await;

        let stdin: Option<Box<dyn tokio::io::AsyncRead + Send + Unpin>> = if exec.stdin.is_empty() {
            None
        } else {
            let file = tokio::fs::File::open(mapper.host_path(&exec.stdin)?).await?;
            Some(Box::new(file))
        };

        let tailer = LogTailer::start(
            ew.clone(),
            self.conf.worker.max_log_size,
            self.conf.worker.log_update_rate,
        );
        let stdout = tee_to_file(mapper, &exec.stdout, tailer.stdout()).await?;
        let stderr = tee_to_file(mapper, &exec.stderr, tailer.stderr()).await?;
        let io = ContainerIo {
            stdin,
            stdout,
            stderr,
        };

        let inspector = {
            let driver = self.driver.clone();
            let name = spec.name.clone();
            let tw = tw.clone();
            tokio::spawn(async move {
                match driver.inspect(&name).await {
                    Ok(info) if !info.ip.is_empty() || !info.ports.is_empty() => {
                        let ports = serde_json::to_string(&info.ports).unwrap_or_default();
                        emit(tw.metadata(fields([("ip", info.ip), ("ports", ports)]))).await;
                    }
                    Ok(_) => {}
                    Err(e) => debug!(container = %name, "inspect: {e}"),
                }
            })
        };

        let started = Instant::now();
        let result = tokio::select! {
            res = self.driver.run(spec, io) => res,
            _ = cancel.cancelled() => {
                if let Err(e) = self.driver.stop(&spec.name).await {
                    warn!(container = %spec.name, "stopping container: {e}");
                }
                Err(Error::Canceled)
            }
        };
        inspector.abort();

        let flushed = tailer.close().await;
        let exit = match &result {
            Ok(0) => "ok",
            _ => "error",
        };
        metrics::executor_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("exit", exit)],
        );

        if let Ok(code) = &result {
            emit(ew.exit_code(*code)).await;
        }
        emit(ew.end_time(Utc::now())).await;
        if let Err(e) = flushed {
            warn!(task_id = %ew.id(), index, "flushing executor logs: {e}");
        }
        result
    }
}

/// Log instead of failing: event delivery problems must not abort a run.
async fn emit(fut: impl std::future::Future<Output = Result<()>>) {
    if let Err(e) = fut.await {
        warn!("writing task event: {e}");
    }
}

/// `dir` with permissions open enough for any container user.
async fn prepare_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777)).await?;
    }
    Ok(())
}

/// An empty `file` the container can write through a file bind mount.
async fn prepare_file(file: &Path) -> Result<()> {
    if let Some(parent) = file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::File::create(file).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(file, std::fs::Permissions::from_mode(0o666)).await?;
    }
    Ok(())
}

async fn tee_to_file<W>(
    mapper: &FileMapper,
    container_path: &str,
    tail: W,
) -> Result<Box<dyn AsyncWrite + Send + Unpin>>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    if container_path.is_empty() {
        return Ok(Box::new(tail));
    }
    let host = mapper.host_path(container_path)?;
    if let Some(parent) = host.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::File::create(host).await?;
    Ok(Box::new(Tee::new(file, tail)))
}

#[cfg(unix)]
async fn worker_uid(work_dir: &Path) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    tokio::fs::metadata(work_dir).await.ok().map(|m| m.uid())
}

#[cfg(not(unix))]
async fn worker_uid(_work_dir: &Path) -> Option<u32> {
    None
}

/// `hostname` and, when a route exists, the outbound IP address.
async fn host_metadata() -> BTreeMap<String, String> {
    let mut meta = BTreeMap::new();
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()));
    if let Some(host) = host {
        meta.insert(crate::db::embedded::HOSTNAME_KEY.to_string(), host);
    }
    if let Some(ip) = external_ip().await {
        meta.insert("ip".to_string(), ip);
    }
    meta
}

/// No packet is sent: connecting a UDP socket only selects a route.
async fn external_ip() -> Option<String> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:80").await.ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}
