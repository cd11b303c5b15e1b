//! Task execution span helpers.
//!
//! Provides span creation and state-transition recording for tasks
//! flowing through the dispatcher and worker.

use tracing::Span;

/// Start a span covering one task's run on a backend.
///
/// The `task.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_task_span(task_id: &str, backend: &str) -> Span {
    tracing::info_span!(
        "task.run",
        "task.id" = task_id,
        "task.backend" = backend,
        "task.state" = tracing::field::Empty,
    )
}

/// Start a span for one executor invocation.
pub fn start_executor_span(task_id: &str, attempt: u32, index: u32, image: &str) -> Span {
    tracing::info_span!(
        "task.executor",
        "task.id" = task_id,
        "task.attempt" = attempt,
        "executor.index" = index,
        "executor.image" = image,
    )
}

/// Record a state transition on the span.
///
/// Emits a tracing `info` event scoped to the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
