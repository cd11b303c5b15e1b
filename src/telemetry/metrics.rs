//! Metric instrument factories for tes-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"tes-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for tes-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("tes-rs")
}

/// Counter: tasks accepted by the database.
pub fn tasks_created() -> Counter<u64> {
    meter()
        .u64_counter("tes.tasks.created")
        .with_description("Number of tasks created")
        .build()
}

/// Counter: task state transitions.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("tes.tasks.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: events applied to a database.
/// Labels: `type`.
pub fn events_written() -> Counter<u64> {
    meter()
        .u64_counter("tes.events.written")
        .with_description("Number of task events written")
        .build()
}

/// Counter: dispatcher submissions to the compute backend.
/// Labels: `backend`, `result` ("ok" | "retry" | "error").
pub fn dispatch_submissions() -> Counter<u64> {
    meter()
        .u64_counter("tes.dispatch.submissions")
        .with_description("Number of task submissions to a compute backend")
        .build()
}

/// Counter: corrective events emitted by reconcilers.
/// Labels: `backend`, `action` ("system_error" | "complete" | "cleanup").
pub fn reconcile_corrections() -> Counter<u64> {
    meter()
        .u64_counter("tes.reconcile.corrections")
        .with_description("Number of reconciler corrections")
        .build()
}

/// Histogram: executor run time in milliseconds.
/// Labels: `exit` ("ok" | "error").
pub fn executor_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("tes.executor.duration_ms")
        .with_description("Executor run time in milliseconds")
        .with_unit("ms")
        .build()
}
