//! # tes-rs
//!
//! A GA4GH Task Execution Service.
//!
//! Tasks are stored as event-sourced documents (embedded `sled` or
//! Postgres), dispatched to a compute backend (in-process, HPC schedulers
//! or Kubernetes), and executed by a container worker that reports its
//! progress as events.

pub mod client;
pub mod compute;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod model;
pub mod reducer;
pub mod retry;
pub mod server;
pub mod shutdown;
pub mod telemetry;
pub mod worker;
