//! revenant: scan orchestration for secrets hidden in force-pushed
//! (dangling) GitHub commits.
//!
//! The library wires five pieces together: target enumeration
//! ([`source`]), the durable progress store ([`progress`]), the worker pool
//! ([`pool`]), the per-target scan task ([`scan`]), and best-effort
//! notification dispatch ([`notify`]). The binary in `main.rs` is a thin
//! CLI shell over [`pool::run`].

pub mod cli;
pub mod config;
pub mod exec;
pub mod git;
pub mod notify;
pub mod pool;
pub mod progress;
pub mod scan;
pub mod source;
pub mod styling;
pub mod target;
