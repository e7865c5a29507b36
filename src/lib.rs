//! # Resumable Sampler
//!
//! Pause, snapshot, and resume for long-running iterative solvers. A run can
//! be held at any step boundary, checkpointed on a cadence or on demand, and
//! continued later from disk with the same RNG stream and solver momentum it
//! would have had without the interruption.
//!
//! ## Modules
//!
//! - [`control`] — Per-run command channels, the run registry, and the steer request handler
//! - [`checkpoint`] — State codec, size-bounded snapshot store, history reconstruction
//! - [`sampler`] — Step loop, reference solvers, sigma schedule, resume planning
//! - [`session`] — Run identifiers
//! - [`config`] — TOML configuration loading and validation
//! - [`logging`] — Tracing subscriber setup
//! - [`error`] — Structured error types

pub mod checkpoint;
pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod sampler;
pub mod session;
