//! metricollect-core: Core library for metricollect
//!
//! A self-supervising pool of forked worker processes that re-evaluates a
//! set of named metrics on a fixed cadence and pushes them through
//! pluggable publishers.
//!
//! # Architecture
//!
//! ```text
//! Config → Registry → Application (metric ids, publish)
//!                          ↓
//!   Runner ── WorkQueue ── Worker dispatch threads ══ framed pipes ══ forked children
//!     │                                                                   ↓
//!     └── PerformanceMonitor (grow / shrink)                    Application::publish
//! ```
//!
//! # Modules
//!
//! - `runner`: control loop, pool scaling, shutdown
//! - `worker`: one forked process plus its dispatch thread
//! - `framing`: length-prefixed messages over OS pipes
//! - `work_queue`: shared FIFO of metric ids
//! - `performance`: rolling drain-ratio history and scaling decisions
//! - `reaper`: stale-instance discovery and termination, PID files
//! - `metric`, `publisher`, `application`, `registry`: collaborators the
//!   runner schedules
//! - `config`: TOML configuration
//! - `logging`: tracing subscriber setup
//! - `error`: error types with remediation hints
//!
//! # Safety
//!
//! `fork(2)` in `worker` is the only unsafe call.

#![deny(unsafe_code)]

pub mod application;
pub mod config;
pub mod error;
pub mod framing;
pub mod logging;
pub mod metric;
pub mod performance;
pub mod publisher;
pub mod reaper;
pub mod registry;
pub mod runner;
pub mod work_queue;
pub mod worker;

pub use application::{Application, MetricApplication};
pub use config::Config;
pub use error::{Error, Result};
pub use metric::{Metric, MetricDefinition, Unit};
pub use publisher::{Publisher, PublisherRegistry};
pub use registry::Registry;
pub use runner::{RunSummary, Runner, RunnerHandle, RunnerOptions};
pub use worker::Worker;

/// Version of the metricollect-core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
