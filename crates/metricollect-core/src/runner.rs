//! The control loop.
//!
//! # Cycle
//!
//! ```text
//! start(): title ─► reap stale ─► PID file ─► TERM/INT ─► metric ids ─► initial pool
//!
//! every `frequency`:
//!   replace dead workers
//!   working set = queued ids ∪ in-flight ids
//!   sample ─► PerformanceMonitor ─► Hold | Shrink(1) | Grow{target}
//!   enqueue ids not in the working set
//!
//! between cycles: 1s ticks, stop observed within one tick
//! ```
//!
//! Reaching the iteration cap drains the queue (up to one more frequency)
//! before the pool is stopped; `stop()` and signals discard queued ids and
//! stop the pool at once. Each worker still finishes its current publish.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use signal_hook::SigId;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{debug, error, info, warn};

use crate::application::Application;
use crate::error::{ConfigError, Result};
use crate::performance::{PerformanceMonitor, ScalingDecision, drain_ratio, overload_ratio};
use crate::reaper::{
    DEFAULT_GRACE_PERIOD, DEFAULT_POLL_INTERVAL, PidFile, ReaperConfig, process_signature,
    reap_stale_instances, set_process_title,
};
use crate::registry::Registry;
use crate::work_queue::WorkQueue;
use crate::worker::{AfterForkHook, Worker};

/// Default cycle length.
pub const DEFAULT_FREQUENCY: Duration = Duration::from_secs(120);

const TICK: Duration = Duration::from_secs(1);

/// Hook run in the parent right before each worker is forked.
pub type BeforeForkHook = Arc<dyn Fn() + Send + Sync>;

/// Scheduling options for one runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    pub frequency: Duration,
    /// Role filter; empty matches every metric.
    pub roles: Vec<String>,
    pub initial_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Stop after this many cycles.
    pub iterations: Option<u64>,
    /// Reap stale instances before starting.
    pub reap_stale: bool,
    /// PID file used for single-instance discovery. Without one the
    /// process table is scanned.
    pub pid_file: Option<PathBuf>,
    pub reap_grace: Duration,
    pub reap_poll: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_FREQUENCY,
            roles: Vec::new(),
            initial_workers: 2,
            min_workers: 1,
            max_workers: 8,
            iterations: None,
            reap_stale: true,
            pid_file: None,
            reap_grace: DEFAULT_GRACE_PERIOD,
            reap_poll: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl RunnerOptions {
    /// `1 <= min <= initial <= max` and a non-zero frequency.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.frequency.is_zero() {
            return Err(ConfigError::ValidationError(
                "frequency must be greater than zero".to_string(),
            ));
        }
        if self.min_workers == 0 {
            return Err(ConfigError::ValidationError(
                "min_workers must be at least 1".to_string(),
            ));
        }
        if !(self.min_workers <= self.initial_workers && self.initial_workers <= self.max_workers)
        {
            return Err(ConfigError::ValidationError(format!(
                "worker counts must satisfy min <= initial <= max (got {} <= {} <= {})",
                self.min_workers, self.initial_workers, self.max_workers
            )));
        }
        if self.iterations == Some(0) {
            return Err(ConfigError::ValidationError(
                "iterations must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a finished run looked like.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub cycles: u64,
    pub peak_workers: usize,
    /// Pool size when the loop exited, before shutdown.
    pub final_workers: usize,
    /// Performance history at exit, oldest first.
    pub samples: Vec<f64>,
}

/// Cloneable control surface for a runner blocked in [`Runner::start`].
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
}

impl RunnerHandle {
    /// Ask the loop to stop; observed within one second.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Why the scheduling loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    IterationCap,
    Stopped,
}

/// Scheduling session for one application.
pub struct Runner {
    app: Arc<dyn Application>,
    options: RunnerOptions,
    queue: Arc<WorkQueue>,
    workers: Vec<Worker>,
    monitor: PerformanceMonitor,
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    before_fork: Option<BeforeForkHook>,
    after_fork: Option<AfterForkHook>,
    next_worker_id: usize,
    peak_workers: usize,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("app", &self.app.name())
            .field("options", &self.options)
            .field("workers", &self.workers.len())
            .field("queued", &self.queue.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Runner {
    /// Bind a runner to `app_name`. Unknown applications and invalid
    /// options fail here, before anything is forked.
    pub fn new(registry: &Registry, app_name: &str, options: RunnerOptions) -> Result<Self> {
        options.validate()?;
        let app = registry.resolve(app_name)?;
        Ok(Self::build(app, options))
    }

    pub fn for_application(app: Arc<dyn Application>, options: RunnerOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self::build(app, options))
    }

    fn build(app: Arc<dyn Application>, options: RunnerOptions) -> Self {
        Self {
            app,
            options,
            queue: Arc::new(WorkQueue::new()),
            workers: Vec::new(),
            monitor: PerformanceMonitor::new(),
            running: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            before_fork: None,
            after_fork: None,
            next_worker_id: 0,
            peak_workers: 0,
        }
    }

    #[must_use]
    pub fn with_before_fork(mut self, hook: BeforeForkHook) -> Self {
        self.before_fork = Some(hook);
        self
    }

    #[must_use]
    pub fn with_after_fork(mut self, hook: AfterForkHook) -> Self {
        self.after_fork = Some(hook);
        self
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            running: Arc::clone(&self.running),
            stop_requested: Arc::clone(&self.stop_requested),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Idempotent; the loop notices within one second.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Run until stopped or until the iteration cap is reached.
    ///
    /// Blocks the calling thread. Returns immediately if already running.
    /// The process title is set on the calling thread; workers forked from
    /// it inherit that name. Every session starts with an empty performance
    /// history.
    pub fn start(&mut self) -> Result<RunSummary> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(RunSummary::default());
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        let outcome = self.run_session();
        self.running.store(false, Ordering::SeqCst);
        outcome
    }

    fn run_session(&mut self) -> Result<RunSummary> {
        self.monitor = PerformanceMonitor::new();
        self.peak_workers = 0;

        let app_name = self.app.name().to_string();
        let signature = process_signature(&app_name);
        set_process_title(&signature);

        if self.options.reap_stale {
            let mut config = ReaperConfig::for_app(&app_name)
                .with_timing(self.options.reap_grace, self.options.reap_poll);
            config.pid_file.clone_from(&self.options.pid_file);
            let report = reap_stale_instances(&config);
            if report.discovered > 0 {
                info!(app = %app_name, ?report, "Reaped stale instances");
            }
        }

        let pid_file = self.options.pid_file.as_ref().map(PidFile::new);
        if let Some(pid_file) = &pid_file {
            if let Err(err) = pid_file.write_current() {
                warn!(app = %app_name, path = %pid_file.path().display(), error = %err, "Failed to write PID file");
            }
        }

        let signal_ids = self.install_signal_handlers();

        let ids = self.app.metric_ids(&self.options.roles);
        info!(
            app = %app_name,
            metrics = ids.len(),
            roles = ?self.options.roles,
            frequency_secs = self.options.frequency.as_secs_f64(),
            workers = self.options.initial_workers,
            "Runner starting"
        );

        let result = self.spawn_initial_pool().map(|()| self.schedule(&ids));

        let summary = match result {
            Ok((mut summary, exit)) => {
                summary.final_workers = self.workers.len();
                self.shutdown(exit);
                summary.samples = self.monitor.samples();
                summary.peak_workers = self.peak_workers;
                Ok(summary)
            }
            Err(err) => {
                error!(app = %app_name, error = %err, "Runner failed to start");
                self.shutdown(LoopExit::Stopped);
                Err(err)
            }
        };

        for id in signal_ids {
            signal_hook::low_level::unregister(id);
        }
        if let Some(pid_file) = &pid_file {
            if let Err(err) = pid_file.remove_if_owned() {
                warn!(app = %app_name, error = %err, "Failed to remove PID file");
            }
        }

        info!(app = %app_name, "Runner terminated");
        summary
    }

    fn install_signal_handlers(&self) -> Vec<SigId> {
        [SIGTERM, SIGINT]
            .into_iter()
            .filter_map(|signal| {
                signal_hook::flag::register(signal, Arc::clone(&self.stop_requested))
                    .map_err(|err| warn!(signal, error = %err, "Failed to install signal handler"))
                    .ok()
            })
            .collect()
    }

    fn should_run(&self) -> bool {
        !self.stop_requested.load(Ordering::SeqCst)
    }

    fn spawn_initial_pool(&mut self) -> Result<()> {
        for _ in 0..self.options.initial_workers {
            self.spawn_worker()?;
        }
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<()> {
        self.next_worker_id += 1;
        let name = format!("worker[{}]", self.next_worker_id);
        let mut worker = Worker::new(name, Arc::clone(&self.app), Arc::clone(&self.queue))
            .with_after_fork(self.after_fork.clone());

        if let Some(hook) = &self.before_fork {
            hook();
        }
        worker.start()?;
        self.workers.push(worker);
        self.peak_workers = self.peak_workers.max(self.workers.len());
        Ok(())
    }

    /// Ids queued or dispatched and not yet acknowledged.
    fn working_set(&self) -> HashSet<String> {
        collect_working_set(&self.queue, self.workers.iter().filter_map(Worker::in_flight))
    }

    fn pool_idle(&self) -> bool {
        self.queue.is_empty()
            && self
                .workers
                .iter()
                .all(|w| !w.is_running() || w.in_flight().is_none())
    }

    fn schedule(&mut self, ids: &[String]) -> (RunSummary, LoopExit) {
        let frequency = self.options.frequency;
        let mut summary = RunSummary::default();
        let mut next_run_at = Instant::now();
        let mut previous_start: Option<Instant> = None;
        let mut finished_at: Option<Instant> = None;

        while self.should_run() {
            let now = Instant::now();
            if now < next_run_at {
                if finished_at.is_none() && self.pool_idle() {
                    finished_at = Some(now);
                }
                std::thread::sleep(TICK.min(next_run_at - now));
                continue;
            }

            self.replace_dead_workers();

            let working_set = self.working_set();
            if let Some(previous) = previous_start {
                let sample = if working_set.is_empty() {
                    drain_ratio(finished_at.unwrap_or(now) - previous, frequency)
                } else {
                    overload_ratio(ids.len(), working_set.len())
                };
                let stored = self.monitor.record(sample);
                debug!(
                    app = %self.app.name(),
                    sample = stored,
                    average = ?self.monitor.average(),
                    pending = working_set.len(),
                    pool_size = self.workers.len(),
                    "Cycle sample"
                );
            }

            self.adjust_worker_count();

            let mut enqueued = 0usize;
            for id in ids {
                if !working_set.contains(id) {
                    self.queue.push(id.as_str());
                    enqueued += 1;
                }
            }
            debug!(app = %self.app.name(), enqueued, skipped = working_set.len(), "Cycle enqueued");

            previous_start = Some(now);
            next_run_at += frequency;
            finished_at = None;
            summary.cycles += 1;

            if self
                .options
                .iterations
                .is_some_and(|cap| summary.cycles >= cap)
            {
                info!(app = %self.app.name(), cycles = summary.cycles, "Iteration cap reached");
                return (summary, LoopExit::IterationCap);
            }
        }

        info!(app = %self.app.name(), cycles = summary.cycles, "Stop requested");
        (summary, LoopExit::Stopped)
    }

    /// Drop workers whose child died and start replacements.
    fn replace_dead_workers(&mut self) {
        let before = self.workers.len();
        let (alive, dead): (Vec<Worker>, Vec<Worker>) =
            std::mem::take(&mut self.workers).into_iter().partition(Worker::is_running);
        self.workers = alive;

        for mut worker in dead {
            warn!(app = %self.app.name(), worker = %worker.name(), "Replacing dead worker");
            if let Err(err) = worker.stop() {
                error!(worker = %worker.name(), error = %err, "Failed to reap dead worker");
            }
        }

        while self.workers.len() < before {
            if let Err(err) = self.spawn_worker() {
                error!(app = %self.app.name(), error = %err, "Failed to replace worker");
                break;
            }
        }
    }

    fn adjust_worker_count(&mut self) {
        let current = self.workers.len();
        match self
            .monitor
            .decide(current, self.options.min_workers, self.options.max_workers)
        {
            ScalingDecision::Hold => {}
            ScalingDecision::Shrink => {
                if let Some(mut worker) = self.workers.pop() {
                    info!(
                        app = %self.app.name(),
                        worker = %worker.name(),
                        average = ?self.monitor.average(),
                        pool_size = current - 1,
                        "Shrinking pool"
                    );
                    if let Err(err) = worker.stop() {
                        error!(worker = %worker.name(), error = %err, "Failed to stop worker");
                    }
                }
            }
            ScalingDecision::Grow { target } => {
                info!(
                    app = %self.app.name(),
                    average = ?self.monitor.average(),
                    last = ?self.monitor.last(),
                    from = current,
                    to = target,
                    "Growing pool"
                );
                while self.workers.len() < target {
                    if let Err(err) = self.spawn_worker() {
                        error!(app = %self.app.name(), error = %err, "Failed to grow pool");
                        break;
                    }
                }
            }
        }
    }

    /// Wait in one-second ticks, up to one frequency, for the pool to go idle.
    fn drain(&self) {
        let deadline = Instant::now() + self.options.frequency;
        while self.should_run() {
            if self.pool_idle() {
                debug!(app = %self.app.name(), "Queue drained");
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    app = %self.app.name(),
                    queued = self.queue.len(),
                    "Drain timed out"
                );
                return;
            }
            std::thread::sleep(TICK.min(deadline - now));
        }
    }

    fn shutdown(&mut self, exit: LoopExit) {
        if exit == LoopExit::IterationCap {
            self.drain();
        }
        let dropped = self.queue.clear();
        if dropped > 0 {
            info!(app = %self.app.name(), dropped, "Discarded queued metrics");
        }

        for worker in &self.workers {
            worker.request_stop();
        }
        for mut worker in self.workers.drain(..) {
            if let Err(err) = worker.stop() {
                error!(worker = %worker.name(), error = %err, "Failed to stop worker");
            }
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown(LoopExit::Stopped);
        }
    }
}

/// Queue snapshot first, then in-flight ids. A worker records an id as in
/// flight before it leaves the queue, so reading in this order never misses
/// one.
fn collect_working_set(
    queue: &WorkQueue,
    in_flight: impl IntoIterator<Item = String>,
) -> HashSet<String> {
    let mut set: HashSet<String> = queue.snapshot().into_iter().collect();
    set.extend(in_flight);
    set
}

/// Convenience for callers holding only a name and a registry.
pub fn run(registry: &Registry, app_name: &str, options: RunnerOptions) -> Result<RunSummary> {
    let mut runner = Runner::new(registry, app_name, options)?;
    runner.start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::MetricApplication;
    use crate::error::Error;

    fn options() -> RunnerOptions {
        RunnerOptions {
            frequency: Duration::from_secs(5),
            iterations: Some(1),
            reap_stale: false,
            ..RunnerOptions::default()
        }
    }

    #[test]
    fn default_options_are_valid() {
        let defaults = RunnerOptions::default();
        assert_eq!(defaults.frequency, Duration::from_secs(120));
        defaults.validate().unwrap();
    }

    #[test]
    fn zero_frequency_rejected() {
        let opts = RunnerOptions {
            frequency: Duration::ZERO,
            ..options()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn worker_bounds_must_be_ordered() {
        let cases = [(0, 1, 2), (2, 1, 3), (1, 4, 3), (3, 3, 2)];
        for (min, initial, max) in cases {
            let opts = RunnerOptions {
                min_workers: min,
                initial_workers: initial,
                max_workers: max,
                ..options()
            };
            assert!(opts.validate().is_err(), "{min} {initial} {max} accepted");
        }
        let ok = RunnerOptions {
            min_workers: 2,
            initial_workers: 2,
            max_workers: 2,
            ..options()
        };
        ok.validate().unwrap();
    }

    #[test]
    fn zero_iterations_rejected() {
        let opts = RunnerOptions {
            iterations: Some(0),
            ..options()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn unknown_application_fails_before_fork() {
        let registry = Registry::new();
        let err = Runner::new(&registry, "missing", options()).unwrap_err();
        assert!(matches!(err, Error::UnknownApplication(_)));
    }

    #[test]
    fn invalid_options_fail_before_resolve() {
        let mut registry = Registry::new();
        registry.register(Arc::new(MetricApplication::new("web")));
        let bad = RunnerOptions {
            max_workers: 0,
            ..options()
        };
        assert!(matches!(
            Runner::new(&registry, "web", bad),
            Err(Error::Config(ConfigError::ValidationError(_)))
        ));
    }

    #[test]
    fn handle_reflects_stop_requests() {
        let runner =
            Runner::for_application(Arc::new(MetricApplication::new("web")), options()).unwrap();
        let handle = runner.handle();
        assert!(!handle.is_running());
        handle.stop();
        handle.stop();
        assert!(!runner.should_run());
        assert_eq!(runner.worker_count(), 0);
    }

    #[test]
    fn working_set_unions_queued_and_in_flight_ids() {
        let queue = WorkQueue::new();
        queue.push("A/queued");
        queue.push("A/both");

        let set = collect_working_set(&queue, ["A/dispatched".to_string(), "A/both".to_string()]);
        let mut ids: Vec<&str> = set.iter().map(String::as_str).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["A/both", "A/dispatched", "A/queued"]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn working_set_of_idle_pool_is_empty() {
        assert!(collect_working_set(&WorkQueue::new(), std::iter::empty()).is_empty());
    }

    #[test]
    fn run_summary_serializes() {
        let summary = RunSummary {
            cycles: 3,
            peak_workers: 2,
            final_workers: 2,
            samples: vec![0.1, 0.2],
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["cycles"], 3);
        assert_eq!(json["samples"][1], 0.2);
    }
}
