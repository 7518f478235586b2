//! Pooled worker: one forked process plus a framed pipe pair.
//!
//! # Protocol
//!
//! ```text
//!  parent (dispatch thread)                      child process
//!  ────────────────────────                      ─────────────
//!  recv ping (≤1s) ──► ready = true
//!  ready && queue.try_pop() ── "System/Load" ──► recv (≤1s)
//!  ready = false                                 app.publish("System/Load")
//!                                                recv (≤1s) times out
//!  recv ping ◄─────────────── "<child pid>" ──── ping once per dispatched item
//!  ...
//!  stop(): ─────────────────────── "EXIT" ─────► loop ends, _exit(0)
//!  waitpid(child)
//! ```
//!
//! Shutdown is in-band so a publish in progress finishes first. SIGTERM to
//! the child is the immediate-exit path.
//!
//! The dispatch thread treats a closed readiness pipe as child death: it
//! reaps the child and marks the worker not running so the runner can
//! replace it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, fork, getpid, getppid};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::application::Application;
use crate::error::{FrameError, Result, WorkerError};
use crate::framing::{self, DEFAULT_TIMEOUT, FrameReceiver, FrameSender};
use crate::work_queue::WorkQueue;

/// In-band shutdown sentinel.
pub const EXIT: &str = "EXIT";

/// Hook run in a freshly forked child before it starts serving items.
pub type AfterForkHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    NotStarted,
    Parent,
    Child,
}

/// State shared between the owning [`Worker`] and its dispatch thread.
#[derive(Debug)]
struct WorkerShared {
    name: String,
    running: AtomicBool,
    ready: AtomicBool,
    in_flight: Mutex<Option<String>>,
    dispatch: Mutex<Option<FrameSender>>,
    child: Mutex<Option<Pid>>,
}

impl WorkerShared {
    fn new(name: String) -> Self {
        Self {
            name,
            running: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            in_flight: Mutex::new(None),
            dispatch: Mutex::new(None),
            child: Mutex::new(None),
        }
    }

    fn mark_ready(&self) {
        *self.in_flight.lock() = None;
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Pop the next id and record it as in flight under one lock, so the id
    /// is always visible in either the queue or `in_flight`.
    fn claim_next(&self, queue: &WorkQueue) -> Option<String> {
        let mut in_flight = self.in_flight.lock();
        let item = queue.try_pop()?;
        if item != EXIT {
            *in_flight = Some(item.clone());
        }
        Some(item)
    }

    /// Hand an undelivered id back to the queue. It is queued again before
    /// it stops being in flight.
    fn release(&self, queue: &WorkQueue, item: String) {
        queue.push(item);
        *self.in_flight.lock() = None;
    }

    /// Send EXIT and wait for the child. Only the first caller does anything.
    fn reap_child(&self) -> std::result::Result<(), WorkerError> {
        let Some(pid) = self.child.lock().take() else {
            return Ok(());
        };

        if let Some(mut sender) = self.dispatch.lock().take() {
            match sender.send(EXIT, DEFAULT_TIMEOUT) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(worker = %self.name, child_pid = pid.as_raw(), "EXIT not accepted within timeout; closing pipe");
                }
                Err(err) => {
                    debug!(worker = %self.name, child_pid = pid.as_raw(), error = %err, "EXIT not delivered");
                }
            }
        }

        wait_for_exit(pid)?;
        self.running.store(false, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        *self.in_flight.lock() = None;
        info!(worker = %self.name, child_pid = pid.as_raw(), "Worker stopped");
        Ok(())
    }
}

/// Block until `pid` has exited. A child that is already gone counts as
/// exited.
fn wait_for_exit(pid: Pid) -> std::result::Result<(), WorkerError> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                debug!(child_pid = pid.as_raw(), ?status, "Child reaped");
                return Ok(());
            }
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => return Ok(()),
            Err(source) => {
                return Err(WorkerError::Wait {
                    pid: pid.as_raw(),
                    source,
                });
            }
        }
    }
}

#[allow(unsafe_code)]
fn fork_process() -> std::result::Result<ForkResult, WorkerError> {
    // SAFETY: the child only uses its own pipe ends, the application and the
    // inherited logging subscriber, and leaves through `_exit` without
    // returning into the caller.
    unsafe { fork() }.map_err(WorkerError::Fork)
}

/// One pooled worker process.
pub struct Worker {
    name: String,
    app: Arc<dyn Application>,
    queue: Arc<WorkQueue>,
    after_fork: Option<AfterForkHook>,
    shared: Arc<WorkerShared>,
    dispatcher: Option<JoinHandle<()>>,
    role: Role,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("app", &self.app.name())
            .field("role", &self.role)
            .field("pid", &self.pid())
            .field("running", &self.is_running())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Worker {
    pub fn new(name: impl Into<String>, app: Arc<dyn Application>, queue: Arc<WorkQueue>) -> Self {
        let name = name.into();
        Self {
            shared: Arc::new(WorkerShared::new(name.clone())),
            name,
            app,
            queue,
            after_fork: None,
            dispatcher: None,
            role: Role::NotStarted,
        }
    }

    #[must_use]
    pub fn with_after_fork(mut self, hook: Option<AfterForkHook>) -> Self {
        self.after_fork = hook;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// True when nothing has been dispatched since the last readiness ping.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    pub fn is_parent(&self) -> bool {
        self.role == Role::Parent
    }

    pub fn is_child(&self) -> bool {
        self.role == Role::Child
    }

    /// Id dispatched to the child and not yet acknowledged.
    pub fn in_flight(&self) -> Option<String> {
        self.shared.in_flight.lock().clone()
    }

    pub fn pid(&self) -> Option<Pid> {
        *self.shared.child.lock()
    }

    /// Fork the child and start the dispatch thread.
    ///
    /// In the child this never returns. Starting twice is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.role != Role::NotStarted {
            return Ok(());
        }

        let (dispatch_tx, dispatch_rx) = framing::channel()?;
        let (ready_tx, ready_rx) = framing::channel()?;
        let parent = getpid();

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.ready.store(true, Ordering::SeqCst);

        match fork_process() {
            Ok(ForkResult::Parent { child }) => {
                drop(dispatch_rx);
                drop(ready_tx);
                self.role = Role::Parent;
                *self.shared.child.lock() = Some(child);
                *self.shared.dispatch.lock() = Some(dispatch_tx);

                let shared = Arc::clone(&self.shared);
                let queue = Arc::clone(&self.queue);
                let spawned = std::thread::Builder::new()
                    .name(self.name.clone())
                    .spawn(move || dispatch_loop(&shared, &queue, ready_rx));

                match spawned {
                    Ok(handle) => self.dispatcher = Some(handle),
                    Err(err) => {
                        if let Err(reap_err) = self.shared.reap_child() {
                            error!(worker = %self.name, error = %reap_err, "Failed to reap child");
                        }
                        return Err(WorkerError::Thread(err.to_string()).into());
                    }
                }

                info!(
                    worker = %self.name,
                    app = %self.app.name(),
                    child_pid = child.as_raw(),
                    "Worker started"
                );
                Ok(())
            }
            Ok(ForkResult::Child) => {
                drop(dispatch_tx);
                drop(ready_rx);
                self.role = Role::Child;
                self.run_child(parent, dispatch_rx, ready_tx)
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.ready.store(false, Ordering::SeqCst);
                Err(err.into())
            }
        }
    }

    /// Ask the dispatch thread to finish without waiting for it. A later
    /// [`Worker::stop`] completes the shutdown.
    pub fn request_stop(&self) {
        if self.role == Role::Parent {
            self.shared.running.store(false, Ordering::SeqCst);
        }
    }

    /// Send EXIT and block until the child has exited.
    ///
    /// No-op unless this is the parent side of a started worker. Safe to
    /// call repeatedly.
    pub fn stop(&mut self) -> Result<()> {
        if self.role != Role::Parent {
            return Ok(());
        }

        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                error!(worker = %self.name, "Dispatch thread panicked");
            }
        }
        self.shared.reap_child()?;
        Ok(())
    }

    fn run_child(&self, parent: Pid, items: FrameReceiver, pings: FrameSender) -> ! {
        install_child_signal_handlers();

        // Nothing may unwind back into the code that called `start`.
        let code = match catch_unwind(AssertUnwindSafe(|| {
            if let Some(hook) = &self.after_fork {
                hook();
            }
            self.child_loop(parent, items, pings);
        })) {
            Ok(()) => 0,
            Err(_) => {
                error!(worker = %self.name, "Child loop panicked");
                1
            }
        };
        nix::unistd::_exit(code)
    }

    fn child_loop(&self, parent: Pid, mut items: FrameReceiver, mut pings: FrameSender) {
        let me = getpid();
        debug!(worker = %self.name, pid = me.as_raw(), "Child loop started");

        let ping = me.as_raw().to_string();
        let mut signaled_ready = true;

        loop {
            if getppid() != parent {
                warn!(worker = %self.name, pid = me.as_raw(), "Parent exited; child leaving");
                break;
            }

            match items.recv(DEFAULT_TIMEOUT) {
                Ok(None) => {
                    if !signaled_ready {
                        match pings.send(&ping, DEFAULT_TIMEOUT) {
                            Ok(sent) => signaled_ready = sent,
                            Err(err) => {
                                warn!(worker = %self.name, error = %err, "Readiness pipe closed");
                                break;
                            }
                        }
                    }
                }
                Ok(Some(item)) if item == EXIT => break,
                Ok(Some(item)) => {
                    signaled_ready = false;
                    self.publish_guarded(&item);
                }
                Err(FrameError::Closed) => break,
                Err(err) => {
                    error!(worker = %self.name, error = %err, "Dispatch pipe failed");
                    break;
                }
            }
        }

        debug!(worker = %self.name, pid = me.as_raw(), "Child loop finished");
    }

    /// Publish one id; errors and panics are logged, never propagated.
    fn publish_guarded(&self, id: &str) {
        match catch_unwind(AssertUnwindSafe(|| self.app.publish(id))) {
            Ok(Ok(())) => {
                debug!(worker = %self.name, metric_id = %id, "Published");
            }
            Ok(Err(err)) => {
                error!(worker = %self.name, metric_id = %id, error = %err, "Publish failed");
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(worker = %self.name, metric_id = %id, panic = %message, "Publish panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!(worker = %self.name, error = %err, "Worker stop failed during drop");
        }
    }
}

/// SIGTERM exits the child at once; SIGINT keeps the inherited handlers so
/// the child waits for the in-band EXIT.
fn install_child_signal_handlers() {
    let exit_on_term = Arc::new(AtomicBool::new(true));
    if let Err(err) = signal_hook::flag::register_conditional_shutdown(
        signal_hook::consts::SIGTERM,
        0,
        exit_on_term,
    ) {
        warn!(error = %err, "Could not install SIGTERM handler in child");
    }
}

fn dispatch_loop(shared: &WorkerShared, queue: &WorkQueue, mut pings: FrameReceiver) {
    while shared.running.load(Ordering::SeqCst) {
        match pings.recv(DEFAULT_TIMEOUT) {
            Ok(Some(_)) => shared.mark_ready(),
            Ok(None) => {}
            Err(FrameError::Closed) => {
                warn!(worker = %shared.name, "Child exited unexpectedly");
                break;
            }
            Err(err) => {
                error!(worker = %shared.name, error = %err, "Readiness pipe failed");
                break;
            }
        }

        if !shared.ready.load(Ordering::SeqCst) {
            continue;
        }
        let Some(item) = shared.claim_next(queue) else {
            continue;
        };
        if item == EXIT {
            debug!(worker = %shared.name, "EXIT dequeued");
            break;
        }

        let sent = {
            let mut dispatch = shared.dispatch.lock();
            match dispatch.as_mut() {
                Some(sender) => sender.send(&item, DEFAULT_TIMEOUT),
                None => Err(FrameError::Closed),
            }
        };

        match sent {
            Ok(true) => {
                shared.ready.store(false, Ordering::SeqCst);
                debug!(worker = %shared.name, metric_id = %item, "Dispatched");
            }
            Ok(false) => {
                debug!(worker = %shared.name, metric_id = %item, "Dispatch pipe busy; requeued");
                shared.release(queue, item);
            }
            Err(FrameError::PayloadTooLarge { len }) => {
                error!(worker = %shared.name, metric_id = %item, len, "Metric id too long; dropped");
                *shared.in_flight.lock() = None;
            }
            Err(err) => {
                warn!(worker = %shared.name, metric_id = %item, error = %err, "Dispatch failed");
                shared.release(queue, item);
                break;
            }
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    if let Err(err) = shared.reap_child() {
        error!(worker = %shared.name, error = %err, "Failed to reap child");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::MetricApplication;

    fn idle_worker() -> Worker {
        Worker::new(
            "worker[test]",
            Arc::new(MetricApplication::new("test")),
            Arc::new(WorkQueue::new()),
        )
    }

    #[test]
    fn new_worker_is_idle() {
        let worker = idle_worker();
        assert!(!worker.is_running());
        assert!(!worker.is_ready());
        assert!(!worker.is_parent());
        assert!(!worker.is_child());
        assert!(worker.pid().is_none());
        assert!(worker.in_flight().is_none());
    }

    #[test]
    fn stop_before_start_is_noop() {
        let mut worker = idle_worker();
        worker.stop().unwrap();
        worker.stop().unwrap();
        assert!(!worker.is_running());
    }

    #[test]
    fn claimed_id_is_in_flight_as_soon_as_it_leaves_the_queue() {
        let shared = WorkerShared::new("worker[test]".to_string());
        let queue = WorkQueue::new();
        queue.push("A/x");
        queue.push("A/y");

        assert_eq!(shared.claim_next(&queue).as_deref(), Some("A/x"));
        assert_eq!(shared.in_flight.lock().as_deref(), Some("A/x"));
        assert_eq!(queue.snapshot(), vec!["A/y".to_string()]);
    }

    #[test]
    fn exit_sentinel_is_never_in_flight() {
        let shared = WorkerShared::new("worker[test]".to_string());
        let queue = WorkQueue::new();
        queue.push(EXIT);

        assert_eq!(shared.claim_next(&queue).as_deref(), Some(EXIT));
        assert!(shared.in_flight.lock().is_none());
        assert!(shared.claim_next(&queue).is_none());
    }

    #[test]
    fn released_id_is_queued_again_and_no_longer_in_flight() {
        let shared = WorkerShared::new("worker[test]".to_string());
        let queue = WorkQueue::new();
        queue.push("A/x");

        let item = shared.claim_next(&queue).unwrap();
        shared.release(&queue, item);
        assert!(shared.in_flight.lock().is_none());
        assert_eq!(queue.snapshot(), vec!["A/x".to_string()]);
    }

    #[test]
    fn wait_for_exit_tolerates_unknown_child() {
        // Not our child: ECHILD counts as already reaped.
        wait_for_exit(Pid::from_raw(1)).unwrap();
    }
}
