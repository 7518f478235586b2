//! Runner control loop against real forked workers.
//!
//! These tests take several seconds each: cycles run on whole-second ticks.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use common::{RecordingApp, named_binary, read_lines, serial, wait_until};
use metricollect_core::error::Error;
use metricollect_core::reaper::process_signature;
use metricollect_core::registry::Registry;
use metricollect_core::runner::{Runner, RunnerOptions};

fn options(dir: &Path, frequency_secs: u64, iterations: u64) -> RunnerOptions {
    RunnerOptions {
        frequency: Duration::from_secs(frequency_secs),
        iterations: Some(iterations),
        initial_workers: 1,
        min_workers: 1,
        max_workers: 3,
        pid_file: Some(dir.join("app.pid")),
        reap_grace: Duration::from_millis(200),
        reap_poll: Duration::from_millis(50),
        ..RunnerOptions::default()
    }
}

#[test]
fn three_iterations_publish_exactly_three_times() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("published");
    let app = RecordingApp::new("cadence", &log, &["System/LoadAverage"]);

    let mut registry = Registry::new();
    registry.register(Arc::new(app));
    let mut runner = Runner::new(&registry, "cadence", options(dir.path(), 5, 3)).unwrap();

    let started = Instant::now();
    let summary = runner.start().unwrap();

    assert_eq!(summary.cycles, 3);
    assert_eq!(read_lines(&log), vec!["System/LoadAverage"; 3]);
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(!runner.is_running());
    assert!(!dir.path().join("app.pid").exists(), "PID file left behind");
}

#[test]
fn unknown_application_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new();
    let err = Runner::new(&registry, "ghost", options(dir.path(), 5, 1)).unwrap_err();
    assert!(matches!(err, Error::UnknownApplication(name) if name == "ghost"));
}

#[test]
fn handle_stop_ends_blocked_start() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("published");
    let app = RecordingApp::new("stoppable", &log, &["A/x", "A/y"]);

    let opts = RunnerOptions {
        iterations: None,
        ..options(dir.path(), 60, 1)
    };
    let mut runner = Runner::for_application(Arc::new(app), opts).unwrap();
    let handle = runner.handle();

    let thread = std::thread::spawn(move || runner.start());
    assert!(wait_until(Duration::from_secs(10), || handle.is_running()
        && read_lines(&log).len() == 2));

    let stopped_at = Instant::now();
    handle.stop();
    handle.stop();
    let summary = thread.join().unwrap().unwrap();

    assert!(stopped_at.elapsed() < Duration::from_secs(10));
    assert_eq!(summary.cycles, 1);
    assert!(!handle.is_running());
}

#[test]
fn overloaded_pool_grows_within_ceiling() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("published");
    let app = RecordingApp::new("busy", &log, &["B/1", "B/2", "B/3", "B/4"])
        .with_delay(Duration::from_secs(2));

    let mut runner =
        Runner::for_application(Arc::new(app), options(dir.path(), 1, 8)).unwrap();
    let summary = runner.start().unwrap();

    assert_eq!(summary.cycles, 8);
    assert!(summary.peak_workers > 1, "pool never grew: {summary:?}");
    assert!(summary.peak_workers <= 3);
    assert!(summary.final_workers <= 3);
    assert!(summary.samples.iter().all(|s| *s >= 0.9), "{summary:?}");
}

#[test]
fn idle_pool_shrinks_one_per_cycle_to_floor() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("published");
    let app = RecordingApp::new("idle", &log, &[]);

    // Stopping a worker can take a second; a 3s cycle leaves room to
    // observe the idle pool before the next sample.
    let opts = RunnerOptions {
        initial_workers: 3,
        ..options(dir.path(), 3, 9)
    };
    let mut runner = Runner::for_application(Arc::new(app), opts).unwrap();
    let summary = runner.start().unwrap();

    assert_eq!(summary.cycles, 9);
    assert_eq!(summary.peak_workers, 3);
    assert_eq!(summary.final_workers, 1);
    assert!(summary.samples.iter().all(|s| *s < 1.0), "{summary:?}");
}

#[test]
fn fork_hooks_run_once_per_worker() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("forked");
    let app = RecordingApp::new("hooks", &dir.path().join("published"), &[]);

    let before = Arc::new(AtomicUsize::new(0));
    let before_hook = Arc::clone(&before);
    let marker_hook = marker.clone();

    let opts = RunnerOptions {
        initial_workers: 2,
        ..options(dir.path(), 1, 1)
    };
    let mut runner = Runner::for_application(Arc::new(app), opts)
        .unwrap()
        .with_before_fork(Arc::new(move || {
            before_hook.fetch_add(1, Ordering::SeqCst);
        }))
        .with_after_fork(Arc::new(move || {
            common::append_line(&marker_hook, &std::process::id().to_string());
        }));
    runner.start().unwrap();

    assert_eq!(before.load(Ordering::SeqCst), 2);
    assert!(wait_until(Duration::from_secs(5), || read_lines(&marker).len() == 2));
    let pids = read_lines(&marker);
    assert_ne!(pids[0], pids[1]);
    assert!(!pids.contains(&std::process::id().to_string()));
}

#[test]
fn stale_master_from_pid_file_is_reaped_before_start() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let sleeper = named_binary(dir.path(), &process_signature("reaping"), "/bin/sleep");
    let mut stale = std::process::Command::new(&sleeper).arg("30").spawn().unwrap();
    std::fs::write(dir.path().join("app.pid"), format!("{}\n", stale.id())).unwrap();

    let app = RecordingApp::new("reaping", &dir.path().join("published"), &[]);
    let mut runner =
        Runner::for_application(Arc::new(app), options(dir.path(), 1, 1)).unwrap();
    runner.start().unwrap();

    let status = stale.wait().unwrap();
    assert!(!status.success());
}

#[test]
fn slow_id_is_not_queued_again_while_in_flight() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("published");
    // Each publish outlasts three cycles.
    let app = RecordingApp::new("slow", &log, &["Slow/metric"])
        .with_delay(Duration::from_millis(3500));

    let opts = RunnerOptions {
        max_workers: 1,
        ..options(dir.path(), 1, 4)
    };
    let mut runner = Runner::for_application(Arc::new(app), opts).unwrap();
    let summary = runner.start().unwrap();

    assert_eq!(summary.cycles, 4);
    assert_eq!(summary.peak_workers, 1);
    assert_eq!(read_lines(&log), vec!["Slow/metric"]);
}

#[test]
fn restart_begins_with_fresh_history() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let app = RecordingApp::new("restart", &dir.path().join("published"), &["R/x"]);

    let mut runner =
        Runner::for_application(Arc::new(app), options(dir.path(), 1, 2)).unwrap();
    let first = runner.start().unwrap();
    let second = runner.start().unwrap();

    assert_eq!(first.samples.len(), 1);
    assert_eq!(second.samples.len(), 1, "{second:?}");
    assert_eq!(second.cycles, 2);
}
