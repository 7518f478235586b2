//! Shared helpers for process-level integration tests.
//!
//! Publishes happen inside forked children, so the stub application records
//! them by appending one line per publish to a file the test can read.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use metricollect_core::application::Application;
use metricollect_core::error::{Error, Result};

// ---------------------------------------------------------------------------
// RecordingApp: appends "<id>" lines to a file on every publish
// ---------------------------------------------------------------------------

pub struct RecordingApp {
    name: String,
    log: PathBuf,
    ids: Vec<String>,
    fail_on: Option<String>,
    panic_on: Option<String>,
    delay: Duration,
}

impl RecordingApp {
    pub fn new(name: &str, log: &Path, ids: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            log: log.to_path_buf(),
            ids: ids.iter().map(|s| (*s).to_string()).collect(),
            fail_on: None,
            panic_on: None,
            delay: Duration::ZERO,
        }
    }

    /// Return an error when publishing `id`.
    pub fn failing_on(mut self, id: &str) -> Self {
        self.fail_on = Some(id.to_string());
        self
    }

    /// Panic when publishing `id`.
    pub fn panicking_on(mut self, id: &str) -> Self {
        self.panic_on = Some(id.to_string());
        self
    }

    /// Sleep this long inside every publish.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Application for RecordingApp {
    fn name(&self) -> &str {
        &self.name
    }

    fn metric_ids(&self, _roles: &[String]) -> Vec<String> {
        self.ids.clone()
    }

    fn publish(&self, id: &str) -> Result<()> {
        if self.fail_on.as_deref() == Some(id) {
            return Err(Error::Publish(format!("refusing {id}")));
        }
        if self.panic_on.as_deref() == Some(id) {
            panic!("publish blew up on {id}");
        }
        std::thread::sleep(self.delay);
        append_line(&self.log, id);
        Ok(())
    }
}

pub fn append_line(path: &Path, line: &str) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open record file");
    file.write_all(format!("{line}\n").as_bytes())
        .expect("append record");
}

pub fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Poll `condition` every 50ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    condition()
}

/// Forking tests run one at a time so no child inherits another test's
/// pipe ends.
pub fn serial() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Symlink `target` as `<dir>/<name>`. Executing the link gives the
/// process `name` as its `comm` and `argv[0]`.
pub fn named_binary(dir: &Path, name: &str, target: &str) -> PathBuf {
    let link = dir.join(name);
    std::os::unix::fs::symlink(target, &link).expect("create named binary link");
    link
}

/// Whether `pid` still exists (zombies included).
pub fn pid_exists(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}
