//! Stale-instance reaper.
//!
//! Before a runner starts it stops any previous runner of the same
//! application that is still alive.
//!
//! Discovery prefers the PID file (`<run_dir>/<app>.pid`): the recorded pid
//! is probed with signal 0, zombies count as dead, and the process must
//! still carry the signature `mc-<app>`. A live pid without it was reused by
//! something else and is left alone. Without a PID file the process table
//! is scanned for the signature (`/proc` on Linux, `ps` on macOS).
//!
//! Escalation: SIGTERM every stale master, poll until the grace period
//! expires, then SIGKILL each survivor's process group. Reaping is best
//! effort; failures end up in [`ReapReport::errors`].

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::{Pid, getpgrp, getpid};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Linux truncates `comm` to this many bytes.
pub const COMM_LEN: usize = 15;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Discoverable process name for `app`, truncated to [`COMM_LEN`].
#[must_use]
pub fn process_signature(app: &str) -> String {
    truncate_comm(&format!("mc-{app}")).to_string()
}

fn truncate_comm(name: &str) -> &str {
    if name.len() <= COMM_LEN {
        return name;
    }
    let mut end = COMM_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Rename the calling thread. From the main thread this is the process
/// `comm`; from any other thread only that thread's `comm` changes, which
/// discovery also checks on Linux. Best effort; a no-op off Linux.
pub fn set_process_title(title: &str) {
    #[cfg(target_os = "linux")]
    {
        let name = truncate_comm(title);
        match std::ffi::CString::new(name) {
            Ok(cname) => {
                if let Err(err) = nix::sys::prctl::set_name(&cname) {
                    warn!(title = %name, error = %err, "Failed to set process title");
                } else {
                    debug!(title = %name, "Process title set");
                }
            }
            Err(err) => warn!(title = %name, error = %err, "Invalid process title"),
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        debug!(title = %title, "Process titles are not supported on this platform");
    }
}

/// A discovered process believed to be a stale master or worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pub pid: i32,
    pub ppid: i32,
    pub pgid: i32,
    pub state: char,
    /// `comm` on Linux, executable name elsewhere.
    pub name: String,
    /// Full command line, space separated.
    pub command: String,
    /// Per-thread `comm` values (Linux only).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub thread_names: Vec<String>,
}

impl ProcessRecord {
    fn argv0(&self) -> &str {
        let first = self.command.split(' ').next().unwrap_or_default();
        first.rsplit('/').next().unwrap_or(first)
    }

    /// True when `name`, `argv[0]` or any thread name carries `signature`.
    #[must_use]
    pub fn matches_signature(&self, signature: &str) -> bool {
        truncate_comm(&self.name) == signature
            || truncate_comm(self.argv0()) == signature
            || self
                .thread_names
                .iter()
                .any(|thread| truncate_comm(thread) == signature)
    }

    #[must_use]
    pub fn is_zombie(&self) -> bool {
        self.state == 'Z'
    }
}

/// Outcome of one reaping pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Stale masters found.
    pub discovered: usize,
    /// Masters that exited after SIGTERM within the grace period.
    pub terminated: usize,
    /// Process groups (or lone processes) sent SIGKILL.
    pub killed: usize,
    /// Still alive after escalation.
    pub remaining: usize,
    pub errors: Vec<String>,
}

/// Where to look and how patiently to wait.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub signature: String,
    /// Use this PID file instead of scanning the process table.
    pub pid_file: Option<PathBuf>,
    pub grace_period: Duration,
    pub poll_interval: Duration,
}

impl ReaperConfig {
    #[must_use]
    pub fn for_app(app: &str) -> Self {
        Self {
            signature: process_signature(app),
            pid_file: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_timing(mut self, grace_period: Duration, poll_interval: Duration) -> Self {
        self.grace_period = grace_period;
        self.poll_interval = poll_interval;
        self
    }
}

// =============================================================================
// PID file
// =============================================================================

/// Single-instance PID file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<run_dir>/<app>.pid`
    pub fn for_app(run_dir: &Path, app: &str) -> Self {
        Self::new(run_dir.join(format!("{app}.pid")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recorded pid, or `None` if the file is missing or unparsable.
    pub fn read(&self) -> io::Result<Option<i32>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => match contents.trim().parse::<i32>() {
                Ok(pid) if pid > 0 => Ok(Some(pid)),
                _ => {
                    warn!(path = %self.path.display(), "Ignoring malformed PID file");
                    Ok(None)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Record the current process.
    pub fn write_current(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, format!("{}\n", getpid()))
    }

    /// Remove the file if it still names the current process.
    pub fn remove_if_owned(&self) -> io::Result<bool> {
        if self.read()? != Some(getpid().as_raw()) {
            return Ok(false);
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}

// =============================================================================
// Discovery
// =============================================================================

/// Whether `pid` is alive. Zombies are dead.
#[must_use]
pub fn is_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => {}
        Err(_) => return false,
    }
    !read_process(pid).is_some_and(|record| record.is_zombie())
}

/// Find stale masters according to `config`.
pub fn discover(config: &ReaperConfig) -> Result<Vec<ProcessRecord>, String> {
    match &config.pid_file {
        Some(path) => discover_from_pid_file(&PidFile::new(path.clone()), &config.signature),
        None => {
            let table = list_processes()?;
            Ok(select_stale_masters(
                &table,
                &config.signature,
                getpid().as_raw(),
            ))
        }
    }
}

fn discover_from_pid_file(
    pid_file: &PidFile,
    signature: &str,
) -> Result<Vec<ProcessRecord>, String> {
    let pid = match pid_file.read() {
        Ok(Some(pid)) => pid,
        Ok(None) => return Ok(Vec::new()),
        Err(err) => return Err(format!("read {}: {err}", pid_file.path().display())),
    };

    if pid == getpid().as_raw() {
        return Ok(Vec::new());
    }
    if !is_alive(pid) {
        debug!(pid, path = %pid_file.path().display(), "PID file names a dead process");
        return Ok(Vec::new());
    }

    match read_process(pid) {
        Some(record) if record.matches_signature(signature) => Ok(vec![record]),
        Some(record) => {
            info!(
                pid,
                name = %record.name,
                signature,
                path = %pid_file.path().display(),
                "Stale PID file names an unrelated process; leaving it alone"
            );
            Ok(Vec::new())
        }
        None => {
            debug!(pid, signature, "Cannot inspect PID file process; leaving it alone");
            Ok(Vec::new())
        }
    }
}

/// Processes carrying `signature` whose parent does not, excluding
/// `self_pid` and its children.
#[must_use]
pub fn select_stale_masters(
    table: &[ProcessRecord],
    signature: &str,
    self_pid: i32,
) -> Vec<ProcessRecord> {
    let matched: Vec<&ProcessRecord> = table
        .iter()
        .filter(|p| p.pid != self_pid && p.ppid != self_pid)
        .filter(|p| !p.is_zombie())
        .filter(|p| p.matches_signature(signature))
        .collect();

    matched
        .iter()
        .filter(|p| !matched.iter().any(|parent| parent.pid == p.ppid))
        .map(|p| (*p).clone())
        .collect()
}

// =============================================================================
// Escalation
// =============================================================================

/// Stop every stale instance described by `config`.
pub fn reap_stale_instances(config: &ReaperConfig) -> ReapReport {
    let mut report = ReapReport::default();

    let stale = match discover(config) {
        Ok(stale) => stale,
        Err(err) => {
            report.errors.push(format!("process discovery failed: {err}"));
            return report;
        }
    };
    report.discovered = stale.len();

    if stale.is_empty() {
        debug!(signature = %config.signature, "No stale instances found");
        return report;
    }

    info!(
        signature = %config.signature,
        pids = ?stale.iter().map(|p| p.pid).collect::<Vec<_>>(),
        "Stopping stale instances"
    );

    for process in &stale {
        match kill(Pid::from_raw(process.pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => report
                .errors
                .push(format!("failed to TERM pid {}: {err}", process.pid)),
        }
    }

    let deadline = Instant::now() + config.grace_period;
    let mut alive = survivors(&stale);
    while !alive.is_empty() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(config.poll_interval.min(deadline - now));
        alive = survivors(&alive);
    }
    report.terminated = stale.len() - alive.len();

    if !alive.is_empty() {
        let own_group = getpgrp().as_raw();
        for process in &alive {
            let result = if process.pgid > 0 && process.pgid != own_group {
                killpg(Pid::from_raw(process.pgid), Signal::SIGKILL)
            } else {
                kill(Pid::from_raw(process.pid), Signal::SIGKILL)
            };
            match result {
                Ok(()) => report.killed += 1,
                Err(Errno::ESRCH) => {}
                Err(err) => report
                    .errors
                    .push(format!("failed to KILL pid {}: {err}", process.pid)),
            }
        }
        std::thread::sleep(config.poll_interval);
        alive = survivors(&alive);
    }

    report.remaining = alive.len();
    if report.remaining > 0 {
        warn!(
            remaining = report.remaining,
            pids = ?alive.iter().map(|p| p.pid).collect::<Vec<_>>(),
            "Stale instances survived SIGKILL"
        );
    } else {
        info!(
            terminated = report.terminated,
            killed = report.killed,
            "Stale instances stopped"
        );
    }
    for err in &report.errors {
        warn!(error = %err, "Reaper error");
    }

    report
}

fn survivors(processes: &[ProcessRecord]) -> Vec<ProcessRecord> {
    processes
        .iter()
        .filter(|p| is_alive(p.pid))
        .cloned()
        .collect()
}

// =============================================================================
// Linux: /proc filesystem
// =============================================================================

/// Parse `/proc/<pid>/stat` into `(comm, state, ppid, pgid)`.
fn parse_stat(stat: &str) -> Option<(String, char, i32, i32)> {
    // comm may contain spaces and parens; it ends at the last ')'.
    let name_start = stat.find('(')?;
    let name_end = stat.rfind(')')?;
    let name = stat.get(name_start + 1..name_end)?.to_string();
    let rest = stat.get(name_end + 1..)?;
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    let pgid = fields.next()?.parse().ok()?;
    Some((name, state, ppid, pgid))
}

#[cfg(target_os = "linux")]
fn read_process(pid: i32) -> Option<ProcessRecord> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let (name, state, ppid, pgid) = parse_stat(&stat)?;
    let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).unwrap_or_default();
    let command = String::from_utf8_lossy(&cmdline)
        .split('\0')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    Some(ProcessRecord {
        pid,
        ppid,
        pgid,
        state,
        name,
        command,
        thread_names: thread_names(pid),
    })
}

#[cfg(target_os = "linux")]
fn thread_names(pid: i32) -> Vec<String> {
    let Ok(tasks) = std::fs::read_dir(format!("/proc/{pid}/task")) else {
        return Vec::new();
    };
    tasks
        .flatten()
        .filter_map(|task| std::fs::read_to_string(task.path().join("comm")).ok())
        .map(|comm| comm.trim_end().to_string())
        .collect()
}

#[cfg(target_os = "linux")]
fn list_processes() -> Result<Vec<ProcessRecord>, String> {
    let entries = std::fs::read_dir("/proc").map_err(|e| format!("read /proc: {e}"))?;
    Ok(entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter_map(read_process)
        .collect())
}

// =============================================================================
// macOS: ps command
// =============================================================================

#[cfg(target_os = "macos")]
fn ps_records(args: &[&str]) -> Result<Vec<ProcessRecord>, String> {
    let output = std::process::Command::new("ps")
        .args(args)
        .output()
        .map_err(|e| format!("ps failed: {e}"))?;
    if !output.status.success() && output.stdout.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("ps returned non-zero: {stderr}"));
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(parse_ps_line)
        .collect())
}

/// Parse `pid ppid pgid stat command...`.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_ps_line(line: &str) -> Option<ProcessRecord> {
    let mut fields = line.split_whitespace();
    let pid = fields.next()?.parse().ok()?;
    let ppid = fields.next()?.parse().ok()?;
    let pgid = fields.next()?.parse().ok()?;
    let state = fields.next()?.chars().next()?;
    let command = fields.collect::<Vec<_>>().join(" ");
    let first = command.split(' ').next().unwrap_or_default();
    let name = first.rsplit('/').next().unwrap_or(first).to_string();
    Some(ProcessRecord {
        pid,
        ppid,
        pgid,
        state,
        name,
        command,
        thread_names: Vec::new(),
    })
}

#[cfg(target_os = "macos")]
fn read_process(pid: i32) -> Option<ProcessRecord> {
    let pid_arg = pid.to_string();
    ps_records(&["-o", "pid=,ppid=,pgid=,stat=,command=", "-p", &pid_arg])
        .ok()?
        .into_iter()
        .next()
}

#[cfg(target_os = "macos")]
fn list_processes() -> Result<Vec<ProcessRecord>, String> {
    ps_records(&["-axo", "pid=,ppid=,pgid=,stat=,command="])
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn read_process(_pid: i32) -> Option<ProcessRecord> {
    None
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn list_processes() -> Result<Vec<ProcessRecord>, String> {
    Err("process table scan not supported on this platform".to_string())
}
