use crate::retry::{CrashDecision, RestartPolicy};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

/// Where a child's stdout/stderr go.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildOutput {
    Null,
    Files { stdout: PathBuf, stderr: PathBuf },
}

/// Lifecycle of one supervised child. The process handle only exists in
/// `Running`, so "never started" and "exited" cannot be confused.
#[derive(Debug)]
pub enum ChildState {
    NotStarted,
    Running(Child),
    /// Exited (or failed to start); crash recorded, waiting out the backoff.
    Crashed,
    /// Restart cap exceeded. Terminal until the supervisor itself restarts.
    Failed,
    /// Shut down by the supervisor.
    Terminated,
}

/// Outcome of a spawn attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    Spawned,
    AlreadyRunning,
    /// Last attempt was less than one backoff ago.
    Deferred,
    /// Terminally failed or terminated; no attempt made.
    Refused,
    /// The command could not be started; counted as a crash.
    StartFailed,
}

/// Per-child entry of the fleet heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildReport {
    pub name: String,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub failed: bool,
    pub returncode: Option<i32>,
    pub backoff: f64,
}

/// A named worker command plus everything the supervisor tracks about it.
#[derive(Debug)]
pub struct SupervisedChild {
    name: String,
    command: Vec<String>,
    cwd: PathBuf,
    output: ChildOutput,
    policy: RestartPolicy,
    state: ChildState,
    restarts: u32,
    /// Start of the current backoff window: the last spawn attempt or crash.
    last_start: Option<Instant>,
    backoff: Duration,
    last_exit_code: Option<i32>,
}

impl SupervisedChild {
    /// A child that has not been started yet, with the policy's initial
    /// backoff.
    pub fn new(
        name: impl Into<String>,
        command: Vec<String>,
        cwd: impl Into<PathBuf>,
        output: ChildOutput,
        policy: RestartPolicy,
    ) -> Self {
        let backoff = policy.initial_backoff();
        Self {
            name: name.into(),
            command,
            cwd: cwd.into(),
            output,
            policy,
            state: ChildState::NotStarted,
            restarts: 0,
            last_start: None,
            backoff,
            last_exit_code: None,
        }
    }

    /// Unique name from the `[[children]]` entry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> &ChildState {
        &self.state
    }

    /// Crashes recorded since the supervisor started. Never reset.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Minimum wait after the last spawn attempt or crash before respawning.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// True once the restart cap has been exceeded.
    pub fn is_failed(&self) -> bool {
        matches!(self.state(), ChildState::Failed)
    }

    /// OS process id while running.
    pub fn pid(&self) -> Option<u32> {
        match &self.state {
            ChildState::Running(child) => child.id(),
            _ => None,
        }
    }

    /// Make sure the child is running: start it if it never ran, restart it
    /// if it exited. Safe to call on every tick in any state.
    pub fn ensure(&mut self, now: Instant) {
        match self.state {
            ChildState::Failed | ChildState::Terminated => {}
            ChildState::NotStarted | ChildState::Crashed => {
                self.spawn(now);
            }
            ChildState::Running(_) => {
                if self.detect_exit(now) {
                    self.spawn(now);
                }
            }
        }
    }

    /// Poll a running child. On exit, record the crash at `now` and return
    /// true.
    pub fn detect_exit(&mut self, now: Instant) -> bool {
        let ChildState::Running(child) = &mut self.state else {
            return false;
        };
        let code = match child.try_wait() {
            Ok(None) => return false,
            Ok(Some(status)) => status.code(),
            Err(e) => {
                warn!(child = %self.name, error = %e, "failed to poll child, treating as exited");
                None
            }
        };
        self.last_exit_code = code;
        self.state = ChildState::Crashed;
        self.record_crash(now);
        true
    }

    /// Attempt to start the child process.
    pub fn spawn(&mut self, now: Instant) -> SpawnOutcome {
        match self.state {
            ChildState::Failed | ChildState::Terminated => return SpawnOutcome::Refused,
            ChildState::Running(_) => return SpawnOutcome::AlreadyRunning,
            ChildState::Crashed => {
                if let Some(last) = self.last_start {
                    if now.saturating_duration_since(last) < self.backoff {
                        return SpawnOutcome::Deferred;
                    }
                }
            }
            ChildState::NotStarted => {}
        }

        self.last_start = Some(now);
        match self.start_process() {
            Ok(child) => {
                info!(child = %self.name, pid = ?child.id(), restarts = self.restarts, "child.spawn");
                self.state = ChildState::Running(child);
                SpawnOutcome::Spawned
            }
            Err(e) => {
                error!(
                    child = %self.name,
                    restarts = self.restarts + 1,
                    error = %e,
                    "child.spawn.error"
                );
                self.state = ChildState::Crashed;
                self.record_crash(now);
                SpawnOutcome::StartFailed
            }
        }
    }

    fn start_process(&self) -> std::io::Result<Child> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")
        })?;
        let (stdout, stderr) = self.output_stdio();
        Command::new(program)
            .args(args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0) // Own process group so shutdown reaches grandchildren
            .spawn()
    }

    fn output_stdio(&self) -> (Stdio, Stdio) {
        let ChildOutput::Files { stdout, stderr } = &self.output else {
            return (Stdio::null(), Stdio::null());
        };
        let open = |path: &PathBuf| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map(Stdio::from)
                .unwrap_or_else(|e| {
                    warn!(child = %self.name, path = %path.display(), error = %e, "cannot open child log, discarding output");
                    Stdio::null()
                })
        };
        (open(stdout), open(stderr))
    }

    /// Count a crash and either grow the backoff or give up for good. The
    /// backoff window restarts at `now`, so the tick that detects an exit
    /// never respawns.
    pub fn record_crash(&mut self, now: Instant) {
        self.restarts += 1;
        self.last_start = Some(now);
        match self.policy.on_crash(self.restarts, self.backoff) {
            CrashDecision::Restart { backoff } => self.backoff = backoff,
            CrashDecision::GiveUp => self.state = ChildState::Failed,
        }
        warn!(
            child = %self.name,
            restarts = self.restarts,
            failed = self.is_failed(),
            backoff = self.backoff.as_secs_f64(),
            returncode = ?self.last_exit_code,
            "child.crash"
        );
    }

    /// True while the child has a process that has not exited.
    pub fn is_alive(&mut self) -> bool {
        match &mut self.state {
            ChildState::Running(child) => matches!(child.try_wait(), Ok(None)),
            _ => false,
        }
    }

    /// Ask the child's process group to exit (SIGTERM).
    pub fn terminate(&mut self) {
        if !self.is_alive() {
            return;
        }
        if let Some(pid) = self.pid() {
            match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => info!(child = %self.name, pid, "child.terminate"),
                Err(e) => warn!(child = %self.name, pid, error = %e, "failed to send SIGTERM"),
            }
        }
    }

    /// Unconditionally kill the child's process group.
    pub fn kill(&mut self) {
        if !self.is_alive() {
            return;
        }
        let pid = self.pid();
        if let Some(pid) = pid {
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        if let ChildState::Running(child) = &mut self.state {
            if let Err(e) = child.start_kill() {
                warn!(child = %self.name, error = %e, "failed to kill child");
                return;
            }
        }
        warn!(child = %self.name, pid = ?pid, "child.kill");
    }

    /// Collect the exit status after shutdown and mark the child terminated.
    pub async fn reap(&mut self, wait: Duration) {
        if let ChildState::Running(child) = &mut self.state {
            match tokio::time::timeout(wait, child.wait()).await {
                Ok(Ok(status)) => self.last_exit_code = status.code(),
                Ok(Err(e)) => warn!(child = %self.name, error = %e, "failed to reap child"),
                Err(_) => warn!(child = %self.name, "child did not exit after kill"),
            }
        }
        if !self.is_failed() {
            self.state = ChildState::Terminated;
        }
    }

    /// Entry for the fleet heartbeat.
    pub fn report(&self) -> ChildReport {
        let running = matches!(self.state, ChildState::Running(_));
        ChildReport {
            name: self.name.clone(),
            pid: self.pid(),
            restarts: self.restarts(),
            failed: self.is_failed(),
            returncode: if running { None } else { self.last_exit_code },
            backoff: self.backoff().as_secs_f64(),
        }
    }
}
