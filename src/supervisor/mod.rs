//! Process supervisor: keeps the pipeline's worker processes alive, restarts
//! crashed ones with bounded backoff, and publishes a fleet heartbeat.

pub mod child;

use crate::config::HarnessConfig;
use crate::data_dir::DataDir;
use crate::retry::RestartPolicy;
use crate::signals;
use crate::status::{now_ts, StateFile};
use child::{ChildOutput, ChildReport, SupervisedChild};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SHUTDOWN_POLL: Duration = Duration::from_millis(200);
const REAP_WAIT: Duration = Duration::from_secs(2);

/// The fleet heartbeat document (`heartbeat_orchestrator.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub service: String,
    pub role: String,
    pub ts: f64,
    pub loop_iter: u64,
    pub version: u32,
    pub mode: String,
    pub children: Vec<ChildReport>,
    pub all_failed: bool,
}

pub struct Supervisor {
    children: Vec<SupervisedChild>,
    heartbeat: StateFile,
    interval: Duration,
    grace: Duration,
    loop_iter: u64,
}

impl Supervisor {
    pub fn new(
        children: Vec<SupervisedChild>,
        heartbeat: StateFile,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            children,
            heartbeat,
            interval,
            grace,
            loop_iter: 0,
        }
    }

    /// Build the fleet from configuration, honoring the spawn allow-list.
    pub fn from_config(config: &HarnessConfig, data_dir: &DataDir) -> Self {
        let policy = RestartPolicy::from_config(&config.supervisor);
        let children = config
            .selected_children()
            .into_iter()
            .map(|c| {
                let output = if config.supervisor.capture_child_output {
                    let (stdout, stderr) = data_dir.child_logs(&c.name);
                    ChildOutput::Files { stdout, stderr }
                } else {
                    ChildOutput::Null
                };
                let cwd = config.child_cwd(&c);
                SupervisedChild::new(c.name, c.command, cwd, output, policy.clone())
            })
            .collect();
        Self::new(
            children,
            StateFile::new(data_dir.fleet_heartbeat()),
            Duration::from_secs_f64(config.supervisor.interval_secs),
            Duration::from_secs_f64(config.supervisor.shutdown_grace_secs),
        )
    }

    pub fn children(&self) -> &[SupervisedChild] {
        &self.children
    }

    pub fn loop_iter(&self) -> u64 {
        self.loop_iter
    }

    pub fn ensure_all(&mut self, now: Instant) {
        for child in &mut self.children {
            child.ensure(now);
        }
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        FleetSnapshot {
            service: "orchestrator".to_string(),
            role: "supervisor".to_string(),
            ts: now_ts(),
            loop_iter: self.loop_iter,
            version: 1,
            mode: "supervise".to_string(),
            children: self.children.iter().map(SupervisedChild::report).collect(),
            all_failed: !self.children.is_empty() && self.children.iter().all(|c| c.is_failed()),
        }
    }

    pub fn write_fleet_snapshot(&self) {
        if let Err(e) = self.heartbeat.write(&self.snapshot()) {
            warn!(error = %e, path = %self.heartbeat.path().display(), "failed to write fleet heartbeat");
        }
    }

    /// Run until `cancel` fires, then shut every child down.
    pub async fn run(mut self, cancel: CancellationToken) -> u64 {
        self.ensure_all(Instant::now());
        info!(
            children = ?self.children.iter().map(|c| c.name()).collect::<Vec<_>>(),
            "supervisor.start"
        );
        self.write_fleet_snapshot();

        while !cancel.is_cancelled() {
            if !signals::sleep_or_cancel(&cancel, self.interval).await {
                break;
            }
            self.loop_iter += 1;
            self.ensure_all(Instant::now());
            self.write_fleet_snapshot();
            debug!(loop_iter = self.loop_iter, "supervisor.loop");
        }

        self.shutdown().await;
        let restarts: u32 = self.children().iter().map(SupervisedChild::restarts).sum();
        info!(loop_iter = self.loop_iter(), restarts, "supervisor.stop");
        self.loop_iter()
    }

    /// SIGTERM everyone, wait out the grace period, SIGKILL stragglers,
    /// then write the final snapshot.
    pub async fn shutdown(&mut self) {
        for child in &mut self.children {
            child.terminate();
        }
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline && self.children.iter_mut().any(|c| c.is_alive()) {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        for child in &mut self.children {
            child.kill();
        }
        for child in &mut self.children {
            child.reap(REAP_WAIT).await;
        }
        self.write_fleet_snapshot();
    }
}
