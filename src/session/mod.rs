//! Session lifecycle manager: claims replays from the queue, launches them,
//! watches the capture heartbeat to confirm the launch, and routes every
//! replay to `completed/`, `corrupt/` or back to `queue/`.

pub mod capture;
pub mod launcher;
pub mod queue;
pub mod state;

use crate::config::SessionConfig;
use crate::data_dir::DataDir;
use crate::signals;
use crate::status::{now_ts, StateFile};
use capture::read_capture_heartbeat;
use launcher::{Launcher, SystemLauncher};
use queue::{move_file, DirectoryQueue, MoveError, WorkSource};
use state::{ServiceMeta, Session, SessionState, SCHEMA_VERSION};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Decides when an ACTIVE session is over.
pub trait EndDetector {
    fn has_ended(&mut self, session: &Session, now: f64) -> bool;
}

/// Ends every session a fixed time after it became active.
#[derive(Debug, Clone)]
pub struct FixedDuration {
    pub duration_secs: f64,
}

impl EndDetector for FixedDuration {
    fn has_ended(&mut self, session: &Session, now: f64) -> bool {
        session
            .timestamps
            .active
            .is_some_and(|active| now - active >= self.duration_secs)
    }
}

/// Tunables for the state machine, resolved from `[session]`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub success_frames: u32,
    pub launch_timeout_secs: f64,
    pub ended_delay_secs: f64,
    pub poll_interval: Duration,
    pub heartbeat_interval_secs: f64,
    pub unrecoverable_reasons: Vec<String>,
    pub capture_max_age: Option<Duration>,
    pub requeue_orphans: bool,
    pub queue_pattern: glob::Pattern,
}

impl Settings {
    pub fn from_config(config: &SessionConfig) -> Result<Self, glob::PatternError> {
        Ok(Self {
            success_frames: config.launch_success_frames,
            launch_timeout_secs: config.launch_timeout_secs,
            ended_delay_secs: config.ended_delay_secs,
            poll_interval: Duration::from_secs_f64(config.poll_interval_secs),
            heartbeat_interval_secs: config.heartbeat_interval_secs,
            unrecoverable_reasons: config.unrecoverable_reasons.clone(),
            capture_max_age: config
                .capture_heartbeat_max_age_secs
                .map(Duration::from_secs_f64),
            requeue_orphans: config.requeue_orphans,
            queue_pattern: glob::Pattern::new(&config.queue_pattern)?,
        })
    }

    fn is_unrecoverable(&self, reason: Option<&str>) -> bool {
        reason.is_some_and(|r| self.unrecoverable_reasons.iter().any(|u| u == r))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// A replay is already in flight.
    AlreadyHeld,
    QueueEmpty,
    /// Another claimant renamed the candidate first.
    Raced,
    /// Every queued replay shares its name with one already in `active/`.
    Blocked,
    /// Listing or moving failed for an OS reason; retried next tick.
    Unavailable,
}

pub struct SessionManager {
    session: Session,
    settings: Settings,
    data_dir: DataDir,
    source: Box<dyn WorkSource>,
    launcher: Box<dyn Launcher>,
    end_detector: Box<dyn EndDetector>,
    document: StateFile,
    heartbeat: StateFile,
    last_heartbeat: Option<f64>,
}

impl SessionManager {
    pub fn new(
        settings: Settings,
        data_dir: DataDir,
        source: Box<dyn WorkSource>,
        launcher: Box<dyn Launcher>,
        end_detector: Box<dyn EndDetector>,
    ) -> Self {
        Self {
            session: Session::default(),
            document: StateFile::new(data_dir.session_document()),
            heartbeat: StateFile::new(data_dir.session_heartbeat()),
            settings,
            data_dir,
            source,
            launcher,
            end_detector,
            last_heartbeat: None,
        }
    }

    /// The production wiring: directory queue, system opener, fixed-duration end.
    pub fn from_config(config: &SessionConfig, data_dir: DataDir) -> Result<Self, glob::PatternError> {
        let settings = Settings::from_config(config)?;
        let source = DirectoryQueue::new(data_dir.queue_dir(), settings.queue_pattern.clone());
        Ok(Self::new(
            settings,
            data_dir,
            Box::new(source),
            Box::new(SystemLauncher::new(config.launcher.clone())),
            Box::new(FixedDuration {
                duration_secs: config.active_duration_secs,
            }),
        ))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn persist(&self, now: f64) {
        let doc = self.session.to_document(self.settings.success_frames, now);
        if let Err(e) = self.document.write(&doc) {
            warn!(error = %e, path = %self.document.path().display(), "failed to write session document");
        }
    }

    fn write_heartbeat(&mut self, now: f64) {
        if let Err(e) = self.heartbeat.write(&self.session.to_heartbeat(now)) {
            warn!(error = %e, path = %self.heartbeat.path().display(), "failed to write session heartbeat");
        }
        self.last_heartbeat = Some(now);
    }

    fn maybe_heartbeat(&mut self, now: f64) {
        let due = self
            .last_heartbeat
            .map_or(true, |last| now - last >= self.settings.heartbeat_interval_secs);
        if due {
            self.write_heartbeat(now);
        }
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.session.state;
        self.session.state = to;
        info!(from_state = %from, to_state = %to, replay.file = ?self.session.replay, "state.transition");
    }

    /// Take the next queued replay into `active/`. From a finished state the
    /// record is replaced only once a replay is actually claimed.
    pub fn claim(&mut self, now: f64) -> ClaimOutcome {
        if self.session.holds_in_flight_replay() {
            return ClaimOutcome::AlreadyHeld;
        }
        let candidates = match self.source.candidates() {
            Ok(names) if names.is_empty() => return ClaimOutcome::QueueEmpty,
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "failed to list queue");
                return ClaimOutcome::Unavailable;
            }
        };
        for name in candidates {
            let dest = self.data_dir.active_dir().join(&name);
            match self.source.claim(&name, &dest) {
                Ok(()) => {
                    info!(replay.file = %name, "replay.claim");
                    self.session = Session::claimed(name, now);
                    self.persist(now);
                    return ClaimOutcome::Claimed;
                }
                Err(MoveError::SourceMissing { .. }) => {
                    debug!(replay.file = %name, "claim lost to another manager");
                    return ClaimOutcome::Raced;
                }
                Err(MoveError::DestinationExists { .. }) => {
                    warn!(replay.file = %name, "same-named replay already in active/, skipping");
                }
                Err(e) => {
                    warn!(replay.file = %name, error = %e, "failed to claim replay");
                    return ClaimOutcome::Unavailable;
                }
            }
        }
        ClaimOutcome::Blocked
    }

    /// Open the claimed replay. Only meaningful in QUEUED; a failure leaves
    /// the state alone so the next tick retries.
    pub fn attempt_launch(&mut self, now: f64) -> bool {
        if self.session.state != SessionState::Queued {
            return false;
        }
        let Some(name) = self.session.replay.clone() else {
            return false;
        };
        let path = self.data_dir.active_dir().join(&name);
        if !path.exists() {
            error!(replay.file = %name, "replay.launch.missing");
            return false;
        }
        match self.launcher.launch(&path) {
            Ok(()) => {
                self.transition(SessionState::Launching);
                self.session.timestamps.launch = Some(now);
                self.persist(now);
                info!(replay.file = %name, replay.path = %path.display(), "replay.launch");
                true
            }
            Err(e) => {
                error!(replay.file = %name, error = %e, "replay.launch.error");
                false
            }
        }
    }

    /// Per-tick decision for the current state.
    pub fn evaluate(&mut self, now: f64) {
        match self.session.state {
            SessionState::Queued => {
                self.attempt_launch(now);
            }
            SessionState::Launching => self.evaluate_launch(now),
            SessionState::Active => {
                if self.end_detector.has_ended(&self.session, now) {
                    self.transition(SessionState::Ended);
                    self.session.timestamps.ended = Some(now);
                    self.persist(now);
                }
            }
            SessionState::Ended => {
                let Some(ended) = self.session.timestamps.ended else {
                    return;
                };
                if now - ended >= self.settings.ended_delay_secs {
                    self.transition(SessionState::Completed);
                    self.session.timestamps.completed = Some(now);
                    self.persist(now);
                    self.finalize();
                }
            }
            SessionState::Idle
            | SessionState::Completed
            | SessionState::Aborted
            | SessionState::Corrupt => {}
        }
    }

    fn evaluate_launch(&mut self, now: f64) {
        let hb = read_capture_heartbeat(
            &self.data_dir.capture_heartbeat(),
            self.settings.capture_max_age,
        );
        let success = hb.as_ref().is_some_and(|h| h.success);
        let before = self.session.consecutive_success_frames;
        if success {
            self.session.consecutive_success_frames += 1;
        } else {
            self.session.consecutive_success_frames = 0;
        }

        if self.session.consecutive_success_frames >= self.settings.success_frames {
            self.transition(SessionState::Active);
            self.session.timestamps.active = Some(now);
            self.persist(now);
            return;
        }

        let timed_out = self
            .session
            .timestamps
            .launch
            .is_some_and(|launch| now - launch > self.settings.launch_timeout_secs);
        if timed_out {
            let reason = hb.as_ref().and_then(|h| h.reason());
            if self.settings.is_unrecoverable(reason) {
                warn!(reason = ?reason, timeout_secs = self.settings.launch_timeout_secs, "launch failed for good, quarantining replay");
                self.transition(SessionState::Corrupt);
                self.session.timestamps.aborted = Some(now);
                self.persist(now);
                self.relocate_to_corrupt();
            } else {
                warn!(reason = ?reason, timeout_secs = self.settings.launch_timeout_secs, "launch timed out, requeueing replay");
                self.transition(SessionState::Aborted);
                self.session.timestamps.aborted = Some(now);
                self.persist(now);
                self.relocate_to_queue();
            }
            return;
        }

        if self.session.consecutive_success_frames != before {
            self.persist(now);
        }
    }

    fn relocate_to_corrupt(&self) {
        let Some(name) = self.session.replay.as_deref() else {
            return;
        };
        let from = self.data_dir.active_dir().join(name);
        let result = move_file(&from, &self.data_dir.corrupt_dir().join(name));
        log_relocation(name, "corrupt", result);
    }

    fn relocate_to_queue(&self) {
        let Some(name) = self.session.replay.as_deref() else {
            return;
        };
        let from = self.data_dir.active_dir().join(name);
        let result = self.source.requeue(&from, name);
        log_relocation(name, "queue", result);
    }

    /// Archive the finished replay. A vanished source or a failed move is
    /// treated as already handled.
    fn finalize(&self) {
        let Some(name) = self.session.replay.as_deref() else {
            return;
        };
        let from = self.data_dir.active_dir().join(name);
        match move_file(&from, &self.data_dir.completed_dir().join(name)) {
            Ok(()) => info!(replay.file = %name, "replay.complete"),
            Err(e) => debug!(replay.file = %name, error = %e, "finalize skipped"),
        }
    }

    /// One loop iteration: claim when idle or finished, evaluate otherwise.
    /// A fresh claim is evaluated on the same tick.
    pub fn tick(&mut self, now: f64) {
        if self.session.state.is_recyclable() {
            if self.claim(now) == ClaimOutcome::Claimed {
                self.evaluate(now);
            }
        } else {
            self.evaluate(now);
        }
        self.maybe_heartbeat(now);
    }

    /// Startup reconciliation. Returns how many orphaned replays were
    /// found in `active/`.
    pub fn startup(&mut self, now: f64) -> std::io::Result<usize> {
        self.data_dir.init()?;

        let meta = ServiceMeta {
            service: "session-manager".to_string(),
            schema_version: SCHEMA_VERSION,
            created_ts: now,
            notes: "replay session lifecycle manager".to_string(),
        };
        if let Err(e) = StateFile::new(self.data_dir.session_service()).write_if_missing(&meta) {
            warn!(error = %e, "failed to write service metadata");
        }

        self.session = Session::default();
        self.persist(now);
        self.write_heartbeat(now);

        let active = DirectoryQueue::new(self.data_dir.active_dir(), self.settings.queue_pattern.clone());
        let orphans = active.candidates()?;
        if !orphans.is_empty() {
            warn!(count = orphans.len(), files = ?orphans, requeue = self.settings.requeue_orphans, "found orphaned replays in active/");
            if self.settings.requeue_orphans {
                for name in &orphans {
                    let result = self
                        .source
                        .requeue(&self.data_dir.active_dir().join(name), name);
                    log_relocation(name, "queue", result);
                }
            }
        }
        Ok(orphans.len())
    }

    /// Run until `cancel` fires. The final document and heartbeat are
    /// written on the way out.
    pub async fn run(mut self, cancel: CancellationToken) -> std::io::Result<()> {
        self.startup(now_ts())?;
        info!(
            success_frames = self.settings.success_frames,
            launch_timeout_secs = self.settings.launch_timeout_secs,
            "session.start"
        );

        while !cancel.is_cancelled() {
            self.tick(now_ts());
            if !signals::sleep_or_cancel(&cancel, self.settings.poll_interval).await {
                break;
            }
        }

        let now = now_ts();
        self.persist(now);
        self.write_heartbeat(now);
        info!(state = %self.session().state, replay.file = ?self.session().replay, "session.stop");
        Ok(())
    }
}

fn log_relocation(name: &str, dest: &str, result: Result<(), MoveError>) {
    match result {
        Ok(()) => info!(replay.file = %name, dest, "replay moved"),
        Err(MoveError::SourceMissing { .. }) => {
            debug!(replay.file = %name, dest, "replay already gone from active/")
        }
        Err(e) => warn!(replay.file = %name, dest, error = %e, "failed to move replay"),
    }
}
