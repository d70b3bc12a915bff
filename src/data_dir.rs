use std::path::{Path, PathBuf};

/// Manages the on-disk layout shared by the supervisor and the session manager.
///
/// Replay files move between the four stage directories (`queue/`, `active/`,
/// `completed/`, `corrupt/`); heartbeats, session documents and logs live
/// under `state/`.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Layout rooted at `root` (the configured `storage.base_dir`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replays waiting to be claimed.
    pub fn queue_dir(&self) -> PathBuf {
        self.root.join("queue")
    }

    /// Replays claimed by a session manager and in progress.
    pub fn active_dir(&self) -> PathBuf {
        self.root.join("active")
    }

    /// Archive of replays that played through.
    pub fn completed_dir(&self) -> PathBuf {
        self.root.join("completed")
    }

    /// Quarantine for replays that can never launch.
    pub fn corrupt_dir(&self) -> PathBuf {
        self.root.join("corrupt")
    }

    /// Heartbeats, session documents and logs.
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    /// Service logs and captured child output.
    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }

    /// Fleet heartbeat written by the supervisor.
    pub fn fleet_heartbeat(&self) -> PathBuf {
        self.state_dir().join("heartbeat_orchestrator.json")
    }

    /// Current session record, rewritten on every change.
    pub fn session_document(&self) -> PathBuf {
        self.state_dir().join("session.json")
    }

    /// Liveness heartbeat of the session manager.
    pub fn session_heartbeat(&self) -> PathBuf {
        self.state_dir().join("heartbeat_session.json")
    }

    /// Session manager metadata, written once.
    pub fn session_service(&self) -> PathBuf {
        self.state_dir().join("session_service.json")
    }

    /// Written by the capture worker, read-only from our side.
    pub fn capture_heartbeat(&self) -> PathBuf {
        self.state_dir().join("heartbeat_capture.json")
    }

    /// Structured log file for one of our own services.
    pub fn service_log(&self, service: &str) -> PathBuf {
        self.logs_dir().join(format!("{service}.log"))
    }

    /// Stdout/stderr capture files for a supervised child.
    pub fn child_logs(&self, child: &str) -> (PathBuf, PathBuf) {
        let logs = self.logs_dir();
        (
            logs.join(format!("{child}.out.log")),
            logs.join(format!("{child}.err.log")),
        )
    }

    /// Create every directory of the layout.
    /// Returns Ok(true) if the root was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        for dir in [
            self.queue_dir(),
            self.active_dir(),
            self.completed_dir(),
            self.corrupt_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_paths() {
        let dd = DataDir::new("/srv/nexus");
        assert_eq!(dd.root(), Path::new("/srv/nexus"));
        assert_eq!(dd.queue_dir(), PathBuf::from("/srv/nexus/queue"));
        assert_eq!(dd.active_dir(), PathBuf::from("/srv/nexus/active"));
        assert_eq!(dd.completed_dir(), PathBuf::from("/srv/nexus/completed"));
        assert_eq!(dd.corrupt_dir(), PathBuf::from("/srv/nexus/corrupt"));
        assert_eq!(
            dd.fleet_heartbeat(),
            PathBuf::from("/srv/nexus/state/heartbeat_orchestrator.json")
        );
        assert_eq!(
            dd.session_document(),
            PathBuf::from("/srv/nexus/state/session.json")
        );
        assert_eq!(
            dd.capture_heartbeat(),
            PathBuf::from("/srv/nexus/state/heartbeat_capture.json")
        );
        assert_eq!(dd.state_dir(), PathBuf::from("/srv/nexus/state"));
        assert_eq!(
            dd.session_heartbeat(),
            PathBuf::from("/srv/nexus/state/heartbeat_session.json")
        );
        assert_eq!(
            dd.session_service(),
            PathBuf::from("/srv/nexus/state/session_service.json")
        );
        assert_eq!(
            dd.service_log("orchestrator"),
            PathBuf::from("/srv/nexus/state/logs/orchestrator.log")
        );
    }

    #[test]
    fn test_child_log_paths() {
        let dd = DataDir::new("root");
        let (out, err) = dd.child_logs("capture");
        assert_eq!(out, PathBuf::from("root/state/logs/capture.out.log"));
        assert_eq!(err, PathBuf::from("root/state/logs/capture.err.log"));
    }

    #[test]
    fn test_init_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path().join("nexus"));

        assert!(dd.init().unwrap());
        for dir in [
            dd.queue_dir(),
            dd.active_dir(),
            dd.completed_dir(),
            dd.corrupt_dir(),
            dd.state_dir(),
            dd.logs_dir(),
        ] {
            assert!(dir.is_dir(), "{} missing", dir.display());
        }
    }

    #[test]
    fn test_init_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path().join("nexus"));
        assert!(dd.init().unwrap());
        std::fs::write(dd.queue_dir().join("a.StormReplay"), b"x").unwrap();
        assert!(!dd.init().unwrap());
        assert!(dd.queue_dir().join("a.StormReplay").exists());
    }
}
