use serde::{Deserialize, Serialize};
use std::fmt;

pub const SCHEMA_VERSION: u32 = 1;
pub const DOCUMENT_VERSION: u32 = 1;

/// Lifecycle of one replay session.
///
/// ```text
/// IDLE/COMPLETED/ABORTED/CORRUPT --claim--> QUEUED --launch--> LAUNCHING
/// LAUNCHING --N consecutive capture successes--> ACTIVE --duration--> ENDED --delay--> COMPLETED
/// LAUNCHING --timeout, unrecoverable reason--> CORRUPT
/// LAUNCHING --timeout, anything else--> ABORTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    #[default]
    Idle,
    Queued,
    Launching,
    Active,
    Ended,
    Completed,
    Aborted,
    Corrupt,
}

impl SessionState {
    /// States from which the manager tries to claim the next replay.
    pub fn is_recyclable(self) -> bool {
        matches!(
            self,
            SessionState::Idle
                | SessionState::Completed
                | SessionState::Aborted
                | SessionState::Corrupt
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::Queued => "QUEUED",
            SessionState::Launching => "LAUNCHING",
            SessionState::Active => "ACTIVE",
            SessionState::Ended => "ENDED",
            SessionState::Completed => "COMPLETED",
            SessionState::Aborted => "ABORTED",
            SessionState::Corrupt => "CORRUPT",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timestamp per major transition, UNIX epoch seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timestamps {
    pub claimed: Option<f64>,
    pub launch: Option<f64>,
    /// Never set; kept so existing readers of the document keep working.
    pub loading: Option<f64>,
    pub active: Option<f64>,
    pub ended: Option<f64>,
    pub completed: Option<f64>,
    pub aborted: Option<f64>,
}

/// The in-memory session record. Exactly one per manager process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub replay: Option<String>,
    pub state: SessionState,
    pub timestamps: Timestamps,
    pub consecutive_success_frames: u32,
}

impl Session {
    /// A fresh record holding a just-claimed replay.
    pub fn claimed(replay: String, now: f64) -> Self {
        Self {
            replay: Some(replay),
            state: SessionState::Queued,
            timestamps: Timestamps {
                claimed: Some(now),
                ..Default::default()
            },
            consecutive_success_frames: 0,
        }
    }

    /// True while a replay is held and still being worked on.
    pub fn holds_in_flight_replay(&self) -> bool {
        self.replay.is_some() && !self.state.is_recyclable()
    }

    pub fn to_document(&self, success_frames_required: u32, updated_ts: f64) -> SessionDocument {
        SessionDocument {
            schema_version: SCHEMA_VERSION,
            replay: self.replay.clone(),
            state: self.state,
            timestamps: self.timestamps.clone(),
            metrics: SessionMetrics {
                consecutive_success_frames: self.consecutive_success_frames,
                launch_success_frames_required: success_frames_required,
            },
            updated_ts,
            version: DOCUMENT_VERSION,
        }
    }

    pub fn to_heartbeat(&self, ts: f64) -> SessionHeartbeat {
        SessionHeartbeat {
            service: "session-manager".to_string(),
            role: "lifecycle".to_string(),
            state: self.state,
            replay: self.replay.clone(),
            ts,
            schema_version: SCHEMA_VERSION,
            version: DOCUMENT_VERSION,
        }
    }
}

/// `state/session.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    pub schema_version: u32,
    pub replay: Option<String>,
    pub state: SessionState,
    pub timestamps: Timestamps,
    pub metrics: SessionMetrics,
    pub updated_ts: f64,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub consecutive_success_frames: u32,
    pub launch_success_frames_required: u32,
}

/// `state/heartbeat_session.json`, the lightweight liveness document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHeartbeat {
    pub service: String,
    pub role: String,
    pub state: SessionState,
    pub replay: Option<String>,
    pub ts: f64,
    pub schema_version: u32,
    pub version: u32,
}

/// `state/session_service.json`, written once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMeta {
    pub service: String,
    pub schema_version: u32,
    pub created_ts: f64,
    pub notes: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_serialize_uppercase() {
        let cases = [
            (SessionState::Idle, "IDLE"),
            (SessionState::Queued, "QUEUED"),
            (SessionState::Launching, "LAUNCHING"),
            (SessionState::Active, "ACTIVE"),
            (SessionState::Ended, "ENDED"),
            (SessionState::Completed, "COMPLETED"),
            (SessionState::Aborted, "ABORTED"),
            (SessionState::Corrupt, "CORRUPT"),
        ];
        for (state, expected) in cases {
            assert_eq!(serde_json::to_string(&state).unwrap(), format!("\"{expected}\""));
            assert_eq!(state.to_string(), expected);
        }
    }

    #[test]
    fn test_recyclable_states() {
        assert!(SessionState::Idle.is_recyclable());
        assert!(SessionState::Completed.is_recyclable());
        assert!(SessionState::Aborted.is_recyclable());
        assert!(SessionState::Corrupt.is_recyclable());
        assert!(!SessionState::Queued.is_recyclable());
        assert!(!SessionState::Launching.is_recyclable());
        assert!(!SessionState::Active.is_recyclable());
        assert!(!SessionState::Ended.is_recyclable());
    }

    #[test]
    fn test_in_flight_only_outside_recyclable_states() {
        let mut s = Session::claimed("a.StormReplay".to_string(), 10.0);
        assert!(s.holds_in_flight_replay());
        s.state = SessionState::Completed;
        assert!(!s.holds_in_flight_replay());
        assert!(!Session::default().holds_in_flight_replay());
    }

    #[test]
    fn test_document_shape() {
        let mut s = Session::claimed("match.StormReplay".to_string(), 100.5);
        s.consecutive_success_frames = 2;
        let json = serde_json::to_value(s.to_document(3, 101.0)).unwrap();
        assert_eq!(json["schema_version"], 1);
        assert_eq!(json["version"], 1);
        assert_eq!(json["replay"], "match.StormReplay");
        assert_eq!(json["state"], "QUEUED");
        assert_eq!(json["timestamps"]["claimed"], 100.5);
        for key in ["launch", "loading", "active", "ended", "completed", "aborted"] {
            assert!(json["timestamps"][key].is_null(), "{key} should be null");
        }
        assert_eq!(json["metrics"]["consecutive_success_frames"], 2);
        assert_eq!(json["metrics"]["launch_success_frames_required"], 3);
        assert_eq!(json["updated_ts"], 101.0);
    }

    #[test]
    fn test_heartbeat_shape() {
        let json = serde_json::to_value(Session::default().to_heartbeat(5.0)).unwrap();
        assert_eq!(json["service"], "session-manager");
        assert_eq!(json["role"], "lifecycle");
        assert_eq!(json["state"], "IDLE");
        assert!(json["replay"].is_null());
        assert_eq!(json["ts"], 5.0);
        assert_eq!(json["schema_version"], 1);
    }
}
