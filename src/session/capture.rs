use serde::Deserialize;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// The capture worker's heartbeat as far as launch detection cares.
///
/// Any other fields the worker writes are ignored. The failure code has
/// been published under both `result` and `reason`; `result` wins.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CaptureHeartbeat {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl CaptureHeartbeat {
    pub fn reason(&self) -> Option<&str> {
        self.result.as_deref().or(self.reason.as_deref())
    }
}

/// Read the capture heartbeat. Absent, unparseable, or older than
/// `max_age` all mean "no signal".
pub fn read_capture_heartbeat(path: &Path, max_age: Option<Duration>) -> Option<CaptureHeartbeat> {
    if let Some(max_age) = max_age {
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age > max_age {
            tracing::debug!(path = %path.display(), age_secs = age.as_secs_f64(), "capture heartbeat is stale");
            return None;
        }
    }
    crate::status::read_json(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::tempdir;

    #[test]
    fn test_success_heartbeat() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heartbeat_capture.json");
        std::fs::write(&path, r#"{"success": true, "fps": 60, "ts": 1.0}"#).unwrap();
        let hb = read_capture_heartbeat(&path, None).unwrap();
        assert!(hb.success);
        assert_eq!(hb.reason(), None);
    }

    #[test]
    fn test_reason_prefers_result_field() {
        let hb: CaptureHeartbeat =
            serde_json::from_str(r#"{"success": false, "result": "no_window", "reason": "other"}"#)
                .unwrap();
        assert_eq!(hb.reason(), Some("no_window"));

        let hb: CaptureHeartbeat =
            serde_json::from_str(r#"{"success": false, "reason": "too_small"}"#).unwrap();
        assert_eq!(hb.reason(), Some("too_small"));
    }

    #[test]
    fn test_missing_success_field_is_failure() {
        let hb: CaptureHeartbeat = serde_json::from_str(r#"{"result": "starting"}"#).unwrap();
        assert!(!hb.success);
    }

    #[test]
    fn test_missing_or_malformed_is_no_signal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heartbeat_capture.json");
        assert!(read_capture_heartbeat(&path, None).is_none());
        std::fs::write(&path, "{\"success\": tr").unwrap();
        assert!(read_capture_heartbeat(&path, None).is_none());
    }

    #[test]
    fn test_stale_heartbeat_is_no_signal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("heartbeat_capture.json");
        std::fs::write(&path, r#"{"success": true}"#).unwrap();

        let max_age = Some(Duration::from_secs(5));
        assert!(read_capture_heartbeat(&path, max_age).is_some());

        let old = FileTime::from_unix_time(FileTime::now().unix_seconds() - 60, 0);
        filetime::set_file_mtime(&path, old).unwrap();
        assert!(read_capture_heartbeat(&path, max_age).is_none());
        // Without a max age the same document is still honored.
        assert!(read_capture_heartbeat(&path, None).is_some());
    }
}
