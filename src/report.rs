//! `nexus-harness status`: a read-only view over the persisted documents.

use crate::data_dir::DataDir;
use crate::session::state::{SessionDocument, SessionHeartbeat};
use crate::status::read_json;
use crate::supervisor::FleetSnapshot;
use serde::Serialize;
use std::fmt::Write;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub fleet: Option<FleetSnapshot>,
    pub session: Option<SessionDocument>,
    pub session_heartbeat: Option<SessionHeartbeat>,
}

impl StatusReport {
    /// Missing or unreadable documents load as `None`.
    pub fn load(data_dir: &DataDir) -> Self {
        Self {
            fleet: read_json(&data_dir.fleet_heartbeat()),
            session: read_json(&data_dir.session_document()),
            session_heartbeat: read_json(&data_dir.session_heartbeat()),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Human summary; `now` is epoch seconds used for the age columns.
    pub fn render(&self, now: f64) -> String {
        let mut out = String::new();
        match &self.fleet {
            None => out.push_str("supervisor: not running\n"),
            Some(fleet) => {
                let _ = writeln!(
                    out,
                    "supervisor: loop {} (updated {} ago){}",
                    fleet.loop_iter,
                    age(now, fleet.ts),
                    if fleet.all_failed { ", ALL CHILDREN FAILED" } else { "" }
                );
                let _ = writeln!(
                    out,
                    "  {:<18} {:<8} {:<9} {:<8} {:<6} BACKOFF",
                    "CHILD", "PID", "RESTARTS", "FAILED", "EXIT"
                );
                for c in &fleet.children {
                    let _ = writeln!(
                        out,
                        "  {:<18} {:<8} {:<9} {:<8} {:<6} {:.1}s",
                        c.name,
                        c.pid.map_or("-".to_string(), |p| p.to_string()),
                        c.restarts,
                        if c.failed { "yes" } else { "no" },
                        c.returncode.map_or("-".to_string(), |r| r.to_string()),
                        c.backoff
                    );
                }
            }
        }

        match &self.session {
            None => out.push_str("session: not running\n"),
            Some(doc) => {
                let _ = writeln!(
                    out,
                    "session: {} {} (updated {} ago)",
                    doc.state,
                    doc.replay.as_deref().unwrap_or("-"),
                    age(now, doc.updated_ts)
                );
                let _ = writeln!(
                    out,
                    "  success frames {}/{}",
                    doc.metrics.consecutive_success_frames, doc.metrics.launch_success_frames_required
                );
            }
        }
        if let Some(hb) = &self.session_heartbeat {
            let _ = writeln!(out, "  heartbeat {} ago", age(now, hb.ts));
        }
        out
    }
}

fn age(now: f64, ts: f64) -> String {
    format!("{:.1}s", (now - ts).max(0.0))
}
