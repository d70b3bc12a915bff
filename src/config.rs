use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from `nexus.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub storage: StorageConfig,
    pub supervisor: SupervisorConfig,
    pub children: Vec<ChildConfig>,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub interval_secs: f64,
    pub max_restarts: u32,
    pub base_backoff_secs: f64,
    pub backoff_factor: f64,
    pub max_backoff_secs: f64,
    pub shutdown_grace_secs: f64,
    /// Names of children to spawn. Empty means all of them.
    pub spawn: Vec<String>,
    /// Append child stdout/stderr to `state/logs/<child>.{out,err}.log`.
    pub capture_child_output: bool,
}

/// One supervised worker process.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChildConfig {
    pub name: String,
    pub command: Vec<String>,
    /// Working directory, relative paths resolve against `storage.base_dir`.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub launch_success_frames: u32,
    pub launch_timeout_secs: f64,
    pub active_duration_secs: f64,
    pub ended_delay_secs: f64,
    pub poll_interval_secs: f64,
    pub heartbeat_interval_secs: f64,
    pub queue_pattern: String,
    pub unrecoverable_reasons: Vec<String>,
    pub capture_heartbeat_max_age_secs: Option<f64>,
    pub requeue_orphans: bool,
    /// Opener argv; the replay path is appended as the final argument.
    pub launcher: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

// --- Default implementations ---

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            supervisor: SupervisorConfig::default(),
            children: default_children(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 2.0,
            max_restarts: 5,
            base_backoff_secs: 2.0,
            backoff_factor: 1.5,
            max_backoff_secs: 30.0,
            shutdown_grace_secs: 3.0,
            spawn: Vec::new(),
            capture_child_output: false,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            launch_success_frames: 3,
            launch_timeout_secs: 90.0,
            active_duration_secs: 10.0,
            ended_delay_secs: 3.0,
            poll_interval_secs: 1.0,
            heartbeat_interval_secs: 2.0,
            queue_pattern: "*.StormReplay".to_string(),
            unrecoverable_reasons: vec!["no_window".to_string(), "too_small".to_string()],
            capture_heartbeat_max_age_secs: None,
            requeue_orphans: false,
            launcher: default_launcher(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

fn default_launcher() -> Vec<String> {
    if cfg!(target_os = "macos") {
        vec!["open".to_string()]
    } else {
        vec!["xdg-open".to_string()]
    }
}

fn child(name: &str, command: &[&str]) -> ChildConfig {
    ChildConfig {
        name: name.to_string(),
        command: command.iter().map(|s| s.to_string()).collect(),
        cwd: None,
    }
}

/// The capture pipeline as it ships: native capture, game control,
/// replay harvesting, the session manager and detection.
fn default_children() -> Vec<ChildConfig> {
    vec![
        child("capture", &["build/cpp/capture/Debug/hots_capture.exe"]),
        child(
            "control",
            &["dotnet", "run", "--project", "src/game-controller/Control.csproj"],
        ),
        child(
            "harvester",
            &["dotnet", "run", "--project", "src/replay-harvestor/Harvester.csproj"],
        ),
        child("session-manager", &["nexus-harness", "session"]),
        child("detection", &["uv", "run", "python", "-m", "detection.service"]),
    ]
}

/// Values supplied through the environment or CLI flags. `None` leaves
/// the file value in place.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub base_dir: Option<PathBuf>,
    pub spawn: Option<Vec<String>>,
    pub capture_child_output: Option<bool>,
    pub launch_success_frames: Option<u32>,
    pub launch_timeout_secs: Option<f64>,
    pub active_duration_secs: Option<f64>,
    pub log_level: Option<String>,
}

impl HarnessConfig {
    /// Load from `path`. A missing file yields the defaults; a file that
    /// exists but does not parse is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(dir) = overrides.base_dir {
            self.storage.base_dir = dir;
        }
        if let Some(spawn) = overrides.spawn {
            self.supervisor.spawn = spawn
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(capture) = overrides.capture_child_output {
            self.supervisor.capture_child_output = capture;
        }
        if let Some(frames) = overrides.launch_success_frames {
            self.session.launch_success_frames = frames;
        }
        if let Some(timeout) = overrides.launch_timeout_secs {
            self.session.launch_timeout_secs = timeout;
        }
        if let Some(active) = overrides.active_duration_secs {
            self.session.active_duration_secs = active;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        if let Some(level) = level_filter(&self.logging.level) {
            self.logging.level = level.to_string().to_lowercase();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sup = &self.supervisor;
        let ses = &self.session;
        for (field, value) in [
            ("supervisor.interval_secs", sup.interval_secs),
            ("supervisor.base_backoff_secs", sup.base_backoff_secs),
            ("supervisor.max_backoff_secs", sup.max_backoff_secs),
            ("supervisor.shutdown_grace_secs", sup.shutdown_grace_secs),
            ("session.launch_timeout_secs", ses.launch_timeout_secs),
            ("session.active_duration_secs", ses.active_duration_secs),
            ("session.ended_delay_secs", ses.ended_delay_secs),
            ("session.poll_interval_secs", ses.poll_interval_secs),
            ("session.heartbeat_interval_secs", ses.heartbeat_interval_secs),
        ] {
            check_duration(field, value)?;
        }
        if let Some(age) = ses.capture_heartbeat_max_age_secs {
            check_duration("session.capture_heartbeat_max_age_secs", age)?;
        }
        if !(sup.backoff_factor.is_finite() && sup.backoff_factor >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "supervisor.backoff_factor must be >= 1, got {}",
                sup.backoff_factor
            )));
        }
        if sup.base_backoff_secs > sup.max_backoff_secs {
            return Err(ConfigError::Invalid(format!(
                "supervisor.base_backoff_secs ({}) exceeds max_backoff_secs ({})",
                sup.base_backoff_secs, sup.max_backoff_secs
            )));
        }
        if ses.launch_success_frames == 0 {
            return Err(ConfigError::Invalid(
                "session.launch_success_frames must be at least 1".to_string(),
            ));
        }
        if ses.launcher.is_empty() {
            return Err(ConfigError::Invalid(
                "session.launcher must name a command".to_string(),
            ));
        }
        if level_filter(&self.logging.level).is_none() {
            return Err(ConfigError::Invalid(format!(
                "logging.level {:?} is not one of trace, debug, info, warn(ing), error, critical, off",
                self.logging.level
            )));
        }
        if let Err(e) = glob::Pattern::new(&ses.queue_pattern) {
            return Err(ConfigError::Invalid(format!(
                "session.queue_pattern {:?} is not a valid glob: {e}",
                ses.queue_pattern
            )));
        }

        let mut seen = HashSet::new();
        for c in &self.children {
            if c.name.trim().is_empty() {
                return Err(ConfigError::Invalid("child with empty name".to_string()));
            }
            if !seen.insert(c.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate child name {:?}",
                    c.name
                )));
            }
            if c.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "child {:?} has an empty command",
                    c.name
                )));
            }
        }
        for name in &sup.spawn {
            if !seen.contains(name.as_str()) {
                tracing::warn!(child = %name, "spawn allow-list names an unknown child");
            }
        }
        Ok(())
    }

    /// Children selected by the spawn allow-list, in configuration order.
    pub fn selected_children(&self) -> Vec<ChildConfig> {
        if self.supervisor.spawn.is_empty() {
            return self.children.clone();
        }
        self.children
            .iter()
            .filter(|c| self.supervisor.spawn.iter().any(|s| s == &c.name))
            .cloned()
            .collect()
    }

    /// Working directory for a child: absolute paths as given, relative
    /// paths and the default both anchored at the base directory.
    pub fn child_cwd(&self, child: &ChildConfig) -> PathBuf {
        match &child.cwd {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.storage.base_dir.join(dir),
            None => self.storage.base_dir.clone(),
        }
    }
}

/// Parse a level name, accepting the pipeline's `warning` and `critical`
/// spellings. Anything else is rejected rather than read as a target.
pub fn level_filter(level: &str) -> Option<LevelFilter> {
    match level.trim().to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::OFF),
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" | "critical" => Some(LevelFilter::ERROR),
        _ => None,
    }
}

fn check_duration(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{field} must be a non-negative number of seconds, got {value}"
        )))
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}
