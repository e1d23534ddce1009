use crate::error::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "WM_HARNESS_";

/// Fixed-interval retry ceiling for one polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    pub attempts: u32,
    pub interval_ms: u64,
}

impl RetryBudget {
    /// Bring-up of external processes (nested server): ~5s.
    pub const FIRST_CONTACT: RetryBudget = RetryBudget {
        attempts: 50,
        interval_ms: 100,
    };

    /// Confirmations against an already running subject: ~2s.
    pub const STEADY_STATE: RetryBudget = RetryBudget {
        attempts: 20,
        interval_ms: 100,
    };

    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            interval_ms: interval.as_millis() as u64,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn total(&self) -> Duration {
        self.interval() * self.attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    pub first_contact: RetryBudget,
    pub steady_state: RetryBudget,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            first_contact: RetryBudget::FIRST_CONTACT,
            steady_state: RetryBudget::STEADY_STATE,
        }
    }
}

/// How to launch the nested display server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub binary: PathBuf,
    /// Inserted before the display name, e.g. `["-keybd", "evdev"]`.
    pub extra_args: Vec<String>,
    pub settle_ms: u64,
    pub env: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("Xephyr"),
            extra_args: Vec::new(),
            settle_ms: 50,
            env: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// How to launch the window manager under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectConfig {
    pub binary: PathBuf,
    /// Argument template; `{display}` and `{socket}` are substituted.
    pub args: Vec<String>,
    pub config_path: Option<PathBuf>,
    pub config_flag: String,
    pub testing: bool,
    pub testing_flag: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for SubjectConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("qtile"),
            args: vec![
                "start".into(),
                "--socket".into(),
                "{socket}".into(),
            ],
            config_path: None,
            config_flag: "--config".into(),
            testing: true,
            testing_flag: None,
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory holding `.X<N>-lock` markers and harness reservations.
    pub lock_dir: PathBuf,
    /// Directory holding the `X<N>` listening sockets.
    pub x11_socket_dir: PathBuf,
    pub min_display: u32,
    pub max_display: u32,
    pub socket_name: String,
    /// Minimal built-in test client, run as `<client> <display> <name>`.
    pub window_client: PathBuf,
    pub ipc_timeout_ms: u64,
    pub poll: PollPolicy,
    pub server: ServerConfig,
    pub subject: SubjectConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            lock_dir: PathBuf::from("/tmp"),
            x11_socket_dir: PathBuf::from("/tmp/.X11-unix"),
            min_display: 1,
            max_display: 1023,
            socket_name: "qtilesocket".into(),
            window_client: PathBuf::from("scripts/window"),
            ipc_timeout_ms: 1_000,
            poll: PollPolicy::default(),
            server: ServerConfig::default(),
            subject: SubjectConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Defaults overlaid with `WM_HARNESS_*` environment variables.
    pub fn from_env() -> HarnessResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Reads a TOML file; missing keys fall back to defaults.
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|err| HarnessError::Config(format!("{}: {err}", path.display())))
    }

    pub fn apply_env(&mut self) -> HarnessResult<()> {
        if let Some(value) = env_path("LOCK_DIR") {
            self.lock_dir = value;
        }
        if let Some(value) = env_path("X11_SOCKET_DIR") {
            self.x11_socket_dir = value;
        }
        if let Some(value) = env_parse::<u32>("MIN_DISPLAY")? {
            self.min_display = value;
        }
        if let Some(value) = env_parse::<u32>("MAX_DISPLAY")? {
            self.max_display = value;
        }
        if let Some(value) = env_path("SERVER_BIN") {
            self.server.binary = value;
        }
        if let Some(value) = env_path("SUBJECT_BIN") {
            self.subject.binary = value;
        }
        if let Some(value) = env_path("SUBJECT_CONFIG") {
            self.subject.config_path = Some(value);
        }
        if let Some(value) = env_path("WINDOW_CLIENT") {
            self.window_client = value;
        }
        if let Some(value) = env_parse::<u64>("IPC_TIMEOUT_MS")? {
            self.ipc_timeout_ms = value;
        }
        if let Some(value) = env_parse::<u32>("FIRST_CONTACT_ATTEMPTS")? {
            self.poll.first_contact.attempts = value;
        }
        if let Some(value) = env_parse::<u32>("STEADY_STATE_ATTEMPTS")? {
            self.poll.steady_state.attempts = value;
        }
        if let Some(value) = env_parse::<u64>("POLL_INTERVAL_MS")? {
            self.poll.first_contact.interval_ms = value;
            self.poll.steady_state.interval_ms = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.min_display > self.max_display {
            return Err(HarnessError::Config(format!(
                "min_display {} exceeds max_display {}",
                self.min_display, self.max_display
            )));
        }
        if self.poll.first_contact.attempts == 0 || self.poll.steady_state.attempts == 0 {
            return Err(HarnessError::Config(
                "poll budgets need at least one attempt".into(),
            ));
        }
        if self.socket_name.is_empty() || self.socket_name.contains('/') {
            return Err(HarnessError::Config(format!(
                "invalid socket name '{}'",
                self.socket_name
            )));
        }
        Ok(())
    }

    pub fn ipc_timeout(&self) -> Duration {
        Duration::from_millis(self.ipc_timeout_ms)
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_value(key).map(PathBuf::from)
}

fn env_parse<T>(key: &str) -> HarnessResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_value(key) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|err| {
            HarnessError::Config(format!("{ENV_PREFIX}{key}='{raw}': {err}"))
        }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variable tests must not interleave.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn defaults_match_two_tier_policy() {
        let config = HarnessConfig::default();
        assert_eq!(config.poll.first_contact.total(), Duration::from_secs(5));
        assert_eq!(config.poll.steady_state.total(), Duration::from_secs(2));
        assert_eq!(config.min_display, 1);
        assert_eq!(config.socket_name, "qtilesocket");
        config.validate().unwrap();
    }

    #[test]
    fn toml_overrides_only_given_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        fs::write(
            &path,
            r#"
lock_dir = "/var/tmp/locks"

[poll.steady_state]
attempts = 40
interval_ms = 50

[server]
binary = "/usr/bin/Xephyr"
extra_args = ["-keybd", "evdev"]
"#,
        )
        .unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.lock_dir, PathBuf::from("/var/tmp/locks"));
        assert_eq!(config.poll.steady_state, RetryBudget::new(40, Duration::from_millis(50)));
        assert_eq!(config.poll.first_contact, RetryBudget::FIRST_CONTACT);
        assert_eq!(config.server.extra_args, vec!["-keybd", "evdev"]);
        assert_eq!(config.server.settle_ms, 50);
        assert_eq!(config.subject, SubjectConfig::default());
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "min_display = \"seven\"").unwrap();
        let err = HarnessConfig::load(&path).unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn env_overrides_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("WM_HARNESS_MIN_DISPLAY", "20");
            env::set_var("WM_HARNESS_POLL_INTERVAL_MS", "25");
            env::set_var("WM_HARNESS_SUBJECT_BIN", "/opt/wm/bin/wm");
        }
        let config = HarnessConfig::from_env();
        unsafe {
            env::remove_var("WM_HARNESS_MIN_DISPLAY");
            env::remove_var("WM_HARNESS_POLL_INTERVAL_MS");
            env::remove_var("WM_HARNESS_SUBJECT_BIN");
        }

        let config = config.unwrap();
        assert_eq!(config.min_display, 20);
        assert_eq!(config.poll.first_contact.interval_ms, 25);
        assert_eq!(config.poll.steady_state.interval_ms, 25);
        assert_eq!(config.subject.binary, PathBuf::from("/opt/wm/bin/wm"));
    }

    #[test]
    fn unparsable_env_value_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("WM_HARNESS_STEADY_STATE_ATTEMPTS", "lots");
        }
        let result = HarnessConfig::from_env();
        unsafe {
            env::remove_var("WM_HARNESS_STEADY_STATE_ATTEMPTS");
        }
        assert!(matches!(result, Err(HarnessError::Config(_))));
    }

    #[test]
    fn validate_rejects_inverted_display_range() {
        let config = HarnessConfig {
            min_display: 10,
            max_display: 5,
            ..HarnessConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
