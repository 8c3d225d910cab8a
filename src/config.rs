use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::{ReconnectPolicy, unit_fraction};

// ── Profile ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Backend base URL; `/api/...` paths are appended
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Optional API key (sent as Bearer token)
    pub api_key: Option<String>,
    /// First reconnect delay in milliseconds; doubles per failed retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a single reconnect delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive failed retries before giving up (state becomes Disconnected)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Random upward stretch of each delay, 0.0 – 1.0
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// A typing indicator with no stop event is cleared after this long
    #[serde(default = "default_typing_timeout_secs")]
    pub typing_timeout_secs: u64,
    /// Timeline entries fetched per channel when it first shows up
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_status_poll_secs")]
    pub status_poll_secs: u64,
    #[serde(default = "default_channels_poll_secs")]
    pub channels_poll_secs: u64,
    #[serde(default = "default_agents_poll_secs")]
    pub agents_poll_secs: u64,
}

fn default_endpoint() -> String {
    "http://localhost:19898".to_string()
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    8
}

fn default_jitter() -> f64 {
    0.2
}

fn default_typing_timeout_secs() -> u64 {
    15
}

fn default_history_limit() -> usize {
    50
}

fn default_status_poll_secs() -> u64 {
    5
}

fn default_channels_poll_secs() -> u64 {
    10
}

fn default_agents_poll_secs() -> u64 {
    30
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
            jitter: default_jitter(),
            typing_timeout_secs: default_typing_timeout_secs(),
            history_limit: default_history_limit(),
            status_poll_secs: default_status_poll_secs(),
            channels_poll_secs: default_channels_poll_secs(),
            agents_poll_secs: default_agents_poll_secs(),
        }
    }
}

// ── Config file ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Which profile to use when none is specified
    #[serde(default = "default_profile_name")]
    pub default_profile: String,

    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

fn default_profile_name() -> String {
    "default".to_string()
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            default_profile: default_profile_name(),
            profiles: HashMap::new(),
        }
    }
}

impl ConfigFile {
    /// Load from disk, or return a default config if the file doesn't exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))
    }

    /// Write a starter config file to disk (only if it doesn't exist).
    pub fn write_default_if_missing() -> Result<PathBuf> {
        let path = config_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, DEFAULT_CONFIG_TOML)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Resolve the active profile given an optional override name.
    pub fn resolve_profile(&self, name: Option<&str>) -> Option<&Profile> {
        let key = name.unwrap_or(&self.default_profile);
        self.profiles.get(key)
    }
}

// ── Resolved runtime config (after merging file + CLI overrides) ──────────────

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Profile name that was resolved (for display)
    pub profile_name: String,
    pub reconnect: ReconnectPolicy,
    pub typing_timeout: Duration,
    pub history_limit: usize,
    pub status_poll: Duration,
    pub channels_poll: Duration,
    pub agents_poll: Duration,
}

impl ResolvedConfig {
    /// Merge config file profile with CLI overrides.
    /// Priority: CLI args > env vars (handled by clap) > config file profile > built-in defaults
    pub fn resolve(
        file: &ConfigFile,
        profile_override: Option<&str>,
        endpoint_override: Option<&str>,
        api_key_override: Option<&str>,
    ) -> Self {
        let profile_name = profile_override
            .unwrap_or(&file.default_profile)
            .to_string();

        let base = file
            .resolve_profile(profile_override)
            .cloned()
            .unwrap_or_default();

        Self {
            endpoint: endpoint_override
                .map(str::to_string)
                .unwrap_or(base.endpoint),
            api_key: api_key_override
                .map(str::to_string)
                .or(base.api_key),
            profile_name,
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(base.base_delay_ms),
                max_delay: Duration::from_millis(base.max_delay_ms.max(base.base_delay_ms)),
                max_retries: base.max_retries,
                jitter: unit_fraction(base.jitter),
            },
            typing_timeout: Duration::from_secs(base.typing_timeout_secs),
            history_limit: base.history_limit,
            // Zero would make tokio::time::interval panic
            status_poll: Duration::from_secs(base.status_poll_secs.max(1)),
            channels_poll: Duration::from_secs(base.channels_poll_secs.max(1)),
            agents_poll: Duration::from_secs(base.agents_poll_secs.max(1)),
        }
    }
}

// ── Paths ─────────────────────────────────────────────────────────────────────

pub fn config_path() -> PathBuf {
    dirs_config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("livedeck")
        .join("config.toml")
}

fn dirs_config_dir() -> Option<PathBuf> {
    // XDG_CONFIG_HOME or ~/.config on Linux/macOS
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        })
}

// ── Default config template written on first run ──────────────────────────────

const DEFAULT_CONFIG_TOML: &str = r#"# livedeck configuration
# Run `livedeck --init` to regenerate this file.

default_profile = "local"

# ── Local backend (default) ──────────────────────────────────────────────────
[profiles.local]
endpoint = "http://localhost:19898"
# api_key is not needed for a local backend

# ── Remote backend behind auth ───────────────────────────────────────────────
# [profiles.prod]
# endpoint = "https://agents.example.com"
# api_key  = "..."

# ── Reconnect tuning (optional, per-profile) ─────────────────────────────────
# base_delay_ms = 1000         # first retry delay, doubled per failed retry
# max_delay_ms  = 30000        # cap for a single delay
# max_retries   = 8            # consecutive failures before giving up
# jitter        = 0.2          # random upward stretch of each delay (0.0 - 1.0)

# ── Dashboard behaviour (optional, per-profile) ──────────────────────────────
# typing_timeout_secs = 15     # clear a typing indicator that never got its stop
# history_limit       = 50     # timeline entries loaded per channel
# status_poll_secs    = 5
# channels_poll_secs  = 10
# agents_poll_secs    = 30
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_template_parses() {
        let file: ConfigFile = toml::from_str(DEFAULT_CONFIG_TOML).unwrap();
        assert_eq!(file.default_profile, "local");
        let local = file.resolve_profile(None).unwrap();
        assert_eq!(local.endpoint, "http://localhost:19898");
        assert_eq!(local.max_retries, 8);
        assert_eq!(local.typing_timeout_secs, 15);
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::load_from(&dir.path().join("absent.toml")).unwrap();
        assert!(file.profiles.is_empty());
        assert_eq!(file.default_profile, "default");
        let resolved = ResolvedConfig::resolve(&file, None, None, None);
        assert_eq!(resolved.endpoint, "http://localhost:19898");
        assert_eq!(resolved.reconnect, ReconnectPolicy::default());
        assert_eq!(resolved.status_poll, Duration::from_secs(5));
        assert_eq!(resolved.channels_poll, Duration::from_secs(10));
        assert_eq!(resolved.agents_poll, Duration::from_secs(30));
    }

    #[test]
    fn test_write_default_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livedeck").join("config.toml");
        ConfigFile::write_default_to(&path).unwrap();
        // Existing file is left alone
        fs::write(&path, "default_profile = \"mine\"\n").unwrap();
        ConfigFile::write_default_to(&path).unwrap();
        let file = ConfigFile::load_from(&path).unwrap();
        assert_eq!(file.default_profile, "mine");
    }

    #[test]
    fn test_profile_values_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
default_profile = "prod"

[profiles.prod]
endpoint = "https://agents.example.com"
api_key = "secret"
base_delay_ms = 500
max_delay_ms = 100
max_retries = 3
jitter = 4.0
typing_timeout_secs = 20
status_poll_secs = 0
"#,
        )
        .unwrap();
        let file = ConfigFile::load_from(&path).unwrap();

        let resolved = ResolvedConfig::resolve(&file, None, None, None);
        assert_eq!(resolved.profile_name, "prod");
        assert_eq!(resolved.api_key.as_deref(), Some("secret"));
        assert_eq!(resolved.reconnect.base_delay, Duration::from_millis(500));
        // Cap never below the base delay; jitter clamped
        assert_eq!(resolved.reconnect.max_delay, Duration::from_millis(500));
        assert_eq!(resolved.reconnect.jitter, 1.0);
        assert_eq!(resolved.reconnect.max_retries, 3);
        assert_eq!(resolved.typing_timeout, Duration::from_secs(20));
        assert_eq!(resolved.status_poll, Duration::from_secs(1));

        let overridden = ResolvedConfig::resolve(
            &file,
            Some("prod"),
            Some("http://127.0.0.1:9000"),
            Some("other"),
        );
        assert_eq!(overridden.endpoint, "http://127.0.0.1:9000");
        assert_eq!(overridden.api_key.as_deref(), Some("other"));
    }

    #[test]
    fn test_unknown_profile_falls_back_to_defaults() {
        let file = ConfigFile::default();
        let resolved = ResolvedConfig::resolve(&file, Some("nope"), None, None);
        assert_eq!(resolved.profile_name, "nope");
        assert_eq!(resolved.history_limit, 50);
    }

    #[test]
    fn test_non_finite_jitter_resolves_to_zero() {
        for raw in ["nan", "inf", "-inf"] {
            let text = format!("default_profile = \"x\"\n[profiles.x]\njitter = {raw}\n");
            let file: ConfigFile = toml::from_str(&text).unwrap();
            let resolved = ResolvedConfig::resolve(&file, None, None, None);
            assert_eq!(resolved.reconnect.jitter, 0.0);
        }
    }

    #[test]
    fn test_invalid_toml_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "default_profile = [").unwrap();
        let err = ConfigFile::load_from(&path).unwrap_err();
        assert!(format!("{err}").contains("Failed to parse config file"));
    }
}
