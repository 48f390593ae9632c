//! Bridge worker configuration management
//!
//! Configuration is read-only to the core components. The `ConfigStore`
//! persists it as TOML under `~/.priority-living/` and offers flat
//! `get`/`set` access for the `pl config` subcommand.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix every valid bridge key carries
pub const BRIDGE_KEY_PREFIX: &str = "pb_";

/// Main bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Opaque key identifying this bridge to the backend
    pub bridge_key: String,

    /// Backend base URL
    pub backend_url: String,

    /// Public API key sent alongside the bridge key
    pub anon_key: String,

    /// Machine name reported to the backend (empty = hostname)
    pub machine_name: String,

    /// Seconds between polls while connected
    pub poll_interval: u64,

    /// Seconds between status heartbeats when there is nothing to report
    pub heartbeat_interval: u64,

    /// Restart supervised processes that exit unexpectedly
    pub auto_restart: bool,

    /// Model storage path, also the working directory of supervised processes
    pub default_model_path: PathBuf,

    /// Shell command execution limits
    pub commands: CommandsConfig,

    /// Process supervision policy
    pub supervisor: SupervisorConfig,

    /// External model tooling
    pub models: ModelsConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bridge_key: String::new(),
            backend_url: String::new(),
            anon_key: String::new(),
            machine_name: String::new(),
            poll_interval: 3,
            heartbeat_interval: 60,
            auto_restart: true,
            default_model_path: base_dir().join("models"),
            commands: CommandsConfig::default(),
            supervisor: SupervisorConfig::default(),
            models: ModelsConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Poll interval as a `Duration` (never zero)
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.max(1))
    }

    /// Heartbeat interval as a `Duration` (never zero)
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval.max(1))
    }

    /// Machine name, falling back to the hostname
    pub fn resolved_machine_name(&self) -> String {
        if self.machine_name.is_empty() {
            hostname()
        } else {
            self.machine_name.clone()
        }
    }

    /// Check that the bridge can be started with this configuration.
    pub fn validate_for_bridge(&self) -> Result<()> {
        validate_bridge_key(&self.bridge_key)?;
        self.validate_backend_url()
    }

    /// Check that `backend_url` is a usable http(s) URL.
    pub fn validate_backend_url(&self) -> Result<()> {
        if self.backend_url.trim().is_empty() {
            return Err(Error::Config(
                "backend_url is not set. Run: pl config set backend_url https://...".to_string(),
            ));
        }
        if !self.backend_url.starts_with("http://") && !self.backend_url.starts_with("https://") {
            return Err(Error::Config(format!(
                "backend_url must be an http(s) URL, got '{}'",
                self.backend_url
            )));
        }
        Ok(())
    }
}

/// Validate the bridge key format.
pub fn validate_bridge_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Config(
            "Bridge key required. Use --key pb_xxx or: pl config set bridge_key pb_xxx".to_string(),
        ));
    }
    if !key.starts_with(BRIDGE_KEY_PREFIX) {
        return Err(Error::Config(format!(
            "Invalid bridge key. Must start with '{}'",
            BRIDGE_KEY_PREFIX
        )));
    }
    Ok(())
}

/// Shell command execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Wall-clock limit per command in seconds
    pub timeout_secs: u64,

    /// Combined stdout + stderr cap in bytes
    pub max_output_bytes: usize,

    /// Commands executing at the same time
    pub max_concurrent: usize,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            max_output_bytes: 50_000,
            max_concurrent: 4,
        }
    }
}

/// Process supervision policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Milliseconds between supervision ticks
    pub tick_interval_ms: u64,

    /// Seconds to wait after SIGTERM before force-killing
    pub stop_grace_secs: u64,

    /// Crashes tolerated within the restart window before an entry fails
    pub max_restarts: u32,

    /// Rolling window for counting crashes, in seconds
    pub restart_window_secs: u64,

    /// First backoff delay after a repeated crash, in milliseconds
    pub backoff_base_ms: u64,

    /// Backoff cap in seconds
    pub backoff_max_secs: u64,

    /// Agent runner binary
    pub agent_program: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 2000,
            stop_grace_secs: 5,
            max_restarts: 5,
            restart_window_secs: 60,
            backoff_base_ms: 1000,
            backoff_max_secs: 60,
            agent_program: "pl-agent".to_string(),
        }
    }
}

/// External model tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Downloader invoked as `<program> download <model> --local-dir <dir>`
    pub download_program: String,

    /// Inference runner invoked as `<program> --model <path> --prompt <p> --max-tokens <n>`
    pub infer_program: String,

    /// Model server invoked as `<program> --model <path> --port <port>`
    pub serve_program: String,

    /// Wall-clock limit for download/infer in seconds
    pub timeout_secs: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            download_program: "huggingface-cli".to_string(),
            infer_program: "pl-infer".to_string(),
            serve_program: "pl-model-server".to_string(),
            timeout_secs: 3600,
        }
    }
}

/// Keys accepted by `ConfigStore::get` / `ConfigStore::set`
pub const CONFIG_KEYS: &[&str] = &[
    "bridge_key",
    "backend_url",
    "anon_key",
    "machine_name",
    "poll_interval",
    "heartbeat_interval",
    "auto_restart",
    "default_model_path",
    "command_timeout",
    "max_output_bytes",
];

/// Persisted configuration file
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Store backed by the given file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default location (`~/.priority-living/config.toml`)
    pub fn default_location() -> Self {
        Self::new(base_dir().join("config.toml"))
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration; a missing file yields defaults.
    pub fn load(&self) -> Result<BridgeConfig> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "No config file, using defaults");
            return Ok(BridgeConfig::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Config file {} is corrupted: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Write the configuration, creating the parent directory if needed.
    pub fn save(&self, config: &BridgeConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(config)?;
        // Readers never see a half-written file
        let staging = self.path.with_extension("toml.tmp");
        std::fs::write(&staging, content)?;
        std::fs::rename(&staging, &self.path)?;
        Ok(())
    }

    /// Read a single key as a display string.
    pub fn get(&self, key: &str) -> Result<String> {
        let config = self.load()?;
        get_value(&config, key)
    }

    /// Set a single key, converting the value for typed keys.
    pub fn set(&self, key: &str, value: &str) -> Result<BridgeConfig> {
        let mut config = self.load()?;
        set_value(&mut config, key, value)?;
        self.save(&config)?;
        Ok(config)
    }
}

/// Where the bridge session reads its key.
///
/// A key given on the command line is used until the backend rejects it.
/// After that, and whenever no key was given, the key is re-read from the
/// store before each authentication so a `pl config set bridge_key` takes
/// effect without a restart.
#[derive(Debug, Clone)]
pub struct KeySource {
    explicit: Option<String>,
    store: Option<ConfigStore>,
}

impl KeySource {
    /// A key that never changes
    pub fn fixed(key: impl Into<String>) -> Self {
        Self {
            explicit: Some(key.into()),
            store: None,
        }
    }

    /// Key read from `store` on every call to `current`
    pub fn store(store: ConfigStore) -> Self {
        Self {
            explicit: None,
            store: Some(store),
        }
    }

    /// Prefer `key` (if set) until it is rejected.
    pub fn with_override(mut self, key: Option<String>) -> Self {
        if let Some(key) = key.filter(|k| !k.is_empty()) {
            self.explicit = Some(key);
        }
        self
    }

    /// The key to authenticate with now.
    pub fn current(&self) -> Result<String> {
        if let Some(key) = &self.explicit {
            return Ok(key.clone());
        }
        match &self.store {
            Some(store) => Ok(store.load()?.bridge_key),
            None => Ok(String::new()),
        }
    }

    /// The backend refused the current key. An explicit key is dropped in
    /// favour of the store; a fixed key stays.
    pub fn rejected(&mut self) {
        if self.store.is_some() && self.explicit.take().is_some() {
            tracing::info!("Command-line bridge key rejected; reading the key from the config file from now on");
        }
    }
}

/// Read a flat key from a config.
pub fn get_value(config: &BridgeConfig, key: &str) -> Result<String> {
    let value = match key {
        "bridge_key" => config.bridge_key.clone(),
        "backend_url" => config.backend_url.clone(),
        "anon_key" => config.anon_key.clone(),
        "machine_name" => config.machine_name.clone(),
        "poll_interval" => config.poll_interval.to_string(),
        "heartbeat_interval" => config.heartbeat_interval.to_string(),
        "auto_restart" => config.auto_restart.to_string(),
        "default_model_path" => config.default_model_path.display().to_string(),
        "command_timeout" => config.commands.timeout_secs.to_string(),
        "max_output_bytes" => config.commands.max_output_bytes.to_string(),
        other => return Err(unknown_key(other)),
    };
    Ok(value)
}

/// Write a flat key into a config.
pub fn set_value(config: &mut BridgeConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "bridge_key" => config.bridge_key = value.to_string(),
        "backend_url" => config.backend_url = value.trim_end_matches('/').to_string(),
        "anon_key" => config.anon_key = value.to_string(),
        "machine_name" => config.machine_name = value.to_string(),
        "poll_interval" => config.poll_interval = parse_number(key, value)?,
        "heartbeat_interval" => config.heartbeat_interval = parse_number(key, value)?,
        "auto_restart" => config.auto_restart = parse_bool(value),
        "default_model_path" => config.default_model_path = PathBuf::from(value),
        "command_timeout" => config.commands.timeout_secs = parse_number(key, value)?,
        "max_output_bytes" => config.commands.max_output_bytes = parse_number(key, value)?,
        other => return Err(unknown_key(other)),
    }
    Ok(())
}

fn unknown_key(key: &str) -> Error {
    Error::Config(format!(
        "Unknown config key '{}'. Known keys: {}",
        key,
        CONFIG_KEYS.join(", ")
    ))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("'{}' expects a number, got '{}'", key, value)))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

/// Mask a secret for display: first 6 + last 4 characters visible
pub fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 10 {
        return "***".to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Base directory for bridge state (`~/.priority-living`)
pub fn base_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".priority-living")
}

/// Best-effort hostname lookup
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // SAFETY: buf is valid for buf.len() bytes and gethostname NUL-terminates on success.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
            if !name.is_empty() {
                return name;
            }
        }
    }
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
