//! TOML Configuration File Support
//!
//! Centralized configuration loading for the engine, supporting a TOML file at
//! `~/.config/realtime-engine/engine.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Time Units
//!
//! Deadlines and backoff delays are expressed in *units*. One unit is
//! `time_unit_ms` milliseconds (1000 by default), so tests and slow links can
//! scale every timer at once.
//!
//! # Example Configuration
//!
//! ```toml
//! time_unit_ms = 1000
//!
//! [connection]
//! url = "wss://api.openai.com/v1/realtime"
//! model = "gpt-4o-realtime-preview-2024-12-17"
//! connect_timeout_ms = 10000
//!
//! [backoff]
//! initial_units = 1
//! max_units = 32
//! max_retries = 3
//!
//! [session]
//! instructions = "You are a helpful assistant."
//! voice = "ash"
//! deadline_units = 10
//!
//! [correlator]
//! max_pending = 32
//! max_concurrent_responses = 1
//!
//! [liveness]
//! ping_interval_secs = 30
//!
//! [history]
//! max_turns = 3
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::BackoffConfig;
use crate::correlator::CorrelatorConfig;
use crate::history::HistoryConfig;
use crate::protocol::{Modality, SessionConfig};
use crate::transport::LivenessConfig;

/// Default backend endpoint
pub const DEFAULT_URL: &str = "wss://api.openai.com/v1/realtime";

/// Default model
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";

/// Longest timer any unit-based setting may resolve to
pub const MAX_SPAN: Duration = Duration::from_secs(24 * 60 * 60);

/// `n` units of `unit`, saturating at [`MAX_SPAN`]
#[must_use]
pub fn span(unit: Duration, n: u32) -> Duration {
    unit.checked_mul(n).map_or(MAX_SPAN, |d| d.min(MAX_SPAN))
}

/// Default system instructions
pub const DEFAULT_INSTRUCTIONS: &str =
    "You are a helpful assistant. Keep your answers short and conversational.";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Connection section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionToml {
    /// WebSocket endpoint
    pub url: Option<String>,
    /// Model requested in the `?model=` query
    pub model: Option<String>,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// Capacity of the outbound frame queue
    pub outbound_capacity: Option<usize>,
    /// Whether to reconnect after an unexpected closure
    pub auto_reconnect: Option<bool>,
}

/// Backoff section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffToml {
    /// First retry delay in units
    pub initial_units: Option<u32>,
    /// Delay growth factor
    pub multiplier: Option<f64>,
    /// Delay cap in units
    pub max_units: Option<u32>,
    /// Jitter fraction (0.1 = ±10%)
    pub jitter: Option<f64>,
    /// Maximum reconnect attempts
    pub max_retries: Option<u32>,
}

/// Session section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// System instructions
    pub instructions: Option<String>,
    /// Voice name
    pub voice: Option<String>,
    /// Output modalities
    pub modalities: Option<Vec<Modality>>,
    /// Handshake phase deadline in units
    pub deadline_units: Option<u32>,
    /// Total handshake attempts (first try included)
    pub max_handshake_attempts: Option<u32>,
}

/// Correlator section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorToml {
    /// Pending request cap
    pub max_pending: Option<usize>,
    /// Item confirmation deadline in units
    pub item_deadline_units: Option<u32>,
    /// Deadline for `response.created` in units
    pub response_ack_units: Option<u32>,
    /// Deadline for the full response stream in units
    pub response_deadline_units: Option<u32>,
    /// Concurrent in-flight responses
    pub max_concurrent_responses: Option<usize>,
    /// Message size cap in bytes
    pub max_message_bytes: Option<usize>,
}

/// Liveness section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessToml {
    /// Whether pings are sent
    pub enabled: Option<bool>,
    /// Ping interval in seconds
    pub ping_interval_secs: Option<u64>,
    /// Pong timeout in seconds
    pub response_timeout_secs: Option<u64>,
    /// Missed pongs before the link is declared dead
    pub max_missed_pongs: Option<u32>,
}

/// History section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryToml {
    /// Turns kept in memory
    pub max_turns: Option<usize>,
    /// Replay remembered turns into a re-initialized session
    pub replay_on_resume: Option<bool>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineToml {
    /// Milliseconds per time unit
    pub time_unit_ms: Option<u64>,
    /// Connection section
    pub connection: ConnectionToml,
    /// Backoff section
    pub backoff: BackoffToml,
    /// Session section
    pub session: SessionToml,
    /// Correlator section
    pub correlator: CorrelatorToml,
    /// Liveness section
    pub liveness: LivenessToml,
    /// History section
    pub history: HistoryToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Connection settings
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionSettings {
    /// WebSocket endpoint
    pub url: String,
    /// Model requested in the `?model=` query
    pub model: String,
    /// Bearer token; only ever read from the environment
    pub api_key: Option<String>,
    /// Bound on one transport connect attempt
    pub connect_timeout: Duration,
    /// Capacity of the outbound frame queue
    pub outbound_capacity: usize,
    /// Whether to reconnect after an unexpected closure
    pub auto_reconnect: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            connect_timeout: Duration::from_secs(10),
            outbound_capacity: 64,
            auto_reconnect: true,
        }
    }
}

/// Session handshake settings
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSettings {
    /// System instructions
    pub instructions: String,
    /// Voice name
    pub voice: Option<String>,
    /// Output modalities
    pub modalities: Vec<Modality>,
    /// Handshake phase deadline in units
    pub deadline_units: u32,
    /// Total handshake attempts (first try included)
    pub max_handshake_attempts: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            voice: Some("ash".to_string()),
            modalities: vec![Modality::Text],
            deadline_units: 10,
            max_handshake_attempts: 2,
        }
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            instructions: settings.instructions.clone(),
            modalities: settings.modalities.clone(),
            tools: Vec::new(),
            tool_choice: "auto".to_string(),
            voice: settings.voice.clone(),
        }
    }
}

/// Centralized configuration for the engine
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Duration of one time unit
    pub time_unit: Duration,
    /// Connection settings
    pub connection: ConnectionSettings,
    /// Reconnect backoff policy
    pub backoff: BackoffConfig,
    /// Session handshake settings
    pub session: SessionSettings,
    /// Pending-set limits and deadlines
    pub correlator: CorrelatorConfig,
    /// Link liveness pings
    pub liveness: LivenessConfig,
    /// Conversation memory
    pub history: HistoryConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            time_unit: Duration::from_secs(1),
            connection: ConnectionSettings::default(),
            backoff: BackoffConfig::default(),
            session: SessionSettings::default(),
            correlator: CorrelatorConfig::default(),
            liveness: LivenessConfig::default(),
            history: HistoryConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl EngineConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with liveness pings disabled, for in-process links
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            liveness: LivenessConfig::disabled(),
            ..Self::default()
        }
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Convert a count of units to wall time, saturating at [`MAX_SPAN`]
    #[must_use]
    pub fn units(&self, n: u32) -> Duration {
        span(self.time_unit, n)
    }

    /// Deadline for each handshake phase
    #[must_use]
    pub fn session_deadline(&self) -> Duration {
        self.units(self.session.deadline_units)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` naming the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.time_unit.is_zero() {
            return invalid("time_unit_ms must be greater than zero");
        }
        let timers = [
            ("backoff.initial_units", self.backoff.initial_units),
            ("backoff.max_units", self.backoff.max_units),
            ("session.deadline_units", self.session.deadline_units),
            ("correlator.item_deadline_units", self.correlator.item_deadline_units),
            ("correlator.response_ack_units", self.correlator.response_ack_units),
            ("correlator.response_deadline_units", self.correlator.response_deadline_units),
        ];
        for (name, n) in timers {
            if self.time_unit.checked_mul(n).map_or(true, |d| d > MAX_SPAN) {
                return Err(ConfigError::ValidationError(format!(
                    "{name} x time_unit_ms exceeds {} seconds",
                    MAX_SPAN.as_secs()
                )));
            }
        }
        if self.liveness.ping_interval > MAX_SPAN || self.liveness.response_timeout > MAX_SPAN {
            return invalid("liveness intervals must not exceed one day");
        }
        if self.connection.url.is_empty() {
            return invalid("connection.url must not be empty");
        }
        if self.connection.outbound_capacity == 0 {
            return invalid("connection.outbound_capacity must be greater than zero");
        }
        if self.backoff.multiplier < 1.0 {
            return invalid("backoff.multiplier must be at least 1.0");
        }
        if !(0.0..1.0).contains(&self.backoff.jitter) {
            return invalid("backoff.jitter must be in [0, 1)");
        }
        if self.backoff.max_units < self.backoff.initial_units {
            return invalid("backoff.max_units must not be below backoff.initial_units");
        }
        if self.session.max_handshake_attempts == 0 {
            return invalid("session.max_handshake_attempts must be at least 1");
        }
        if self.correlator.max_pending == 0 {
            return invalid("correlator.max_pending must be greater than zero");
        }
        if self.correlator.max_concurrent_responses == 0 {
            return invalid("correlator.max_concurrent_responses must be greater than zero");
        }
        if self.correlator.response_deadline_units < self.correlator.response_ack_units {
            return invalid(
                "correlator.response_deadline_units must not be below response_ack_units",
            );
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/realtime-engine/engine.toml` or
/// `~/.config/realtime-engine/engine.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("realtime-engine").join("engine.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// merged configuration is invalid. A missing config file is not an error.
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then apply the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed, or
/// if the merged configuration is invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<EngineConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<EngineConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = EngineConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: EngineToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut EngineConfig, toml: &EngineToml) {
    if let Some(ms) = toml.time_unit_ms {
        config.time_unit = Duration::from_millis(ms);
    }

    let conn = &toml.connection;
    if let Some(ref url) = conn.url {
        config.connection.url.clone_from(url);
    }
    if let Some(ref model) = conn.model {
        config.connection.model.clone_from(model);
    }
    if let Some(ms) = conn.connect_timeout_ms {
        config.connection.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(capacity) = conn.outbound_capacity {
        config.connection.outbound_capacity = capacity;
    }
    if let Some(enabled) = conn.auto_reconnect {
        config.connection.auto_reconnect = enabled;
    }

    let backoff = &toml.backoff;
    if let Some(units) = backoff.initial_units {
        config.backoff.initial_units = units;
    }
    if let Some(multiplier) = backoff.multiplier {
        config.backoff.multiplier = multiplier;
    }
    if let Some(units) = backoff.max_units {
        config.backoff.max_units = units;
    }
    if let Some(jitter) = backoff.jitter {
        config.backoff.jitter = jitter;
    }
    if let Some(retries) = backoff.max_retries {
        config.backoff.max_retries = retries;
    }

    let session = &toml.session;
    if let Some(ref instructions) = session.instructions {
        config.session.instructions.clone_from(instructions);
    }
    if session.voice.is_some() {
        config.session.voice.clone_from(&session.voice);
    }
    if let Some(ref modalities) = session.modalities {
        config.session.modalities.clone_from(modalities);
    }
    if let Some(units) = session.deadline_units {
        config.session.deadline_units = units;
    }
    if let Some(attempts) = session.max_handshake_attempts {
        config.session.max_handshake_attempts = attempts;
    }

    let correlator = &toml.correlator;
    if let Some(max) = correlator.max_pending {
        config.correlator.max_pending = max;
    }
    if let Some(units) = correlator.item_deadline_units {
        config.correlator.item_deadline_units = units;
    }
    if let Some(units) = correlator.response_ack_units {
        config.correlator.response_ack_units = units;
    }
    if let Some(units) = correlator.response_deadline_units {
        config.correlator.response_deadline_units = units;
    }
    if let Some(max) = correlator.max_concurrent_responses {
        config.correlator.max_concurrent_responses = max;
    }
    if let Some(bytes) = correlator.max_message_bytes {
        config.correlator.max_message_bytes = bytes;
    }

    let liveness = &toml.liveness;
    if let Some(enabled) = liveness.enabled {
        config.liveness.enabled = enabled;
    }
    if let Some(secs) = liveness.ping_interval_secs {
        config.liveness.ping_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = liveness.response_timeout_secs {
        config.liveness.response_timeout = Duration::from_secs(secs);
    }
    if let Some(max) = liveness.max_missed_pongs {
        config.liveness.max_missed_pongs = max;
    }

    if let Some(turns) = toml.history.max_turns {
        config.history.max_turns = turns;
    }
    if let Some(replay) = toml.history.replay_on_resume {
        config.history.replay_on_resume = replay;
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut EngineConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    // The API key never comes from the file
    if let Some(key) = env("OPENAI_API_KEY").filter(|k| !k.is_empty()) {
        config.connection.api_key = Some(key);
    }

    if let Some(model) = env("REALTIME_MODEL") {
        config.connection.model = model;
        config.source = ConfigSource::Env;
    }
    if let Some(url) = env("REALTIME_WEBSOCKET_URL") {
        config.connection.url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(voice) = env("AI_VOICE") {
        config.session.voice = Some(voice.to_lowercase());
        config.source = ConfigSource::Env;
    }
    if let Some(instructions) = env("SYSTEM_INSTRUCTIONS") {
        config.session.instructions = instructions;
        config.source = ConfigSource::Env;
    }
    if let Some(n) = env("RECONNECT_MAX_ATTEMPTS").and_then(|v| v.parse::<u32>().ok()) {
        config.backoff.max_retries = n;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = env("REALTIME_TIME_UNIT_MS").and_then(|v| v.parse::<u64>().ok()) {
        config.time_unit = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(n) = env("REALTIME_MAX_PENDING_EVENTS").and_then(|v| v.parse::<usize>().ok()) {
        config.correlator.max_pending = n;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = env("REALTIME_CONNECT_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
        config.connection.connect_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(enabled) = env("REALTIME_LIVENESS") {
        config.liveness.enabled = enabled != "0" && enabled.to_lowercase() != "false";
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Model override
    pub model: Option<String>,
    /// Endpoint override
    pub url: Option<String>,
    /// Instructions override
    pub instructions: Option<String>,
    /// Voice override
    pub voice: Option<String>,
    /// Reconnect attempts override
    pub max_retries: Option<u32>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set model override
    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }

    /// Set endpoint override
    #[must_use]
    pub fn with_url(mut self, url: String) -> Self {
        self.url = Some(url);
        self
    }

    /// Set instructions override
    #[must_use]
    pub fn with_instructions(mut self, instructions: String) -> Self {
        self.instructions = Some(instructions);
        self
    }

    /// Set voice override
    #[must_use]
    pub fn with_voice(mut self, voice: String) -> Self {
        self.voice = Some(voice);
        self
    }

    /// Set reconnect attempts override
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut EngineConfig) {
        if self.model.is_some()
            || self.url.is_some()
            || self.instructions.is_some()
            || self.voice.is_some()
            || self.max_retries.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref model) = self.model {
            config.connection.model.clone_from(model);
        }
        if let Some(ref url) = self.url {
            config.connection.url.clone_from(url);
        }
        if let Some(ref instructions) = self.instructions {
            config.session.instructions.clone_from(instructions);
        }
        if let Some(ref voice) = self.voice {
            config.session.voice = Some(voice.clone());
        }
        if let Some(retries) = self.max_retries {
            config.backoff.max_retries = retries;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn write_toml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();

        assert_eq!(config.time_unit, Duration::from_secs(1));
        assert_eq!(config.connection.url, DEFAULT_URL);
        assert_eq!(config.connection.model, DEFAULT_MODEL);
        assert_eq!(config.backoff.max_retries, 3);
        assert_eq!(config.session.max_handshake_attempts, 2);
        assert_eq!(config.correlator.max_pending, 32);
        assert_eq!(config.correlator.max_concurrent_responses, 1);
        assert_eq!(config.history.max_turns, 3);
        assert_eq!(config.session_deadline(), Duration::from_secs(10));
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.to_string_lossy().contains("realtime-engine"));
            assert!(p.to_string_lossy().ends_with("engine.toml"));
        }
    }

    #[test]
    fn test_units_saturate_instead_of_overflowing() {
        let config = EngineConfig {
            time_unit: Duration::from_millis(u64::MAX),
            ..EngineConfig::default()
        };
        assert_eq!(config.units(10_000), MAX_SPAN);
        assert_eq!(span(Duration::from_secs(1), 3), Duration::from_secs(3));
    }

    #[test]
    fn test_huge_time_unit_rejected() {
        let file = write_toml(
            r#"
time_unit_ms = 9223372036854775807

[correlator]
response_deadline_units = 10000
"#,
        );

        let err = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap_err();
        assert!(
            matches!(err, ConfigError::ValidationError(ref msg) if msg.contains("units")),
            "got {err:?}"
        );
    }

    #[test]
    fn test_units_scale_with_time_unit() {
        let config = EngineConfig {
            time_unit: Duration::from_millis(10),
            ..EngineConfig::default()
        };
        assert_eq!(config.units(15), Duration::from_millis(150));
        assert_eq!(config.session_deadline(), Duration::from_millis(100));
    }

    // =========================================================================
    // TOML Parsing Tests
    // =========================================================================

    #[test]
    fn test_parse_valid_toml() {
        let file = write_toml(
            r#"
time_unit_ms = 250

[connection]
url = "wss://example.test/realtime"
model = "custom-model"
connect_timeout_ms = 5000

[backoff]
initial_units = 2
max_units = 16
max_retries = 5

[session]
instructions = "be terse"
voice = "verse"
deadline_units = 4

[correlator]
max_pending = 8
max_concurrent_responses = 2

[liveness]
enabled = false

[history]
max_turns = 5
replay_on_resume = false
"#,
        );

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.time_unit, Duration::from_millis(250));
        assert_eq!(config.connection.url, "wss://example.test/realtime");
        assert_eq!(config.connection.model, "custom-model");
        assert_eq!(config.connection.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.backoff.initial_units, 2);
        assert_eq!(config.backoff.max_units, 16);
        assert_eq!(config.backoff.max_retries, 5);
        assert_eq!(config.session.instructions, "be terse");
        assert_eq!(config.session.voice.as_deref(), Some("verse"));
        assert_eq!(config.session.deadline_units, 4);
        assert_eq!(config.correlator.max_pending, 8);
        assert_eq!(config.correlator.max_concurrent_responses, 2);
        assert!(!config.liveness.enabled);
        assert_eq!(config.history.max_turns, 5);
        assert!(!config.history.replay_on_resume);
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_parse_partial_toml() {
        let file = write_toml(
            r#"
[correlator]
max_pending = 4
"#,
        );

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.correlator.max_pending, 4);
        assert_eq!(config.correlator.item_deadline_units, 15);
        assert_eq!(config.backoff.max_retries, 3);
        assert_eq!(config.connection.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = load_config_with_env(
            Some(PathBuf::from("/nonexistent/realtime-engine/engine.toml")),
            no_env,
        )
        .unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let file = write_toml("[correlator\nmax_pending = ");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_invalid_values_are_validation_errors() {
        let file = write_toml("[correlator]\nmax_pending = 0\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ValidationError(msg)) if msg.contains("max_pending")));

        let file = write_toml("[backoff]\njitter = 1.5\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    // =========================================================================
    // Environment and CLI Priority Tests
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let file = write_toml("[connection]\nmodel = \"file-model\"\n");
        let env = env_from(&[
            ("REALTIME_MODEL", "env-model"),
            ("OPENAI_API_KEY", "sk-test"),
            ("AI_VOICE", "Ash"),
            ("RECONNECT_MAX_ATTEMPTS", "7"),
            ("REALTIME_TIME_UNIT_MS", "5"),
        ]);

        let config = load_config_with_env(Some(file.path().to_path_buf()), env).unwrap();

        assert_eq!(config.connection.model, "env-model");
        assert_eq!(config.connection.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.session.voice.as_deref(), Some("ash"));
        assert_eq!(config.backoff.max_retries, 7);
        assert_eq!(config.time_unit, Duration::from_millis(5));
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_unparseable_env_values_are_ignored() {
        let env = env_from(&[("RECONNECT_MAX_ATTEMPTS", "lots")]);
        let config = load_config_with_env(None, env).unwrap();
        assert_eq!(config.backoff.max_retries, 3);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_cli_overrides_env() {
        let env = env_from(&[("REALTIME_MODEL", "env-model")]);
        let mut config = load_config_with_env(None, env).unwrap();

        ConfigOverrides::new()
            .with_model("cli-model".to_string())
            .with_instructions("cli instructions".to_string())
            .apply(&mut config);

        assert_eq!(config.connection.model, "cli-model");
        assert_eq!(config.session.instructions, "cli instructions");
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = EngineConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_session_config_from_settings() {
        let settings = SessionSettings::default();
        let session = SessionConfig::from(&settings);
        assert_eq!(session.instructions, DEFAULT_INSTRUCTIONS);
        assert_eq!(session.voice.as_deref(), Some("ash"));
        assert_eq!(session.tool_choice, "auto");
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
