//! Configuration management
//!
//! Configuration is resolved in this order:
//! 1. Environment variables
//! 2. `appt-gateway.toml` configuration file
//! 3. Defaults
//!
//! `${VAR_NAME}` inside the configuration file expands to the environment
//! variable's value. Per-user settings resolve once into a [`UserContext`]
//! that is passed explicitly to the operations that need it.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::Error;

/// LLM Provider type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Anthropic Claude API
    #[default]
    Claude,
    /// OpenAI-compatible API
    OpenAi,
}

impl LlmProvider {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "openai" | "glm" | "zai" | "minimax" => Self::OpenAi,
            _ => Self::Claude,
        }
    }
}

/// LLM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key
    pub api_key: String,

    /// Model to use
    #[serde(default = "default_model")]
    pub model: String,

    /// API provider
    #[serde(default)]
    pub provider: LlmProvider,

    /// Base URL (optional, for custom endpoints)
    pub base_url: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            provider: LlmProvider::Claude,
            base_url: None,
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    30
}

/// Extraction engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Results below this confidence need clarification instead of creation
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,

    /// Duration used when the text states none
    #[serde(default = "default_duration_minutes")]
    pub default_duration_minutes: i64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            confidence_floor: default_confidence_floor(),
            default_duration_minutes: default_duration_minutes(),
        }
    }
}

fn default_confidence_floor() -> f64 {
    0.6
}

fn default_duration_minutes() -> i64 {
    60
}

/// Deduplication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Start instants within this many minutes of each other may match
    #[serde(default = "default_tolerance_minutes")]
    pub tolerance_minutes: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            tolerance_minutes: default_tolerance_minutes(),
        }
    }
}

impl DedupConfig {
    pub fn tolerance(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.tolerance_minutes)
    }
}

fn default_tolerance_minutes() -> i64 {
    5
}

/// Sync engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Attempts per task before it is reported as exhausted
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Tasks running at once across different records
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_concurrency() -> usize {
    4
}

/// Backing technology of a calendar store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local, lost on exit
    Memory,
    /// SQLite database file
    #[default]
    Sqlite,
    /// CalDAV server
    Caldav,
}

/// Connection settings for one calendar store
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default, rename = "kind")]
    pub backend: StoreBackend,

    /// Database path (sqlite)
    #[serde(default)]
    pub path: Option<String>,

    /// Server URL (caldav)
    #[serde(default)]
    pub server_url: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Calendar collection (caldav)
    #[serde(default)]
    pub calendar_id: Option<String>,
}

impl StoreConfig {
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn memory() -> Self {
        Self {
            backend: StoreBackend::Memory,
            ..Default::default()
        }
    }
}

/// Stores that are not owned by a single user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoresConfig {
    #[serde(default = "default_shared_store")]
    pub shared: StoreConfig,

    #[serde(default = "default_business_store")]
    pub business: StoreConfig,
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            shared: default_shared_store(),
            business: default_business_store(),
        }
    }
}

fn default_shared_store() -> StoreConfig {
    StoreConfig::sqlite("data/shared.db")
}

fn default_business_store() -> StoreConfig {
    StoreConfig::sqlite("data/business.db")
}

/// One user and their private calendar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub id: String,

    /// IANA zone name, e.g. "Europe/Berlin"
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default)]
    pub private_store: Option<StoreConfig>,
}

impl UserConfig {
    pub fn new(id: impl Into<String>, timezone: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timezone: timezone.into(),
            private_store: None,
        }
    }

    /// The user's private store, defaulting to a per-user SQLite file
    pub fn private_store(&self) -> StoreConfig {
        self.private_store
            .clone()
            .unwrap_or_else(|| StoreConfig::sqlite(format!("data/private-{}.db", self.id)))
    }

    /// Resolve into the explicit context passed to operations
    pub fn context(&self) -> crate::Result<UserContext> {
        let timezone: Tz = self.timezone.parse().map_err(|_| {
            Error::Config(format!(
                "Invalid timezone '{}' for user '{}'",
                self.timezone, self.id
            ))
        })?;
        Ok(UserContext {
            user_id: self.id.clone(),
            timezone,
        })
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Per-session user settings, resolved once from [`UserConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: String,
    pub timezone: Tz,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, timezone: Tz) -> Self {
        Self {
            user_id: user_id.into(),
            timezone,
        }
    }
}

/// Main configuration for appt-gateway
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub extraction: ExtractionConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub stores: StoresConfig,

    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl Config {
    /// Expand `${VAR_NAME}` references with environment values.
    /// Unset variables expand to an empty string.
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::new();
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next();

                let mut var_name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    var_name.push(c);
                }

                if let Ok(env_value) = std::env::var(&var_name) {
                    result.push_str(&env_value);
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();

        let toml_content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut cfg = Self::from_toml_str(&toml_content)?;
        cfg.apply_env_overrides();
        cfg.validate()?;

        Ok(cfg)
    }

    /// Parse TOML content (with `${VAR}` expansion) without env overrides
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let expanded_content = Self::expand_env_vars(content);

        let toml: TomlConfig = toml::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?;

        Ok(Self::from_toml_config(toml))
    }

    /// Load from the default path, falling back to the environment
    ///
    /// Looks for `./appt-gateway.toml`; without it only environment variables
    /// are used.
    pub fn load() -> crate::Result<Self> {
        if Path::new("appt-gateway.toml").exists() {
            return Self::from_toml_file("appt-gateway.toml");
        }

        Self::from_env()
    }

    fn from_toml_config(toml: TomlConfig) -> Self {
        let llm = toml.llm.unwrap_or_default();
        let llm_config = LlmConfig {
            api_key: llm.api_key.unwrap_or_default(),
            model: llm.model.unwrap_or_else(default_model),
            provider: LlmProvider::parse(&llm.provider.unwrap_or_default()),
            base_url: llm.base_url,
            timeout_secs: llm.timeout_secs.unwrap_or_else(default_llm_timeout_secs),
        };

        Config {
            llm: llm_config,
            extraction: toml.extraction.unwrap_or_default(),
            dedup: toml.dedup.unwrap_or_default(),
            sync: toml.sync.unwrap_or_default(),
            stores: toml.stores.unwrap_or_default(),
            users: toml.users.unwrap_or_default(),
        }
    }

    /// Override settings from environment variables
    fn apply_env_overrides(&mut self) {
        if let Ok(api_key) = std::env::var("LLM_API_KEY") {
            self.llm.api_key = api_key;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            if !model.is_empty() {
                self.llm.model = model;
            }
        }
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            if !provider.is_empty() {
                self.llm.provider = LlmProvider::parse(&provider);
            }
        }
        if let Ok(base_url) = std::env::var("LLM_BASE_URL") {
            if !base_url.is_empty() {
                self.llm.base_url = Some(base_url);
            }
        }
        if let Some(secs) = env_parse("LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = secs;
        }

        if let Some(floor) = env_parse("EXTRACTION_CONFIDENCE_FLOOR") {
            self.extraction.confidence_floor = floor;
        }
        if let Some(minutes) = env_parse("DEDUP_TOLERANCE_MINUTES") {
            self.dedup.tolerance_minutes = minutes;
        }
        if let Some(attempts) = env_parse("SYNC_MAX_ATTEMPTS") {
            self.sync.max_attempts = attempts;
        }
        if let Some(concurrency) = env_parse("SYNC_CONCURRENCY") {
            self.sync.concurrency = concurrency;
        }

        if let Ok(path) = std::env::var("SHARED_STORE_PATH") {
            self.stores.shared = StoreConfig::sqlite(path);
        }
        if let Ok(path) = std::env::var("BUSINESS_STORE_PATH") {
            self.stores.business = StoreConfig::sqlite(path);
        }
    }

    /// Load configuration from environment variables only
    ///
    /// A single user is configured from `APPT_USER_ID` / `APPT_TIMEZONE`.
    pub fn from_env() -> crate::Result<Self> {
        let api_key = std::env::var("LLM_API_KEY")
            .map_err(|_| Error::Config("LLM_API_KEY not set".to_string()))?;

        let user_id = std::env::var("APPT_USER_ID").unwrap_or_else(|_| "default".to_string());
        let timezone = std::env::var("APPT_TIMEZONE").unwrap_or_else(|_| default_timezone());

        let mut cfg = Config {
            llm: LlmConfig {
                api_key,
                ..Default::default()
            },
            users: vec![UserConfig::new(user_id, timezone)],
            ..Default::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;

        Ok(cfg)
    }

    /// Reject settings that would make the engines misbehave
    pub fn validate(&self) -> crate::Result<()> {
        if !(0.0..=1.0).contains(&self.extraction.confidence_floor) {
            return Err(Error::Config(format!(
                "extraction.confidence_floor must be within [0, 1], got {}",
                self.extraction.confidence_floor
            )));
        }
        if self.extraction.default_duration_minutes <= 0 {
            return Err(Error::Config(
                "extraction.default_duration_minutes must be positive".to_string(),
            ));
        }
        if self.dedup.tolerance_minutes < 0 {
            return Err(Error::Config(
                "dedup.tolerance_minutes must not be negative".to_string(),
            ));
        }
        if self.sync.max_attempts == 0 {
            return Err(Error::Config("sync.max_attempts must be at least 1".to_string()));
        }
        if self.sync.concurrency == 0 {
            return Err(Error::Config("sync.concurrency must be at least 1".to_string()));
        }

        let mut seen = HashSet::new();
        for user in &self.users {
            if !seen.insert(user.id.as_str()) {
                return Err(Error::Config(format!("Duplicate user id: {}", user.id)));
            }
            user.context()?;
        }

        Ok(())
    }

    pub fn user(&self, user_id: &str) -> crate::Result<&UserConfig> {
        self.users
            .iter()
            .find(|u| u.id == user_id)
            .ok_or_else(|| Error::UnknownUser(user_id.to_string()))
    }

    /// Resolve the explicit per-session context for `user_id`
    pub fn user_context(&self, user_id: &str) -> crate::Result<UserContext> {
        self.user(user_id)?.context()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

// ============================================================================
// TOML file structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct TomlConfig {
    llm: Option<TomlLlmConfig>,
    extraction: Option<ExtractionConfig>,
    dedup: Option<DedupConfig>,
    sync: Option<SyncConfig>,
    stores: Option<StoresConfig>,
    users: Option<Vec<UserConfig>>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlLlmConfig {
    /// "claude" or "openai"
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_config_default() {
        let config = LlmConfig::default();
        assert_eq!(config.model, "claude-sonnet-4-20250514");
        assert_eq!(config.provider, LlmProvider::Claude);
        assert!(config.api_key.is_empty());
        assert!(config.base_url.is_none());
        assert_eq!(config.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_engine_defaults() {
        let config = Config::default();
        assert_eq!(config.extraction.default_duration_minutes, 60);
        assert!((config.extraction.confidence_floor - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.dedup.tolerance(), chrono::Duration::minutes(5));
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.sync.concurrency, 4);
        assert_eq!(config.stores.shared.backend, StoreBackend::Sqlite);
    }

    #[test]
    fn test_expand_env_vars() {
        unsafe {
            std::env::set_var("APPT_GATEWAY_TEST_VAR", "test_value");
        }

        let result = Config::expand_env_vars("prefix_${APPT_GATEWAY_TEST_VAR}_suffix");
        assert_eq!(result, "prefix_test_value_suffix");

        let result = Config::expand_env_vars("prefix_${APPT_NONEXISTENT_VAR}_suffix");
        assert_eq!(result, "prefix__suffix");

        unsafe {
            std::env::remove_var("APPT_GATEWAY_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_no_braces() {
        assert_eq!(Config::expand_env_vars("no_vars_here"), "no_vars_here");
        assert_eq!(Config::expand_env_vars("${}_content"), "_content");
    }

    #[test]
    fn test_toml_config_parsing() {
        let toml_content = r#"
[llm]
provider = "openai"
model = "glm-4.7"
api_key = "test_key"
timeout_secs = 12

[extraction]
confidence_floor = 0.75

[dedup]
tolerance_minutes = 10

[sync]
max_attempts = 3
concurrency = 2

[stores.shared]
kind = "caldav"
server_url = "https://dav.example.com"
username = "couple"
password = "secret"
calendar_id = "together"

[stores.business]
kind = "memory"

[[users]]
id = "alice"
timezone = "Europe/Berlin"

[[users]]
id = "bob"
timezone = "America/New_York"
private_store = { kind = "sqlite", path = "/var/lib/appt/bob.db" }
"#;

        let config = Config::from_toml_str(toml_content).unwrap();

        assert_eq!(config.llm.provider, LlmProvider::OpenAi);
        assert_eq!(config.llm.model, "glm-4.7");
        assert_eq!(config.llm.timeout_secs, 12);
        assert!((config.extraction.confidence_floor - 0.75).abs() < f64::EPSILON);
        assert_eq!(config.extraction.default_duration_minutes, 60);
        assert_eq!(config.dedup.tolerance_minutes, 10);
        assert_eq!(config.sync.max_attempts, 3);
        assert_eq!(config.sync.initial_backoff_ms, 200);

        assert_eq!(config.stores.shared.backend, StoreBackend::Caldav);
        assert_eq!(config.stores.shared.calendar_id.as_deref(), Some("together"));
        assert_eq!(config.stores.business.backend, StoreBackend::Memory);

        assert_eq!(config.users.len(), 2);
        let alice = config.user("alice").unwrap();
        assert_eq!(alice.private_store().path.as_deref(), Some("data/private-alice.db"));
        let bob = config.user("bob").unwrap();
        assert_eq!(bob.private_store().path.as_deref(), Some("/var/lib/appt/bob.db"));

        config.validate().unwrap();
    }

    #[test]
    fn test_user_context_resolves_timezone() {
        let mut config = Config::default();
        config.users.push(UserConfig::new("alice", "Europe/Berlin"));

        let ctx = config.user_context("alice").unwrap();
        assert_eq!(ctx.user_id, "alice");
        assert_eq!(ctx.timezone, chrono_tz::Europe::Berlin);

        assert!(matches!(
            config.user_context("mallory"),
            Err(Error::UnknownUser(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.users.push(UserConfig::new("alice", "Mars/Olympus"));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.extraction.confidence_floor = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sync.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.users.push(UserConfig::new("alice", "UTC"));
        config.users.push(UserConfig::new("alice", "UTC"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appt-gateway.toml");
        std::fs::write(
            &path,
            "[[users]]\nid = \"carol\"\ntimezone = \"Asia/Tokyo\"\n",
        )
        .unwrap();

        let config = Config::from_toml_file(&path).unwrap();
        assert_eq!(config.users[0].id, "carol");
    }
}
