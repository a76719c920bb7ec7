use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

/// How chat sessions are opened and supervised.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Fetcher executable started once per session.
    #[serde(default = "default_command")]
    pub command: String,
    /// Fetcher arguments. `{url}`, `{categories}` and `{timeout}` are substituted.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: f64,
    /// Fixed pause before every re-open.
    #[serde(default)]
    pub reconnect_delay_ms: u64,
    /// Extra pause after a failed open or an empty session, doubled on each repeat.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    /// Fetcher exit codes that mean the upstream permanently refused the channel.
    #[serde(default = "default_fatal_exit_codes")]
    pub fatal_exit_codes: Vec<i32>,
}

/// Pauses the supervisor applies between sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizerConfig {
    /// Apply the YouTube author character filter to Twitch names as well.
    #[serde(default)]
    pub sanitize_twitch_authors: bool,
    #[serde(default = "default_colour")]
    pub default_colour: String,
    #[serde(default = "default_owner_colour")]
    pub owner_colour: String,
    #[serde(default = "default_moderator_colour")]
    pub moderator_colour: String,
    #[serde(default = "default_member_colour")]
    pub member_colour: String,
    /// When set, only records whose `message_type` is listed are relayed.
    #[serde(default)]
    pub message_types: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: f64,
}

fn default_command() -> String {
    "python3".to_string()
}

fn default_args() -> Vec<String> {
    [
        "demos/fetch_chat.py",
        "{url}",
        "--categories",
        "{categories}",
        "--inactivity-timeout",
        "{timeout}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_inactivity_timeout_secs() -> f64 {
    10.0
}

fn default_backoff_initial_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_categories() -> Vec<String> {
    vec!["messages".to_string()]
}

fn default_fatal_exit_codes() -> Vec<i32> {
    vec![2]
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_colour() -> String {
    "#808080".to_string()
}

fn default_owner_colour() -> String {
    "#FFFF00".to_string()
}

fn default_moderator_colour() -> String {
    "#0000FF".to_string()
}

fn default_member_colour() -> String {
    "#008000".to_string()
}

fn default_write_timeout_secs() -> f64 {
    5.0
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            reconnect_delay_ms: 0,
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            categories: default_categories(),
            fatal_exit_codes: default_fatal_exit_codes(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            sanitize_twitch_authors: false,
            default_colour: default_colour(),
            owner_colour: default_owner_colour(),
            moderator_colour: default_moderator_colour(),
            member_colour: default_member_colour(),
            message_types: None,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

impl SourceConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.inactivity_timeout_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_millis(self.reconnect_delay_ms),
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs.min(i64::MAX as u64 / 1_000) as i64)
    }
}

impl SinkConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.write_timeout_secs)
    }
}

fn is_hex_colour(value: &str) -> bool {
    value.len() == 7
        && value.starts_with('#')
        && value[1..].chars().all(|c| c.is_ascii_hexdigit())
}

fn is_positive_secs(value: f64) -> bool {
    value.is_finite() && value > 0.0 && value < 1e9
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Load `path` if it exists, otherwise fall back to built-in defaults.
    /// A path the user asked for explicitly must exist.
    pub fn load_or_default(path: &Path, explicit: bool) -> Result<Self> {
        if !explicit && !path.exists() {
            return Ok(Config::default());
        }
        Self::load(path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.command.trim().is_empty() {
            anyhow::bail!("source.command must not be empty");
        }
        if !is_positive_secs(self.source.inactivity_timeout_secs) {
            anyhow::bail!(
                "source.inactivity_timeout_secs must be a positive number of seconds, got {}",
                self.source.inactivity_timeout_secs
            );
        }
        if !is_positive_secs(self.sink.write_timeout_secs) {
            anyhow::bail!(
                "sink.write_timeout_secs must be a positive number of seconds, got {}",
                self.sink.write_timeout_secs
            );
        }
        if self.source.backoff_initial_ms > self.source.backoff_max_ms {
            anyhow::bail!("source.backoff_initial_ms must not exceed source.backoff_max_ms");
        }
        if self.dedup.ttl_secs == 0 {
            anyhow::bail!("dedup.ttl_secs must be greater than zero");
        }

        let palette = [
            ("default_colour", &self.normalizer.default_colour),
            ("owner_colour", &self.normalizer.owner_colour),
            ("moderator_colour", &self.normalizer.moderator_colour),
            ("member_colour", &self.normalizer.member_colour),
        ];
        for (name, value) in palette {
            if !is_hex_colour(value) {
                anyhow::bail!("normalizer.{} must look like #RRGGBB, got '{}'", name, value);
            }
        }

        Ok(())
    }
}
