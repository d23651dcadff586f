//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.courier/config.json`) and environment.
//! Every field has a default so an empty `{}` file is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Status server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Channel settings (e.g. Telegram).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Outbound delivery pacing and retry policy.
    #[serde(default)]
    pub outbound: OutboundConfig,

    /// Per-command-class admission limits.
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
}

/// Status server bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the HTTP status server (default 15152).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// When false, no status server is started.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_gateway_port() -> u16 {
    15152
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            enabled: true,
        }
    }
}

/// Per-channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramChannelConfig,
}

/// Telegram channel config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Bot API base URL; tests point this at a local server.
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    /// Long-poll timeout passed to getUpdates, in seconds.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Update types requested from getUpdates.
    #[serde(default = "default_allowed_updates")]
    pub allowed_updates: Vec<String>,
    /// Fixed sleep after a failed getUpdates call, in milliseconds.
    #[serde(default = "default_fetch_backoff_ms")]
    pub fetch_backoff_ms: u64,
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_allowed_updates() -> Vec<String> {
    vec!["message".to_string()]
}

fn default_fetch_backoff_ms() -> u64 {
    2000
}

impl Default for TelegramChannelConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: default_telegram_api_base(),
            poll_timeout_secs: default_poll_timeout_secs(),
            allowed_updates: default_allowed_updates(),
            fetch_backoff_ms: default_fetch_backoff_ms(),
        }
    }
}

impl TelegramChannelConfig {
    pub fn fetch_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_ms)
    }
}

/// Outbound queue policy: spacing per conversation, retry bounds and capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundConfig {
    /// Minimum interval between two deliveries to the same conversation.
    #[serde(default = "default_spacing_ms")]
    pub spacing_ms: u64,
    /// Rate-limited sends are requeued at most this many times.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First rate-limit backoff.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Growth factor applied per retry.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound for the computed backoff.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fixed delay before the single retry allowed after a server error.
    #[serde(default = "default_server_retry_delay_ms")]
    pub server_retry_delay_ms: u64,
    /// Maximum number of queued messages; further sends are rejected.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// On shutdown the worker keeps draining for at most this long.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_spacing_ms() -> u64 {
    350
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_server_retry_delay_ms() -> u64 {
    1000
}

fn default_capacity() -> usize {
    1000
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            spacing_ms: default_spacing_ms(),
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            server_retry_delay_ms: default_server_retry_delay_ms(),
            capacity: default_capacity(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Limits for one command class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitClassConfig {
    pub max_requests: usize,
    pub window_ms: u64,
}

impl RateLimitClassConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Class name used for commands with no explicit class.
pub const DEFAULT_COMMAND_CLASS: &str = "default";

/// Rate limit classes and the command → class mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitsConfig {
    /// Class name → limits. A "default" class is always available.
    #[serde(default = "default_rate_limit_classes")]
    pub classes: BTreeMap<String, RateLimitClassConfig>,
    /// Command name (lowercase, no slash) → class name.
    #[serde(default)]
    pub command_classes: BTreeMap<String, String>,
    /// How often idle identities are swept from the limiters.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_rate_limit_classes() -> BTreeMap<String, RateLimitClassConfig> {
    let mut classes = BTreeMap::new();
    classes.insert(
        DEFAULT_COMMAND_CLASS.to_string(),
        RateLimitClassConfig {
            max_requests: 20,
            window_ms: 60_000,
        },
    );
    classes.insert(
        "heavy".to_string(),
        RateLimitClassConfig {
            max_requests: 5,
            window_ms: 60_000,
        },
    );
    classes
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            classes: default_rate_limit_classes(),
            command_classes: BTreeMap::new(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl RateLimitsConfig {
    /// Limits for a class; unknown classes fall back to "default", then to the built-in default.
    pub fn class(&self, name: &str) -> RateLimitClassConfig {
        self.classes
            .get(name)
            .or_else(|| self.classes.get(DEFAULT_COMMAND_CLASS))
            .copied()
            .unwrap_or_else(|| default_rate_limit_classes()[DEFAULT_COMMAND_CLASS])
    }

    /// A class that admits nothing, or has no window, is a configuration mistake.
    pub fn validate(&self) -> Result<()> {
        for (name, class) in &self.classes {
            if class.max_requests == 0 {
                anyhow::bail!("rateLimits.classes.{}: maxRequests must be at least 1", name);
            }
            if class.window_ms == 0 {
                anyhow::bail!("rateLimits.classes.{}: windowMs must be at least 1", name);
            }
        }
        Ok(())
    }
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    std::env::var("TELEGRAM_BOT_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .channels
                .telegram
                .bot_token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("COURIER_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".courier").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    config
        .rate_limits
        .validate()
        .with_context(|| format!("invalid config in {}", path.display()))?;
    Ok((config, path))
}
