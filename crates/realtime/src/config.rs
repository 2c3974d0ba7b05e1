//! Client configuration

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::reconnect::ReconnectConfig;

const DEFAULT_QUEUE_NAMESPACE: &str = "plexmcp-realtime";

/// Realtime client configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    // Endpoints
    pub server_url: Url,
    pub api_url: Url,
    pub access_token: Option<String>,

    // Connection lifecycle
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,

    // Reconnection
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub manual_reconnect_delay: Duration,

    // Delivery
    pub dedup_window: Duration,
    pub queue_dir: Option<PathBuf>, // None keeps the queue in memory
    /// Storage namespace; clients sharing a store need distinct namespaces
    pub queue_namespace: String,
}

impl RealtimeConfig {
    /// Configuration with default timings for a server URL
    pub fn new(server_url: Url) -> Self {
        let api_url = api_url_from(&server_url);
        Self {
            server_url,
            api_url,
            access_token: None,
            connect_timeout: Duration::from_millis(10_000),
            heartbeat_interval: Duration::from_millis(15_000),
            stale_after: Duration::from_millis(45_000),
            reconnect_base_delay: Duration::from_millis(1_000),
            reconnect_max_delay: Duration::from_millis(30_000),
            max_reconnect_attempts: 5,
            manual_reconnect_delay: Duration::from_millis(500),
            dedup_window: Duration::from_millis(1_000),
            queue_dir: None,
            queue_namespace: DEFAULT_QUEUE_NAMESPACE.to_string(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_url = parse_url(
            &env::var("REALTIME_URL").map_err(|_| ConfigError::Missing("REALTIME_URL"))?,
        )?;
        let defaults = Self::new(server_url);

        let config = Self {
            api_url: match env::var("REALTIME_API_URL") {
                Ok(url) => parse_url(&url)?,
                Err(_) => defaults.api_url.clone(),
            },
            access_token: env::var("REALTIME_ACCESS_TOKEN").ok().filter(|t| !t.is_empty()),

            connect_timeout: millis("REALTIME_CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            heartbeat_interval: millis("REALTIME_HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval),
            stale_after: millis("REALTIME_STALE_AFTER_MS", defaults.stale_after),

            reconnect_base_delay: millis("REALTIME_RECONNECT_BASE_MS", defaults.reconnect_base_delay),
            reconnect_max_delay: millis("REALTIME_RECONNECT_MAX_MS", defaults.reconnect_max_delay),
            max_reconnect_attempts: env::var("REALTIME_MAX_RECONNECT_ATTEMPTS")
                .unwrap_or_else(|_| defaults.max_reconnect_attempts.to_string())
                .parse()
                .unwrap_or(defaults.max_reconnect_attempts),
            manual_reconnect_delay: millis(
                "REALTIME_MANUAL_RECONNECT_DELAY_MS",
                defaults.manual_reconnect_delay,
            ),

            dedup_window: millis("REALTIME_DEDUP_WINDOW_MS", defaults.dedup_window),
            queue_dir: env::var("REALTIME_QUEUE_DIR").ok().map(PathBuf::from),
            queue_namespace: env::var("REALTIME_QUEUE_NAMESPACE")
                .unwrap_or(defaults.queue_namespace),

            server_url: defaults.server_url,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject timing combinations the connection task cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("connect timeout must be greater than zero"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid("heartbeat interval must be greater than zero"));
        }
        if self.stale_after <= self.heartbeat_interval {
            return Err(ConfigError::Invalid(
                "stale window must be longer than the heartbeat interval",
            ));
        }
        if self.reconnect_base_delay.is_zero() {
            return Err(ConfigError::Invalid("reconnect base delay must be greater than zero"));
        }
        if self.reconnect_max_delay < self.reconnect_base_delay {
            return Err(ConfigError::Invalid(
                "reconnect max delay must not be shorter than the base delay",
            ));
        }
        let namespace_ok = !self.queue_namespace.is_empty()
            && self
                .queue_namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
        if !namespace_ok {
            return Err(ConfigError::Invalid(
                "queue namespace must be non-empty and use only letters, digits, '-' or '_'",
            ));
        }
        Ok(())
    }

    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            base_delay: self.reconnect_base_delay,
            max_delay: self.reconnect_max_delay,
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", raw, e)))
}

fn millis(var: &str, default: Duration) -> Duration {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Origin of the socket URL with an HTTP scheme
fn api_url_from(server_url: &Url) -> Url {
    let mut api_url = server_url.clone();
    let scheme = match server_url.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => other,
    };
    let _ = api_url.set_scheme(scheme);
    api_url.set_path("");
    api_url.set_query(None);
    api_url.set_fragment(None);
    api_url
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
