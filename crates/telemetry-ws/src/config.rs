//! Telemetry connection configuration.

use std::time::Duration;

use url::Url;

use crate::{
    error::{TelemetryError, TelemetryResult},
    reconnect::ReconnectPolicy,
};

/// Path of the telemetry socket relative to the REST API base.
const TELEMETRY_PATH: &str = "api/ws";

/// Configuration for the telemetry engine.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Telemetry socket, usually `ws(s)://host/api/ws`.
    pub url: String,

    // Reconnect
    /// Wait after the first close before reopening.
    pub reconnect_initial_delay: Duration,
    /// Upper bound for the reopen wait after repeated failures.
    pub reconnect_max_delay: Duration,
    /// Growth of the reopen wait per consecutive failure (1.0 keeps it fixed).
    pub reconnect_backoff_factor: f64,
    /// Share of the reopen wait (0.0-1.0) that may be randomly cut.
    pub reconnect_jitter: f64,

    // Outbound commands
    /// Maximum number of commands carried by one `{"cmds": [...]}` frame.
    pub batch_size: usize,
    /// Capacity of the engine's command mailbox.
    pub command_channel_capacity: usize,

    // Connection
    /// Timeout covering token refresh plus transport open.
    pub connect_timeout: Duration,
    /// Interval between protocol-level pings (None disables keepalive).
    pub ping_interval: Option<Duration>,
    /// Close the connection after this long without subscribers (None keeps it open).
    pub idle_timeout: Option<Duration>,
    /// In-band error codes that force a reconnect.
    pub critical_error_codes: Vec<i64>,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect_initial_delay: Duration::from_millis(2000),
            reconnect_max_delay: Duration::from_millis(2000),
            reconnect_backoff_factor: 1.0,
            reconnect_jitter: 0.0,
            batch_size: 10,
            command_channel_capacity: 64,
            connect_timeout: Duration::from_secs(10),
            ping_interval: Some(Duration::from_secs(30)),
            idle_timeout: Some(Duration::from_secs(90)),
            critical_error_codes: vec![1, 2],
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

impl TelemetryConfig {
    /// Create a new configuration with the given socket URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Create a configuration whose socket URL is derived from a REST API endpoint.
    ///
    /// `https://host/base` becomes `wss://host/base/api/ws`, `http` becomes `ws`.
    pub fn from_api_endpoint(api_endpoint: &str) -> TelemetryResult<Self> {
        Ok(Self::new(telemetry_url(api_endpoint)?))
    }

    /// Set the wait after the first close.
    #[must_use]
    pub fn reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.reconnect_initial_delay = delay;
        self
    }

    /// Cap the reopen wait.
    #[must_use]
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    /// Grow the reopen wait by `factor` per consecutive failure.
    #[must_use]
    pub fn reconnect_backoff_factor(mut self, factor: f64) -> Self {
        self.reconnect_backoff_factor = factor;
        self
    }

    /// Randomly cut up to `jitter` of each reopen wait.
    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Set the number of commands per outbound frame.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Bound token refresh plus transport open.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the keepalive ping interval.
    #[must_use]
    pub fn ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the idle close timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the in-band error codes that force a reconnect.
    #[must_use]
    pub fn critical_error_codes(mut self, codes: impl Into<Vec<i64>>) -> Self {
        self.critical_error_codes = codes.into();
        self
    }

    /// Set the command mailbox capacity.
    #[must_use]
    pub fn command_channel_capacity(mut self, capacity: usize) -> Self {
        self.command_channel_capacity = capacity;
        self
    }

    pub(crate) fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial: self.reconnect_initial_delay,
            ceiling: self.reconnect_max_delay,
            factor: self.reconnect_backoff_factor,
            jitter: self.reconnect_jitter,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL cannot be empty".to_string());
        }
        self.reconnect_policy().check()?;
        if self.batch_size == 0 {
            return Err("Batch size must be > 0".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        if self.ping_interval.is_some_and(|i| i.is_zero()) {
            return Err("Ping interval must be > 0".to_string());
        }
        if self.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err("Idle timeout must be > 0".to_string());
        }
        if self.command_channel_capacity == 0 {
            return Err("Command channel capacity must be > 0".to_string());
        }
        Ok(())
    }
}

/// Derive the telemetry socket URL from a REST API endpoint.
pub fn telemetry_url(api_endpoint: &str) -> TelemetryResult<String> {
    let mut url = Url::parse(api_endpoint)?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(TelemetryError::config(format!(
                "Unsupported API endpoint scheme: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TelemetryError::config("Failed to derive socket scheme"))?;

    let base = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base}/{TELEMETRY_PATH}"));
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}
