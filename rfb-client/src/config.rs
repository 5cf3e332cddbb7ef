//! Configuration types for the VNC client.

use crate::errors::RfbClientError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete VNC client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    pub connection: ConnectionConfig,
    /// Display settings.
    pub display: DisplayConfig,
    /// Security settings.
    pub security: SecurityConfig,
    /// Input settings.
    pub input: InputConfig,
    /// Reconnection settings.
    pub reconnect: ReconnectConfig,
}

/// Connection configuration, including the ms-denominated tunables that govern the
/// connection driver's establish/handle loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server hostname or IP address.
    pub host: String,
    /// Server port (typically 5900 + display number).
    pub port: u16,
    /// VNC password (if required).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Connection timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Socket read timeout in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Delay between reconnection attempts while a connection cannot be established.
    #[serde(default = "default_connection_retry_interval_ms")]
    pub connection_retry_interval_ms: u64,
    /// Maximum time to wait for an inbound protocol message in the handle loop before
    /// treating the wait as idle.
    #[serde(default = "default_message_wait_timeout_ms")]
    pub message_wait_timeout_ms: u64,
    /// Interval at which the driver proactively requests incremental framebuffer
    /// updates. Zero or negative disables proactive polling (server-push only).
    #[serde(default = "default_fast_framebuffer_update_interval_ms")]
    pub fast_framebuffer_update_interval_ms: i64,
    /// If no framebuffer update has arrived within this bound, the driver issues a
    /// full (non-incremental) refresh to recover from a missed update.
    #[serde(default = "default_framebuffer_update_watchdog_timeout_ms")]
    pub framebuffer_update_watchdog_timeout_ms: u64,
    /// Bound on how long `Client::join`/`stop` waits for the driver thread to exit
    /// before escalating to a forced, leaked shutdown.
    #[serde(default = "default_thread_termination_timeout_ms")]
    pub thread_termination_timeout_ms: u64,
    /// TCP keepalive idle time before the first probe.
    #[serde(default = "default_socket_keepalive_idle_ms")]
    pub socket_keepalive_idle_ms: u64,
    /// TCP keepalive probe interval.
    #[serde(default = "default_socket_keepalive_interval_ms")]
    pub socket_keepalive_interval_ms: u64,
    /// Number of unacknowledged TCP keepalive probes before the connection is
    /// considered dead.
    #[serde(default = "default_socket_keepalive_count")]
    pub socket_keepalive_count: u32,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_connection_retry_interval_ms() -> u64 {
    5_000
}

/// Base wait granularity for the handle loop's `wait_for_message` poll. Kept in the
/// low tens of milliseconds rather than the hundreds: in periodic mode (spec §4.1
/// step 2) this value is multiplied by 100, and that product must stay within the
/// watchdog bound (`max(2 * fast_framebuffer_update_interval_ms, framebuffer_update_watchdog_timeout_ms)`)
/// or the watchdog and periodic-incremental paths can't run on schedule.
fn default_message_wait_timeout_ms() -> u64 {
    20
}

fn default_fast_framebuffer_update_interval_ms() -> i64 {
    0
}

fn default_framebuffer_update_watchdog_timeout_ms() -> u64 {
    2_000
}

fn default_thread_termination_timeout_ms() -> u64 {
    5_000
}

fn default_socket_keepalive_idle_ms() -> u64 {
    10_000
}

fn default_socket_keepalive_interval_ms() -> u64 {
    3_000
}

fn default_socket_keepalive_count() -> u32 {
    3
}

/// Display configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Preferred encodings in priority order.
    #[serde(default = "default_encodings")]
    pub encodings: Vec<i32>,
    /// Selected quality level, driving [`crate::quality::Quality::profile`].
    #[serde(default)]
    pub quality: QualityLevel,
    /// Whether to request the server-rendered remote cursor shape.
    #[serde(default = "default_true")]
    pub use_remote_cursor: bool,
}

fn default_encodings() -> Vec<i32> {
    // Minimal, known-good baseline encodings: Raw(0), CopyRect(1), ZRLE(16)
    vec![
        rfb_encodings::ENCODING_RAW,
        rfb_encodings::ENCODING_COPY_RECT,
        rfb_encodings::ENCODING_ZRLE,
    ]
}

/// Mirrors [`crate::quality::Quality`]; kept distinct so `Config` can derive
/// `Serialize`/`Deserialize` without adding those bounds to the pure mapping type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QualityLevel {
    Highest,
    #[default]
    High,
    Medium,
    Low,
    Lowest,
}

impl From<QualityLevel> for crate::quality::Quality {
    fn from(level: QualityLevel) -> Self {
        match level {
            QualityLevel::Highest => crate::quality::Quality::Highest,
            QualityLevel::High => crate::quality::Quality::High,
            QualityLevel::Medium => crate::quality::Quality::Medium,
            QualityLevel::Low => crate::quality::Quality::Low,
            QualityLevel::Lowest => crate::quality::Quality::Lowest,
        }
    }
}

/// Security configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// View-only mode (no input sent to server).
    #[serde(default)]
    pub view_only: bool,
}

/// Input configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Pointer event rate limit in Hz.
    #[serde(default = "default_pointer_rate_hz")]
    pub pointer_rate_hz: u32,
    /// Enable pointer event throttling.
    #[serde(default = "default_true")]
    pub pointer_throttle: bool,
}

fn default_pointer_rate_hz() -> u32 {
    60
}

fn default_true() -> bool {
    true
}

/// Reconnection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection.
    #[serde(default)]
    pub enabled: bool,
    /// Maximum number of retry attempts (0 = infinite).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Jitter factor (0.0-1.0) for backoff randomization.
    #[serde(default = "default_jitter")]
    pub jitter: f32,
}

fn default_max_retries() -> u32 {
    5
}

fn default_jitter() -> f32 {
    0.1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig {
                host: String::new(),
                port: 5900,
                password: None,
                connect_timeout_ms: default_connect_timeout_ms(),
                read_timeout_ms: default_read_timeout_ms(),
                connection_retry_interval_ms: default_connection_retry_interval_ms(),
                message_wait_timeout_ms: default_message_wait_timeout_ms(),
                fast_framebuffer_update_interval_ms: default_fast_framebuffer_update_interval_ms(),
                framebuffer_update_watchdog_timeout_ms:
                    default_framebuffer_update_watchdog_timeout_ms(),
                thread_termination_timeout_ms: default_thread_termination_timeout_ms(),
                socket_keepalive_idle_ms: default_socket_keepalive_idle_ms(),
                socket_keepalive_interval_ms: default_socket_keepalive_interval_ms(),
                socket_keepalive_count: default_socket_keepalive_count(),
            },
            display: DisplayConfig {
                encodings: default_encodings(),
                quality: QualityLevel::default(),
                use_remote_cursor: true,
            },
            security: SecurityConfig { view_only: false },
            input: InputConfig {
                pointer_rate_hz: default_pointer_rate_hz(),
                pointer_throttle: default_true(),
            },
            reconnect: ReconnectConfig {
                enabled: false,
                max_retries: default_max_retries(),
                jitter: default_jitter(),
            },
        }
    }
}

impl Config {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), RfbClientError> {
        if self.connection.host.is_empty() {
            return Err(RfbClientError::Config("Host cannot be empty".to_string()));
        }

        if self.connection.port == 0 {
            return Err(RfbClientError::Config("Port cannot be 0".to_string()));
        }

        if self.display.encodings.is_empty() {
            return Err(RfbClientError::Config(
                "At least one encoding must be specified".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(RfbClientError::Config(
                "Jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.connection.socket_keepalive_count == 0 {
            return Err(RfbClientError::Config(
                "socket_keepalive_count must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the connection timeout duration.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.connect_timeout_ms)
    }

    /// Returns the read timeout duration.
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.read_timeout_ms)
    }

    /// Returns the retry backoff duration used between failed establish attempts.
    #[must_use]
    pub fn connection_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connection.connection_retry_interval_ms)
    }

    /// Returns the encodings to request in priority order, derived from
    /// [`DisplayConfig::quality`] via [`crate::quality::Quality::profile`].
    ///
    /// `QualityProfile::encodings` names preferences this workspace has no decoder
    /// for (`zywrle`, `ultra`, `zlib`, `corre`, which have no `rfb-encodings`
    /// counterpart); those names are skipped rather than rejected, and `Raw` is
    /// always appended so the list is never empty.
    #[must_use]
    pub fn effective_encodings(&self) -> Vec<i32> {
        encodings_for_quality(crate::quality::Quality::from(self.display.quality))
    }
}

/// Derives the requested encoding list for a given [`crate::quality::Quality`], the
/// same mapping [`Config::effective_encodings`] uses, exposed standalone so the
/// connection driver can re-derive it after a runtime `setQuality` call without a
/// full `Config` in hand.
#[must_use]
pub fn encodings_for_quality(quality: crate::quality::Quality) -> Vec<i32> {
    let profile = quality.profile();
    let mut encodings = Vec::new();
    for name in profile.encodings.split_whitespace() {
        let encoding = match name {
            "tight" => Some(rfb_encodings::ENCODING_TIGHT),
            "zrle" => Some(rfb_encodings::ENCODING_ZRLE),
            "hextile" => Some(rfb_encodings::ENCODING_HEXTILE),
            "rre" => Some(rfb_encodings::ENCODING_RRE),
            "copyrect" => Some(rfb_encodings::ENCODING_COPY_RECT),
            "raw" => Some(rfb_encodings::ENCODING_RAW),
            _ => None,
        };
        if let Some(encoding) = encoding {
            if !encodings.contains(&encoding) {
                encodings.push(encoding);
            }
        }
    }
    if !encodings.contains(&rfb_encodings::ENCODING_RAW) {
        encodings.push(rfb_encodings::ENCODING_RAW);
    }
    encodings
}

/// Builder for creating a `Config`.
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Sets the server hostname or IP address.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.connection.host = host.into();
        self
    }

    /// Sets the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.connection.port = port;
        self
    }

    /// Sets the VNC password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.connection.password = Some(password.into());
        self
    }

    /// Sets the encoding quality level.
    #[must_use]
    pub fn quality(mut self, quality: QualityLevel) -> Self {
        self.config.display.quality = quality;
        self
    }

    /// Enables or disables automatic reconnection.
    #[must_use]
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect.enabled = enabled;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<Config, RfbClientError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
