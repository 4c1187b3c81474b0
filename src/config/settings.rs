use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub matchmaking: MatchmakingConfig,
    #[serde(default)]
    pub rooms: RoomConfig,
    #[serde(default)]
    pub batcher: BatcherConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub shutdown: ShutdownSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Use the first `X-Forwarded-For` entry as the client address
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiConfig {
    /// Key required in `X-API-Key` for the admin/debug endpoints
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Heartbeat interval in seconds (server sends heartbeat)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Connection timeout in seconds (disconnect if no activity)
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Cleanup task interval in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// Seconds a new connection has to identify its tab
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    /// Outbound channel capacity per connection (in batches)
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

fn default_heartbeat_interval() -> u64 {
    25
}

fn default_connection_timeout() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    120 // 2 minutes
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_channel_buffer() -> usize {
    64
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_connections_per_ip() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchmakingConfig {
    #[serde(default = "default_max_interests")]
    pub max_interests: usize,
    #[serde(default = "default_max_interest_len")]
    pub max_interest_len: usize,
    /// Whether two waiters behind the same IP may be paired
    #[serde(default = "default_true")]
    pub allow_same_ip: bool,
    /// Optional wait ceiling; unset means tickets wait until matched or cancelled
    #[serde(default)]
    pub max_wait_secs: Option<u64>,
    /// Interval in seconds of the background matching pass
    #[serde(default = "default_match_interval")]
    pub match_interval: u64,
}

fn default_max_interests() -> usize {
    10
}

fn default_max_interest_len() -> usize {
    32
}

fn default_match_interval() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RoomConfig {
    /// Close rooms with no relayed traffic for this many seconds
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatcherConfig {
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,
    #[serde(default = "default_max_pending_per_target")]
    pub max_pending_per_target: usize,
}

fn default_flush_delay_ms() -> u64 {
    16
}

fn default_max_pending_per_target() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Connections idle for longer than this are counted as stale
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_stale_ratio_degraded")]
    pub stale_ratio_degraded: f64,
    #[serde(default = "default_stale_ratio_down")]
    pub stale_ratio_down: f64,
    #[serde(default = "default_queue_depth_threshold")]
    pub queue_depth_threshold: usize,
    /// Consecutive samples above threshold before queue depth counts as sustained
    #[serde(default = "default_sustained_samples")]
    pub sustained_samples: usize,
    /// Ping-timeout + transport-close disconnects between two samples
    #[serde(default = "default_disconnect_spike")]
    pub disconnect_spike: u64,
    #[serde(default = "default_sample_history")]
    pub sample_history: usize,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_stale_after_secs() -> u64 {
    60
}

fn default_stale_ratio_degraded() -> f64 {
    0.25
}

fn default_stale_ratio_down() -> f64 {
    0.5
}

fn default_queue_depth_threshold() -> usize {
    50
}

fn default_sustained_samples() -> usize {
    5
}

fn default_disconnect_spike() -> u64 {
    20
}

fn default_sample_history() -> usize {
    60
}

fn default_read_timeout_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileConfig {
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
    /// auth id -> display identity, served by the static profile store
    #[serde(default)]
    pub identities: HashMap<String, StaticIdentity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticIdentity {
    pub username: Option<String>,
    pub display_name: Option<String>,
}

fn default_lookup_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownSettings {
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_reconnect_after")]
    pub reconnect_after_seconds: u64,
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_reconnect_after() -> u64 {
    5
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8081)?
            .set_default("limits.max_connections_per_ip", 5)?
            .set_default("websocket.cleanup_interval", 120)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // PAIRLINE_SERVER__PORT, PAIRLINE_LIMITS__MAX_CONNECTIONS_PER_IP, ...
            .add_source(
                Environment::with_prefix("PAIRLINE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            trust_forwarded_for: false,
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            connection_timeout: default_connection_timeout(),
            cleanup_interval: default_cleanup_interval(),
            handshake_timeout: default_handshake_timeout(),
            channel_buffer: default_channel_buffer(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_connections_per_ip: default_max_connections_per_ip(),
        }
    }
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            max_interests: default_max_interests(),
            max_interest_len: default_max_interest_len(),
            allow_same_ip: true,
            max_wait_secs: None,
            match_interval: default_match_interval(),
        }
    }
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            flush_delay_ms: default_flush_delay_ms(),
            max_pending_per_target: default_max_pending_per_target(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            stale_ratio_degraded: default_stale_ratio_degraded(),
            stale_ratio_down: default_stale_ratio_down(),
            queue_depth_threshold: default_queue_depth_threshold(),
            sustained_samples: default_sustained_samples(),
            disconnect_spike: default_disconnect_spike(),
            sample_history: default_sample_history(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            lookup_timeout_ms: default_lookup_timeout_ms(),
            identities: HashMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout(),
            reconnect_after_seconds: default_reconnect_after(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8081);
        assert!(!server.trust_forwarded_for);
    }

    #[test]
    fn test_limits_defaults() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.max_connections_per_ip, 5);
        assert_eq!(limits.max_connections, 10_000);
    }

    #[test]
    fn test_matchmaking_has_no_wait_ceiling_by_default() {
        let config = MatchmakingConfig::default();
        assert!(config.max_wait_secs.is_none());
        assert!(config.allow_same_ip);
    }

    #[test]
    fn test_partial_section_fills_defaults() {
        let settings: Settings = Config::builder()
            .set_override("limits.max_connections_per_ip", 2)
            .unwrap()
            .set_override("batcher.flush_delay_ms", 5)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.limits.max_connections_per_ip, 2);
        assert_eq!(settings.limits.max_connections, 10_000);
        assert_eq!(settings.batcher.flush_delay_ms, 5);
        assert_eq!(settings.batcher.max_pending_per_target, 256);
        assert_eq!(settings.websocket.cleanup_interval, 120);
    }
}
