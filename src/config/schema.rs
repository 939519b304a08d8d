//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the transport engine and interception proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Certificate material for TLS interception.
    pub tls: Option<TlsConfig>,

    /// Transparent proxy behaviour.
    pub proxy: ProxySettings,

    /// Outbound connection pool.
    pub pool: PoolConfig,

    /// HTTP/2 client settings.
    pub http2: Http2Config,

    /// DNS lookup and cache settings.
    pub dns: DnsConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Size caps for HTTP/1.x messages read off the wire.
    pub limits: LimitsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8084").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8084".to_string(),
            max_connections: 10_000,
        }
    }
}

/// TLS certificate material presented to intercepted clients.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain (PEM).
    pub cert_path: String,

    /// Path to private key (PEM).
    pub key_path: String,
}

/// How the proxy treats traffic after the first request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Splice bytes in both directions after the first request.
    #[default]
    Forward,
    /// Parse every exchange and run the rewrite/mirror hooks.
    Hijack,
}

/// Transparent proxy settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySettings {
    pub mode: ProxyMode,

    /// Body served locally when a request targets the proxy itself.
    pub fallback_body: String,

    /// Port assumed for plaintext requests whose Host has no port.
    pub default_http_port: u16,

    /// Port assumed for TLS requests whose Host/SNI has no port.
    pub default_https_port: u16,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Forward,
            fallback_body: "<html><body><h1>rawhttp</h1><p>This request was addressed to the proxy itself.</p></body></html>".to_string(),
            default_http_port: 80,
            default_https_port: 443,
        }
    }
}

/// Outbound connection pool limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections kept per connection key.
    pub max_idle_per_key: usize,

    /// Idle connections kept across all keys.
    pub max_idle_total: usize,

    /// Idle connections older than this are discarded on acquire.
    pub idle_ttl_secs: u64,

    /// How often the idle reaper closes expired connections.
    pub purge_interval_secs: u64,

    /// Retries allowed for failures on reused connections.
    pub max_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_key: 16,
            max_idle_total: 256,
            idle_ttl_secs: 90,
            purge_interval_secs: 30,
            max_retries: 2,
        }
    }
}

impl PoolConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

/// HTTP/2 client settings advertised in the initial SETTINGS frame.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Http2Config {
    /// Stream-level receive window advertised to servers.
    pub initial_window_size: u32,

    /// Extra connection-level credit granted right after SETTINGS.
    pub connection_window_increment: u32,

    /// Maximum concurrent streams advertised to servers.
    pub max_concurrent_streams: u32,

    /// How long to wait for the server's SETTINGS frame.
    pub handshake_timeout_secs: u64,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            initial_window_size: 1 << 24,
            connection_window_increment: (1 << 30) - 65_535,
            max_concurrent_streams: 100,
            handshake_timeout_secs: 5,
        }
    }
}

/// DNS lookup and cache settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Seconds a resolved address stays cached.
    pub cache_ttl_secs: u64,

    /// Per-lookup timeout in seconds.
    pub timeout_secs: u64,

    /// Nameservers handed to a custom lookup primitive. The system resolver
    /// always uses the host's own configuration and ignores this list.
    pub servers: Vec<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            timeout_secs: 5,
            servers: Vec::new(),
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Request timeout (write + full response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            request_secs: 30,
        }
    }
}

/// Message size caps.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest accepted request or status line plus headers, in bytes.
    pub max_head_bytes: usize,

    /// Largest accepted body in bytes, chunk framing included.
    pub max_body_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: EngineConfig = toml::from_str("[proxy]\nmode = \"hijack\"\n").unwrap();
        assert_eq!(config.proxy.mode, ProxyMode::Hijack);
        assert_eq!(config.pool.max_idle_per_key, 16);
        assert!(config.tls.is_none());
        assert_eq!(config.limits.max_head_bytes, 64 * 1024);
    }

    #[test]
    fn limits_section_overrides_caps() {
        let config: EngineConfig =
            toml::from_str("[limits]\nmax_body_bytes = 1024\n").unwrap();
        assert_eq!(config.limits.max_body_bytes, 1024);
        assert_eq!(config.limits.max_head_bytes, 64 * 1024);
    }
}
