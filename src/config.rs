//! constructor configuration for a proxy instance
//!
//! everything a deployment can set is in [ProxyConfig]; the struct
//! deserializes from the usual config formats and `Default` carries the
//! values a bare instance runs with

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// addresses to accept client connections on
    pub listen_addresses: Vec<SocketAddr>,
    /// certificate material handed to the external TLS acceptor; its
    /// presence switches the advertised scheme to https
    pub tls: Option<TlsOptions>,
    /// inject X-Real-Ip / X-Scheme and strip the client supplied ones
    pub forward_headers: bool,
    /// enables hand-over of websocket upgrades to the multiplexing subsystem
    pub multiplex: Option<MultiplexOptions>,
    /// keep the upstream connection open between requests of one session
    pub keep_upstream_alive: bool,
    /// overrides the Server header on relayed responses
    pub server_header: Option<String>,
    /// overrides the Host header on relayed requests
    pub host_header: Option<String>,
    /// addresses and /8 /16 /24 subnets blocked at startup
    pub static_blocklist: Vec<String>,
    /// file rewritten with the full blocklist on every mutation
    pub blocklist_path: Option<PathBuf>,
    /// access log destination, consumed by the logging backend
    pub access_log_path: Option<PathBuf>,
    /// at most one access record per source address per interval
    pub access_log_interval: Duration,
    pub idle_timeout: Duration,
    /// log full fault context
    pub debug: bool,

    pub max_sessions: usize,
    /// a session active more recently than this is protected from eviction
    pub min_session_keepalive: Duration,
    pub source_limits: Option<SourceLimits>,
    /// how long a temporary block outlives its creation
    pub block_retention: Duration,
    pub maintenance_interval: Duration,
    pub zombie_check_interval: Duration,
    pub connect_timeout: Duration,

    pub min_buffers: usize,
    pub max_buffers: usize,
    pub buffer_size: usize,
    /// line scan ceiling; a header block larger than ten times this is
    /// answered with 413
    pub max_header_line: usize,
    pub allowed_methods: Vec<String>,
    /// how many oversized reset pushbacks one stream may perform
    pub replay_reset_limit: u32,
}

impl Default for ProxyConfig {
    fn default() -> ProxyConfig {
        ProxyConfig {
            listen_addresses: Vec::new(),
            tls: None,
            forward_headers: true,
            multiplex: None,
            keep_upstream_alive: true,
            server_header: None,
            host_header: None,
            static_blocklist: Vec::new(),
            blocklist_path: None,
            access_log_path: None,
            access_log_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            debug: false,
            max_sessions: 10_000,
            min_session_keepalive: Duration::from_secs(5),
            source_limits: None,
            block_retention: Duration::from_secs(600),
            maintenance_interval: Duration::from_secs(30),
            zombie_check_interval: Duration::from_secs(30 * 60),
            connect_timeout: Duration::from_secs(3),
            min_buffers: 10,
            max_buffers: 1_000,
            buffer_size: 16_384,
            max_header_line: 1_024,
            allowed_methods: ["GET", "HEAD", "POST", "PUT", "DELETE", "OPTIONS"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            replay_reset_limit: 1,
        }
    }
}

impl ProxyConfig {
    pub fn max_header_block(&self) -> usize {
        self.max_header_line * 10
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }
}

/// passed through to the external TLS acceptor, never opened here
#[derive(Debug, Clone, Deserialize)]
pub struct TlsOptions {
    pub certificate: PathBuf,
    pub key: PathBuf,
    pub certificate_chain: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MultiplexOptions {
    /// upper bound on multiplexed channels per upgraded connection
    pub max_channels: usize,
    pub channel_idle_timeout: Duration,
}

impl Default for MultiplexOptions {
    fn default() -> MultiplexOptions {
        MultiplexOptions {
            max_channels: 64,
            channel_idle_timeout: Duration::from_secs(300),
        }
    }
}

/// per source address ceilings over a sliding window
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SourceLimits {
    pub max_requests: u64,
    pub max_bytes: u64,
    pub window: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = ProxyConfig::default();
        assert_eq!(config.max_header_block(), 10 * config.max_header_line);
        assert!(config.max_header_block() < config.buffer_size);
        assert_eq!(config.scheme(), "http");
        assert!(config.allowed_methods.iter().any(|m| m == "GET"));
    }
}
