//! Gateway configuration: command-line flags with `RENDEZVOUS_*` environment
//! fallbacks, resolved into a [`GatewayConfig`].

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::session::SessionLimits;

/// Default configuration values
pub const DEFAULT_LISTEN: &str = "127.0.0.1:3000";
pub const DEFAULT_MAX_SESSIONS: usize = 4096;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_CANDIDATE_BUFFER: usize = 64;
pub const DEFAULT_OUTBOX_CAPACITY: usize = 128;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_DESCRIPTOR_BYTES: usize = 32 * 1024;
pub const DEFAULT_MAX_CANDIDATE_BYTES: usize = 4096;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;
pub const DEFAULT_MESSAGES_PER_MINUTE: u32 = 600;
pub const DEFAULT_MAX_CONNECTIONS: usize = 8192;
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Resolved runtime settings shared by the core and the transport.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_sessions: usize,
    /// How long a session may sit mid-handshake without activity.
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub candidate_buffer: usize,
    pub outbox_capacity: usize,
    /// How long a send may wait on a full outbox before the channel stalls.
    pub send_timeout: Duration,
    /// Time a fresh connection has to send its `join`.
    pub join_timeout: Duration,
    pub max_descriptor_bytes: usize,
    pub max_candidate_bytes: usize,
    pub max_frame_bytes: usize,
    pub max_messages_per_minute: u32,
    pub max_connections: usize,
    pub ice_servers: Vec<String>,
    pub allowed_origins: Vec<String>,
    pub cors_allow_any: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            candidate_buffer: DEFAULT_CANDIDATE_BUFFER,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            join_timeout: Duration::from_secs(DEFAULT_JOIN_TIMEOUT_SECS),
            max_descriptor_bytes: DEFAULT_MAX_DESCRIPTOR_BYTES,
            max_candidate_bytes: DEFAULT_MAX_CANDIDATE_BYTES,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_messages_per_minute: DEFAULT_MESSAGES_PER_MINUTE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            allowed_origins: Vec::new(),
            cors_allow_any: false,
        }
    }
}

impl GatewayConfig {
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            candidate_buffer: self.candidate_buffer,
            max_descriptor_bytes: self.max_descriptor_bytes,
            max_candidate_bytes: self.max_candidate_bytes,
        }
    }

    /// Whether a WebSocket upgrade from `origin` may proceed. With no
    /// configured origins every origin is accepted.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.cors_allow_any || self.allowed_origins.is_empty() {
            return true;
        }
        let Some(origin) = origin else {
            return false;
        };
        let origin = origin.trim().trim_end_matches('/');
        self.allowed_origins
            .iter()
            .any(|allowed| allowed.trim_end_matches('/').eq_ignore_ascii_case(origin))
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "rendezvous-gateway")]
#[command(about = "Rendezvous gateway - pairs WebRTC peers and relays their handshake")]
pub struct Args {
    /// HTTP/WebSocket listen address
    #[arg(long, env = "RENDEZVOUS_LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: SocketAddr,

    /// Allow binding a non-loopback address (also RENDEZVOUS_ALLOW_PUBLIC_BIND=1)
    #[arg(long, default_value_t = false)]
    pub allow_public_bind: bool,

    /// Maximum concurrent sessions
    #[arg(long, env = "RENDEZVOUS_MAX_SESSIONS", default_value_t = DEFAULT_MAX_SESSIONS)]
    pub max_sessions: usize,

    /// Handshake idle timeout in seconds
    #[arg(long, env = "RENDEZVOUS_IDLE_TIMEOUT_SECS", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout: u64,

    /// Expiry sweep interval in seconds
    #[arg(long, env = "RENDEZVOUS_SWEEP_INTERVAL_SECS", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    pub sweep_interval: u64,

    /// Messages buffered per participant that has not joined yet
    #[arg(long, env = "RENDEZVOUS_CANDIDATE_BUFFER", default_value_t = DEFAULT_CANDIDATE_BUFFER)]
    pub candidate_buffer: usize,

    /// Outbound frames queued per connection
    #[arg(long, env = "RENDEZVOUS_OUTBOX_CAPACITY", default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    pub outbox_capacity: usize,

    /// Milliseconds a relay send may block on a full outbox
    #[arg(long, env = "RENDEZVOUS_SEND_TIMEOUT_MS", default_value_t = DEFAULT_SEND_TIMEOUT_MS)]
    pub send_timeout_ms: u64,

    /// Seconds a connection has to send `join`
    #[arg(long, env = "RENDEZVOUS_JOIN_TIMEOUT_SECS", default_value_t = DEFAULT_JOIN_TIMEOUT_SECS)]
    pub join_timeout: u64,

    #[arg(long, env = "RENDEZVOUS_MAX_DESCRIPTOR_BYTES", default_value_t = DEFAULT_MAX_DESCRIPTOR_BYTES)]
    pub max_descriptor_bytes: usize,

    #[arg(long, env = "RENDEZVOUS_MAX_CANDIDATE_BYTES", default_value_t = DEFAULT_MAX_CANDIDATE_BYTES)]
    pub max_candidate_bytes: usize,

    /// Largest accepted WebSocket text frame
    #[arg(long, env = "RENDEZVOUS_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    /// Per-connection message rate limit
    #[arg(long, env = "RENDEZVOUS_MESSAGES_PER_MINUTE", default_value_t = DEFAULT_MESSAGES_PER_MINUTE)]
    pub messages_per_minute: u32,

    /// Maximum concurrent WebSocket connections
    #[arg(long, env = "RENDEZVOUS_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// ICE server URLs handed out by /ice-config
    #[arg(
        long = "ice-server",
        env = "RENDEZVOUS_ICE_SERVERS",
        value_delimiter = ',',
        default_values = DEFAULT_ICE_SERVERS
    )]
    pub ice_servers: Vec<String>,

    /// Allowed browser origins for CORS and WebSocket upgrades
    #[arg(long = "allowed-origin", env = "RENDEZVOUS_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Accept any origin
    #[arg(long, default_value_t = false)]
    pub cors_allow_any: bool,

    /// Log level
    #[arg(long, env = "RENDEZVOUS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_sessions: self.max_sessions.max(1),
            idle_timeout: Duration::from_secs(self.idle_timeout.max(1)),
            sweep_interval: Duration::from_secs(self.sweep_interval.max(1)),
            candidate_buffer: self.candidate_buffer,
            outbox_capacity: self.outbox_capacity.max(1),
            send_timeout: Duration::from_millis(self.send_timeout_ms.max(1)),
            join_timeout: Duration::from_secs(self.join_timeout.max(1)),
            max_descriptor_bytes: self.max_descriptor_bytes,
            max_candidate_bytes: self.max_candidate_bytes,
            max_frame_bytes: self.max_frame_bytes,
            max_messages_per_minute: self.messages_per_minute.max(1),
            max_connections: self.max_connections.max(1),
            ice_servers: self.ice_servers.clone(),
            allowed_origins: self.allowed_origins.clone(),
            cors_allow_any: self.cors_allow_any || env_bool("RENDEZVOUS_CORS_ALLOW_ANY", false),
        }
    }

    /// Refuse a non-loopback bind unless it was explicitly allowed.
    pub fn check_public_bind_allowed(&self) -> anyhow::Result<()> {
        if self.listen.ip().is_loopback() {
            return Ok(());
        }
        if self.allow_public_bind || env_bool("RENDEZVOUS_ALLOW_PUBLIC_BIND", false) {
            return Ok(());
        }
        Err(anyhow::anyhow!(
            "refusing non-loopback bind on {} without --allow-public-bind or RENDEZVOUS_ALLOW_PUBLIC_BIND=1",
            self.listen
        ))
    }
}

pub(crate) fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
