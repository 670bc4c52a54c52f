use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::frame::FrameMode;
use crate::pool::ExhaustionPolicy;

const MIN_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Leases come from a bounded pool and clean sockets are reused.
    #[default]
    Pooled,
    /// Every connection dials its own socket and closes it when done.
    Ephemeral,
}

/// Engine configuration.
///
/// Deserializes from any serde source; missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Receive buffer capacity per connection, fixed at creation.
    pub buffer_size: usize,
    /// Dial timeout (milliseconds in serialized form).
    #[serde(deserialize_with = "millis")]
    pub socket_timeout: Duration,
    pub max_pooled_connections: usize,
    /// 0: quiet, 1: state transitions and leases, 2: wire dumps.
    pub debug_level: u8,
    pub pool_policy: ExhaustionPolicy,
    pub transport: TransportMode,
    pub frames: FrameMode,
    /// Sub-protocols offered in `Sec-WebSocket-Protocol`.
    pub protocols: Vec<String>,
    /// Extra handshake headers.
    pub headers: Vec<(String, String)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            socket_timeout: Duration::from_millis(500),
            max_pooled_connections: 2,
            debug_level: 0,
            pool_policy: ExhaustionPolicy::Wait,
            transport: TransportMode::Pooled,
            frames: FrameMode::Protocol,
            protocols: Vec::new(),
            headers: Vec::new(),
        }
    }
}

impl Config {
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn with_max_pooled_connections(mut self, max: usize) -> Self {
        self.max_pooled_connections = max;
        self
    }

    pub fn with_debug_level(mut self, level: u8) -> Self {
        self.debug_level = level;
        self
    }

    pub fn with_pool_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.pool_policy = policy;
        self
    }

    pub fn with_transport(mut self, mode: TransportMode) -> Self {
        self.transport = mode;
        self
    }

    pub fn with_frames(mut self, mode: FrameMode) -> Self {
        self.frames = mode;
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(format!(
                "buffer_size must be at least {MIN_BUFFER_SIZE} bytes, got {}",
                self.buffer_size
            ));
        }
        if self.transport == TransportMode::Pooled && self.max_pooled_connections == 0 {
            return Err("max_pooled_connections must be at least 1".to_owned());
        }
        Ok(())
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Duration::from_millis(u64::deserialize(deserializer)?))
}
