//! Client configuration

use std::time::Duration;

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;

/// Client configuration options
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Registry server address (`host:port`)
    pub server_addr: String,

    /// Name of this client; scopes the owner key of its own registrations
    pub name: String,

    /// Time allowed for one TCP connect attempt
    pub connect_timeout: Duration,

    /// Delay before the first reconnect attempt
    pub reconnect_delay: Duration,

    /// Upper bound of the exponential reconnect back-off
    pub max_reconnect_delay: Duration,

    /// Outbound queue capacity, in messages
    pub outbound_queue: usize,

    /// Largest accepted frame body, in bytes
    pub max_frame_size: usize,

    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:9777".to_string(),
            name: "client".to_string(),
            connect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_millis(200),
            max_reconnect_delay: Duration::from_secs(10),
            outbound_queue: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            tcp_nodelay: true,
        }
    }
}

impl ClientConfig {
    /// Config for the server at `addr`
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            server_addr: addr.into(),
            ..Default::default()
        }
    }

    /// Set the client name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the reconnect back-off range
    ///
    /// `max` is raised to `initial` when smaller.
    pub fn reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max.max(initial);
        self
    }

    /// Set the outbound queue capacity (at least 1)
    pub fn outbound_queue(mut self, capacity: usize) -> Self {
        self.outbound_queue = capacity.max(1);
        self
    }

    /// Set the largest accepted frame body
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Delay after `current`: doubled, capped at `max_reconnect_delay`
    pub(crate) fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_reconnect_delay)
    }
}
