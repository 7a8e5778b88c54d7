//! Server configuration.

use crate::encoder::DEFAULT_HARD_CUT_DISTANCE;
use crate::session::HostPolicy;
use shared::{DEFAULT_BROADCAST_PERIOD_MS, DEFAULT_PORT, IDENTIFY_TIMEOUT_SECS};
use std::time::Duration;

pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the TCP listener binds to. Port 0 picks a free port.
    pub bind_addr: String,
    /// Wall-clock period of the data-stream broadcast loop.
    pub broadcast_period: Duration,
    /// How long a new socket may take to send `Identify`.
    pub identify_timeout: Duration,
    /// Detached sessions are evicted after this long. `None` keeps them.
    pub session_idle_timeout: Option<Duration>,
    pub max_connections: usize,
    /// Client ids granted host authorization. Empty means the first client
    /// to identify becomes host.
    pub host_ids: Vec<String>,
    /// Per-tick movement beyond which an entity is hard cut.
    pub hard_cut_distance: f32,
}

impl ServerConfig {
    pub fn host_policy(&self) -> HostPolicy {
        HostPolicy::from_ids(self.host_ids.clone())
    }

    /// Loopback config on an ephemeral port.
    pub fn local() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            broadcast_period: Duration::from_millis(DEFAULT_BROADCAST_PERIOD_MS),
            identify_timeout: Duration::from_secs(IDENTIFY_TIMEOUT_SECS),
            session_idle_timeout: Some(DEFAULT_SESSION_IDLE_TIMEOUT),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            host_ids: Vec::new(),
            hard_cut_distance: DEFAULT_HARD_CUT_DISTANCE,
        }
    }
}
