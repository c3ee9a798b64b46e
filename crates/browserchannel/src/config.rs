use std::time::Duration;

use crate::cors::CrossDomainInfo;

/// Per-channel timer durations. The defaults match what the reference
/// browser client expects; tests shorten them instead of mocking time.
#[derive(Debug, Clone)]
pub struct ChannelTimeouts {
    /// Without forward activity in Init, or back-channel reattachment in
    /// Ready, the session is terminated after this long.
    pub session: Duration,
    /// An attached, idle back channel receives an empty keep-alive batch on
    /// this interval so intermediaries keep the connection open.
    pub heartbeat: Duration,
    /// Armed when a back channel detaches; the session is terminated if no
    /// replacement attaches in time.
    pub dead_client: Duration,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self {
            session: Duration::from_secs(3 * 60),
            heartbeat: Duration::from_secs(15),
            dead_client: Duration::from_secs(30),
        }
    }
}

/// Dispatcher configuration. Requests are routed on their final path
/// segment, so the router can be nested under any mount point.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_path: String,
    pub test_path: String,
    pub timeouts: ChannelTimeouts,
    /// When set, matching origins are echoed in CORS headers and sessions
    /// are handed a host prefix from the configured pool.
    pub cross_domain: Option<CrossDomainInfo>,
}

pub const DEFAULT_BIND_PATH: &str = "bind";
pub const DEFAULT_TEST_PATH: &str = "test";

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_path: DEFAULT_BIND_PATH.to_string(),
            test_path: DEFAULT_TEST_PATH.to_string(),
            timeouts: ChannelTimeouts::default(),
            cross_domain: None,
        }
    }
}
