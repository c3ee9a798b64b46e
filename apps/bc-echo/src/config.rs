use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub log_filter: String,
    /// Origin pattern for cross-domain clients, e.g.
    /// `^https?://([a-z0-9]+\.)?example\.com$`.
    pub origin_pattern: Option<String>,
    /// Comma-separated host prefixes handed to cross-domain clients.
    pub host_prefixes: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("BC_ECHO_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            log_filter: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            origin_pattern: env::var("BC_ECHO_ORIGIN").ok().filter(|s| !s.is_empty()),
            host_prefixes: env::var("BC_ECHO_PREFIXES")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}
