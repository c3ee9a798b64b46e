use rand::seq::SliceRandom;
use regex::Regex;

/// Cross-domain configuration for one origin: the pattern requests'
/// `Origin` headers are matched against, the domain echoed into HTML
/// streaming responses, and the pool of host prefixes handed to clients
/// for hostname sharding.
#[derive(Debug, Clone)]
pub struct CrossDomainInfo {
    matcher: Regex,
    prefixes: Vec<String>,
}

impl CrossDomainInfo {
    /// Compiles the origin pattern. `prefixes` must be non-empty; the prefix
    /// handed out is drawn uniformly from it on every use.
    pub fn new(origin_pattern: &str, prefixes: Vec<String>) -> Result<Self, regex::Error> {
        assert!(!prefixes.is_empty(), "host prefix list must be non-empty");
        Ok(Self {
            matcher: Regex::new(origin_pattern)?,
            prefixes,
        })
    }

    pub fn allows_origin(&self, origin: &str) -> bool {
        self.matcher.is_match(origin)
    }

    pub fn host_prefix(&self) -> &str {
        self.prefixes
            .choose(&mut rand::thread_rng())
            .expect("prefix list is non-empty")
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }
}

/// The prefix for a session when no cross-domain config is present.
pub fn host_prefix(info: Option<&CrossDomainInfo>) -> String {
    info.map(|i| i.host_prefix().to_string()).unwrap_or_default()
}
