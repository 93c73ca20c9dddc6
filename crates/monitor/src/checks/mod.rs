pub mod availability;
pub mod metrics;
pub mod ns;

pub use availability::{
    AvailabilityVerdict, FailureTracker, HttpReachability, Reachability, TcpReachability,
};
pub use metrics::{GlancesProbe, MetricsProbe, ProbeOutcome, ResourceSnapshot};
pub use ns::{HickoryNsResolver, LookupFailure, NsCheck, NsResolver, NsVerifier};

use std::time::Duration;
use url::Url;

use crate::{config::Config, store::MonitoredServer, Error, Result};

pub const USER_AGENT: &str = "Reverse-Proxy-Monitor/1.0";
pub const DEFAULT_AGENT_PATH: &str = "/api/4/all";
pub const DEFAULT_AGENT_PORT: u16 = 61208;

/// Timeouts and attempt count shared by every checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckPolicy {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub dns_timeout: Duration,
    /// Always 1: the next scheduler tick is the retry.
    pub attempts: u32,
}

impl CheckPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.probe.connect_timeout_secs),
            request_timeout: Duration::from_secs(config.probe.request_timeout_secs),
            dns_timeout: Duration::from_secs(config.dns.timeout_secs),
            attempts: 1,
        }
    }

    /// Upper bound for one probe future, including connection setup.
    pub fn deadline(&self) -> Duration {
        self.connect_timeout + self.request_timeout.max(self.dns_timeout)
    }
}

impl Default for CheckPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Resolves the agent endpoint for a server. A bare `scheme://host[:port]`
/// gets the default aggregate path.
pub fn agent_endpoint(server: &MonitoredServer) -> Result<Url> {
    let mut url = Url::parse(&server.agent_url)
        .map_err(|e| Error::Validation(format!("Invalid agent URL: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Validation(format!(
            "Unsupported agent URL scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(Error::Validation("Agent URL has no host".into()));
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(DEFAULT_AGENT_PATH);
    }
    Ok(url)
}
