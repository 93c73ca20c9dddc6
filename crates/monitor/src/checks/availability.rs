use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

use super::{agent_endpoint, CheckPolicy, DEFAULT_AGENT_PORT, USER_AGENT};
use crate::{
    store::{MonitoredServer, ServerStatus},
    Result,
};

#[async_trait]
pub trait Reachability: Send + Sync {
    async fn check(&self, server: &MonitoredServer) -> bool;
}

/// Reachable when the agent endpoint answers with any 2xx.
pub struct HttpReachability {
    client: reqwest::Client,
}

impl HttpReachability {
    pub fn new(policy: &CheckPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(policy.connect_timeout)
            .timeout(policy.request_timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Reachability for HttpReachability {
    async fn check(&self, server: &MonitoredServer) -> bool {
        let Ok(url) = agent_endpoint(server) else {
            return false;
        };
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(server = %server.name, timeout = e.is_timeout(), "Availability request failed");
                false
            }
        }
    }
}

/// Reachable when a TCP connection to the agent port opens in time.
pub struct TcpReachability {
    connect_timeout: Duration,
}

impl TcpReachability {
    pub fn new(policy: &CheckPolicy) -> Self {
        Self {
            connect_timeout: policy.connect_timeout,
        }
    }
}

#[async_trait]
impl Reachability for TcpReachability {
    async fn check(&self, server: &MonitoredServer) -> bool {
        let Ok(url) = agent_endpoint(server) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        // Url keeps IPv6 hosts bracketed.
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = url.port_or_known_default().unwrap_or(DEFAULT_AGENT_PORT);

        match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(server = %server.name, error = %e, "TCP connect failed");
                false
            }
            Err(_) => {
                debug!(server = %server.name, "TCP connect timed out");
                false
            }
        }
    }
}

/// Result of folding one reachability sample into a server's debounce state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityVerdict {
    pub failures: u32,
    pub status: ServerStatus,
    pub breaching: bool,
}

/// Consecutive-failure counters per server.
pub struct FailureTracker {
    threshold: u32,
    counts: Mutex<HashMap<Uuid, u32>>,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Records a sample for `server`. The first sample for a server seeds
    /// the counter from its persisted `failure_count`.
    pub fn record(&self, server: &MonitoredServer, reachable: bool) -> AvailabilityVerdict {
        let mut counts = self.counts.lock().unwrap_or_else(|p| p.into_inner());
        let count = counts
            .entry(server.id)
            .or_insert_with(|| server.failure_count.max(0) as u32);

        if reachable {
            *count = 0;
        } else {
            *count = count.saturating_add(1);
        }

        let failures = *count;
        let breaching = failures >= self.threshold;
        let status = if reachable {
            ServerStatus::Ok
        } else if breaching {
            ServerStatus::Unreachable
        } else {
            server.status
        };

        AvailabilityVerdict {
            failures,
            status,
            breaching,
        }
    }

    /// Drops counters of servers that are no longer monitored.
    pub fn retain(&self, live: &[Uuid]) {
        self.counts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|id, _| live.contains(id));
    }
}
