use async_trait::async_trait;
use hickory_resolver::{
    config::{NameServerConfigGroup, ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
    proto::op::ResponseCode,
    TokioAsyncResolver,
};
use std::{net::IpAddr, sync::Arc};
use tracing::debug;

use super::CheckPolicy;
use crate::store::NsOutcome;

const DNS_PORT: u16 = 53;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupFailure {
    /// The zone does not exist or has no NS records.
    NoRecords(String),
    /// Timeout, SERVFAIL, or transport error; says nothing about the zone.
    Failed(String),
}

#[async_trait]
pub trait NsResolver: Send + Sync {
    async fn lookup_ns(&self, domain: &str) -> Result<Vec<String>, LookupFailure>;
}

/// NS lookups through a fixed list of upstream resolvers.
pub struct HickoryNsResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryNsResolver {
    pub fn new(servers: &[IpAddr], policy: &CheckPolicy) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(servers, DNS_PORT, true);
        let config = ResolverConfig::from_parts(None, vec![], group);

        let mut opts = ResolverOpts::default();
        opts.timeout = policy.dns_timeout;
        opts.attempts = policy.attempts as usize;
        // Every check must reach the upstream; NS TTLs outlive the check interval.
        opts.cache_size = 0;

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

#[async_trait]
impl NsResolver for HickoryNsResolver {
    async fn lookup_ns(&self, domain: &str) -> Result<Vec<String>, LookupFailure> {
        let fqdn = format!("{}.", domain.trim_end_matches('.'));
        match self.resolver.ns_lookup(fqdn).await {
            Ok(lookup) => Ok(lookup.iter().map(|ns| ns.to_string()).collect()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { response_code, .. }
                    if *response_code == ResponseCode::ServFail =>
                {
                    Err(LookupFailure::Failed("resolver returned SERVFAIL".into()))
                }
                ResolveErrorKind::NoRecordsFound { response_code, .. } => {
                    Err(LookupFailure::NoRecords(format!("no NS records ({})", response_code)))
                }
                ResolveErrorKind::Timeout => Err(LookupFailure::Failed("DNS query timed out".into())),
                _ => Err(LookupFailure::Failed(format!("DNS query failed: {}", e))),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsCheck {
    pub outcome: NsOutcome,
    pub nameservers: Vec<String>,
    pub error: Option<String>,
}

impl NsCheck {
    pub fn resolution_failed(error: impl Into<String>) -> Self {
        Self {
            outcome: NsOutcome::ResolutionFailed,
            nameservers: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// `Some(compliant)` for a definitive answer, `None` when resolution failed.
    pub fn compliance(&self) -> Option<bool> {
        match self.outcome {
            NsOutcome::Compliant => Some(true),
            NsOutcome::NonCompliant => Some(false),
            NsOutcome::ResolutionFailed => None,
        }
    }
}

pub struct NsVerifier {
    resolver: Arc<dyn NsResolver>,
}

impl NsVerifier {
    pub fn new(resolver: Arc<dyn NsResolver>) -> Self {
        Self { resolver }
    }

    /// Compliant when any nameserver name contains `policy_tag`, ignoring case.
    pub async fn verify(&self, domain: &str, policy_tag: &str) -> NsCheck {
        let domain = normalize(domain);
        let tag = policy_tag.trim().to_lowercase();

        match self.resolver.lookup_ns(&domain).await {
            Ok(names) => {
                let nameservers: Vec<String> = names.iter().map(|n| normalize(n)).collect();
                if nameservers.is_empty() {
                    return NsCheck {
                        outcome: NsOutcome::NonCompliant,
                        nameservers,
                        error: Some("no NS records".into()),
                    };
                }
                let compliant = !tag.is_empty() && nameservers.iter().any(|ns| ns.contains(&tag));
                debug!(domain = %domain, compliant, "NS lookup finished");
                NsCheck {
                    outcome: if compliant {
                        NsOutcome::Compliant
                    } else {
                        NsOutcome::NonCompliant
                    },
                    nameservers,
                    error: None,
                }
            }
            Err(LookupFailure::NoRecords(reason)) => NsCheck {
                outcome: NsOutcome::NonCompliant,
                nameservers: Vec::new(),
                error: Some(reason),
            },
            Err(LookupFailure::Failed(reason)) => NsCheck::resolution_failed(reason),
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_lowercase()
}
