use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::Error;

// Monitored entities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredServer {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub agent_url: String,
    pub agent_auth: AgentAuth,
    pub status: ServerStatus,
    pub failure_count: i32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Credentials presented to the metrics agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentAuth {
    #[default]
    None,
    Basic { username: String, password: String },
    Token { token: String },
}

impl AgentAuth {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentAuth::None => "none",
            AgentAuth::Basic { .. } => "basic",
            AgentAuth::Token { .. } => "token",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Unknown,
    Ok,
    Unreachable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredDomain {
    pub id: Uuid,
    pub domain: String,
    pub server_id: Option<Uuid>,
    pub ns_policy: String,
    pub last_ns_check_at: Option<DateTime<Utc>>,
    pub ns_compliant: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

// Alert lifecycle tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub subject_type: SubjectType,
    pub subject_id: Uuid,
    pub kind: AlertKind,
    pub fingerprint: String,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub last_notified_at: DateTime<Utc>,
    pub notification_count: i32,
    pub last_message: Option<String>,
    pub measured_value: Option<f64>,
    pub threshold_value: Option<f64>,
}

/// Narrowing for alert listings; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertFilter {
    pub open_only: bool,
    pub kind: Option<AlertKind>,
    pub subject_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertStats {
    pub total: i64,
    pub open: i64,
    pub open_by_kind: HashMap<AlertKind, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    Server,
    Domain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Availability,
    Cpu,
    Memory,
    Disk,
    Ns,
}

impl AlertKind {
    pub const ALL: [AlertKind; 5] = [
        AlertKind::Availability,
        AlertKind::Cpu,
        AlertKind::Memory,
        AlertKind::Disk,
        AlertKind::Ns,
    ];

    pub fn subject_type(&self) -> SubjectType {
        match self {
            AlertKind::Ns => SubjectType::Domain,
            _ => SubjectType::Server,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AlertKind::Availability => "Availability",
            AlertKind::Cpu => "CPU",
            AlertKind::Memory => "Memory",
            AlertKind::Disk => "Disk",
            AlertKind::Ns => "Nameservers",
        }
    }
}

// NS check history, one row per check regardless of outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NsCheckRecord {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub outcome: NsOutcome,
    pub nameservers: Vec<String>,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NsOutcome {
    Compliant,
    NonCompliant,
    ResolutionFailed,
}

// Resource utilization history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub id: Uuid,
    pub server_id: Uuid,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub load_1: Option<f64>,
    pub load_5: Option<f64>,
    pub load_15: Option<f64>,
    pub uptime_secs: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl AlertRecord {
    /// Opens a fresh record for `(subject, kind)` at `now`.
    pub fn open(
        subject_type: SubjectType,
        subject_id: Uuid,
        kind: AlertKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject_type,
            subject_id,
            kind,
            fingerprint: Self::generate_fingerprint(subject_type, subject_id, kind),
            opened_at: now,
            resolved_at: None,
            last_notified_at: now,
            notification_count: 1,
            last_message: None,
            measured_value: None,
            threshold_value: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    pub fn generate_fingerprint(subject_type: SubjectType, subject_id: Uuid, kind: AlertKind) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(subject_type.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(subject_id.as_bytes());
        hasher.update(b":");
        hasher.update(kind.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl std::str::FromStr for ServerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "unknown" => Ok(ServerStatus::Unknown),
            "ok" => Ok(ServerStatus::Ok),
            "unreachable" => Ok(ServerStatus::Unreachable),
            _ => Err(Error::Validation(format!("Invalid server status: {}", s))),
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Unknown => write!(f, "unknown"),
            ServerStatus::Ok => write!(f, "ok"),
            ServerStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

impl std::str::FromStr for SubjectType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "server" => Ok(SubjectType::Server),
            "domain" => Ok(SubjectType::Domain),
            _ => Err(Error::Validation(format!("Invalid subject type: {}", s))),
        }
    }
}

impl std::fmt::Display for SubjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubjectType::Server => write!(f, "server"),
            SubjectType::Domain => write!(f, "domain"),
        }
    }
}

impl std::str::FromStr for AlertKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "availability" => Ok(AlertKind::Availability),
            "cpu" => Ok(AlertKind::Cpu),
            "memory" => Ok(AlertKind::Memory),
            "disk" => Ok(AlertKind::Disk),
            "ns" => Ok(AlertKind::Ns),
            _ => Err(Error::Validation(format!("Invalid alert kind: {}", s))),
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::Availability => write!(f, "availability"),
            AlertKind::Cpu => write!(f, "cpu"),
            AlertKind::Memory => write!(f, "memory"),
            AlertKind::Disk => write!(f, "disk"),
            AlertKind::Ns => write!(f, "ns"),
        }
    }
}

impl std::str::FromStr for NsOutcome {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "compliant" => Ok(NsOutcome::Compliant),
            "non_compliant" => Ok(NsOutcome::NonCompliant),
            "resolution_failed" => Ok(NsOutcome::ResolutionFailed),
            _ => Err(Error::Validation(format!("Invalid NS outcome: {}", s))),
        }
    }
}

impl std::fmt::Display for NsOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NsOutcome::Compliant => write!(f, "compliant"),
            NsOutcome::NonCompliant => write!(f, "non_compliant"),
            NsOutcome::ResolutionFailed => write!(f, "resolution_failed"),
        }
    }
}
