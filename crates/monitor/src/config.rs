use serde::{Deserialize, Serialize};
use std::{net::IpAddr, path::PathBuf, str::FromStr};

use crate::{
    notify::MaskPolicy,
    store::{DatabaseConfig, DatabaseType},
    Error, Result,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityMode {
    #[default]
    Http,
    Tcp,
}

impl FromStr for AvailabilityMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "http" => Ok(AvailabilityMode::Http),
            "tcp" => Ok(AvailabilityMode::Tcp),
            other => Err(Error::Config(format!("Invalid availability mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub schedule: ScheduleConfig,
    pub thresholds: ThresholdConfig,
    pub probe: ProbeConfig,
    pub dns: DnsConfig,
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub mask: MaskPolicy,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
}

/// Job periods in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub availability_secs: u64,
    pub resources_secs: u64,
    pub ns_secs: u64,
    pub retention_secs: u64,
}

/// Alerting ceilings. A measurement strictly above a ceiling is breaching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdConfig {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub unreachable_after: u32,
    pub cooldown_secs: u64,
}

impl ThresholdConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub availability_mode: AvailabilityMode,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    pub servers: Vec<IpAddr>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(skip_serializing)]
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub api_base: String,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        self.bot_token.is_some() && self.chat_id.is_some()
    }
}

/// History retention in days.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub metric_days: i64,
    pub alert_days: i64,
}

const DEFAULT_SQLITE_PATH: &str = "data/proxy-monitor.db";
const DEFAULT_DNS_SERVERS: &str = "8.8.8.8,1.1.1.1";
const DEFAULT_TELEGRAM_API: &str = "https://api.telegram.org";

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from an arbitrary variable source. Unset
    /// variables fall back to defaults; set but unparsable ones are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Config::default();

        let db_type_raw = var("DATABASE_TYPE").map(|s| s.to_lowercase());
        let db_type = match db_type_raw.as_deref() {
            None | Some("sqlite") => DatabaseType::Sqlite,
            Some("postgres") | Some("postgresql") => DatabaseType::Postgres,
            Some(other) => {
                return Err(Error::Config(format!("Invalid DATABASE_TYPE: {}", other)));
            }
        };

        let dns_servers = var("DNS_SERVERS")
            .unwrap_or_else(|| DEFAULT_DNS_SERVERS.to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<IpAddr>()
                    .map_err(|_| Error::Config(format!("Invalid DNS server address: {}", s)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mask_char = match var("MASK_CHAR") {
            Some(s) => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => c,
                    _ => return Err(Error::Config("MASK_CHAR must be a single character".into())),
                }
            }
            None => defaults.mask.mask_char,
        };

        Ok(Config {
            server: ServerConfig {
                addr: var("SERVER_ADDR").unwrap_or(defaults.server.addr),
            },
            database: DatabaseConfig {
                db_type,
                sqlite_path: var("SQLITE_PATH")
                    .map(PathBuf::from)
                    .or_else(|| Some(PathBuf::from(DEFAULT_SQLITE_PATH))),
                connection_string: var("DATABASE_URL"),
                max_connections: parse_or(&var, "DATABASE_MAX_CONNECTIONS", defaults.database.max_connections)?,
            },
            schedule: ScheduleConfig {
                availability_secs: parse_or(&var, "AVAILABILITY_INTERVAL_SECS", defaults.schedule.availability_secs)?,
                resources_secs: parse_or(&var, "RESOURCE_INTERVAL_SECS", defaults.schedule.resources_secs)?,
                ns_secs: parse_or(&var, "NS_INTERVAL_SECS", defaults.schedule.ns_secs)?,
                retention_secs: parse_or(&var, "RETENTION_INTERVAL_SECS", defaults.schedule.retention_secs)?,
            },
            thresholds: ThresholdConfig {
                cpu_percent: parse_or(&var, "CPU_THRESHOLD", defaults.thresholds.cpu_percent)?,
                memory_percent: parse_or(&var, "MEMORY_THRESHOLD", defaults.thresholds.memory_percent)?,
                disk_percent: parse_or(&var, "DISK_THRESHOLD", defaults.thresholds.disk_percent)?,
                unreachable_after: parse_or(&var, "UNREACHABLE_AFTER_FAILURES", defaults.thresholds.unreachable_after)?,
                cooldown_secs: parse_or(&var, "ALERT_COOLDOWN_SECS", defaults.thresholds.cooldown_secs)?,
            },
            probe: ProbeConfig {
                availability_mode: match var("AVAILABILITY_MODE") {
                    Some(mode) => mode.parse()?,
                    None => defaults.probe.availability_mode,
                },
                connect_timeout_secs: parse_or(&var, "PROBE_CONNECT_TIMEOUT_SECS", defaults.probe.connect_timeout_secs)?,
                request_timeout_secs: parse_or(&var, "PROBE_TIMEOUT_SECS", defaults.probe.request_timeout_secs)?,
            },
            dns: DnsConfig {
                servers: dns_servers,
                timeout_secs: parse_or(&var, "DNS_TIMEOUT_SECS", defaults.dns.timeout_secs)?,
            },
            telegram: TelegramConfig {
                bot_token: var("TELEGRAM_BOT_TOKEN"),
                chat_id: var("TELEGRAM_CHAT_ID"),
                api_base: var("TELEGRAM_API_BASE")
                    .map(|s| s.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.telegram.api_base),
            },
            mask: MaskPolicy {
                visible_prefix: parse_or(&var, "MASK_VISIBLE_PREFIX", defaults.mask.visible_prefix)?,
                mask_char,
                keep_suffix: defaults.mask.keep_suffix,
            },
            retention: RetentionConfig {
                metric_days: parse_or(&var, "METRIC_RETENTION_DAYS", defaults.retention.metric_days)?,
                alert_days: parse_or(&var, "ALERT_RETENTION_DAYS", defaults.retention.alert_days)?,
            },
        })
    }

    /// Rejects configurations the monitor cannot run with. Called before any
    /// job starts; every failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        self.database.validate().map_err(Error::Config)?;

        for (name, value) in [
            ("CPU_THRESHOLD", self.thresholds.cpu_percent),
            ("MEMORY_THRESHOLD", self.thresholds.memory_percent),
            ("DISK_THRESHOLD", self.thresholds.disk_percent),
        ] {
            if !value.is_finite() || value <= 0.0 || value > 100.0 {
                return Err(Error::Config(format!(
                    "{} must be within (0, 100], got {}",
                    name, value
                )));
            }
        }

        if self.thresholds.unreachable_after == 0 {
            return Err(Error::Config("UNREACHABLE_AFTER_FAILURES must be at least 1".into()));
        }

        for (name, value) in [
            ("AVAILABILITY_INTERVAL_SECS", self.schedule.availability_secs),
            ("RESOURCE_INTERVAL_SECS", self.schedule.resources_secs),
            ("NS_INTERVAL_SECS", self.schedule.ns_secs),
            ("RETENTION_INTERVAL_SECS", self.schedule.retention_secs),
            ("PROBE_CONNECT_TIMEOUT_SECS", self.probe.connect_timeout_secs),
            ("PROBE_TIMEOUT_SECS", self.probe.request_timeout_secs),
            ("DNS_TIMEOUT_SECS", self.dns.timeout_secs),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }

        if self.dns.servers.is_empty() {
            return Err(Error::Config("DNS_SERVERS must list at least one resolver".into()));
        }

        if self.telegram.bot_token.is_some() != self.telegram.chat_id.is_some() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must be set together".into(),
            ));
        }

        if self.retention.metric_days <= 0 || self.retention.alert_days <= 0 {
            return Err(Error::Config("Retention periods must be at least one day".into()));
        }

        if !self.telegram.is_configured() {
            tracing::warn!("Telegram is not configured; notifications will only be logged");
        }

        Ok(())
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("Invalid value for {}: {}", key, raw))),
        None => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:8080".to_string(),
            },
            database: DatabaseConfig::default(),
            schedule: ScheduleConfig {
                availability_secs: 30,
                resources_secs: 60,
                ns_secs: 300,
                retention_secs: 6 * 60 * 60,
            },
            thresholds: ThresholdConfig {
                cpu_percent: 85.0,
                memory_percent: 90.0,
                disk_percent: 90.0,
                unreachable_after: 3,
                cooldown_secs: 30 * 60,
            },
            probe: ProbeConfig {
                availability_mode: AvailabilityMode::Http,
                connect_timeout_secs: 10,
                request_timeout_secs: 10,
            },
            dns: DnsConfig {
                servers: DEFAULT_DNS_SERVERS
                    .split(',')
                    .filter_map(|s| s.parse().ok())
                    .collect(),
                timeout_secs: 5,
            },
            telegram: TelegramConfig {
                bot_token: None,
                chat_id: None,
                api_base: DEFAULT_TELEGRAM_API.to_string(),
            },
            mask: MaskPolicy::default(),
            retention: RetentionConfig {
                metric_days: 30,
                alert_days: 90,
            },
        }
    }
}
