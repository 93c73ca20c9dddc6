use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{agent_endpoint, CheckPolicy, USER_AGENT};
use crate::{
    store::{AgentAuth, MonitoredServer},
    Result,
};

/// Resource utilization read from an agent in one probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub load_1: Option<f64>,
    pub load_5: Option<f64>,
    pub load_15: Option<f64>,
    pub uptime_secs: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Success(ResourceSnapshot),
    Failure { reason: String },
}

impl ProbeOutcome {
    fn failure(reason: impl Into<String>) -> Self {
        ProbeOutcome::Failure {
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait MetricsProbe: Send + Sync {
    /// Single attempt; never fails, every problem becomes `ProbeOutcome::Failure`.
    async fn probe(&self, server: &MonitoredServer) -> ProbeOutcome;
}

/// Polls a Glances agent's aggregate endpoint.
pub struct GlancesProbe {
    client: reqwest::Client,
}

impl GlancesProbe {
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
impl MetricsProbe for GlancesProbe {
    async fn probe(&self, server: &MonitoredServer) -> ProbeOutcome {
        let url = match agent_endpoint(server) {
            Ok(url) => url,
            Err(e) => return ProbeOutcome::failure(e.to_string()),
        };

        let request = match &server.agent_auth {
            AgentAuth::None => self.client.get(url),
            AgentAuth::Basic { username, password } => {
                self.client.get(url).basic_auth(username, Some(password))
            }
            AgentAuth::Token { token } => self.client.get(url).bearer_auth(token),
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return ProbeOutcome::failure("agent request timed out"),
            Err(e) if e.is_connect() => return ProbeOutcome::failure("agent connection failed"),
            Err(e) => return ProbeOutcome::failure(format!("agent request failed: {}", e.without_url())),
        };

        let status = response.status();
        if !status.is_success() {
            return ProbeOutcome::failure(format!("agent returned HTTP {}", status.as_u16()));
        }

        let body: GlancesAll = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                debug!(server = %server.name, error = %e.without_url(), "Undecodable agent body");
                return ProbeOutcome::failure("agent returned an undecodable body");
            }
        };

        match body.into_snapshot() {
            Ok(snapshot) => ProbeOutcome::Success(snapshot),
            Err(reason) => ProbeOutcome::Failure { reason },
        }
    }
}

// Glances v4 `/api/4/all`, only the parts the monitor reads.
#[derive(Debug, Deserialize)]
struct GlancesAll {
    cpu: Option<GlancesCpu>,
    mem: Option<GlancesMem>,
    #[serde(default)]
    fs: Vec<GlancesFs>,
    load: Option<GlancesLoad>,
    uptime: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GlancesCpu {
    total: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct GlancesMem {
    percent: Option<f64>,
    total: Option<f64>,
    available: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct GlancesFs {
    #[serde(default)]
    mnt_point: String,
    percent: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct GlancesLoad {
    min1: Option<f64>,
    min5: Option<f64>,
    min15: Option<f64>,
}

impl GlancesAll {
    fn into_snapshot(self) -> std::result::Result<ResourceSnapshot, String> {
        let cpu_percent = self
            .cpu
            .and_then(|c| c.total)
            .ok_or("agent response is missing cpu.total")?;

        let memory_percent = self
            .mem
            .and_then(|m| match (m.total, m.available) {
                (Some(total), Some(available)) if total > 0.0 => {
                    Some((total - available) / total * 100.0)
                }
                _ => m.percent,
            })
            .ok_or("agent response is missing memory usage")?;

        let disk_percent = self
            .fs
            .iter()
            .find(|fs| fs.mnt_point == "/")
            .and_then(|fs| fs.percent)
            .ok_or("agent response has no root filesystem usage")?;

        for (name, value) in [
            ("cpu", cpu_percent),
            ("memory", memory_percent),
            ("disk", disk_percent),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("agent reported an invalid {} value", name));
            }
        }

        let (load_1, load_5, load_15) = self
            .load
            .map(|l| (l.min1, l.min5, l.min15))
            .unwrap_or_default();

        Ok(ResourceSnapshot {
            cpu_percent,
            memory_percent,
            disk_percent,
            load_1,
            load_5,
            load_15,
            uptime_secs: self.uptime.as_ref().and_then(parse_uptime),
        })
    }
}

/// Glances reports uptime either as seconds or as "3 days, 4:05:06".
fn parse_uptime(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => parse_uptime_str(s),
        _ => None,
    }
}

fn parse_uptime_str(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<i64>() {
        return Some(secs);
    }

    let (days, clock) = match s.split_once(',') {
        Some((days, clock)) => {
            let days = days.split_whitespace().next()?.parse::<i64>().ok()?;
            (days, clock.trim())
        }
        None => (0, s),
    };

    let mut parts = clock.split(':').map(|p| p.trim().parse::<i64>());
    let (h, m, sec) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(Ok(h)), Some(Ok(m)), Some(Ok(sec)), None) => (h, m, sec),
        _ => return None,
    };

    Some(days * 86_400 + h * 3_600 + m * 60 + sec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ServerStatus;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn server(agent_url: String, agent_auth: AgentAuth) -> MonitoredServer {
        let now = Utc::now();
        MonitoredServer {
            id: Uuid::new_v4(),
            name: "edge-1".into(),
            host: "127.0.0.1".into(),
            agent_url,
            agent_auth,
            status: ServerStatus::Unknown,
            failure_count: 0,
            last_check_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn glances_body() -> Value {
        json!({
            "cpu": { "total": 42.5, "user": 30.0 },
            "mem": { "total": 8000.0, "available": 2000.0, "percent": 70.0 },
            "fs": [
                { "mnt_point": "/boot", "percent": 12.0 },
                { "mnt_point": "/", "percent": 55.5 }
            ],
            "load": { "min1": 0.5, "min5": 0.4, "min15": 0.3, "cpucore": 4 },
            "uptime": "2 days, 3:04:05"
        })
    }

    #[tokio::test]
    async fn test_probe_parses_glances_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/4/all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(glances_body()))
            .mount(&mock_server)
            .await;

        let probe = GlancesProbe::new(&CheckPolicy::default()).unwrap();
        let outcome = probe.probe(&server(mock_server.uri(), AgentAuth::None)).await;

        let ProbeOutcome::Success(snapshot) = outcome else {
            panic!("expected success, got {:?}", outcome);
        };
        assert_eq!(snapshot.cpu_percent, 42.5);
        assert_eq!(snapshot.memory_percent, 75.0);
        assert_eq!(snapshot.disk_percent, 55.5);
        assert_eq!(snapshot.load_1, Some(0.5));
        assert_eq!(snapshot.load_15, Some(0.3));
        assert_eq!(snapshot.uptime_secs, Some(2 * 86_400 + 3 * 3_600 + 4 * 60 + 5));
    }

    #[tokio::test]
    async fn test_probe_sends_credentials() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/4/all"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(glances_body()))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;

        let probe = GlancesProbe::new(&CheckPolicy::default()).unwrap();
        let with_token = server(
            mock_server.uri(),
            AgentAuth::Token {
                token: "s3cret".into(),
            },
        );
        assert!(matches!(probe.probe(&with_token).await, ProbeOutcome::Success(_)));

        let anonymous = server(mock_server.uri(), AgentAuth::None);
        assert_eq!(
            probe.probe(&anonymous).await,
            ProbeOutcome::Failure {
                reason: "agent returned HTTP 401".into()
            }
        );
    }

    #[tokio::test]
    async fn test_probe_server_error_is_failure() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let probe = GlancesProbe::new(&CheckPolicy::default()).unwrap();
        let outcome = probe.probe(&server(mock_server.uri(), AgentAuth::None)).await;
        assert!(matches!(outcome, ProbeOutcome::Failure { .. }));
    }

    #[tokio::test]
    async fn test_probe_garbage_body_is_failure() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>nginx</html>"))
            .mount(&mock_server)
            .await;

        let probe = GlancesProbe::new(&CheckPolicy::default()).unwrap();
        let outcome = probe.probe(&server(mock_server.uri(), AgentAuth::None)).await;
        assert_eq!(
            outcome,
            ProbeOutcome::Failure {
                reason: "agent returned an undecodable body".into()
            }
        );
    }

    #[tokio::test]
    async fn test_probe_unreachable_agent_is_failure() {
        let probe = GlancesProbe::new(&CheckPolicy::default()).unwrap();
        // Port 9 (discard) is closed on test hosts.
        let outcome = probe
            .probe(&server("http://127.0.0.1:9".into(), AgentAuth::None))
            .await;
        assert!(matches!(outcome, ProbeOutcome::Failure { .. }));
    }

    #[test]
    fn test_missing_root_filesystem_is_failure() {
        let mut body = glances_body();
        body["fs"] = json!([{ "mnt_point": "/boot", "percent": 12.0 }]);
        let parsed: GlancesAll = serde_json::from_value(body).unwrap();
        assert_eq!(
            parsed.into_snapshot().unwrap_err(),
            "agent response has no root filesystem usage"
        );
    }

    #[test]
    fn test_missing_cpu_is_failure() {
        let mut body = glances_body();
        body.as_object_mut().unwrap().remove("cpu");
        let parsed: GlancesAll = serde_json::from_value(body).unwrap();
        assert!(parsed.into_snapshot().is_err());
    }

    #[test]
    fn test_memory_falls_back_to_percent() {
        let mut body = glances_body();
        body["mem"] = json!({ "percent": 61.0 });
        let parsed: GlancesAll = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.into_snapshot().unwrap().memory_percent, 61.0);
    }

    #[test]
    fn test_optional_fields_may_be_absent() {
        let body = json!({
            "cpu": { "total": 1.0 },
            "mem": { "percent": 2.0 },
            "fs": [{ "mnt_point": "/", "percent": 3.0 }]
        });
        let parsed: GlancesAll = serde_json::from_value(body).unwrap();
        let snapshot = parsed.into_snapshot().unwrap();
        assert_eq!(snapshot.load_1, None);
        assert_eq!(snapshot.uptime_secs, None);
    }

    #[test]
    fn test_parse_uptime() {
        assert_eq!(parse_uptime(&json!(3600)), Some(3600));
        assert_eq!(parse_uptime(&json!("0:01:30")), Some(90));
        assert_eq!(parse_uptime(&json!("1 day, 0:00:01")), Some(86_401));
        assert_eq!(parse_uptime(&json!("yesterday")), None);
        assert_eq!(parse_uptime(&json!(null)), None);
    }
}
