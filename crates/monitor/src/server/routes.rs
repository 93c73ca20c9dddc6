use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use http::{header, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use super::Server;
use crate::{
    checks::{agent_endpoint, DEFAULT_AGENT_PORT},
    metrics::gather_metrics,
    store::{
        AgentAuth, AlertFilter, AlertKind, AlertRecord, AlertStats, MetricSample,
        MonitoredDomain, MonitoredServer, NsCheckRecord, ServerStatus, SubjectType,
    },
    Error, Result,
};

pub const DEFAULT_NS_POLICY: &str = "dnspod";
const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, format!("{} not found", msg)),
            Error::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            other => {
                error!("Request failed: {}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn metrics() -> Result<Response> {
    let body = gather_metrics()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

/// Server as exposed over HTTP; agent credentials are reduced to their kind.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerView {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub agent_url: String,
    pub agent_auth: String,
    pub status: ServerStatus,
    pub failure_count: i32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<MonitoredServer> for ServerView {
    fn from(server: MonitoredServer) -> Self {
        Self {
            id: server.id,
            agent_auth: server.agent_auth.kind().to_string(),
            name: server.name,
            host: server.host,
            agent_url: server.agent_url,
            status: server.status,
            failure_count: server.failure_count,
            last_check_at: server.last_check_at,
            created_at: server.created_at,
            updated_at: server.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateServer {
    pub name: String,
    pub host: String,
    pub agent_url: Option<String>,
    #[serde(default)]
    pub agent_auth: AgentAuth,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateDomain {
    pub domain: String,
    pub server_id: Option<Uuid>,
    pub ns_policy: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ListAlertsQuery {
    pub open: Option<bool>,
    pub kind: Option<AlertKind>,
    pub subject_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

// Servers

pub async fn list_servers(State(state): State<Arc<Server>>) -> Result<Json<Vec<ServerView>>> {
    let servers = state.store.list_servers().await?;
    Ok(Json(servers.into_iter().map(ServerView::from).collect()))
}

pub async fn create_server(
    State(state): State<Arc<Server>>,
    Json(body): Json<CreateServer>,
) -> Result<(StatusCode, Json<ServerView>)> {
    let name = body.name.trim().to_string();
    let host = body.host.trim().to_string();
    if name.is_empty() || host.is_empty() {
        return Err(Error::Validation("name and host are required".into()));
    }

    let agent_url = match body.agent_url {
        Some(url) if !url.trim().is_empty() => url.trim().to_string(),
        _ if host.contains(':') => format!("http://[{}]:{}", host, DEFAULT_AGENT_PORT),
        _ => format!("http://{}:{}", host, DEFAULT_AGENT_PORT),
    };

    let now = Utc::now();
    let server = MonitoredServer {
        id: Uuid::new_v4(),
        name,
        host,
        agent_url,
        agent_auth: body.agent_auth,
        status: ServerStatus::Unknown,
        failure_count: 0,
        last_check_at: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };

    let endpoint = agent_endpoint(&server)?;
    if !endpoint.username().is_empty() || endpoint.password().is_some() {
        return Err(Error::Validation(
            "agent_url must not embed credentials; use agent_auth".into(),
        ));
    }

    state.store.save_server(server.clone()).await?;
    info!(server_id = %server.id, name = %server.name, "Server registered");

    Ok((StatusCode::CREATED, Json(server.into())))
}

pub async fn get_server(
    State(state): State<Arc<Server>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ServerView>> {
    let server = state
        .store
        .get_server(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Server {}", id)))?;
    Ok(Json(server.into()))
}

pub async fn delete_server(
    State(state): State<Arc<Server>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    let closed = state.alerts.delete_subject(SubjectType::Server, id).await?;
    info!(server_id = %id, closed_alerts = closed, "Server removed");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_server_metrics(
    State(state): State<Arc<Server>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<MetricSample>>> {
    if state.store.get_server(id).await?.is_none() {
        return Err(Error::NotFound(format!("Server {}", id)));
    }
    let samples = state
        .store
        .list_metric_samples(id, clamp_limit(query.limit))
        .await?;
    Ok(Json(samples))
}

// Domains

fn normalize_domain(raw: &str) -> Result<String> {
    let domain = raw.trim().trim_end_matches('.').to_lowercase();
    let valid = domain.contains('.')
        && domain.len() <= 253
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if !valid {
        return Err(Error::Validation(format!("Invalid domain name: {}", raw)));
    }
    Ok(domain)
}

pub async fn list_domains(State(state): State<Arc<Server>>) -> Result<Json<Vec<MonitoredDomain>>> {
    Ok(Json(state.store.list_domains().await?))
}

pub async fn create_domain(
    State(state): State<Arc<Server>>,
    Json(body): Json<CreateDomain>,
) -> Result<(StatusCode, Json<MonitoredDomain>)> {
    let domain = normalize_domain(&body.domain)?;

    let ns_policy = body
        .ns_policy
        .map(|p| p.trim().to_lowercase())
        .unwrap_or_else(|| DEFAULT_NS_POLICY.to_string());
    if ns_policy.is_empty() {
        return Err(Error::Validation("ns_policy must not be empty".into()));
    }

    if let Some(server_id) = body.server_id {
        if state.store.get_server(server_id).await?.is_none() {
            return Err(Error::Validation(format!("Unknown server: {}", server_id)));
        }
    }

    let now = Utc::now();
    let record = MonitoredDomain {
        id: Uuid::new_v4(),
        domain,
        server_id: body.server_id,
        ns_policy,
        last_ns_check_at: None,
        ns_compliant: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    state.store.save_domain(record.clone()).await?;
    info!(domain_id = %record.id, "Domain registered");

    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn get_domain(
    State(state): State<Arc<Server>>,
    Path(id): Path<Uuid>,
) -> Result<Json<MonitoredDomain>> {
    let domain = state
        .store
        .get_domain(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Domain {}", id)))?;
    Ok(Json(domain))
}

pub async fn delete_domain(
    State(state): State<Arc<Server>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    let closed = state.alerts.delete_subject(SubjectType::Domain, id).await?;
    info!(domain_id = %id, closed_alerts = closed, "Domain removed");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_domain_ns_checks(
    State(state): State<Arc<Server>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<NsCheckRecord>>> {
    if state.store.get_domain(id).await?.is_none() {
        return Err(Error::NotFound(format!("Domain {}", id)));
    }
    Ok(Json(state.store.list_ns_checks(id, clamp_limit(query.limit)).await?))
}

// Alerts

pub async fn list_alerts(
    State(state): State<Arc<Server>>,
    Query(query): Query<ListAlertsQuery>,
) -> Result<Json<Vec<AlertRecord>>> {
    let filter = AlertFilter {
        open_only: query.open.unwrap_or(false),
        kind: query.kind,
        subject_id: query.subject_id,
    };
    let alerts = state
        .store
        .list_alerts(&filter, clamp_limit(query.limit), query.offset.unwrap_or(0).max(0))
        .await?;
    Ok(Json(alerts))
}

pub async fn alert_stats(State(state): State<Arc<Server>>) -> Result<Json<AlertStats>> {
    Ok(Json(state.store.alert_stats().await?))
}

pub async fn get_alert(
    State(state): State<Arc<Server>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AlertRecord>> {
    let alert = state
        .store
        .get_alert(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Alert {}", id)))?;
    Ok(Json(alert))
}

pub async fn resolve_alert(
    State(state): State<Arc<Server>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AlertRecord>> {
    Ok(Json(state.alerts.resolve_manually(id).await?))
}
