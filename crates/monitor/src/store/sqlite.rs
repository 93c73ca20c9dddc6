use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, Transaction,
};
use std::str::FromStr;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    store::{
        AlertFilter, AlertKind, AlertRecord, AlertStats, MetricSample, MonitoredDomain,
        MonitoredServer, NsCheckRecord, ServerStatus, Store,
    },
    Error, Result,
};

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to SQLite database: {}", database_url);

        let in_memory = database_url == ":memory:" || database_url == "sqlite::memory:";
        if !in_memory {
            let file = database_url.trim_start_matches("sqlite://").trim_start_matches("sqlite:");
            if let Some(parent) = std::path::Path::new(file).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to ":memory:" is its own database, so pin the pool to
        // a single connection that never expires.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections)
        };

        let pool = pool_options.connect_with(options).await.map_err(|e| {
            error!("Failed to connect to SQLite: {}", e);
            Error::Sqlx(e)
        })?;

        Ok(Self { pool })
    }
}

fn server_from_row(r: &SqliteRow) -> Result<MonitoredServer> {
    Ok(MonitoredServer {
        id: r.get::<String, _>("id").parse()?,
        name: r.get("name"),
        host: r.get("host"),
        agent_url: r.get("agent_url"),
        agent_auth: serde_json::from_str(r.get("agent_auth"))?,
        status: r.get::<String, _>("status").parse()?,
        failure_count: r.get("failure_count"),
        last_check_at: r.get("last_check_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        deleted_at: r.get("deleted_at"),
    })
}

fn domain_from_row(r: &SqliteRow) -> Result<MonitoredDomain> {
    Ok(MonitoredDomain {
        id: r.get::<String, _>("id").parse()?,
        domain: r.get("domain"),
        server_id: r
            .get::<Option<String>, _>("server_id")
            .map(|s| s.parse())
            .transpose()?,
        ns_policy: r.get("ns_policy"),
        last_ns_check_at: r.get("last_ns_check_at"),
        ns_compliant: r.get("ns_compliant"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        deleted_at: r.get("deleted_at"),
    })
}

fn alert_from_row(r: &SqliteRow) -> Result<AlertRecord> {
    Ok(AlertRecord {
        id: r.get::<String, _>("id").parse()?,
        subject_type: r.get::<String, _>("subject_type").parse()?,
        subject_id: r.get::<String, _>("subject_id").parse()?,
        kind: r.get::<String, _>("kind").parse()?,
        fingerprint: r.get("fingerprint"),
        opened_at: r.get("opened_at"),
        resolved_at: r.get("resolved_at"),
        last_notified_at: r.get("last_notified_at"),
        notification_count: r.get("notification_count"),
        last_message: r.get("last_message"),
        measured_value: r.get("measured_value"),
        threshold_value: r.get("threshold_value"),
    })
}

fn ns_check_from_row(r: &SqliteRow) -> Result<NsCheckRecord> {
    Ok(NsCheckRecord {
        id: r.get::<String, _>("id").parse()?,
        domain_id: r.get::<String, _>("domain_id").parse()?,
        outcome: r.get::<String, _>("outcome").parse()?,
        nameservers: serde_json::from_str(r.get("nameservers"))?,
        error_message: r.get("error_message"),
        checked_at: r.get("checked_at"),
    })
}

fn sample_from_row(r: &SqliteRow) -> Result<MetricSample> {
    Ok(MetricSample {
        id: r.get::<String, _>("id").parse()?,
        server_id: r.get::<String, _>("server_id").parse()?,
        cpu_percent: r.get("cpu_percent"),
        memory_percent: r.get("memory_percent"),
        disk_percent: r.get("disk_percent"),
        load_1: r.get("load_1"),
        load_5: r.get("load_5"),
        load_15: r.get("load_15"),
        uptime_secs: r.get("uptime_secs"),
        created_at: r.get("created_at"),
    })
}

fn map_unique_violation(e: sqlx::Error, what: &str) -> Error {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::Conflict(format!("{} already exists", what))
        }
        _ => Error::Sqlx(e),
    }
}

// A deleted subject is never evaluated again, so its open alerts would never recover.
async fn resolve_subject_alerts(
    tx: &mut Transaction<'_, Sqlite>,
    subject_id: Uuid,
    at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE alert_records SET resolved_at = ?1 WHERE subject_id = ?2 AND resolved_at IS NULL",
    )
    .bind(at)
    .bind(subject_id.to_string())
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected())
}

const SERVER_COLUMNS: &str = "id, name, host, agent_url, agent_auth, status, failure_count, \
     last_check_at, created_at, updated_at, deleted_at";

const DOMAIN_COLUMNS: &str = "id, domain, server_id, ns_policy, last_ns_check_at, ns_compliant, \
     created_at, updated_at, deleted_at";

const ALERT_COLUMNS: &str = "id, subject_type, subject_id, kind, fingerprint, opened_at, resolved_at, \
     last_notified_at, notification_count, last_message, measured_value, threshold_value";

#[async_trait]
impl Store for SqliteStore {
    async fn init(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                Error::Migrate(e)
            })?;

        Ok(())
    }

    // Server operations
    async fn save_server(&self, server: MonitoredServer) -> Result<()> {
        debug!("Saving server: {}", server.id);

        let auth_json = serde_json::to_string(&server.agent_auth)?;

        sqlx::query(
            r#"
            INSERT INTO servers (
                id, name, host, agent_url, agent_auth, status, failure_count,
                last_check_at, created_at, updated_at, deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                host = excluded.host,
                agent_url = excluded.agent_url,
                agent_auth = excluded.agent_auth,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(server.id.to_string())
        .bind(&server.name)
        .bind(&server.host)
        .bind(&server.agent_url)
        .bind(auth_json)
        .bind(server.status.to_string())
        .bind(server.failure_count)
        .bind(server.last_check_at)
        .bind(server.created_at)
        .bind(server.updated_at)
        .bind(server.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &format!("Server '{}'", server.name)))?;

        Ok(())
    }

    async fn get_server(&self, id: Uuid) -> Result<Option<MonitoredServer>> {
        debug!("Getting server: {}", id);

        let row = sqlx::query(&format!(
            "SELECT {} FROM servers WHERE id = ?1 AND deleted_at IS NULL",
            SERVER_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(server_from_row).transpose()
    }

    async fn list_servers(&self) -> Result<Vec<MonitoredServer>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM servers WHERE deleted_at IS NULL ORDER BY name",
            SERVER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(server_from_row).collect()
    }

    async fn update_server_status(
        &self,
        id: Uuid,
        status: ServerStatus,
        failure_count: i32,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        debug!("Updating server status: {} -> {} ({} failures)", id, status, failure_count);

        sqlx::query(
            "UPDATE servers SET status = ?1, failure_count = ?2, last_check_at = ?3, updated_at = ?4 WHERE id = ?5",
        )
        .bind(status.to_string())
        .bind(failure_count)
        .bind(checked_at)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn soft_delete_server(&self, id: Uuid, at: DateTime<Utc>) -> Result<u64> {
        debug!("Soft-deleting server: {}", id);

        let mut tx = self.pool.begin().await?;

        let dependents: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM domains WHERE server_id = ?1 AND deleted_at IS NULL",
        )
        .bind(id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        if dependents > 0 {
            return Err(Error::Conflict(format!(
                "Server {} is still referenced by {} domain(s)",
                id, dependents
            )));
        }

        let result = sqlx::query(
            "UPDATE servers SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
        )
        .bind(at)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Server {}", id)));
        }

        let closed = resolve_subject_alerts(&mut tx, id, at).await?;
        tx.commit().await?;
        Ok(closed)
    }

    // Domain operations
    async fn save_domain(&self, domain: MonitoredDomain) -> Result<()> {
        debug!("Saving domain: {}", domain.id);

        sqlx::query(
            r#"
            INSERT INTO domains (
                id, domain, server_id, ns_policy, last_ns_check_at, ns_compliant,
                created_at, updated_at, deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                domain = excluded.domain,
                server_id = excluded.server_id,
                ns_policy = excluded.ns_policy,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(domain.id.to_string())
        .bind(&domain.domain)
        .bind(domain.server_id.map(|id| id.to_string()))
        .bind(&domain.ns_policy)
        .bind(domain.last_ns_check_at)
        .bind(domain.ns_compliant)
        .bind(domain.created_at)
        .bind(domain.updated_at)
        .bind(domain.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &format!("Domain '{}'", domain.domain)))?;

        Ok(())
    }

    async fn get_domain(&self, id: Uuid) -> Result<Option<MonitoredDomain>> {
        debug!("Getting domain: {}", id);

        let row = sqlx::query(&format!(
            "SELECT {} FROM domains WHERE id = ?1 AND deleted_at IS NULL",
            DOMAIN_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(domain_from_row).transpose()
    }

    async fn list_domains(&self) -> Result<Vec<MonitoredDomain>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM domains WHERE deleted_at IS NULL ORDER BY domain",
            DOMAIN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(domain_from_row).collect()
    }

    async fn update_domain_ns_status(
        &self,
        id: Uuid,
        compliant: Option<bool>,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        debug!("Updating domain NS status: {} -> {:?}", id, compliant);

        // A failed resolution says nothing about compliance; keep the last verdict.
        sqlx::query(
            r#"
            UPDATE domains
            SET ns_compliant = COALESCE(?1, ns_compliant),
                last_ns_check_at = ?2,
                updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(compliant)
        .bind(checked_at)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn soft_delete_domain(&self, id: Uuid, at: DateTime<Utc>) -> Result<u64> {
        debug!("Soft-deleting domain: {}", id);

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE domains SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
        )
        .bind(at)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Domain {}", id)));
        }

        let closed = resolve_subject_alerts(&mut tx, id, at).await?;
        tx.commit().await?;
        Ok(closed)
    }

    // Check history
    async fn save_ns_check(&self, check: NsCheckRecord) -> Result<()> {
        debug!("Saving NS check for domain {}: {}", check.domain_id, check.outcome);

        sqlx::query(
            r#"
            INSERT INTO ns_checks (id, domain_id, outcome, nameservers, error_message, checked_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(check.id.to_string())
        .bind(check.domain_id.to_string())
        .bind(check.outcome.to_string())
        .bind(serde_json::to_string(&check.nameservers)?)
        .bind(&check.error_message)
        .bind(check.checked_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_ns_checks(&self, domain_id: Uuid, limit: i64) -> Result<Vec<NsCheckRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, domain_id, outcome, nameservers, error_message, checked_at
            FROM ns_checks
            WHERE domain_id = ?1
            ORDER BY checked_at DESC
            LIMIT ?2
            "#,
        )
        .bind(domain_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(ns_check_from_row).collect()
    }

    async fn save_metric_sample(&self, sample: MetricSample) -> Result<()> {
        debug!("Saving metric sample for server {}", sample.server_id);

        sqlx::query(
            r#"
            INSERT INTO metric_samples (
                id, server_id, cpu_percent, memory_percent, disk_percent,
                load_1, load_5, load_15, uptime_secs, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(sample.id.to_string())
        .bind(sample.server_id.to_string())
        .bind(sample.cpu_percent)
        .bind(sample.memory_percent)
        .bind(sample.disk_percent)
        .bind(sample.load_1)
        .bind(sample.load_5)
        .bind(sample.load_15)
        .bind(sample.uptime_secs)
        .bind(sample.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_metric_samples(&self, server_id: Uuid, limit: i64) -> Result<Vec<MetricSample>> {
        let rows = sqlx::query(
            r#"
            SELECT id, server_id, cpu_percent, memory_percent, disk_percent,
                   load_1, load_5, load_15, uptime_secs, created_at
            FROM metric_samples
            WHERE server_id = ?1
            ORDER BY created_at DESC
            LIMIT ?2
            "#,
        )
        .bind(server_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(sample_from_row).collect()
    }

    async fn purge_history(&self, before: DateTime<Utc>) -> Result<u64> {
        let samples = sqlx::query("DELETE FROM metric_samples WHERE created_at < ?1")
            .bind(before)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let checks = sqlx::query("DELETE FROM ns_checks WHERE checked_at < ?1")
            .bind(before)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(samples + checks)
    }

    async fn purge_resolved_alerts(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM alert_records WHERE resolved_at IS NOT NULL AND resolved_at < ?1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // Alert operations
    async fn insert_open_alert(&self, alert: &AlertRecord) -> Result<bool> {
        debug!("Opening alert {} for {} {}", alert.id, alert.subject_type, alert.subject_id);

        let result = sqlx::query(
            r#"
            INSERT INTO alert_records (
                id, subject_type, subject_id, kind, fingerprint, opened_at, resolved_at,
                last_notified_at, notification_count, last_message, measured_value, threshold_value
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(fingerprint) WHERE resolved_at IS NULL DO NOTHING
            "#,
        )
        .bind(alert.id.to_string())
        .bind(alert.subject_type.to_string())
        .bind(alert.subject_id.to_string())
        .bind(alert.kind.to_string())
        .bind(&alert.fingerprint)
        .bind(alert.opened_at)
        .bind(alert.last_notified_at)
        .bind(alert.notification_count)
        .bind(&alert.last_message)
        .bind(alert.measured_value)
        .bind(alert.threshold_value)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_open_alert(&self, fingerprint: &str) -> Result<Option<AlertRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM alert_records WHERE fingerprint = ?1 AND resolved_at IS NULL",
            ALERT_COLUMNS
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(alert_from_row).transpose()
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<AlertRecord>> {
        debug!("Getting alert: {}", id);

        let row = sqlx::query(&format!("SELECT {} FROM alert_records WHERE id = ?1", ALERT_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(alert_from_row).transpose()
    }

    async fn touch_open_alert(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        message: &str,
        measured: Option<f64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE alert_records
            SET last_notified_at = ?1,
                notification_count = notification_count + 1,
                last_message = ?2,
                measured_value = COALESCE(?3, measured_value)
            WHERE id = ?4 AND resolved_at IS NULL
            "#,
        )
        .bind(at)
        .bind(message)
        .bind(measured)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn resolve_alert(&self, id: Uuid, at: DateTime<Utc>, message: Option<&str>) -> Result<bool> {
        debug!("Resolving alert: {}", id);

        let result = sqlx::query(
            r#"
            UPDATE alert_records
            SET resolved_at = ?1,
                last_message = COALESCE(?2, last_message)
            WHERE id = ?3 AND resolved_at IS NULL
            "#,
        )
        .bind(at)
        .bind(message)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_alerts(&self, filter: &AlertFilter, limit: i64, offset: i64) -> Result<Vec<AlertRecord>> {
        debug!("Listing alerts: {:?}, limit={}, offset={}", filter, limit, offset);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM alert_records
            WHERE (?1 = 0 OR resolved_at IS NULL)
              AND (?2 IS NULL OR kind = ?2)
              AND (?3 IS NULL OR subject_id = ?3)
            ORDER BY opened_at DESC
            LIMIT ?4 OFFSET ?5
            "#,
            ALERT_COLUMNS
        ))
        .bind(filter.open_only)
        .bind(filter.kind.map(|k| k.to_string()))
        .bind(filter.subject_id.map(|id| id.to_string()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(alert_from_row).collect()
    }

    async fn alert_stats(&self) -> Result<AlertStats> {
        let rows = sqlx::query(
            r#"
            SELECT kind,
                   COUNT(*) AS total,
                   SUM(CASE WHEN resolved_at IS NULL THEN 1 ELSE 0 END) AS open
            FROM alert_records
            GROUP BY kind
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = AlertStats::default();
        for row in &rows {
            let kind: AlertKind = row.get::<String, _>("kind").parse()?;
            let total: i64 = row.get("total");
            let open: i64 = row.get("open");
            stats.total += total;
            stats.open += open;
            if open > 0 {
                stats.open_by_kind.insert(kind, open);
            }
        }
        Ok(stats)
    }

    async fn list_alerts_for_subject(&self, subject_id: Uuid) -> Result<Vec<AlertRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM alert_records WHERE subject_id = ?1 ORDER BY opened_at ASC",
            ALERT_COLUMNS
        ))
        .bind(subject_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(alert_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AgentAuth, AlertKind, NsOutcome, SubjectType};
    use chrono::Duration;

    async fn memory_store() -> SqliteStore {
        let store = SqliteStore::new(":memory:", 1).await.unwrap();
        store.init().await.unwrap();
        store
    }

    fn server(name: &str) -> MonitoredServer {
        let now = Utc::now();
        MonitoredServer {
            id: Uuid::new_v4(),
            name: name.to_string(),
            host: "10.0.0.5".to_string(),
            agent_url: "http://10.0.0.5:61208/api/4/all".to_string(),
            agent_auth: AgentAuth::Token { token: "t0k".to_string() },
            status: ServerStatus::Unknown,
            failure_count: 0,
            last_check_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn domain(name: &str, server_id: Option<Uuid>) -> MonitoredDomain {
        let now = Utc::now();
        MonitoredDomain {
            id: Uuid::new_v4(),
            domain: name.to_string(),
            server_id,
            ns_policy: "dnspod".to_string(),
            last_ns_check_at: None,
            ns_compliant: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn server_round_trip_keeps_auth() {
        let store = memory_store().await;
        let s = server("edge-1");
        store.save_server(s.clone()).await.unwrap();

        let loaded = store.get_server(s.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "edge-1");
        assert_eq!(loaded.agent_auth, AgentAuth::Token { token: "t0k".to_string() });
        assert_eq!(loaded.status, ServerStatus::Unknown);
    }

    #[tokio::test]
    async fn duplicate_server_name_is_a_conflict() {
        let store = memory_store().await;
        store.save_server(server("edge-1")).await.unwrap();
        let err = store.save_server(server("edge-1")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn server_status_update_is_persisted() {
        let store = memory_store().await;
        let s = server("edge-1");
        store.save_server(s.clone()).await.unwrap();

        let now = Utc::now();
        store
            .update_server_status(s.id, ServerStatus::Unreachable, 3, now)
            .await
            .unwrap();

        let loaded = store.get_server(s.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ServerStatus::Unreachable);
        assert_eq!(loaded.failure_count, 3);
        assert!(loaded.last_check_at.is_some());
    }

    #[tokio::test]
    async fn soft_delete_is_guarded_by_domains() {
        let store = memory_store().await;
        let s = server("edge-1");
        store.save_server(s.clone()).await.unwrap();
        let d = domain("example.com", Some(s.id));
        store.save_domain(d.clone()).await.unwrap();

        let err = store.soft_delete_server(s.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        store.soft_delete_domain(d.id, Utc::now()).await.unwrap();
        store.soft_delete_server(s.id, Utc::now()).await.unwrap();

        assert!(store.get_server(s.id).await.unwrap().is_none());
        assert!(store.list_servers().await.unwrap().is_empty());
        let err = store.soft_delete_server(s.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_resolution_keeps_last_compliance_verdict() {
        let store = memory_store().await;
        let d = domain("example.com", None);
        store.save_domain(d.clone()).await.unwrap();

        store.update_domain_ns_status(d.id, Some(true), Utc::now()).await.unwrap();
        store.update_domain_ns_status(d.id, None, Utc::now()).await.unwrap();

        let loaded = store.get_domain(d.id).await.unwrap().unwrap();
        assert_eq!(loaded.ns_compliant, Some(true));
        assert!(loaded.last_ns_check_at.is_some());
    }

    #[tokio::test]
    async fn only_one_open_alert_per_fingerprint() {
        let store = memory_store().await;
        let subject = Uuid::new_v4();
        let now = Utc::now();

        let first = AlertRecord::open(SubjectType::Server, subject, AlertKind::Cpu, now);
        let second = AlertRecord::open(SubjectType::Server, subject, AlertKind::Cpu, now);

        assert!(store.insert_open_alert(&first).await.unwrap());
        assert!(!store.insert_open_alert(&second).await.unwrap());

        assert!(store.resolve_alert(first.id, now, Some("recovered")).await.unwrap());
        assert!(!store.resolve_alert(first.id, now, None).await.unwrap());
        assert!(store.insert_open_alert(&second).await.unwrap());

        let all = store.list_alerts_for_subject(subject).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|a| a.is_open()).count(), 1);
    }

    #[tokio::test]
    async fn soft_delete_resolves_open_alerts() {
        let store = memory_store().await;
        let s = server("edge-1");
        store.save_server(s.clone()).await.unwrap();
        let d = domain("example.com", None);
        store.save_domain(d.clone()).await.unwrap();

        let now = Utc::now();
        let cpu = AlertRecord::open(SubjectType::Server, s.id, AlertKind::Cpu, now);
        let ns = AlertRecord::open(SubjectType::Domain, d.id, AlertKind::Ns, now);
        store.insert_open_alert(&cpu).await.unwrap();
        store.insert_open_alert(&ns).await.unwrap();

        assert_eq!(store.soft_delete_server(s.id, now).await.unwrap(), 1);
        assert!(!store.get_alert(cpu.id).await.unwrap().unwrap().is_open());
        assert!(store.get_alert(ns.id).await.unwrap().unwrap().is_open());

        assert_eq!(store.soft_delete_domain(d.id, now).await.unwrap(), 1);
        assert!(!store.get_alert(ns.id).await.unwrap().unwrap().is_open());
    }

    #[tokio::test]
    async fn alerts_filter_by_kind_subject_and_state() {
        let store = memory_store().await;
        let now = Utc::now();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let cpu_a = AlertRecord::open(SubjectType::Server, a, AlertKind::Cpu, now);
        let disk_a = AlertRecord::open(SubjectType::Server, a, AlertKind::Disk, now);
        let cpu_b = AlertRecord::open(SubjectType::Server, b, AlertKind::Cpu, now);
        for alert in [&cpu_a, &disk_a, &cpu_b] {
            store.insert_open_alert(alert).await.unwrap();
        }
        store.resolve_alert(cpu_b.id, now, None).await.unwrap();

        let all = store.list_alerts(&AlertFilter::default(), 10, 0).await.unwrap();
        assert_eq!(all.len(), 3);

        let cpu = AlertFilter {
            kind: Some(AlertKind::Cpu),
            ..AlertFilter::default()
        };
        assert_eq!(store.list_alerts(&cpu, 10, 0).await.unwrap().len(), 2);

        let open_cpu = AlertFilter {
            open_only: true,
            ..cpu.clone()
        };
        let open = store.list_alerts(&open_cpu, 10, 0).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, cpu_a.id);

        let for_a = AlertFilter {
            subject_id: Some(a),
            ..AlertFilter::default()
        };
        assert_eq!(store.list_alerts(&for_a, 10, 0).await.unwrap().len(), 2);

        let stats = store.alert_stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.open, 2);
        assert_eq!(stats.open_by_kind.get(&AlertKind::Cpu), Some(&1));
        assert_eq!(stats.open_by_kind.get(&AlertKind::Disk), Some(&1));
        assert!(!stats.open_by_kind.contains_key(&AlertKind::Memory));
    }

    #[tokio::test]
    async fn touch_does_not_modify_resolved_alerts() {
        let store = memory_store().await;
        let now = Utc::now();
        let alert = AlertRecord::open(SubjectType::Domain, Uuid::new_v4(), AlertKind::Ns, now);
        store.insert_open_alert(&alert).await.unwrap();
        store.resolve_alert(alert.id, now, None).await.unwrap();

        store
            .touch_open_alert(alert.id, now + Duration::hours(1), "again", Some(1.0))
            .await
            .unwrap();

        let loaded = store.get_alert(alert.id).await.unwrap().unwrap();
        assert_eq!(loaded.notification_count, 1);
        assert_eq!(loaded.last_message, None);
    }

    #[tokio::test]
    async fn history_is_purged_by_age() {
        let store = memory_store().await;
        let s = server("edge-1");
        store.save_server(s.clone()).await.unwrap();
        let d = domain("example.com", Some(s.id));
        store.save_domain(d.clone()).await.unwrap();

        let old = Utc::now() - Duration::days(40);
        store
            .save_metric_sample(MetricSample {
                id: Uuid::new_v4(),
                server_id: s.id,
                cpu_percent: 10.0,
                memory_percent: 20.0,
                disk_percent: 30.0,
                load_1: None,
                load_5: None,
                load_15: None,
                uptime_secs: Some(60),
                created_at: old,
            })
            .await
            .unwrap();
        store
            .save_ns_check(NsCheckRecord {
                id: Uuid::new_v4(),
                domain_id: d.id,
                outcome: NsOutcome::Compliant,
                nameservers: vec!["a.dnspod.net".to_string()],
                error_message: None,
                checked_at: Utc::now(),
            })
            .await
            .unwrap();

        let purged = store.purge_history(Utc::now() - Duration::days(30)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.list_metric_samples(s.id, 10).await.unwrap().is_empty());
        assert_eq!(store.list_ns_checks(d.id, 10).await.unwrap().len(), 1);
    }
}
