mod config;
mod factory;
mod models;
mod postgres;
mod sqlite;

pub use config::{DatabaseConfig, DatabaseType};
pub use factory::create_store;
pub use models::*;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    // Initialize database schema
    async fn init(&self) -> crate::Result<()>;

    // Server operations
    async fn save_server(&self, server: MonitoredServer) -> crate::Result<()>;
    async fn get_server(&self, id: Uuid) -> crate::Result<Option<MonitoredServer>>;
    async fn list_servers(&self) -> crate::Result<Vec<MonitoredServer>>;
    async fn update_server_status(
        &self,
        id: Uuid,
        status: ServerStatus,
        failure_count: i32,
        checked_at: DateTime<Utc>,
    ) -> crate::Result<()>;
    /// Fails with `Conflict` while live domains still reference the server.
    /// Open alerts of the server are resolved in the same transaction; returns
    /// how many were closed.
    async fn soft_delete_server(&self, id: Uuid, at: DateTime<Utc>) -> crate::Result<u64>;

    // Domain operations
    async fn save_domain(&self, domain: MonitoredDomain) -> crate::Result<()>;
    async fn get_domain(&self, id: Uuid) -> crate::Result<Option<MonitoredDomain>>;
    async fn list_domains(&self) -> crate::Result<Vec<MonitoredDomain>>;
    async fn update_domain_ns_status(
        &self,
        id: Uuid,
        compliant: Option<bool>,
        checked_at: DateTime<Utc>,
    ) -> crate::Result<()>;
    /// Same as `soft_delete_server`, without the dependency guard.
    async fn soft_delete_domain(&self, id: Uuid, at: DateTime<Utc>) -> crate::Result<u64>;

    // Check history
    async fn save_ns_check(&self, check: NsCheckRecord) -> crate::Result<()>;
    async fn list_ns_checks(&self, domain_id: Uuid, limit: i64) -> crate::Result<Vec<NsCheckRecord>>;
    async fn save_metric_sample(&self, sample: MetricSample) -> crate::Result<()>;
    async fn list_metric_samples(&self, server_id: Uuid, limit: i64) -> crate::Result<Vec<MetricSample>>;
    async fn purge_history(&self, before: DateTime<Utc>) -> crate::Result<u64>;
    async fn purge_resolved_alerts(&self, before: DateTime<Utc>) -> crate::Result<u64>;

    // Alert operations
    /// Inserts `alert` unless an open record with the same fingerprint exists.
    /// Returns `true` when the row was inserted.
    async fn insert_open_alert(&self, alert: &AlertRecord) -> crate::Result<bool>;
    async fn get_open_alert(&self, fingerprint: &str) -> crate::Result<Option<AlertRecord>>;
    async fn get_alert(&self, id: Uuid) -> crate::Result<Option<AlertRecord>>;
    /// Records a repeat notification on a still-open alert.
    async fn touch_open_alert(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        message: &str,
        measured: Option<f64>,
    ) -> crate::Result<()>;
    /// Sets `resolved_at`; returns `false` if the alert was not open.
    async fn resolve_alert(&self, id: Uuid, at: DateTime<Utc>, message: Option<&str>) -> crate::Result<bool>;
    async fn list_alerts(&self, filter: &AlertFilter, limit: i64, offset: i64) -> crate::Result<Vec<AlertRecord>>;
    async fn alert_stats(&self) -> crate::Result<AlertStats>;
    async fn list_alerts_for_subject(&self, subject_id: Uuid) -> crate::Result<Vec<AlertRecord>>;
}
