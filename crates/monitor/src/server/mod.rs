mod routes;

use axum::{
    routing::{get, post},
    Router,
};
use std::{future::Future, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{alerting::AlertStateStore, store::Store, Result};

pub use routes::{CreateDomain, CreateServer, ServerView, DEFAULT_NS_POLICY};

pub struct Server {
    store: Arc<dyn Store>,
    alerts: Arc<AlertStateStore>,
}

impl Server {
    pub fn new(store: Arc<dyn Store>, alerts: Arc<AlertStateStore>) -> Self {
        Self { store, alerts }
    }

    pub fn build_router(self) -> Router {
        let state = Arc::new(self);

        Router::new()
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route("/servers", get(routes::list_servers).post(routes::create_server))
            .route("/servers/{id}", get(routes::get_server).delete(routes::delete_server))
            .route("/servers/{id}/metrics", get(routes::list_server_metrics))
            .route("/domains", get(routes::list_domains).post(routes::create_domain))
            .route("/domains/{id}", get(routes::get_domain).delete(routes::delete_domain))
            .route("/domains/{id}/ns-checks", get(routes::list_domain_ns_checks))
            .route("/alerts", get(routes::list_alerts))
            .route("/alerts/stats", get(routes::alert_stats))
            .route("/alerts/{id}", get(routes::get_alert))
            .route("/alerts/{id}/resolve", post(routes::resolve_alert))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    pub async fn serve<F>(self, addr: &str, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
