use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    metrics::{ALERTS_OPENED_TOTAL, ALERTS_RECOVERED_TOTAL},
    notify::{MessageInput, MessageRenderer},
    store::{AlertKind, AlertRecord, MonitoredDomain, MonitoredServer, Store, SubjectType},
    Error, Result,
};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The entity an alert is about.
#[derive(Debug, Clone, Serialize)]
pub struct Subject {
    pub subject_type: SubjectType,
    pub id: Uuid,
    pub name: String,
}

impl Subject {
    pub fn server(server: &MonitoredServer) -> Self {
        Self {
            subject_type: SubjectType::Server,
            id: server.id,
            name: server.name.clone(),
        }
    }

    pub fn domain(domain: &MonitoredDomain) -> Self {
        Self {
            subject_type: SubjectType::Domain,
            id: domain.id,
            name: domain.domain.clone(),
        }
    }
}

/// One evaluated measurement for a (subject, kind) pair.
#[derive(Debug, Clone)]
pub struct Observation {
    pub subject: Subject,
    pub kind: AlertKind,
    pub breaching: bool,
    pub measured: Option<f64>,
    pub threshold: Option<f64>,
    pub failures: Option<u32>,
    pub detail: Option<String>,
}

impl Observation {
    pub fn new(subject: Subject, kind: AlertKind, breaching: bool) -> Self {
        Self {
            subject,
            kind,
            breaching,
            measured: None,
            threshold: None,
            failures: None,
            detail: None,
        }
    }

    /// Breaching when `measured` is strictly above `ceiling`.
    pub fn threshold(subject: Subject, kind: AlertKind, measured: f64, ceiling: f64) -> Self {
        Self {
            measured: Some(measured),
            threshold: Some(ceiling),
            ..Self::new(subject, kind, measured > ceiling)
        }
    }

    pub fn with_failures(mut self, failures: u32) -> Self {
        self.failures = Some(failures);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Opened { repeat: bool },
    Recovered,
}

/// A committed transition that should be announced.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub alert_id: Uuid,
    pub subject: Subject,
    pub kind: AlertKind,
    pub transition: Transition,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Decides, per (subject, kind), whether an observation opens, repeats,
/// or resolves an alert. The only component that writes alert records.
pub struct AlertStateStore {
    store: Arc<dyn Store>,
    renderer: Arc<MessageRenderer>,
    cooldown: chrono::Duration,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AlertStateStore {
    pub fn new(
        store: Arc<dyn Store>,
        renderer: Arc<MessageRenderer>,
        cooldown: chrono::Duration,
    ) -> Self {
        Self::with_clock(store, renderer, cooldown, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn Store>,
        renderer: Arc<MessageRenderer>,
        cooldown: chrono::Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            renderer,
            cooldown,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, fingerprint: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Applies `observation` and returns the event to announce, if any.
    /// The record change and its message are persisted before returning.
    pub async fn evaluate(&self, observation: &Observation) -> Result<Option<NotificationEvent>> {
        let subject = &observation.subject;
        let fingerprint =
            AlertRecord::generate_fingerprint(subject.subject_type, subject.id, observation.kind);

        let lock = self.lock_for(&fingerprint);
        let _guard = lock.lock().await;

        let now = self.clock.now();
        let open = self.store.get_open_alert(&fingerprint).await?;

        match (observation.breaching, open) {
            (true, None) => {
                let mut record =
                    AlertRecord::open(subject.subject_type, subject.id, observation.kind, now);
                record.measured_value = observation.measured;
                record.threshold_value = observation.threshold;

                let transition = Transition::Opened { repeat: false };
                let message = self.render(observation, transition, now, now, 1)?;
                record.last_message = Some(message.clone());

                if !self.store.insert_open_alert(&record).await? {
                    // Another process holds the open record for this fingerprint.
                    debug!(fingerprint = %fingerprint, "Open alert already exists");
                    return Ok(None);
                }

                ALERTS_OPENED_TOTAL
                    .with_label_values(&[&observation.kind.to_string()])
                    .inc();
                info!(
                    alert_id = %record.id,
                    subject = %subject.id,
                    kind = %observation.kind,
                    "Alert opened"
                );
                Ok(Some(self.event(record.id, observation, transition, message, now)))
            }
            (true, Some(existing)) => {
                if now - existing.last_notified_at < self.cooldown {
                    debug!(alert_id = %existing.id, "Alert still open, inside cooldown");
                    return Ok(None);
                }

                let transition = Transition::Opened { repeat: true };
                let count = existing.notification_count + 1;
                let message = self.render(observation, transition, existing.opened_at, now, count)?;
                self.store
                    .touch_open_alert(existing.id, now, &message, observation.measured)
                    .await?;

                info!(alert_id = %existing.id, count, "Alert still open, repeating notification");
                Ok(Some(self.event(existing.id, observation, transition, message, now)))
            }
            (false, Some(existing)) => {
                let transition = Transition::Recovered;
                let message = self.render(
                    observation,
                    transition,
                    existing.opened_at,
                    now,
                    existing.notification_count,
                )?;

                if !self.store.resolve_alert(existing.id, now, Some(&message)).await? {
                    return Ok(None);
                }

                ALERTS_RECOVERED_TOTAL
                    .with_label_values(&[&observation.kind.to_string()])
                    .inc();
                info!(alert_id = %existing.id, kind = %observation.kind, "Alert recovered");
                Ok(Some(self.event(existing.id, observation, transition, message, now)))
            }
            (false, None) => Ok(None),
        }
    }

    /// Closes an open alert without announcing it.
    pub async fn resolve_manually(&self, alert_id: Uuid) -> Result<AlertRecord> {
        let record = self
            .store
            .get_alert(alert_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Alert {}", alert_id)))?;

        let lock = self.lock_for(&record.fingerprint);
        let _guard = lock.lock().await;

        if !self.store.resolve_alert(alert_id, self.clock.now(), None).await? {
            return Err(Error::Conflict(format!("Alert {} is already resolved", alert_id)));
        }

        ALERTS_RECOVERED_TOTAL
            .with_label_values(&[&record.kind.to_string()])
            .inc();
        info!(alert_id = %alert_id, "Alert resolved manually");

        self.store
            .get_alert(alert_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Alert {}", alert_id)))
    }

    /// Soft-deletes a server or domain and closes its open alerts without
    /// announcing them. Returns how many alerts were closed.
    pub async fn delete_subject(&self, subject_type: SubjectType, id: Uuid) -> Result<u64> {
        let fingerprints: Vec<String> = AlertKind::ALL
            .into_iter()
            .filter(|kind| kind.subject_type() == subject_type)
            .map(|kind| AlertRecord::generate_fingerprint(subject_type, id, kind))
            .collect();

        // Hold every kind's lock so no evaluation reopens an alert mid-delete.
        // Always taken in `AlertKind::ALL` order; `evaluate` holds one at a time.
        let locks: Vec<_> = fingerprints.iter().map(|f| self.lock_for(f)).collect();
        let mut guards = Vec::with_capacity(locks.len());
        for lock in &locks {
            guards.push(lock.lock().await);
        }

        let now = self.clock.now();
        let closed = match subject_type {
            SubjectType::Server => self.store.soft_delete_server(id, now).await?,
            SubjectType::Domain => self.store.soft_delete_domain(id, now).await?,
        };

        drop(guards);
        drop(locks);
        self.forget_locks(&fingerprints);

        info!(subject = %id, subject_type = %subject_type, closed, "Subject deleted");
        Ok(closed)
    }

    /// Drops lock entries nobody else is holding or waiting on.
    fn forget_locks(&self, fingerprints: &[String]) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        for fingerprint in fingerprints {
            if locks
                .get(fingerprint)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(fingerprint);
            }
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn render(
        &self,
        observation: &Observation,
        transition: Transition,
        opened_at: DateTime<Utc>,
        at: DateTime<Utc>,
        notification_count: i32,
    ) -> Result<String> {
        self.renderer.render(&MessageInput {
            subject: &observation.subject,
            kind: observation.kind,
            transition,
            measured: observation.measured,
            threshold: observation.threshold,
            failures: observation.failures,
            detail: observation.detail.as_deref(),
            opened_at,
            at,
            notification_count,
        })
    }

    fn event(
        &self,
        alert_id: Uuid,
        observation: &Observation,
        transition: Transition,
        message: String,
        at: DateTime<Utc>,
    ) -> NotificationEvent {
        NotificationEvent {
            alert_id,
            subject: observation.subject.clone(),
            kind: observation.kind,
            transition,
            message,
            at,
        }
    }
}
