mod guard;

pub use guard::{InFlight, InFlightGuard};

use chrono::Utc;
use futures::future::join_all;
use std::{fmt, sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{timeout, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    alerting::{AlertStateStore, Observation, Subject},
    checks::{
        CheckPolicy, FailureTracker, GlancesProbe, HickoryNsResolver, HttpReachability,
        MetricsProbe, NsCheck, NsResolver, NsVerifier, ProbeOutcome, Reachability,
        TcpReachability,
    },
    config::{AvailabilityMode, Config, RetentionConfig, ScheduleConfig, ThresholdConfig},
    metrics::{CHECKS_SKIPPED_TOTAL, CHECKS_TOTAL, CHECK_FAILURES_TOTAL},
    notify::{Dispatcher, Notifier},
    store::{AlertKind, MetricSample, MonitoredDomain, MonitoredServer, NsCheckRecord, Store},
    Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    Availability,
    Resources,
    Ns,
    Retention,
}

impl Job {
    pub const ALL: [Job; 4] = [Job::Availability, Job::Resources, Job::Ns, Job::Retention];

    pub fn as_str(&self) -> &'static str {
        match self {
            Job::Availability => "availability",
            Job::Resources => "resources",
            Job::Ns => "ns",
            Job::Retention => "retention",
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The probing side of the monitor, swappable in tests.
pub struct Checkers {
    pub probe: Arc<dyn MetricsProbe>,
    pub reachability: Arc<dyn Reachability>,
    pub resolver: Arc<dyn NsResolver>,
}

impl Checkers {
    pub fn from_config(config: &Config) -> Result<Self> {
        let policy = CheckPolicy::from_config(config);
        let reachability: Arc<dyn Reachability> = match config.probe.availability_mode {
            AvailabilityMode::Http => Arc::new(HttpReachability::new(&policy)?),
            AvailabilityMode::Tcp => Arc::new(TcpReachability::new(&policy)),
        };
        Ok(Self {
            probe: Arc::new(GlancesProbe::new(&policy)?),
            reachability,
            resolver: Arc::new(HickoryNsResolver::new(&config.dns.servers, &policy)),
        })
    }
}

/// Runs the periodic checks and feeds their results into alerting.
pub struct Monitor {
    store: Arc<dyn Store>,
    probe: Arc<dyn MetricsProbe>,
    reachability: Arc<dyn Reachability>,
    ns: NsVerifier,
    tracker: FailureTracker,
    alerts: Arc<AlertStateStore>,
    dispatcher: Dispatcher,
    thresholds: ThresholdConfig,
    schedule: ScheduleConfig,
    retention: RetentionConfig,
    deadline: Duration,
    in_flight: InFlight,
}

impl Monitor {
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        alerts: Arc<AlertStateStore>,
        checkers: Checkers,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            probe: checkers.probe,
            reachability: checkers.reachability,
            ns: NsVerifier::new(checkers.resolver),
            tracker: FailureTracker::new(config.thresholds.unreachable_after),
            alerts,
            dispatcher: Dispatcher::new(notifier),
            thresholds: config.thresholds.clone(),
            schedule: config.schedule.clone(),
            retention: config.retention.clone(),
            deadline: CheckPolicy::from_config(config).deadline(),
            in_flight: InFlight::new(),
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Starts one task per job. Tasks stop once `shutdown` turns true or
    /// its sender is dropped.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        Job::ALL
            .into_iter()
            .map(|job| {
                let monitor = Arc::clone(self);
                let shutdown = shutdown.clone();
                let period = Duration::from_secs(self.period_secs(job));
                tokio::spawn(async move { monitor.run_job(job, period, shutdown).await })
            })
            .collect()
    }

    fn period_secs(&self, job: Job) -> u64 {
        match job {
            Job::Availability => self.schedule.availability_secs,
            Job::Resources => self.schedule.resources_secs,
            Job::Ns => self.schedule.ns_secs,
            Job::Retention => self.schedule.retention_secs,
        }
    }

    async fn run_job(self: Arc<Self>, job: Job, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(job = %job, period_secs = period.as_secs(), "Starting monitor job");

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once(job).await {
                        Ok(checked) => debug!(job = %job, checked, "Tick finished"),
                        Err(e) => error!(job = %job, error = %e, "Tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(job = %job, "Stopping monitor job");
                        break;
                    }
                }
            }
        }
    }

    /// Runs one tick of `job` and returns how many entity checks ran.
    pub async fn run_once(&self, job: Job) -> Result<usize> {
        match job {
            Job::Availability => self.run_availability_once().await,
            Job::Resources => self.run_resources_once().await,
            Job::Ns => self.run_ns_once().await,
            Job::Retention => self.run_retention_once().await,
        }
    }

    pub async fn run_availability_once(&self) -> Result<usize> {
        let servers = self.store.list_servers().await?;
        let live: Vec<Uuid> = servers.iter().map(|s| s.id).collect();
        self.tracker.retain(&live);

        let results = join_all(servers.iter().map(|s| self.check_server_availability(s))).await;
        Ok(tally(Job::Availability, results))
    }

    pub async fn run_resources_once(&self) -> Result<usize> {
        let servers = self.store.list_servers().await?;
        let results = join_all(servers.iter().map(|s| self.check_server_resources(s))).await;
        Ok(tally(Job::Resources, results))
    }

    pub async fn run_ns_once(&self) -> Result<usize> {
        let domains = self.store.list_domains().await?;
        let results = join_all(domains.iter().map(|d| self.check_domain_ns(d))).await;
        Ok(tally(Job::Ns, results))
    }

    /// Deletes old samples, NS checks, and resolved alerts.
    pub async fn run_retention_once(&self) -> Result<usize> {
        let now = Utc::now();
        let history = self
            .store
            .purge_history(now - chrono::Duration::days(self.retention.metric_days))
            .await?;
        let alerts = self
            .store
            .purge_resolved_alerts(now - chrono::Duration::days(self.retention.alert_days))
            .await?;

        info!(history, alerts, "Retention cleanup finished");
        Ok((history + alerts) as usize)
    }

    /// Returns `Ok(false)` when a check for this server was already running.
    pub async fn check_server_availability(&self, server: &MonitoredServer) -> Result<bool> {
        let Some(_guard) = self.acquire(server.id, Job::Availability) else {
            return Ok(false);
        };

        let reachable = timeout(self.deadline, self.reachability.check(server))
            .await
            .unwrap_or(false);
        if !reachable {
            CHECK_FAILURES_TOTAL
                .with_label_values(&[Job::Availability.as_str()])
                .inc();
        }

        let verdict = self.tracker.record(server, reachable);
        self.store
            .update_server_status(server.id, verdict.status, verdict.failures as i32, Utc::now())
            .await?;

        if verdict.status != server.status {
            info!(
                server = %server.name,
                from = %server.status,
                to = %verdict.status,
                failures = verdict.failures,
                "Server status changed"
            );
        }

        let observation =
            Observation::new(Subject::server(server), AlertKind::Availability, verdict.breaching)
                .with_failures(verdict.failures);
        self.announce(&observation).await?;
        Ok(true)
    }

    /// Probes the agent, stores a sample, and evaluates the resource ceilings.
    /// A failed probe produces no sample and no resource alert changes.
    pub async fn check_server_resources(&self, server: &MonitoredServer) -> Result<bool> {
        let Some(_guard) = self.acquire(server.id, Job::Resources) else {
            return Ok(false);
        };

        let outcome = match timeout(self.deadline, self.probe.probe(server)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::Failure {
                reason: "metrics probe timed out".into(),
            },
        };

        let snapshot = match outcome {
            ProbeOutcome::Success(snapshot) => snapshot,
            ProbeOutcome::Failure { reason } => {
                CHECK_FAILURES_TOTAL
                    .with_label_values(&[Job::Resources.as_str()])
                    .inc();
                warn!(server = %server.name, reason = %reason, "Metrics probe failed");
                return Ok(true);
            }
        };

        self.store
            .save_metric_sample(MetricSample {
                id: Uuid::new_v4(),
                server_id: server.id,
                cpu_percent: snapshot.cpu_percent,
                memory_percent: snapshot.memory_percent,
                disk_percent: snapshot.disk_percent,
                load_1: snapshot.load_1,
                load_5: snapshot.load_5,
                load_15: snapshot.load_15,
                uptime_secs: snapshot.uptime_secs,
                created_at: Utc::now(),
            })
            .await?;

        for (kind, measured, ceiling) in [
            (AlertKind::Cpu, snapshot.cpu_percent, self.thresholds.cpu_percent),
            (AlertKind::Memory, snapshot.memory_percent, self.thresholds.memory_percent),
            (AlertKind::Disk, snapshot.disk_percent, self.thresholds.disk_percent),
        ] {
            let observation = Observation::threshold(Subject::server(server), kind, measured, ceiling);
            self.announce(&observation).await?;
        }
        Ok(true)
    }

    /// Verifies NS delegation and records the result. Resolution failures are
    /// recorded but leave compliance and alerts untouched.
    pub async fn check_domain_ns(&self, domain: &MonitoredDomain) -> Result<bool> {
        let Some(_guard) = self.acquire(domain.id, Job::Ns) else {
            return Ok(false);
        };

        let check = match timeout(self.deadline, self.ns.verify(&domain.domain, &domain.ns_policy)).await {
            Ok(check) => check,
            Err(_) => NsCheck::resolution_failed("DNS lookup timed out"),
        };

        let now = Utc::now();
        self.store
            .save_ns_check(NsCheckRecord {
                id: Uuid::new_v4(),
                domain_id: domain.id,
                outcome: check.outcome,
                nameservers: check.nameservers.clone(),
                error_message: check.error.clone(),
                checked_at: now,
            })
            .await?;
        self.store
            .update_domain_ns_status(domain.id, check.compliance(), now)
            .await?;

        let Some(compliant) = check.compliance() else {
            CHECK_FAILURES_TOTAL.with_label_values(&[Job::Ns.as_str()]).inc();
            warn!(
                domain = %domain.id,
                error = check.error.as_deref().unwrap_or("unknown"),
                "NS resolution failed"
            );
            return Ok(true);
        };

        // Nameserver names often embed the domain itself, so only counts go out.
        let detail = format!(
            "{} nameserver(s) found, expected provider '{}'",
            check.nameservers.len(),
            domain.ns_policy
        );
        let observation =
            Observation::new(Subject::domain(domain), AlertKind::Ns, !compliant).with_detail(detail);
        self.announce(&observation).await?;
        Ok(true)
    }

    fn acquire(&self, entity: Uuid, job: Job) -> Option<InFlightGuard> {
        let guard = self.in_flight.try_acquire(entity, job);
        match guard {
            Some(_) => CHECKS_TOTAL.with_label_values(&[job.as_str()]).inc(),
            None => {
                CHECKS_SKIPPED_TOTAL.with_label_values(&[job.as_str()]).inc();
                debug!(entity = %entity, job = %job, "Check already in flight, skipping");
            }
        }
        guard
    }

    async fn announce(&self, observation: &Observation) -> Result<()> {
        if let Some(event) = self.alerts.evaluate(observation).await? {
            self.dispatcher.dispatch(&event).await;
        }
        Ok(())
    }
}

fn tally(job: Job, results: Vec<Result<bool>>) -> usize {
    let mut checked = 0;
    for result in results {
        match result {
            Ok(true) => checked += 1,
            Ok(false) => {}
            Err(e) => {
                CHECK_FAILURES_TOTAL.with_label_values(&[job.as_str()]).inc();
                error!(job = %job, error = %e, "Entity check failed");
            }
        }
    }
    checked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checks::{LookupFailure, ResourceSnapshot},
        notify::{MaskPolicy, MessageRenderer, MockNotifier},
        store::{AgentAuth, NsOutcome, ServerStatus, SqliteStore},
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedReachability(Mutex<Vec<bool>>);

    #[async_trait]
    impl Reachability for ScriptedReachability {
        async fn check(&self, _server: &MonitoredServer) -> bool {
            self.0.lock().unwrap().remove(0)
        }
    }

    struct FixedProbe(ProbeOutcome);

    #[async_trait]
    impl MetricsProbe for FixedProbe {
        async fn probe(&self, _server: &MonitoredServer) -> ProbeOutcome {
            self.0.clone()
        }
    }

    struct FixedResolver(std::result::Result<Vec<String>, LookupFailure>);

    #[async_trait]
    impl NsResolver for FixedResolver {
        async fn lookup_ns(&self, _domain: &str) -> std::result::Result<Vec<String>, LookupFailure> {
            self.0.clone()
        }
    }

    struct HangingReachability;

    #[async_trait]
    impl Reachability for HangingReachability {
        async fn check(&self, _server: &MonitoredServer) -> bool {
            std::future::pending::<()>().await;
            true
        }
    }

    fn snapshot(cpu: f64) -> ProbeOutcome {
        ProbeOutcome::Success(ResourceSnapshot {
            cpu_percent: cpu,
            memory_percent: 40.0,
            disk_percent: 50.0,
            load_1: None,
            load_5: None,
            load_15: None,
            uptime_secs: Some(60),
        })
    }

    fn quiet_notifier(expected_deliveries: usize) -> Arc<dyn Notifier> {
        let mut notifier = MockNotifier::new();
        notifier.expect_channel().return_const("mock");
        notifier
            .expect_deliver()
            .times(expected_deliveries)
            .returning(|_| Ok(()));
        Arc::new(notifier)
    }

    async fn monitor(checkers: Checkers, notifier: Arc<dyn Notifier>) -> (Monitor, Arc<dyn Store>) {
        monitor_with(Config::default(), checkers, notifier).await
    }

    async fn monitor_with(
        config: Config,
        checkers: Checkers,
        notifier: Arc<dyn Notifier>,
    ) -> (Monitor, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(":memory:", 1).await.unwrap());
        store.init().await.unwrap();
        let renderer = Arc::new(MessageRenderer::new(MaskPolicy::default()).unwrap());
        let alerts = Arc::new(AlertStateStore::new(
            store.clone(),
            renderer,
            config.thresholds.cooldown(),
        ));
        (Monitor::new(&config, store.clone(), alerts, checkers, notifier), store)
    }

    fn checkers(
        reachable: Vec<bool>,
        probe: ProbeOutcome,
        resolver: std::result::Result<Vec<String>, LookupFailure>,
    ) -> Checkers {
        Checkers {
            probe: Arc::new(FixedProbe(probe)),
            reachability: Arc::new(ScriptedReachability(Mutex::new(reachable))),
            resolver: Arc::new(FixedResolver(resolver)),
        }
    }

    async fn add_server(store: &Arc<dyn Store>) -> MonitoredServer {
        let now = Utc::now();
        let server = MonitoredServer {
            id: Uuid::new_v4(),
            name: format!("edge-{}", &Uuid::new_v4().to_string()[..8]),
            host: "10.0.0.5".into(),
            agent_url: "http://10.0.0.5:61208".into(),
            agent_auth: AgentAuth::None,
            status: ServerStatus::Unknown,
            failure_count: 0,
            last_check_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        store.save_server(server.clone()).await.unwrap();
        server
    }

    async fn add_domain(store: &Arc<dyn Store>) -> MonitoredDomain {
        let now = Utc::now();
        let domain = MonitoredDomain {
            id: Uuid::new_v4(),
            domain: "example.com".into(),
            server_id: None,
            ns_policy: "dnspod".into(),
            last_ns_check_at: None,
            ns_compliant: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        store.save_domain(domain.clone()).await.unwrap();
        domain
    }

    #[tokio::test]
    async fn test_availability_debounce_and_recovery() {
        // 3 failures open, 2 more stay quiet inside the cooldown, then recovery.
        let script = vec![false, false, false, false, false, true];
        let (monitor, store) = monitor(checkers(script, snapshot(1.0), Ok(vec![])), quiet_notifier(2)).await;
        let server = add_server(&store).await;

        for _ in 0..6 {
            assert_eq!(monitor.run_availability_once().await.unwrap(), 1);
        }

        let alerts = store.list_alerts_for_subject(server.id).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Availability);
        assert_eq!(alerts[0].notification_count, 1);
        assert!(alerts[0].resolved_at.is_some());

        let stored = store.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServerStatus::Ok);
        assert_eq!(stored.failure_count, 0);
    }

    #[tokio::test]
    async fn test_failures_below_threshold_never_alert() {
        let script = vec![false, false, true];
        let (monitor, store) = monitor(checkers(script, snapshot(1.0), Ok(vec![])), quiet_notifier(0)).await;
        let server = add_server(&store).await;

        for _ in 0..3 {
            monitor.run_availability_once().await.unwrap();
        }
        assert!(store.list_alerts_for_subject(server.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_persisted_while_debouncing() {
        let (monitor, store) = monitor(checkers(vec![false], snapshot(1.0), Ok(vec![])), quiet_notifier(0)).await;
        let server = add_server(&store).await;

        monitor.run_availability_once().await.unwrap();
        let stored = store.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(stored.failure_count, 1);
        assert_eq!(stored.status, ServerStatus::Unknown);
        assert!(stored.last_check_at.is_some());
    }

    #[tokio::test]
    async fn test_resource_probe_stores_sample_and_alerts() {
        let (monitor, store) = monitor(checkers(vec![], snapshot(97.0), Ok(vec![])), quiet_notifier(1)).await;
        let server = add_server(&store).await;

        assert_eq!(monitor.run_resources_once().await.unwrap(), 1);

        let samples = store.list_metric_samples(server.id, 10).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].cpu_percent, 97.0);

        let alerts = store.list_alerts_for_subject(server.id).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Cpu);
        assert!(alerts[0].is_open());
    }

    #[tokio::test]
    async fn test_failed_probe_skips_resource_evaluation() {
        let failure = ProbeOutcome::Failure {
            reason: "agent returned HTTP 500".into(),
        };
        let (monitor, store) = monitor(checkers(vec![], failure, Ok(vec![])), quiet_notifier(0)).await;
        let server = add_server(&store).await;

        monitor.run_resources_once().await.unwrap();
        assert!(store.list_metric_samples(server.id, 10).await.unwrap().is_empty());
        assert!(store.list_alerts_for_subject(server.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ns_non_compliant_opens_alert() {
        let resolver = Ok(vec!["ns1.cloudflare.com.".to_string()]);
        let (monitor, store) = monitor(checkers(vec![], snapshot(1.0), resolver), quiet_notifier(1)).await;
        let domain = add_domain(&store).await;

        monitor.run_ns_once().await.unwrap();

        let stored = store.get_domain(domain.id).await.unwrap().unwrap();
        assert_eq!(stored.ns_compliant, Some(false));
        let checks = store.list_ns_checks(domain.id, 10).await.unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].outcome, NsOutcome::NonCompliant);

        let alerts = store.list_alerts_for_subject(domain.id).await.unwrap();
        assert_eq!(alerts.len(), 1);
        let message = alerts[0].last_message.clone().unwrap();
        assert!(message.contains("exa****.com"));
        assert!(!message.contains("example.com"));
    }

    #[tokio::test]
    async fn test_ns_resolution_failure_leaves_state() {
        let resolver = Err(LookupFailure::Failed("DNS query timed out".into()));
        let (monitor, store) = monitor(checkers(vec![], snapshot(1.0), resolver), quiet_notifier(0)).await;
        let domain = add_domain(&store).await;

        monitor.run_ns_once().await.unwrap();

        let stored = store.get_domain(domain.id).await.unwrap().unwrap();
        assert_eq!(stored.ns_compliant, None);
        assert!(stored.last_ns_check_at.is_some());
        let checks = store.list_ns_checks(domain.id, 10).await.unwrap();
        assert_eq!(checks[0].outcome, NsOutcome::ResolutionFailed);
        assert!(store.list_alerts_for_subject(domain.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_check_is_skipped() {
        let (monitor, store) = monitor(checkers(vec![], snapshot(1.0), Ok(vec![])), quiet_notifier(0)).await;
        let server = add_server(&store).await;

        let _held = monitor.in_flight().try_acquire(server.id, Job::Availability).unwrap();
        assert!(!monitor.check_server_availability(&server).await.unwrap());
        assert_eq!(monitor.run_availability_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hung_probe_counts_as_failure() {
        let mut config = Config::default();
        config.probe.connect_timeout_secs = 1;
        config.probe.request_timeout_secs = 1;
        config.dns.timeout_secs = 1;
        let hanging = Checkers {
            probe: Arc::new(FixedProbe(snapshot(1.0))),
            reachability: Arc::new(HangingReachability),
            resolver: Arc::new(FixedResolver(Ok(vec![]))),
        };
        let (monitor, store) = monitor_with(config, hanging, quiet_notifier(0)).await;
        let server = add_server(&store).await;

        assert!(monitor.check_server_availability(&server).await.unwrap());
        let stored = store.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(stored.failure_count, 1);
    }

    #[tokio::test]
    async fn test_notifier_failure_keeps_transition() {
        let mut notifier = MockNotifier::new();
        notifier.expect_channel().return_const("mock");
        notifier
            .expect_deliver()
            .times(1)
            .returning(|_| Err(crate::Error::Internal("telegram down".into())));

        let (monitor, store) = monitor(checkers(vec![], snapshot(99.0), Ok(vec![])), Arc::new(notifier)).await;
        let server = add_server(&store).await;

        monitor.run_resources_once().await.unwrap();
        let alerts = store.list_alerts_for_subject(server.id).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].is_open());
        assert!(alerts[0].last_message.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_stops_jobs() {
        let (monitor, _store) = monitor(checkers(vec![], snapshot(1.0), Ok(vec![])), quiet_notifier(0)).await;
        let monitor = Arc::new(monitor);
        let (tx, rx) = watch::channel(false);

        let handles = monitor.spawn(rx);
        assert_eq!(handles.len(), 4);
        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
