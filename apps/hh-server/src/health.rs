use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use hh_core::{
    AppRecord, AppState, Config, HealthGrade, HealthProbe, HealthReport, HealthStatus,
    ProbeError, ProbeTarget,
};
use hh_topics as topics;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::http_client;
use crate::lifecycle::ServiceManager;
use crate::registry::AppRegistry;
use crate::router::EventRouter;
use crate::tasks::TaskHandle;

/// Probes `GET http://127.0.0.1:<port><health_path>`.
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: http_client::client_with_timeout(timeout)?,
        })
    }
}

fn classify(err: reqwest::Error) -> ProbeError {
    if err.is_timeout() {
        ProbeError::Timeout
    } else if err.is_decode() {
        ProbeError::Malformed(err.to_string())
    } else {
        ProbeError::Connect(err.to_string())
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, target: &ProbeTarget) -> Result<HealthReport, ProbeError> {
        let url = format!("http://127.0.0.1:{}{}", target.port, target.path);
        let response = self.client.get(&url).send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }
        let body = response.bytes().await.map_err(classify)?;
        serde_json::from_slice::<HealthReport>(&body)
            .map_err(|err| ProbeError::Malformed(err.to_string()))
    }
}

#[derive(Clone, Debug)]
pub struct HealthOptions {
    pub interval: Duration,
    pub timeout: Duration,
    pub history_len: usize,
    pub staleness: Duration,
}

impl HealthOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.health.interval(),
            timeout: config.health.probe_timeout(),
            history_len: config.health.history_len,
            staleness: config.health.staleness(),
        }
    }
}

/// Polls running services and folds the results into the registry. Crash decisions belong to
/// the lifecycle manager; the aggregator only reports.
pub struct HealthAggregator {
    registry: Arc<AppRegistry>,
    lifecycle: Arc<ServiceManager>,
    probe: Arc<dyn HealthProbe>,
    router: EventRouter,
    options: HealthOptions,
}

impl HealthAggregator {
    pub fn new(
        registry: Arc<AppRegistry>,
        lifecycle: Arc<ServiceManager>,
        probe: Arc<dyn HealthProbe>,
        router: EventRouter,
        options: HealthOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            lifecycle,
            probe,
            router,
            options,
        })
    }

    pub fn staleness(&self) -> Duration {
        self.options.staleness
    }

    fn target(record: &AppRecord) -> Option<ProbeTarget> {
        let manifest = record.manifest.as_ref()?;
        (record.is_service() && record.state == AppState::Running && record.port != 0).then(|| {
            ProbeTarget {
                app_id: record.app_id.clone(),
                port: record.port,
                path: manifest.endpoints.health_path.clone(),
            }
        })
    }

    /// Polls one app if it is a running service. Returns the recorded observation.
    pub async fn poll_now(&self, app_id: &str) -> Option<HealthStatus> {
        let record = self.registry.get(app_id).await?;
        let target = Self::target(&record)?;
        Some(self.probe_and_record(target).await)
    }

    /// Polls every running service concurrently.
    pub async fn poll_all(&self) -> Vec<(String, HealthStatus)> {
        let targets = self
            .registry
            .list()
            .await
            .iter()
            .filter_map(Self::target)
            .collect::<Vec<_>>();
        if targets.is_empty() {
            return Vec::new();
        }
        let ids = targets
            .iter()
            .map(|target| target.app_id.clone())
            .collect::<Vec<_>>();
        let results =
            join_all(targets.into_iter().map(|target| self.probe_and_record(target))).await;
        debug!(target: "homehelper::health", polled = ids.len(), "health poll round complete");
        ids.into_iter().zip(results).collect()
    }

    async fn probe_and_record(&self, target: ProbeTarget) -> HealthStatus {
        let outcome = tokio::time::timeout(self.options.timeout, self.probe.probe(&target))
            .await
            .unwrap_or(Err(ProbeError::Timeout));
        if let Err(err) = &outcome {
            debug!(
                target: "homehelper::health",
                app = %target.app_id,
                port = target.port,
                error = %err,
                "health probe failed"
            );
        }
        let status = HealthStatus::from_probe(outcome);
        self.record(&target.app_id, status.clone()).await;
        self.lifecycle.observe(&target.app_id, &status).await;
        status
    }

    async fn record(&self, app_id: &str, status: HealthStatus) {
        let mut previous = HealthGrade::Unknown;
        let history_len = self.options.history_len;
        let stored = status.clone();
        if let Err(err) = self
            .registry
            .update(app_id, |rec| {
                previous = rec
                    .health
                    .latest()
                    .map(|latest| latest.grade)
                    .unwrap_or_default();
                rec.health.push(stored, history_len);
            })
            .await
        {
            warn!(target: "homehelper::health", app = %app_id, error = %err, "health result dropped");
            return;
        }
        if previous != status.grade {
            info!(
                target: "homehelper::health",
                app = %app_id,
                from = previous.as_str(),
                to = status.grade.as_str(),
                message = %status.message,
                "health changed"
            );
            self.router.emit(
                topics::EVENT_APP_HEALTH_CHANGED,
                json!({
                    "app_id": app_id,
                    "previous": previous.as_str(),
                    "grade": status.grade.as_str(),
                    "message": status.message,
                }),
            );
        }
    }

    /// Runs the periodic poll and serves out-of-band poll requests until cancelled.
    pub fn spawn(
        self: &Arc<Self>,
        cancel: CancellationToken,
        mut poll_requests: mpsc::UnboundedReceiver<String>,
    ) -> TaskHandle {
        let aggregator = self.clone();
        TaskHandle::new(
            "health.poller",
            tokio::spawn(async move {
                let mut ticker = interval(aggregator.options.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(target: "homehelper::health", "health poller cancelled");
                            break;
                        }
                        _ = ticker.tick() => {
                            aggregator.poll_all().await;
                        }
                        Some(app_id) = poll_requests.recv() => {
                            if aggregator.poll_now(&app_id).await.is_none() {
                                debug!(target: "homehelper::health", app = %app_id, "poll request skipped; app not running");
                            }
                        }
                    }
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskManager;
    use crate::test_support::{wait_for_state, Harness, ProbeBehavior};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};

    async fn running(harness: &Harness, app_id: &str) {
        harness.add_service(app_id, json!({})).await;
        harness.lifecycle.start(app_id).await.unwrap();
        wait_for_state(&harness.registry, app_id, AppState::Running).await;
    }

    #[tokio::test]
    async fn timeout_counts_like_an_explicit_error() {
        let harness = Harness::new().await;
        running(&harness, "hangs").await;
        running(&harness, "errors").await;
        harness.probe.set("hangs", ProbeBehavior::Hang);
        harness
            .probe
            .set("errors", ProbeBehavior::Fail(ProbeError::Status(500)));
        let mut events = harness.router.subscribe();

        for _ in 0..2 {
            let hung = harness.health.poll_now("hangs").await.unwrap();
            let failed = harness.health.poll_now("errors").await.unwrap();
            assert_eq!(hung.grade, HealthGrade::Error);
            assert_eq!(failed.grade, HealthGrade::Error);
        }
        for id in ["hangs", "errors"] {
            let record = harness.registry.get(id).await.unwrap();
            assert_eq!(record.service_runtime().unwrap().consecutive_failures, 2);
            assert!(record.health.iter().all(|s| s.grade == HealthGrade::Error));
        }

        harness.health.poll_now("hangs").await.unwrap();
        harness.health.poll_now("errors").await.unwrap();
        let mut crashed = Vec::new();
        while crashed.len() < 2 {
            let env = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("crash event")
                .expect("bus open");
            if env.event.event_type == topics::EVENT_APP_CRASHED {
                crashed.push(env.event.data["app_id"].as_str().unwrap().to_string());
            }
        }
        crashed.sort();
        assert_eq!(crashed, vec!["errors", "hangs"]);
    }

    #[tokio::test]
    async fn grade_changes_are_published_once() {
        let harness = Harness::new().await;
        running(&harness, "svc").await;
        let mut events = harness.router.subscribe();
        harness.probe.set("svc", ProbeBehavior::Report("warning", "disk 91%"));
        harness.health.poll_now("svc").await.unwrap();
        harness.health.poll_now("svc").await.unwrap();

        let mut changes = Vec::new();
        while let Ok(env) = events.try_recv() {
            if env.event.event_type == topics::EVENT_APP_HEALTH_CHANGED {
                changes.push(env.event.data);
            }
        }
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["previous"], "unknown");
        assert_eq!(changes[0]["grade"], "warning");
        let record = harness.registry.get("svc").await.unwrap();
        assert_eq!(record.health.len(), 2);
        assert_eq!(record.state, AppState::Running);
    }

    #[tokio::test]
    async fn poll_all_skips_apps_that_are_not_running() {
        let harness = Harness::new().await;
        running(&harness, "up").await;
        harness.add_service("idle", json!({})).await;
        harness.add_interactive("dash").await;
        let polled = harness.health.poll_all().await;
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].0, "up");
        assert_eq!(harness.probe.calls(), 1);
        assert!(harness.health.poll_now("idle").await.is_none());
    }

    #[tokio::test]
    async fn poller_serves_requests_after_start_grace() {
        let harness = Harness::new().await;
        let requests = harness.take_poll_requests().await.unwrap();
        let cancel = CancellationToken::new();
        let mut tasks = TaskManager::new();
        tasks.push(harness.health.spawn(cancel.clone(), requests));

        harness.add_service("svc", json!({})).await;
        harness.lifecycle.start("svc").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if harness.registry.get("svc").await.unwrap().health.len() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first poll after grace");
        cancel.cancel();
        tasks.shutdown_with_grace(Duration::from_secs(1)).await;
    }

    async fn serve(router: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    fn target(port: u16, path: &str) -> ProbeTarget {
        ProbeTarget {
            app_id: "probe".into(),
            port,
            path: path.into(),
        }
    }

    #[tokio::test]
    async fn http_probe_maps_responses() {
        let port = serve(
            Router::new()
                .route(
                    "/health",
                    get(|| async {
                        Json(json!({"health": "good", "message": "ok", "extra_info": {"q": 1}}))
                    }),
                )
                .route(
                    "/broken",
                    get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
                )
                .route("/garbled", get(|| async { "not json" })),
        )
        .await;
        let probe = HttpHealthProbe::new(Duration::from_secs(2)).unwrap();

        let report = probe.probe(&target(port, "/health")).await.unwrap();
        assert_eq!(report.health, "good");
        assert_eq!(report.extra_info, Some(json!({"q": 1})));
        assert_eq!(
            probe.probe(&target(port, "/broken")).await,
            Err(ProbeError::Status(500))
        );
        assert!(matches!(
            probe.probe(&target(port, "/garbled")).await,
            Err(ProbeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn http_probe_reports_unreachable_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let probe = HttpHealthProbe::new(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            probe.probe(&target(port, "/health")).await,
            Err(ProbeError::Connect(_))
        ));
    }
}
