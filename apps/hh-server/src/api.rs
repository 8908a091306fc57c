use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use hh_core::{AppRecord, AppState, HealthGrade, HealthStatus};
use hh_events::Event;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::app_state::AppContext;
use crate::discovery::{DiscoveryError, DiscoveryReport};
use crate::lifecycle::LifecycleError;
use crate::ports::PortError;
use crate::registry::RegistryError;
use crate::resources::ResourceError;
use crate::responses::problem_response;
use crate::router::RelayError;
use crate::stats::{self, SystemStats};
use crate::ui_supervisor::{UiError, UiStatus};

const RECENT_DEFAULT_LIMIT: usize = 50;

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/apps", get(list_apps))
        .route("/api/apps/{id}", get(get_app).delete(uninstall_app))
        .route("/api/apps/{id}/start", post(start_app))
        .route("/api/apps/{id}/stop", post(stop_app))
        .route("/api/apps/{id}/restart", post(restart_app))
        .route("/api/apps/{id}/health/poll", post(poll_health))
        .route("/api/apps/{id}/ui/open", post(open_ui))
        .route("/api/apps/{id}/ui/close", post(close_ui))
        .route("/api/apps/{id}/ui/keepalive", post(keepalive_ui))
        .route("/api/apps/{id}/resources", get(list_resources))
        .route("/api/apps/{id}/resources/{resource}", get(get_resource))
        .route(
            "/api/apps/{id}/resources/{resource}/{item}",
            get(get_resource_item),
        )
        .route("/api/ui", get(ui_status))
        .route("/api/discovery/rescan", post(rescan))
        .route("/api/stats", get(system_stats))
        .route("/api/events/recent", get(recent_events))
        .route("/api/events", post(relay_event))
        .with_state(ctx)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("app `{0}` not found")]
    NotFound(String),
    #[error("app `{0}` is not a running service")]
    NotPollable(String),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Ui(#[from] UiError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

fn registry_status(err: &RegistryError) -> (StatusCode, &'static str) {
    match err {
        RegistryError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
        RegistryError::Conflict { .. } => (StatusCode::CONFLICT, "Conflict"),
    }
}

fn port_status(err: &PortError) -> (StatusCode, &'static str) {
    match err {
        PortError::Exhausted { .. } => (StatusCode::SERVICE_UNAVAILABLE, "Ports Exhausted"),
        PortError::SlotBusy { .. } => (StatusCode::CONFLICT, "Interactive Slot Busy"),
        PortError::Taken { .. } | PortError::OutOfRange { .. } => {
            (StatusCode::CONFLICT, "Port Unavailable")
        }
        PortError::Persist(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Port Map Write Failed"),
    }
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
            ApiError::NotPollable(_) => (StatusCode::CONFLICT, "Not Running"),
            ApiError::Lifecycle(err) => match err {
                LifecycleError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
                LifecycleError::WrongKind { .. } => (StatusCode::BAD_REQUEST, "Wrong App Kind"),
                LifecycleError::InvalidManifest(_) => (StatusCode::CONFLICT, "Invalid Manifest"),
                LifecycleError::AlreadyRunning { .. } => (StatusCode::CONFLICT, "Already Running"),
                LifecycleError::NotRunning { .. } => (StatusCode::CONFLICT, "Not Running"),
                LifecycleError::PortUnavailable { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "Port Unavailable")
                }
                LifecycleError::SpawnFailed { .. } => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "Launch Failed")
                }
                LifecycleError::TerminateFailed { .. } => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "Stop Failed")
                }
                LifecycleError::Registry(err) => registry_status(err),
                LifecycleError::Ports(err) => port_status(err),
            },
            ApiError::Ui(err) => match err {
                UiError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
                UiError::WrongKind { .. } => (StatusCode::BAD_REQUEST, "Wrong App Kind"),
                UiError::InvalidManifest(_) => (StatusCode::CONFLICT, "Invalid Manifest"),
                UiError::NotActive(_) => (StatusCode::CONFLICT, "UI Not Active"),
                UiError::SpawnFailed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "Launch Failed"),
                UiError::TerminateFailed { .. } => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "Stop Failed")
                }
                UiError::Registry(err) => registry_status(err),
                UiError::Ports(err) => port_status(err),
            },
            ApiError::Discovery(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Discovery Failed"),
            ApiError::Relay(_) => (StatusCode::BAD_REQUEST, "Invalid Event"),
            ApiError::Resource(err) => match err {
                ResourceError::NotRunning(_) => (StatusCode::CONFLICT, "Not Running"),
                ResourceError::NoUi(_) => (StatusCode::NOT_FOUND, "No UI"),
                ResourceError::InvalidName(_) => (StatusCode::BAD_REQUEST, "Invalid Resource"),
                ResourceError::Upstream(_)
                | ResourceError::Unreachable(_)
                | ResourceError::Malformed(_) => (StatusCode::BAD_GATEWAY, "Bad Gateway"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, title) = self.status();
        let detail = self.to_string();
        if status.is_server_error() {
            warn!(target: "homehelper::api", %status, error = %detail, "request failed");
        }
        problem_response(status, title, Some(&detail))
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Row of the app listing.
#[derive(Debug, Serialize)]
struct AppSummary {
    app_id: String,
    name: Option<String>,
    version: Option<String>,
    kind: Option<&'static str>,
    state: AppState,
    state_label: &'static str,
    port: u16,
    health: HealthGrade,
    needs_reinstall: bool,
    last_error: Option<String>,
}

#[derive(Debug, Serialize)]
struct AppDetail {
    #[serde(flatten)]
    record: AppRecord,
    state_label: &'static str,
    current_health: HealthStatus,
}

fn summary(ctx: &AppContext, record: AppRecord) -> AppSummary {
    let health = record
        .health
        .current(Utc::now(), ctx.health().staleness())
        .grade;
    let (name, version) = record
        .manifest
        .as_ref()
        .map(|manifest| (Some(manifest.name.clone()), Some(manifest.version.clone())))
        .unwrap_or((None, None));
    AppSummary {
        kind: record.kind().map(|kind| kind.as_str()),
        state_label: record.state.display_label(),
        state: record.state,
        port: record.port,
        health,
        needs_reinstall: record.needs_reinstall,
        last_error: record.last_error,
        app_id: record.app_id,
        name,
        version,
    }
}

fn detail(ctx: &AppContext, record: AppRecord) -> AppDetail {
    AppDetail {
        state_label: record.state.display_label(),
        current_health: record
            .health
            .current(Utc::now(), ctx.health().staleness()),
        record,
    }
}

async fn record_of(ctx: &AppContext, id: &str) -> ApiResult<AppRecord> {
    ctx.registry()
        .get(id)
        .await
        .ok_or_else(|| ApiError::NotFound(id.to_string()))
}

async fn healthz(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "service": "homehelper",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": (Utc::now() - ctx.started_at()).num_seconds().max(0),
    }))
}

async fn list_apps(State(ctx): State<AppContext>) -> Json<Vec<AppSummary>> {
    let records = ctx.registry().list().await;
    Json(
        records
            .into_iter()
            .map(|record| summary(&ctx, record))
            .collect(),
    )
}

async fn get_app(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<AppDetail>> {
    let record = record_of(&ctx, &id).await?;
    Ok(Json(detail(&ctx, record)))
}

async fn uninstall_app(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<AppDetail>> {
    let record = record_of(&ctx, &id).await?;
    if record.is_interactive() && ctx.ui().active_app().await.as_deref() == Some(id.as_str()) {
        ctx.ui().close(&id).await?;
    }
    let removed = ctx.lifecycle().uninstall(&id).await?;
    Ok(Json(detail(&ctx, removed)))
}

async fn start_app(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<AppDetail>> {
    let record = ctx.lifecycle().start(&id).await?;
    Ok(Json(detail(&ctx, record)))
}

async fn stop_app(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<AppDetail>> {
    let record = ctx.lifecycle().stop(&id).await?;
    Ok(Json(detail(&ctx, record)))
}

async fn restart_app(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<AppDetail>> {
    let record = ctx.lifecycle().restart(&id).await?;
    Ok(Json(detail(&ctx, record)))
}

async fn poll_health(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<HealthStatus>> {
    record_of(&ctx, &id).await?;
    ctx.health()
        .poll_now(&id)
        .await
        .map(Json)
        .ok_or(ApiError::NotPollable(id))
}

async fn open_ui(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<AppDetail>> {
    let record = ctx.ui().open(&id).await?;
    Ok(Json(detail(&ctx, record)))
}

async fn close_ui(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<AppDetail>> {
    let record = ctx.ui().close(&id).await?;
    Ok(Json(detail(&ctx, record)))
}

async fn keepalive_ui(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<UiStatus>> {
    Ok(Json(ctx.ui().keep_alive(&id).await?))
}

async fn ui_status(State(ctx): State<AppContext>) -> Json<UiStatus> {
    Json(ctx.ui().status().await)
}

async fn list_resources(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<String>>> {
    let record = record_of(&ctx, &id).await?;
    Ok(Json(ctx.resources().list(&record).await?))
}

async fn get_resource(
    State(ctx): State<AppContext>,
    Path((id, resource)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let record = record_of(&ctx, &id).await?;
    Ok(Json(ctx.resources().fetch(&record, &resource, None).await?))
}

async fn get_resource_item(
    State(ctx): State<AppContext>,
    Path((id, resource, item)): Path<(String, String, String)>,
) -> ApiResult<Json<Value>> {
    let record = record_of(&ctx, &id).await?;
    Ok(Json(
        ctx.resources()
            .fetch(&record, &resource, Some(&item))
            .await?,
    ))
}

async fn rescan(State(ctx): State<AppContext>) -> ApiResult<Json<DiscoveryReport>> {
    Ok(Json(ctx.discovery().scan().await?))
}

async fn system_stats(State(ctx): State<AppContext>) -> Json<SystemStats> {
    Json(stats::collect(&ctx).await)
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
    event_type: Option<String>,
}

async fn recent_events(
    State(ctx): State<AppContext>,
    Query(query): Query<RecentQuery>,
) -> Json<Vec<Event>> {
    let limit = query
        .limit
        .unwrap_or(RECENT_DEFAULT_LIMIT)
        .clamp(1, ctx.config().events.recent_capacity.max(1));
    Json(ctx.events().recent(limit, query.event_type.as_deref()))
}

#[derive(Debug, Deserialize)]
struct RelayRequest {
    source: String,
    event_type: String,
    #[serde(default)]
    data: Value,
}

async fn relay_event(
    State(ctx): State<AppContext>,
    Json(body): Json<RelayRequest>,
) -> ApiResult<(StatusCode, Json<Event>)> {
    let event = ctx
        .events()
        .relay(&body.source, &body.event_type, body.data)?;
    Ok((StatusCode::ACCEPTED, Json(event)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Discovery;
    use crate::resources::ResourceProxy;
    use crate::test_support::{manifest_json, wait_for_state, write_app, Harness};
    use axum::body::Body;
    use axum::http::Request;
    use hh_core::Config;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn context(harness: &Harness) -> AppContext {
        let mut config = Config::default();
        config.apps_dir = harness.dir.path().join("apps");
        let discovery = Discovery::new(
            config.apps_dir.clone(),
            harness.registry.clone(),
            harness.ports.clone(),
            harness.router.clone(),
        );
        AppContext::new(
            Arc::new(config),
            harness.registry.clone(),
            harness.ports.clone(),
            harness.router.clone(),
            harness.lifecycle.clone(),
            harness.ui.clone(),
            harness.health.clone(),
            Arc::new(discovery),
            Arc::new(ResourceProxy::new(Duration::from_secs(1)).unwrap()),
        )
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap())),
            None => builder.body(Body::empty()),
        }
        .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn unknown_app_is_a_problem_document() {
        let harness = Harness::new().await;
        let app = router(context(&harness));
        let (status, body) = call(&app, "GET", "/api/apps/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], 404);
        assert_eq!(body["title"], "Not Found");
        assert!(body["detail"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn rescan_then_start_and_stop_over_http() {
        let harness = Harness::new().await;
        write_app(
            &harness.dir.path().join("apps"),
            "notes",
            &manifest_json("service", json!({})),
            true,
        );
        let app = router(context(&harness));

        let (status, report) = call(&app, "POST", "/api/discovery/rescan", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["registered"], json!(["notes"]));

        let (status, listed) = call(&app, "GET", "/api/apps", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed[0]["app_id"], "notes");
        assert_eq!(listed[0]["health"], "unknown");

        let (status, started) = call(&app, "POST", "/api/apps/notes/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(started["state"], "starting");

        let (status, problem) = call(&app, "POST", "/api/apps/notes/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(problem["title"], "Already Running");

        wait_for_state(&harness.registry, "notes", AppState::Running).await;
        let (status, stopped) = call(&app, "POST", "/api/apps/notes/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stopped["state"], "stopped");
    }

    #[tokio::test]
    async fn ui_routes_reject_services() {
        let harness = Harness::new().await;
        harness.add_service("svc", json!({})).await;
        harness.add_interactive("dash").await;
        let app = router(context(&harness));

        let (status, _) = call(&app, "POST", "/api/apps/svc/ui/open", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, "POST", "/api/apps/dash/ui/keepalive", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, opened) = call(&app, "POST", "/api/apps/dash/ui/open", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(opened["port"], 9501);
        let (_, ui) = call(&app, "GET", "/api/ui", None).await;
        assert_eq!(ui["active"], "dash");

        let (status, _) = call(&app, "DELETE", "/api/apps/dash", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(harness.registry.get("dash").await.is_none());
        assert_eq!(harness.ui.active_app().await, None);
    }

    #[tokio::test]
    async fn events_are_relayed_and_listed() {
        let harness = Harness::new().await;
        let app = router(context(&harness));
        let (status, _) = call(
            &app,
            "POST",
            "/api/events",
            Some(json!({"source": "weather", "event_type": "Bad Type"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, event) = call(
            &app,
            "POST",
            "/api/events",
            Some(json!({"source": "weather", "event_type": "rain_started", "data": {"mm": 2}})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(event["source"], "weather");

        let (status, recent) =
            call(&app, "GET", "/api/events/recent?event_type=rain_started", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(recent.as_array().unwrap().len(), 1);
        assert_eq!(recent[0]["data"]["mm"], 2);
    }

    #[tokio::test]
    async fn stats_cover_ports_and_apps() {
        let harness = Harness::new().await;
        harness.add_service("svc", json!({})).await;
        harness.ports.allocate("svc", hh_core::AppKind::Service).await.unwrap();
        let app = router(context(&harness));
        let (status, stats) = call(&app, "GET", "/api/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["apps"]["total"], 1);
        assert_eq!(stats["ports"]["allocated"], 1);
        assert_eq!(stats["ports"]["total"], 100);
        assert_eq!(stats["health"]["unknown"], 1);
        assert!(stats["host"]["cpu"]["cores"].as_u64().unwrap() > 0);
        assert!(stats["host"]["memory"]["total_mb"].as_u64().unwrap() > 0);
        assert!(stats["processes"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_poll_requires_running_service() {
        let harness = Harness::new().await;
        harness.add_service("svc", json!({})).await;
        let app = router(context(&harness));
        let (status, _) = call(&app, "POST", "/api/apps/svc/health/poll", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        harness.lifecycle.start("svc").await.unwrap();
        wait_for_state(&harness.registry, "svc", AppState::Running).await;
        let (status, body) = call(&app, "POST", "/api/apps/svc/health/poll", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["grade"], "good");
    }

    #[tokio::test]
    async fn resources_of_stopped_app_conflict() {
        let harness = Harness::new().await;
        harness.add_service("svc", json!({"has_UI": true})).await;
        let app = router(context(&harness));
        let (status, body) = call(&app, "GET", "/api/apps/svc/resources", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["title"], "Not Running");
    }
}
