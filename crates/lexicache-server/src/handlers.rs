use std::collections::BTreeMap;
use std::str::FromStr;

use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::{StatusCode, header},
    response::IntoResponse,
};
use lexicache_api::{ApiError, ApiResponse};
use lexicache_core::{
    AggregateStatus, BenchmarkConfig, BenchmarkRun, ClusterTopology, InvalidationEvent,
    InvalidationTrigger, WarmingJob, WarmingKind, WarmingStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::cache::analytics::AnalyticsReport;
use crate::cache::benchmark::BenchmarkDashboard;
use crate::cache::compression::CompressionStats;
use crate::cache::coordinator::CoordinatorStats;
use crate::cache::health::{FailoverRequest, HealthReport, OverrideInfo};
use crate::cache::invalidation::InvalidationOutcome;
use crate::cache::topology::RebalanceReport;
use crate::cache::warming::{WarmRequest, WarmingDashboard};
use crate::server::AppState;

type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

pub async fn root() -> impl IntoResponse {
    let body = json!({
        "service": "Lexicache",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(body))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Not ready while the coordinator bypasses the entry store.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.health.is_failover() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse { status: "failover" }),
        )
    } else {
        (StatusCode::OK, Json(HealthResponse { status: "ready" }))
    }
}

pub async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let body = crate::metrics::render_metrics()
        .ok_or_else(|| ApiError::service_unavailable("metrics exporter not initialized"))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

// ---- Dashboard read models ----

/// Views served under `GET /cache/{view}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashboardView {
    Health,
    Analytics,
    Warming,
    Compression,
    Distributed,
    Benchmark,
    Invalidation,
}

impl FromStr for DashboardView {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "health" => Ok(Self::Health),
            "analytics" => Ok(Self::Analytics),
            "warming" => Ok(Self::Warming),
            "compression" => Ok(Self::Compression),
            "distributed" => Ok(Self::Distributed),
            "benchmark" => Ok(Self::Benchmark),
            "invalidation" => Ok(Self::Invalidation),
            other => Err(ApiError::not_found(format!("unknown dashboard view '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionView {
    pub enabled: bool,
    pub dedup_enabled: bool,
    pub threshold_bytes: usize,
    pub level: u32,
    /// Absent when the entry store is disabled.
    pub stats: Option<CompressionStats>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedView {
    pub topology: Option<ClusterTopology>,
    pub pinned_region: Option<String>,
    pub node_keys: BTreeMap<String, u64>,
    pub coordinator: CoordinatorStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationView {
    pub events: Vec<InvalidationEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum DashboardPayload {
    Health(HealthReport),
    Analytics(AnalyticsReport),
    Warming(WarmingDashboard),
    Compression(CompressionView),
    Distributed(DistributedView),
    Benchmark(BenchmarkDashboard),
    Invalidation(InvalidationView),
}

#[derive(Debug, Default, Deserialize)]
pub struct DashboardQuery {
    /// Run a health cycle before reporting.
    #[serde(default)]
    pub refresh: bool,
}

pub async fn dashboard(
    State(state): State<AppState>,
    Path(view): Path<String>,
    Query(query): Query<DashboardQuery>,
) -> ApiResult<DashboardPayload> {
    let view = view.parse::<DashboardView>()?;
    Ok(ApiResponse::ok(render_view(&state, view, &query).await))
}

/// `GET /cache/benchmark`; the path is also bound to `POST` so it needs its own route.
pub async fn benchmark_dashboard(State(state): State<AppState>) -> ApiResult<DashboardPayload> {
    let query = DashboardQuery::default();
    Ok(ApiResponse::ok(
        render_view(&state, DashboardView::Benchmark, &query).await,
    ))
}

async fn render_view(state: &AppState, view: DashboardView, query: &DashboardQuery) -> DashboardPayload {
    match view {
        DashboardView::Health => {
            let report = if query.refresh {
                state.health.run_cycle().await
            } else {
                state.health.report()
            };
            DashboardPayload::Health(report)
        }
        DashboardView::Analytics => DashboardPayload::Analytics(state.analytics.report()),
        DashboardView::Warming => DashboardPayload::Warming(state.warming.dashboard()),
        DashboardView::Compression => {
            let cfg = &state.config.compression;
            DashboardPayload::Compression(CompressionView {
                enabled: cfg.enabled,
                dedup_enabled: cfg.dedup_enabled,
                threshold_bytes: cfg.threshold_bytes,
                level: cfg.level,
                stats: state.coordinator.remote().map(|r| r.stats()),
            })
        }
        DashboardView::Distributed => {
            let topology = state.coordinator.remote().map(|r| r.store().topology());
            DashboardPayload::Distributed(DistributedView {
                topology: topology.map(|t| t.topology()),
                pinned_region: topology.and_then(|t| t.pinned_region()),
                node_keys: topology.map(|t| t.node_key_counts()).unwrap_or_default(),
                coordinator: state.coordinator.stats(),
            })
        }
        DashboardView::Benchmark => DashboardPayload::Benchmark(state.benchmark.dashboard()),
        DashboardView::Invalidation => DashboardPayload::Invalidation(InvalidationView {
            events: state.invalidation.recent(50),
        }),
    }
}

// ---- Operator actions ----

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

fn job_id(id: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, ApiError> {
    id.map(|Path(id)| id)
        .map_err(|_| ApiError::bad_request("job id must be a UUID"))
}

pub async fn invalidate(
    State(state): State<AppState>,
    payload: Result<Json<InvalidationTrigger>, JsonRejection>,
) -> ApiResult<InvalidationOutcome> {
    let trigger = body(payload)?;
    let outcome = state.invalidation.invalidate(trigger).await?;
    Ok(ApiResponse::ok(outcome))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmAck {
    pub job_id: Uuid,
    pub kind: WarmingKind,
    pub status: WarmingStatus,
    pub candidate_keys: u64,
}

pub async fn warm(
    State(state): State<AppState>,
    payload: Result<Json<WarmRequest>, JsonRejection>,
) -> ApiResult<WarmAck> {
    let request = body(payload)?;
    let ticket = state.warming.submit(request).await?;
    let job = ticket.job;
    Ok(ApiResponse::accepted(WarmAck {
        job_id: job.id,
        kind: job.kind,
        status: job.status,
        candidate_keys: job.candidate_keys,
    }))
}

pub async fn warming_job(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<WarmingJob> {
    let id = job_id(id)?;
    let job = state
        .warming
        .job(id)
        .ok_or_else(|| ApiError::not_found(format!("warming job {id}")))?;
    Ok(ApiResponse::ok(job))
}

pub async fn cancel_warming_job(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<WarmingJob> {
    let id = job_id(id)?;
    Ok(ApiResponse::ok(state.warming.cancel(id)?))
}

pub async fn invalidation_event(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<InvalidationEvent> {
    let id = job_id(id)?;
    let event = state
        .invalidation
        .event(id)
        .ok_or_else(|| ApiError::not_found(format!("invalidation event {id}")))?;
    Ok(ApiResponse::ok(event))
}

#[derive(Debug, Deserialize)]
pub struct BenchmarkRequest {
    pub config: BenchmarkConfig,
}

pub async fn run_benchmark(
    State(state): State<AppState>,
    payload: Result<Json<BenchmarkRequest>, JsonRejection>,
) -> ApiResult<BenchmarkRun> {
    let request = body(payload)?;
    let run = state.benchmark.run(request.config).await?;
    Ok(ApiResponse::ok(run))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverResponse {
    pub status: AggregateStatus,
    pub failover_active: bool,
    #[serde(rename = "override")]
    pub override_info: Option<OverrideInfo>,
}

pub async fn failover(
    State(state): State<AppState>,
    payload: Result<Json<FailoverRequest>, JsonRejection>,
) -> ApiResult<FailoverResponse> {
    let request = body(payload)?;
    let override_info = state.health.apply_override(request).await?;
    Ok(ApiResponse::ok(FailoverResponse {
        status: state.health.status(),
        failover_active: state.health.is_failover(),
        override_info,
    }))
}

pub async fn rebalance(State(state): State<AppState>) -> ApiResult<RebalanceReport> {
    let remote = state
        .coordinator
        .remote()
        .ok_or_else(|| ApiError::service_unavailable("entry store is disabled"))?;
    let report = remote.store().rebalance().await?;
    tracing::info!(
        version = report.version,
        moved_slots = report.moved_slots,
        migrated_keys = report.migrated_keys,
        healthy_nodes = report.healthy_nodes,
        "cluster rebalanced"
    );
    Ok(ApiResponse::ok(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dashboard_views_parse() {
        assert_eq!("health".parse::<DashboardView>().unwrap(), DashboardView::Health);
        assert_eq!(
            "distributed".parse::<DashboardView>().unwrap(),
            DashboardView::Distributed
        );
        let err = "nope".parse::<DashboardView>().unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn failover_response_uses_override_field() {
        let resp = FailoverResponse {
            status: AggregateStatus::Normal,
            failover_active: false,
            override_info: None,
        };
        let value = serde_json::to_value(resp).unwrap();
        assert_eq!(value["failoverActive"], false);
        assert!(value.get("override").is_some());
    }
}
