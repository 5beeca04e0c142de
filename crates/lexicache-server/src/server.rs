use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use lexicache_core::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::cache::analytics::{AccessSample, AnalyticsEngine};
use crate::cache::benchmark::BenchmarkHarness;
use crate::cache::compression::RemoteCodec;
use crate::cache::coordinator::CacheCoordinator;
use crate::cache::entry_store::{EntryStore, nodes_from_config};
use crate::cache::health::{FailoverSwitch, HealthMonitor, TracingSink};
use crate::cache::invalidation::InvalidationPropagator;
use crate::cache::local::LocalTier;
use crate::cache::topology::TopologyManager;
use crate::cache::warming::WarmingScheduler;
use crate::{config::AppConfig, handlers, middleware as app_middleware};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// Shared handles for every cache component.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub coordinator: Arc<CacheCoordinator>,
    pub analytics: Arc<AnalyticsEngine>,
    pub invalidation: Arc<InvalidationPropagator>,
    pub warming: Arc<WarmingScheduler>,
    pub health: Arc<HealthMonitor>,
    pub benchmark: Arc<BenchmarkHarness>,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire all components from configuration without spawning anything.
    ///
    /// The returned receiver feeds the analytics ingest task started by
    /// [`BackgroundTasks::spawn`].
    pub fn from_config(cfg: &AppConfig) -> Result<(Self, mpsc::Receiver<AccessSample>)> {
        let shutdown = CancellationToken::new();

        let remote = if cfg.entry_store.enabled {
            let topology = Arc::new(TopologyManager::new(
                nodes_from_config(&cfg.entry_store),
                cfg.topology.replication_factor,
                cfg.topology.balance_factor,
            ));
            let store = Arc::new(EntryStore::from_config(&cfg.entry_store, topology)?);
            tracing::info!(
                mode = ?cfg.entry_store.mode,
                nodes = store.node_ids().len(),
                replication_factor = cfg.topology.replication_factor,
                "Entry store configured"
            );
            Some(Arc::new(RemoteCodec::new(store, cfg.compression.clone())))
        } else {
            tracing::info!("Entry store disabled, using local tier only");
            None
        };

        let local = Arc::new(LocalTier::from_config(&cfg.local_tier));
        let analytics = Arc::new(AnalyticsEngine::new(cfg.analytics.clone()));
        let (recorder, samples) = analytics.channel();

        let coordinator = Arc::new(CacheCoordinator::new(
            local,
            remote,
            cfg.coordinator.clone(),
            cfg.local_tier.default_ttl(),
            FailoverSwitch::default(),
            Some(recorder),
        ));

        let invalidation = Arc::new(InvalidationPropagator::new(
            Arc::clone(&coordinator),
            cfg.invalidation.clone(),
            shutdown.clone(),
        ));
        let source = WarmingScheduler::source_from_config(&cfg.warming)?;
        let warming = Arc::new(WarmingScheduler::new(
            Arc::clone(&coordinator),
            Some(Arc::clone(&analytics)),
            source,
            cfg.warming.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            cfg.health.clone(),
            Arc::clone(&coordinator),
            Some(Arc::clone(&analytics)),
            Arc::new(TracingSink),
        ));
        let benchmark = Arc::new(BenchmarkHarness::new(
            Arc::clone(&coordinator),
            cfg.benchmark.clone(),
        ));

        let state = Self {
            config: Arc::new(cfg.clone()),
            coordinator,
            analytics,
            invalidation,
            warming,
            health,
            benchmark,
            shutdown,
        };
        Ok((state, samples))
    }
}

/// Owns every background loop; all of them stop on the state's shutdown token.
pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Start the sweeper, write-behind worker, analytics ingest and pruning,
    /// health loop, warming timer and job housekeeping.
    pub fn spawn(state: &AppState, samples: mpsc::Receiver<AccessSample>) -> Self {
        let cancel = state.shutdown.clone();
        let cfg = &state.config;
        let mut handles = vec![
            state
                .coordinator
                .local()
                .spawn_sweeper(cfg.local_tier.sweep_interval(), cancel.clone()),
            state.analytics.spawn_ingest(samples, cancel.clone()),
            state.analytics.spawn_pruner(cancel.clone()),
            state.health.spawn(cancel.clone()),
            spawn_housekeeping(state.clone(), cancel.clone()),
        ];
        if let Some(handle) = state.coordinator.spawn_write_behind(cancel.clone()) {
            handles.push(handle);
        }
        if cfg.warming.timer_enabled {
            handles.push(state.warming.spawn_timer(cancel.clone()));
        }
        tracing::info!(tasks = handles.len(), "background tasks started");
        Self { cancel, handles }
    }

    /// Cancel every loop and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!("background tasks stopped");
    }
}

fn spawn_housekeeping(state: AppState, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let events = state.invalidation.cleanup();
                    let jobs = state.warming.cleanup();
                    if events + jobs > 0 {
                        tracing::debug!(events, jobs, "expired job records removed");
                    }
                    if let Some(remote) = state.coordinator.remote() {
                        let keys = remote.store().topology().prune_tracked_keys();
                        if keys > 0 {
                            tracing::debug!(keys, "expired tracked keys pruned");
                        }
                    }
                }
            }
        }
    })
}

pub fn build_app(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit_bytes;
    Router::new()
        // Health and info endpoints
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        // Operator actions
        .route("/cache/invalidate", post(handlers::invalidate))
        .route("/cache/warm", post(handlers::warm))
        .route(
            "/cache/benchmark",
            get(handlers::benchmark_dashboard).post(handlers::run_benchmark),
        )
        .route("/cache/failover", post(handlers::failover))
        .route("/cache/rebalance", post(handlers::rebalance))
        // Job lookups
        .route(
            "/cache/warming/{id}",
            get(handlers::warming_job).delete(handlers::cancel_warming_job),
        )
        .route("/cache/invalidation/{id}", get(handlers::invalidation_event))
        // Dashboard read models
        .route("/cache/{view}", get(handlers::dashboard))
        .with_state(state)
        // Middleware stack (order: request id -> metrics -> compression/cors/trace -> body limit)
        .layer(middleware::from_fn(app_middleware::request_id))
        .layer(middleware::from_fn(app_middleware::request_metrics))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    pub fn build(self) -> Result<LexicacheServer> {
        let (state, samples) = AppState::from_config(&self.config)?;
        Ok(LexicacheServer {
            addr: self.addr,
            state,
            samples,
        })
    }
}

pub struct LexicacheServer {
    addr: SocketAddr,
    state: AppState,
    samples: mpsc::Receiver<AccessSample>,
}

impl LexicacheServer {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let tasks = BackgroundTasks::spawn(&self.state, self.samples);
        let app = build_app(self.state.clone());

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        let shutdown = self.state.shutdown.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown))
            .await;

        tasks.shutdown().await;
        served?;
        Ok(())
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = cancel.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> AppState {
        let (state, _samples) = AppState::from_config(&AppConfig::default()).expect("state");
        state
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if body.is_some() {
            req = req.header("content-type", "application/json");
        }
        let req = req
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn readyz_reflects_failover_switch() {
        let state = state();
        let app = build_app(state.clone());

        let (status, body) = call(app.clone(), "GET", "/readyz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");

        state.coordinator.failover().force_for(Duration::from_secs(30));
        let (status, body) = call(app, "GET", "/readyz", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "failover");
    }

    #[tokio::test]
    async fn housekeeping_prunes_expired_tracked_keys() {
        let state = state();
        let topology = state.coordinator.remote().unwrap().store().topology().clone();
        for i in 0..100 {
            topology.record_key(&format!("session:{i}"), Duration::from_millis(1));
        }
        topology.record_key("session:live", Duration::from_secs(600));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let cancel = CancellationToken::new();
        let handle = spawn_housekeeping(state, cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(topology.tracked_key_count(), 1);
    }

    #[tokio::test]
    async fn request_id_is_echoed() {
        let app = build_app(state());
        let req = Request::builder()
            .uri("/healthz")
            .header("x-request-id", "abc-123")
            .body(Body::empty())
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.headers()["x-request-id"], "abc-123");
    }

    #[tokio::test]
    async fn malformed_bodies_get_structured_errors() {
        let app = build_app(state());
        let (status, body) = call(app.clone(), "POST", "/cache/warm", Some("{\"type\":\"everything\"}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_request");

        let (status, body) = call(app, "GET", "/cache/warming/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn oversized_failover_duration_is_rejected() {
        let state = state();
        let app = build_app(state.clone());
        let body = format!("{{\"strategy\":\"local_only\",\"duration\":{}}}", u64::MAX);
        let (status, body) = call(app.clone(), "POST", "/cache/failover", Some(&body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_request");
        assert!(!state.health.is_failover());

        let (status, body) = call(
            app,
            "POST",
            "/cache/failover",
            Some("{\"strategy\":\"local_only\",\"duration\":604800}"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["failoverActive"], true);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let app = build_app(state());
        let uri = format!("/cache/invalidation/{}", uuid::Uuid::new_v4());
        let (status, body) = call(app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }
}
