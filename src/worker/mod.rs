// Worker node assembly: registration and heartbeats, the tenant request
// endpoint, the metrics collector feeding the resource manager, the
// archiver, and the degraded mode that keeps cached tenants alive when
// every control-plane address is unreachable.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use http::StatusCode;
use tracing::{info, warn};

use crate::common::tasks::TaskGroup;
use crate::common::TenantId;
use crate::config::PlatformConfig;
use crate::error::{PlatformError, Result};
use crate::gateway::error_response;
use crate::monitoring::MetricsRegistry;
use crate::multitenancy::{
    Archiver, ArchiverConfig, CacheConfig, FileEngineFactory, NullReplicator,
    ObjectStoreReplicator, Replicator, TenantCache,
};
use crate::networking::ControlPlaneClient;
use crate::objectstore::ObjectStore;
use crate::registry::types::{NodeInfo, ResourceSnapshot};
use crate::resources::{ResourceManager, ResourceSample};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const COLLECTOR_INTERVAL: Duration = Duration::from_secs(30);
const WINDOW_ROTATE_INTERVAL: Duration = Duration::from_secs(60);
const ARCHIVER_INTERVAL: Duration = Duration::from_secs(3600);

/// Consecutive heartbeat failures before the worker goes degraded.
const DEGRADED_AFTER_FAILURES: u32 = 3;

pub struct WorkerNode {
    node_id: String,
    cache: Arc<TenantCache>,
    resources: Arc<ResourceManager>,
    metrics: Arc<MetricsRegistry>,
    degraded: Arc<AtomicBool>,
    tasks: TaskGroup,
}

struct WorkerState {
    cache: Arc<TenantCache>,
    resources: Arc<ResourceManager>,
    client: Arc<ControlPlaneClient>,
    metrics: Arc<MetricsRegistry>,
    degraded: Arc<AtomicBool>,
}

impl WorkerNode {
    pub async fn start(
        config: &PlatformConfig,
        object_store: Arc<dyn ObjectStore>,
    ) -> Result<WorkerNode> {
        std::fs::create_dir_all(&config.data_dir)?;

        let client = Arc::new(ControlPlaneClient::new(config.control_plane_addrs.clone()));
        let resources = Arc::new(ResourceManager::new());
        let replicator: Arc<dyn Replicator> = if config.litestream.enabled {
            Arc::new(ObjectStoreReplicator::new(
                object_store.clone(),
                Duration::from_secs(config.litestream.sync_interval_secs.max(1)),
            ))
        } else {
            Arc::new(NullReplicator)
        };
        let cache = Arc::new(TenantCache::new(
            CacheConfig::new(config.max_tenants, &config.data_dir),
            Arc::new(FileEngineFactory),
            replicator,
            resources.clone(),
            Some(client.clone()),
        ));

        // Registration is part of bootstrap; failure is fatal.
        client
            .register_node(NodeInfo::new(
                config.node_id.clone(),
                config.node_address.clone(),
                config.max_tenants,
            ))
            .await?;
        info!(node = %config.node_id, "registered with control plane");

        let metrics = Arc::new(MetricsRegistry::new());
        let degraded = Arc::new(AtomicBool::new(false));
        let archiver = Arc::new(Archiver::new(
            ArchiverConfig::default(),
            cache.clone(),
            object_store,
            Some(client.clone()),
        ));

        let mut tasks = TaskGroup::new();

        // Tenant request endpoint plus /healthz and /metrics.
        let state = Arc::new(WorkerState {
            cache: cache.clone(),
            resources: resources.clone(),
            client: client.clone(),
            metrics: metrics.clone(),
            degraded: degraded.clone(),
        });
        let listener = tokio::net::TcpListener::bind(config.worker_bind_addr()).await?;
        info!(addr = %config.worker_bind_addr(), "worker listening");
        let app = Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(render_metrics))
            .fallback(tenant_request)
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(state);
        tasks.spawn("worker-http", move |mut shutdown| async move {
            let serve = axum::serve(listener, app);
            tokio::select! {
                _ = shutdown.cancelled() => {}
                outcome = serve => {
                    if let Err(e) = outcome {
                        tracing::error!(error = %e, "worker listener failed");
                    }
                }
            }
        });

        // Heartbeat with degraded-mode tracking.
        {
            let client = client.clone();
            let cache = cache.clone();
            let degraded = degraded.clone();
            let node_id = config.node_id.clone();
            let capacity = config.max_tenants;
            let failures = Arc::new(AtomicU32::new(0));
            tasks.spawn_periodic("heartbeat", HEARTBEAT_INTERVAL, move || {
                let client = client.clone();
                let cache = cache.clone();
                let degraded = degraded.clone();
                let failures = failures.clone();
                let node_id = node_id.clone();
                async move {
                    let used = cache.used_weight();
                    let snapshot = ResourceSnapshot {
                        cpu_frac: 0.0,
                        mem_frac: used as f64 / capacity.max(1) as f64,
                        disk_used_mb: 0,
                    };
                    match client.heartbeat(&node_id, used, snapshot).await {
                        Ok(()) => {
                            failures.store(0, Ordering::Release);
                            if degraded.swap(false, Ordering::AcqRel) {
                                info!("control plane reachable again, leaving degraded mode");
                            }
                        }
                        Err(e) => {
                            let n = failures.fetch_add(1, Ordering::AcqRel) + 1;
                            warn!(error = %e, consecutive = n, "heartbeat failed");
                            if n >= DEGRADED_AFTER_FAILURES {
                                degraded.store(true, Ordering::Release);
                            }
                        }
                    }
                }
            });
        }

        // Metrics collector: sample engines, reclassify, honor eviction
        // recommendations between requests.
        {
            let cache = cache.clone();
            let resources = resources.clone();
            let metrics = metrics.clone();
            tasks.spawn_periodic("metrics-collector", COLLECTOR_INTERVAL, move || {
                let cache = cache.clone();
                let resources = resources.clone();
                let metrics = metrics.clone();
                async move { collect_once(&cache, &resources, &metrics).await }
            });
        }

        // Request-window rotator.
        {
            let resources = resources.clone();
            tasks.spawn_periodic("window-rotator", WINDOW_ROTATE_INTERVAL, move || {
                let resources = resources.clone();
                async move { resources.rotate_windows() }
            });
        }

        // Hourly archiver.
        {
            let archiver = archiver.clone();
            tasks.spawn_periodic("archiver", ARCHIVER_INTERVAL, move || {
                let archiver = archiver.clone();
                async move { archiver.run_once().await }
            });
        }

        Ok(WorkerNode {
            node_id: config.node_id.clone(),
            cache,
            resources,
            metrics,
            degraded,
            tasks,
        })
    }

    pub fn cache(&self) -> &Arc<TenantCache> {
        &self.cache
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub async fn stop(&mut self) {
        self.tasks.shutdown().await;
        self.cache.stop_all().await;
        info!(node = %self.node_id, "worker stopped");
    }
}

async fn collect_once(
    cache: &Arc<TenantCache>,
    resources: &Arc<ResourceManager>,
    metrics: &Arc<MetricsRegistry>,
) {
    let ids = cache.cached_ids().await;
    metrics
        .gauge("cached_tenants", "Tenant instances in memory")
        .set(ids.len() as f64);
    metrics
        .gauge("cache_used_weight", "Weighted cache occupancy")
        .set(cache.used_weight() as f64);

    for id in ids {
        let Some(instance) = cache.get(&id).await else {
            continue;
        };
        let db_mb = instance
            .engine()
            .map(|e| e.database_size_mb())
            .unwrap_or(0.0);
        resources.observe(
            &id,
            ResourceSample {
                database_mb: db_mb,
                ..Default::default()
            },
        );
        resources.evaluate(&id);

        if resources.should_evict(&id) {
            warn!(tenant = %id, "noisy neighbor, evicting between requests");
            if let Err(e) = cache.evict(&id).await {
                warn!(tenant = %id, error = %e, "recommended eviction failed");
            }
        }
    }
}

async fn healthz(State(state): State<Arc<WorkerState>>) -> Response {
    let status = if state.degraded.load(Ordering::Acquire) {
        "degraded"
    } else {
        "ok"
    };
    http::Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(format!("{{\"status\":\"{}\"}}", status)))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

async fn render_metrics(State(state): State<Arc<WorkerState>>) -> String {
    state.metrics.render()
}

/// Serve one tenant request: resolve the instance (loading on demand
/// unless degraded), admit it, and run the body as a statement.
async fn tenant_request(State(state): State<Arc<WorkerState>>, req: Request) -> Response {
    match serve_tenant(state, req).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

async fn serve_tenant(state: Arc<WorkerState>, req: Request) -> Result<Response> {
    let tenant_id: TenantId = req
        .headers()
        .get("x-tenant-id")
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| PlatformError::InvalidInput("missing X-Tenant-ID".into()))?;

    let instance = match state.cache.get(&tenant_id).await {
        Some(instance) => instance,
        None => {
            if state.degraded.load(Ordering::Acquire) {
                // Degraded workers serve what they have and nothing more.
                return Err(PlatformError::Unavailable(
                    "control plane unreachable, not loading new tenants".into(),
                ));
            }
            let tenant = state.client.get_tenant(&tenant_id).await?;
            state.cache.load(&tenant).await?
        }
    };

    let _guard = instance.begin_request()?;
    let started = std::time::Instant::now();

    let bytes = axum::body::to_bytes(req.into_body(), 16 * 1024 * 1024)
        .await
        .map_err(|e| PlatformError::InvalidInput(format!("unreadable body: {}", e)))?;
    let statement = String::from_utf8_lossy(&bytes);

    let engine = instance
        .engine()
        .ok_or_else(|| PlatformError::Unavailable("engine not open".into()))?;
    let outcome = if statement.is_empty() {
        Ok("ok".to_string())
    } else {
        engine.execute(&statement).await
    };

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    state
        .resources
        .record_request(&tenant_id, elapsed_ms, outcome.is_err());
    state
        .metrics
        .counter("tenant_requests_total", "Requests served")
        .inc();

    let result = outcome?;
    http::Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "result": result }).to_string(),
        ))
        .map_err(|e| PlatformError::Internal(e.to_string()))
}
