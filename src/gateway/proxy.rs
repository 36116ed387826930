// The reverse proxy: extract tenant, enforce quotas, resolve the route,
// gate through the per-address circuit breaker, forward, and map failures
// onto the documented status codes.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use http::{HeaderMap, Method, StatusCode};
use tracing::{debug, warn};

use crate::error::{PlatformError, QuotaResource, Result};
use crate::gateway::breaker::BreakerRegistry;
use crate::gateway::extract::{extract_tenant, TenantRef};
use crate::gateway::routes::{RouteCache, RouteEntry};
use crate::networking::ControlPlaneClient;
use crate::quota::QuotaEnforcer;

/// Largest request body the proxy will buffer for forwarding.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GatewayState {
    pub client: Arc<ControlPlaneClient>,
    pub routes: Arc<RouteCache>,
    pub breakers: Arc<BreakerRegistry>,
    pub quota: Arc<QuotaEnforcer>,
    pub http: reqwest::Client,
    pub jwt_secret: String,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::timeout::TimeoutLayer::new(Duration::from_secs(60)))
        .with_state(state)
}

async fn proxy_handler(State(state): State<Arc<GatewayState>>, req: Request) -> Response {
    match forward(state, req).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

/// Resolve the route for an extracted tenant reference, consulting the
/// control plane on a cache miss. The worker address always comes from the
/// CP-stored node record or placement decision, never from a local
/// fallback.
async fn resolve_route(state: &GatewayState, tenant_ref: &TenantRef) -> Result<RouteEntry> {
    if let Some(entry) = state.routes.get(tenant_ref.key()) {
        return Ok(entry);
    }

    let tenant = match tenant_ref {
        TenantRef::Domain(domain) => state.client.get_tenant_by_domain(domain).await?,
        TenantRef::Id(id) => state.client.get_tenant(id).await?,
    };

    let address = match &tenant.assigned_node_id {
        Some(node_id) => {
            let node = state.client.get_node(node_id).await?;
            node.address
        }
        None => {
            // Unassigned tenant: ask the control plane to place it now.
            let decision = state.client.assign_tenant(&tenant.id).await?;
            decision.node_address
        }
    };
    if address.is_empty() {
        return Err(PlatformError::NotFound(format!(
            "no address for tenant {}",
            tenant.id
        )));
    }

    state
        .routes
        .insert(tenant_ref.key(), tenant.id.clone(), address.clone());
    Ok(RouteEntry {
        tenant_id: tenant.id,
        node_address: address,
        cached_at: std::time::Instant::now(),
    })
}

fn upload_megabytes(method: &Method, headers: &HeaderMap) -> Option<u64> {
    if !matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
        return None;
    }
    let len: u64 = headers
        .get(http::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()?;
    Some(len.div_ceil(1024 * 1024))
}

async fn forward(state: Arc<GatewayState>, req: Request) -> Result<Response> {
    let tenant_ref = extract_tenant(req.headers(), &state.jwt_secret)?;

    let route = resolve_route(&state, &tenant_ref).await?;

    let upload = upload_megabytes(req.method(), req.headers());
    state
        .quota
        .check_admission(&route.tenant_id, upload)
        .await?;

    let breaker = state.breakers.get(&route.node_address);
    breaker.try_acquire()?;

    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| PlatformError::InvalidInput(format!("unreadable body: {}", e)))?;

    let url = format!(
        "{}{}",
        route.node_address.trim_end_matches('/'),
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    );

    let mut headers = parts.headers.clone();
    headers.remove(http::header::HOST);
    headers.remove(http::header::CONTENT_LENGTH);
    headers.insert(
        "x-tenant-id",
        route
            .tenant_id
            .parse()
            .map_err(|_| PlatformError::Internal("bad tenant id header".into()))?,
    );

    debug!(tenant = %route.tenant_id, url = %url, "forwarding");
    let outcome = state
        .http
        .request(parts.method.clone(), &url)
        .headers(headers)
        .body(bytes.to_vec())
        .timeout(FORWARD_TIMEOUT)
        .send()
        .await;

    let upstream = match outcome {
        Ok(response) => response,
        Err(e) => {
            // Invalidate the route before surfacing the failure.
            breaker.record_failure();
            state.routes.invalidate_tenant(&route.tenant_id);
            warn!(tenant = %route.tenant_id, error = %e, "forward failed");
            return Err(PlatformError::Network(format!("upstream: {}", e)));
        }
    };

    let status = upstream.status();
    if status.is_server_error() {
        breaker.record_failure();
        state.routes.invalidate_tenant(&route.tenant_id);
    } else {
        breaker.record_success();
    }

    let mut builder = http::Response::builder().status(status);
    for (name, value) in upstream.headers() {
        builder = builder.header(name, value);
    }
    let body = upstream
        .bytes()
        .await
        .map_err(|e| PlatformError::Network(format!("upstream body: {}", e)))?;
    builder
        .body(Body::from(body))
        .map_err(|e| PlatformError::Internal(e.to_string()))
}

/// Map platform errors onto the documented HTTP statuses.
pub fn error_response(err: &PlatformError) -> Response {
    let (status, retry_after) = match err {
        PlatformError::InvalidInput(_) => (StatusCode::BAD_REQUEST, false),
        PlatformError::NotFound(_) => (StatusCode::NOT_FOUND, false),
        PlatformError::Quota { resource, .. } => match resource {
            QuotaResource::Storage => (StatusCode::INSUFFICIENT_STORAGE, true),
            _ => (StatusCode::TOO_MANY_REQUESTS, true),
        },
        PlatformError::CircuitOpen(_) | PlatformError::Unavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, false)
        }
        PlatformError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, false),
        PlatformError::Network(_) | PlatformError::NotLeader { .. } => {
            (StatusCode::BAD_GATEWAY, false)
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, false),
    };

    let body = serde_json::json!({ "error": err.to_string() }).to_string();
    let mut builder = http::Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json");
    if retry_after {
        builder = builder.header(http::header::RETRY_AFTER, "3600");
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_errors_map_to_documented_statuses() {
        let rate = PlatformError::Quota {
            resource: QuotaResource::RateLimit,
            current: 0,
            limit: 100,
        };
        let response = error_response(&rate);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[http::header::RETRY_AFTER], "3600");

        let storage = PlatformError::Quota {
            resource: QuotaResource::Storage,
            current: 120,
            limit: 100,
        };
        assert_eq!(
            error_response(&storage).status(),
            StatusCode::INSUFFICIENT_STORAGE
        );
    }

    #[test]
    fn test_circuit_open_maps_to_503() {
        let err = PlatformError::CircuitOpen("http://n1".into());
        assert_eq!(
            error_response(&err).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_upload_size_rounding() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_LENGTH, "1048577".parse().unwrap());
        assert_eq!(upload_megabytes(&Method::POST, &headers), Some(2));
        assert_eq!(upload_megabytes(&Method::GET, &headers), None);
    }
}
