// Tenant identity extraction, tried in order: subdomain from Host,
// X-Tenant-ID header, JWT tenant claim.

use http::HeaderMap;

use crate::auth;
use crate::error::{PlatformError, Result};

/// How the request named its tenant; drives which lookup the router uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantRef {
    /// Full domain from the Host header.
    Domain(String),
    /// Explicit tenant id from a header or token claim.
    Id(String),
}

impl TenantRef {
    /// Cache key for the route cache.
    pub fn key(&self) -> &str {
        match self {
            TenantRef::Domain(d) => d,
            TenantRef::Id(id) => id,
        }
    }
}

/// A host names a tenant only when it has a subdomain label, i.e. at
/// least three DNS labels.
fn domain_from_host(host: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    if host.is_empty() || host.parse::<std::net::IpAddr>().is_ok() {
        return None;
    }
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() >= 3 {
        Some(host.to_ascii_lowercase())
    } else {
        None
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

pub fn extract_tenant(headers: &HeaderMap, jwt_secret: &str) -> Result<TenantRef> {
    if let Some(host) = headers.get(http::header::HOST).and_then(|h| h.to_str().ok()) {
        if let Some(domain) = domain_from_host(host) {
            return Ok(TenantRef::Domain(domain));
        }
    }

    if let Some(id) = headers.get("x-tenant-id").and_then(|h| h.to_str().ok()) {
        if !id.is_empty() {
            return Ok(TenantRef::Id(id.to_string()));
        }
    }

    if let Some(token) = bearer_token(headers) {
        if !jwt_secret.is_empty() {
            if let Ok(Some(tenant)) = auth::tenant_claim(token, jwt_secret) {
                return Ok(TenantRef::Id(tenant));
            }
        }
    }

    Err(PlatformError::InvalidInput(
        "no tenant identity in request".into(),
    ))
}
