// Key layout of the replicated KV.
//
// Primary records live under `<kind>:<id>`; the two unique secondary
// indexes (`tenant_domain`, `user_email`) map back to primary ids and are
// maintained in the same apply step as their primaries.

use crate::common::{NodeId, TenantId, UserId};

pub const TENANT_PREFIX: &str = "tenant:";
pub const TENANT_DOMAIN_PREFIX: &str = "tenant_domain:";
pub const USER_PREFIX: &str = "user:";
pub const USER_EMAIL_PREFIX: &str = "user_email:";
pub const NODE_PREFIX: &str = "node:";
pub const PLACEMENT_PREFIX: &str = "placement:";
pub const ACTIVITY_PREFIX: &str = "activity:";
pub const TOKEN_PREFIX: &str = "token:";

pub fn tenant(id: &TenantId) -> String {
    format!("{}{}", TENANT_PREFIX, id)
}

pub fn tenant_domain(domain: &str) -> String {
    format!("{}{}", TENANT_DOMAIN_PREFIX, domain)
}

pub fn user(id: &UserId) -> String {
    format!("{}{}", USER_PREFIX, id)
}

pub fn user_email(email: &str) -> String {
    format!("{}{}", USER_EMAIL_PREFIX, email)
}

pub fn node(id: &NodeId) -> String {
    format!("{}{}", NODE_PREFIX, id)
}

pub fn placement(tenant_id: &TenantId) -> String {
    format!("{}{}", PLACEMENT_PREFIX, tenant_id)
}

pub fn activity(tenant_id: &TenantId) -> String {
    format!("{}{}", ACTIVITY_PREFIX, tenant_id)
}

pub fn token(token: &str) -> String {
    format!("{}{}", TOKEN_PREFIX, token)
}
