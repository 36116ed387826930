// HS256 JWTs for sessions and SSO, shared by the control plane (session
// issue/verify) and the gateway (tenant claim extraction).

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::common::{now, UserId};
use crate::error::{PlatformError, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User id.
    pub sub: UserId,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    /// Expiry, seconds since epoch.
    pub exp: i64,
    pub iat: i64,
}

fn sign_input(claims_json: &[u8]) -> String {
    let header = B64URL.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = B64URL.encode(claims_json);
    format!("{}.{}", header, payload)
}

fn mac(secret: &str, input: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PlatformError::Auth(e.to_string()))?;
    mac.update(input.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Sign arbitrary claims.
pub fn sign(claims: &Value, secret: &str) -> Result<String> {
    let claims_json =
        serde_json::to_vec(claims).map_err(|e| PlatformError::Serialization(e.to_string()))?;
    let input = sign_input(&claims_json);
    let signature = B64URL.encode(mac(secret, &input)?);
    Ok(format!("{}.{}", input, signature))
}

/// Verify signature and expiry, returning the raw claims.
pub fn verify(token: &str, secret: &str) -> Result<Value> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(PlatformError::Auth("malformed token".into()));
    };

    let input = format!("{}.{}", header, payload);
    let provided = B64URL
        .decode(signature)
        .map_err(|_| PlatformError::Auth("malformed signature".into()))?;
    // Constant-time comparison via the Mac verifier.
    let mut verifier = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PlatformError::Auth(e.to_string()))?;
    verifier.update(input.as_bytes());
    verifier
        .verify_slice(&provided)
        .map_err(|_| PlatformError::Auth("signature mismatch".into()))?;

    let claims_json = B64URL
        .decode(payload)
        .map_err(|_| PlatformError::Auth("malformed payload".into()))?;
    let claims: Value = serde_json::from_slice(&claims_json)
        .map_err(|e| PlatformError::Auth(e.to_string()))?;

    if let Some(exp) = claims.get("exp").and_then(Value::as_i64) {
        if now().timestamp() >= exp {
            return Err(PlatformError::Auth("token expired".into()));
        }
    }
    Ok(claims)
}

/// Issue a session token for a verified user.
pub fn issue_session(
    user_id: &UserId,
    email: &str,
    secret: &str,
    ttl: chrono::Duration,
) -> Result<String> {
    let ts = now();
    let claims = SessionClaims {
        sub: user_id.clone(),
        email: email.to_string(),
        tenant: None,
        exp: (ts + ttl).timestamp(),
        iat: ts.timestamp(),
    };
    let value =
        serde_json::to_value(&claims).map_err(|e| PlatformError::Serialization(e.to_string()))?;
    sign(&value, secret)
}

pub fn verify_session(token: &str, secret: &str) -> Result<SessionClaims> {
    let claims = verify(token, secret)?;
    serde_json::from_value(claims).map_err(|e| PlatformError::Auth(e.to_string()))
}

/// The gateway's tenant claim, verified when a secret is configured.
pub fn tenant_claim(token: &str, secret: &str) -> Result<Option<String>> {
    let claims = verify(token, secret)?;
    Ok(claims
        .get("tenant")
        .and_then(Value::as_str)
        .map(str::to_string))
}
