//! Caller identity from bearer tokens.
//!
//! Tokens are issued and verified by the identity provider in front of this
//! service; here we only read the subject claim to attribute recorded runs.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use tracing::debug;

#[derive(Deserialize)]
struct Claims {
    sub: Option<String>,
}

/// Extract the user id (`sub` claim) from an `Authorization` header value.
///
/// Returns `None` for a missing or non-bearer header, or a token that does
/// not decode; callers treat that as anonymous.
pub fn resolve_user_id(authorization: Option<&str>) -> Option<String> {
    let token = authorization?.strip_prefix("Bearer ")?.trim();
    let payload = token.split('.').nth(1)?;

    let decoded = match URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "Bearer token payload is not base64url");
            return None;
        }
    };

    match serde_json::from_slice::<Claims>(&decoded) {
        Ok(claims) => claims.sub.filter(|s| !s.is_empty()),
        Err(e) => {
            debug!(error = %e, "Bearer token payload is not JSON claims");
            None
        }
    }
}
