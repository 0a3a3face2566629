//! HTTP basic authentication for hook and static routes.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use whd_core::HookError;

use crate::error::AppError;
use crate::state::AppState;

/// Reject requests without valid `Authorization: Basic` credentials when a
/// password file is loaded; pass everything through otherwise.
pub async fn require_basic_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(passwd) = state.passwd.clone() else {
        return Ok(next.run(request).await);
    };

    let (user, password) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_basic)
        .ok_or_else(|| HookError::Unauthorized("Missing or malformed credentials".into()))?;

    // Argon2 verification is CPU bound.
    let checked_user = user.clone();
    let valid = tokio::task::spawn_blocking(move || passwd.verify(&checked_user, &password))
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?;

    if !valid {
        tracing::warn!(user = %user, "Rejected credentials");
        return Err(HookError::Unauthorized("Invalid credentials".into()).into());
    }
    Ok(next.run(request).await)
}

/// Decode `Basic <base64(user:password)>`.
pub fn parse_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}
