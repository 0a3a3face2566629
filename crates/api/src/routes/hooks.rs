//! The hook endpoint: any method on any path not claimed by another route.
//!
//! The request path names the hook, the body is its payload, and headers
//! and query parameters become its arguments. The response streams the
//! hook output as it is produced and ends with the terminal status line.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, PROXY_AUTHORIZATION};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use whd_core::HookInvocation;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Response header carrying the execution id.
pub const HOOK_ID_HEADER: HeaderName = HeaderName::from_static("x-hook-id");

/// Request header overriding the hook timeout (seconds).
pub const HOOK_TIMEOUT_HEADER: HeaderName = HeaderName::from_static("x-hook-timeout");

/// Query parameter overriding the hook timeout (seconds).
const TIMEOUT_PARAM: &str = "timeout";

/// Headers never exported to scripts.
const SENSITIVE_HEADERS: [HeaderName; 3] = [AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION];

/// Run the hook named by the request path and stream its output.
pub async fn run_hook(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let name = uri.path().trim_matches('/').to_string();
    let params: Vec<(String, String)> = match uri.query() {
        Some(_) => Query::try_from_uri(&uri)
            .map(|Query(params)| params)
            .map_err(|e| AppError::BadRequest(e.body_text()))?,
        None => Vec::new(),
    };

    let timeout = requested_timeout(&headers, &params)?;
    let mut invocation = HookInvocation::new(name);
    invocation.payload = body.to_vec();
    invocation.args = hook_args(&headers, params);
    invocation.timeout = timeout;

    let mut handle = state.hooks.submit(invocation).await?;
    tracing::info!(
        hook = %handle.name(),
        hook_id = handle.id(),
        %method,
        "Hook accepted",
    );

    let events = handle
        .take_events()
        .ok_or_else(|| AppError::InternalError("hook log subscription already taken".into()))?;
    let stream = events.map(|event| Ok::<_, Infallible>(Bytes::from(format!("{event}\n"))));

    let hook_id = HeaderValue::from(handle.id());
    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8")),
            (HOOK_ID_HEADER, hook_id),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// Arguments from headers (minus credentials) followed by query parameters.
fn hook_args(headers: &HeaderMap, params: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut args: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| !SENSITIVE_HEADERS.contains(name))
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?;
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect();
    args.extend(params);
    args
}

fn requested_timeout(
    headers: &HeaderMap,
    params: &[(String, String)],
) -> AppResult<Option<Duration>> {
    let raw = headers
        .get(HOOK_TIMEOUT_HEADER)
        .map(|v| v.to_str().unwrap_or_default().to_string())
        .or_else(|| {
            params
                .iter()
                .rev()
                .find(|(k, _)| k == TIMEOUT_PARAM)
                .map(|(_, v)| v.clone())
        });

    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs))),
        _ => Err(AppError::BadRequest(format!(
            "invalid hook timeout {raw:?}: expected a positive number of seconds"
        ))),
    }
}
