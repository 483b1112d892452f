use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderName, HeaderValue, header},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::{error::ApiError, server::AppState};

/// Bearer-token gate for the purge routes.
///
/// Passes everything through when `auth.enabled` is false.
pub async fn authorize_purge(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.auth.enabled {
        return Ok(next.run(req).await);
    }

    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::Unauthorized("missing Authorization header".into()))?;

    let token = header_value
        .to_str()
        .ok()
        .and_then(extract_bearer_token)
        .ok_or_else(|| {
            ApiError::Unauthorized("Authorization header must use the Bearer scheme".into())
        })?;

    if !state.auth.accepts(token) {
        tracing::warn!("purge request rejected: unknown token");
        return Err(ApiError::Forbidden("token is not allowed to purge cache tags".into()));
    }

    Ok(next.run(req).await)
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static("x-request-id");

    // If the incoming request already has a request-id, preserve it; otherwise generate one
    let req_id_value = match req.headers().get(&header_name) {
        Some(value) => value.clone(),
        None => HeaderValue::from_str(&Uuid::new_v4().to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("unknown")),
    };

    // Add to request extensions for downstream usage (e.g., logging)
    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(header_name, req_id_value);

    res
}
