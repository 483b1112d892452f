use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::Serialize;
use serde_json::Value;

use crate::{error::ApiError, metrics, server::AppState};

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Ready once at least one cache backend is registered.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.scheduler.registry().is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse { status: "no cache backends" }),
        );
    }
    (StatusCode::OK, Json(HealthResponse { status: "ready" }))
}

pub async fn prometheus_metrics() -> impl IntoResponse {
    match metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "metrics not initialized".to_string(),
        ),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeAccepted {
    pub status: &'static str,
    pub tags: Vec<String>,
    pub delay_ms: u64,
}

/// `POST /cache/purge-tags`
///
/// Accepts `{"tags": "t"}` or `{"tags": ["t1", "t2"]}` and queues the tags for
/// the next sweep. The response only acknowledges the request; eviction
/// happens when the debounce window closes.
pub async fn purge_tags(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let tags = payload
        .map_err(|e| ApiError::bad_request(format!("invalid JSON body: {}", e.body_text())))
        .and_then(|Json(body)| parse_tags(&body));

    let tags = match tags {
        Ok(tags) => tags,
        Err(e) => {
            metrics::record_purge_request("rejected", 0);
            return Err(e);
        }
    };

    let outcome = state.scheduler.add(tags.iter().cloned());
    metrics::record_purge_request("accepted", outcome.accepted);
    metrics::set_pending_tags(state.scheduler.pending_len());

    tracing::info!(
        tags = outcome.accepted,
        new_tags = outcome.added,
        window = ?outcome.window,
        armed = outcome.armed,
        "cache tag purge accepted"
    );

    if let Some(publisher) = state.publisher.clone() {
        let tags = tags.clone();
        tokio::spawn(async move {
            if let Err(e) = publisher.publish(&tags).await {
                tracing::warn!(error = %e, "failed to fan out tag purge to peers");
            }
        });
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(PurgeAccepted {
            status: "accepted",
            tags,
            delay_ms: state.scheduler.config().delay.as_millis() as u64,
        }),
    ))
}

/// Extract the tag list from a purge body.
///
/// Tags are trimmed and blanks dropped; an empty result is rejected so a
/// no-op request never opens a window.
pub fn parse_tags(body: &Value) -> Result<Vec<String>, ApiError> {
    let Some(obj) = body.as_object() else {
        return Err(ApiError::bad_request("request body must be a JSON object"));
    };

    let raw: Vec<&str> = match obj.get("tags") {
        None | Some(Value::Null) => {
            return Err(ApiError::bad_request("missing required field 'tags'"));
        }
        Some(Value::String(tag)) => vec![tag.as_str()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .ok_or_else(|| ApiError::bad_request("'tags' must contain only strings"))
            })
            .collect::<Result<_, _>>()?,
        Some(_) => {
            return Err(ApiError::bad_request(
                "'tags' must be a string or an array of strings",
            ));
        }
    };

    let tags: Vec<String> = raw
        .into_iter()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    if tags.is_empty() {
        return Err(ApiError::bad_request("'tags' must name at least one tag"));
    }
    Ok(tags)
}

/// `GET /cache/invalidation`
pub async fn invalidation_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.scheduler.status()))
}
