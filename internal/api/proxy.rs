use crate::api::AppState;
use crate::copy::coordinator::{Admission, PassThrough};
use crate::copy::registry::{await_copy, CopyState, WaitOutcome};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, LOCATION};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;

/// Per-request override for how long a waiter blocks on an in-flight copy.
/// Values above the configured bound are clamped, never honored.
pub const MAX_WAIT_HEADER: &str = "x-max-wait-duration";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/{*path}", get(proxy_handler))
        .with_state(state)
}

async fn root_handler(State(state): State<AppState>) -> Response {
    // No key to serve; hand the client to the source as-is.
    redirect(
        &state,
        "source",
        "no-key",
        state.coordinator.source().base_url(),
    )
}

async fn proxy_handler(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    let key = object_key(&state.config.prefix, &path);
    match state.coordinator.admit(&key, &path).await {
        Admission::PassThrough(pass) => pass_through_response(pass),
        Admission::SourceGone => redirect(
            &state,
            "source",
            "source-missing",
            &source_url(&state, &path),
        ),
        Admission::AlreadyCopied => redirect(
            &state,
            "destination",
            "cache-hit",
            &destination_url(&state, &key),
        ),
        Admission::Terminal(terminal) => terminal_redirect(&state, &path, &key, terminal),
        Admission::InFlight(entry) => {
            let bound = wait_bound(&headers, state.config.max_wait);
            let started = Instant::now();
            match await_copy(&entry, bound).await {
                WaitOutcome::Completed(CopyState::Succeeded) => {
                    state.metrics.observe_wait("ready", started.elapsed());
                    redirect(
                        &state,
                        "destination",
                        "copied",
                        &destination_url(&state, &key),
                    )
                }
                WaitOutcome::Completed(terminal) => {
                    state.metrics.observe_wait("miss", started.elapsed());
                    tracing::info!(
                        key = %key,
                        state = terminal.as_str(),
                        "waited but no copy was produced"
                    );
                    redirect(&state, "source", terminal.as_str(), &source_url(&state, &path))
                }
                WaitOutcome::TimedOut => {
                    state.metrics.observe_wait("timeout", started.elapsed());
                    tracing::info!(
                        key = %key,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "timed out waiting for in-flight copy"
                    );
                    redirect(&state, "source", "timeout", &source_url(&state, &path))
                }
            }
        }
    }
}

fn terminal_redirect(state: &AppState, path: &str, key: &str, terminal: CopyState) -> Response {
    match terminal {
        CopyState::Succeeded => redirect(
            state,
            "destination",
            "copied",
            &destination_url(state, key),
        ),
        other => redirect(state, "source", other.as_str(), &source_url(state, path)),
    }
}

fn pass_through_response(pass: PassThrough) -> Response {
    let PassThrough {
        size_bytes,
        content_type,
        etag,
        body,
    } = pass;
    let mut response = Response::new(Body::from_stream(ReceiverStream::new(body)));
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_LENGTH,
        size_bytes.to_string().parse().expect("content length header"),
    );
    if let Some(value) = content_type.and_then(|value| HeaderValue::from_str(&value).ok()) {
        headers.insert(CONTENT_TYPE, value);
    }
    if let Some(value) =
        etag.and_then(|value| HeaderValue::from_str(&format!("\"{value}\"")).ok())
    {
        headers.insert(ETAG, value);
    }
    response
}

fn redirect(state: &AppState, target: &str, reason: &str, location: &str) -> Response {
    state.metrics.record_redirect(target, reason);
    tracing::debug!(target = target, reason = reason, location = location, "redirecting");
    redirect_response(location)
}

fn redirect_response(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = StatusCode::FOUND.into_response();
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(_) => (StatusCode::BAD_REQUEST, "invalid redirect target").into_response(),
    }
}

/// Destination key: configured prefix joined with the request path, no
/// leading slash. The source is addressed by the raw path only.
fn object_key(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let path = path.trim_start_matches('/');
    if prefix.is_empty() {
        path.to_string()
    } else if path.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}/{path}")
    }
}

fn source_url(state: &AppState, path: &str) -> String {
    state.coordinator.source().object_url(path)
}

fn destination_url(state: &AppState, key: &str) -> String {
    state.coordinator.destination().object_url(key)
}

fn wait_bound(headers: &HeaderMap, default_wait: Duration) -> Duration {
    let Some(raw) = headers
        .get(MAX_WAIT_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return default_wait;
    };
    match humantime::parse_duration(raw.trim()) {
        Ok(requested) if requested <= default_wait => requested,
        Ok(requested) => {
            tracing::warn!(
                requested = ?requested,
                limit = ?default_wait,
                "requested wait exceeds the configured bound"
            );
            default_wait
        }
        Err(err) => {
            tracing::warn!(value = raw, error = %err, "could not parse wait header");
            default_wait
        }
    }
}
