use crate::fetch::is_hop_by_hop;
use crate::gateway::{Gateway, Interception, Served, Source};
use crate::lifecycle::Lifecycle;
use crate::request::{InterceptedRequest, PassReason};
use arcade_cache::CachedResponse;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub gateway: Gateway,
    pub lifecycle: Lifecycle,
    pub upstream_url: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{*path}", any(proxy_handler))
        .route("/", any(proxy_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Main proxy handler. Resolves the target URL, lets the gateway pick a cache
/// policy, and forwards anything the gateway declines straight upstream.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let start = Instant::now();
    let (parts, body) = req.into_parts();

    let target = match resolve_target(&state.upstream_url, &parts.uri) {
        Some(uri) => uri,
        None => {
            tracing::warn!(uri = %parts.uri, "cannot resolve request target");
            return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        }
    };

    let request = InterceptedRequest::from_parts(parts.method, target, parts.headers);

    match state.gateway.handle(&request).await {
        Ok(Interception::Served(served)) => {
            tracing::debug!(
                uri = %request.uri,
                status = served.response.status,
                policy = served.policy.label(),
                source = ?served.source,
                latency_us = start.elapsed().as_micros(),
                "served"
            );
            build_served_response(&served)
        }
        Ok(Interception::PassThrough(reason)) => pass_through(&state, &request, body, reason).await,
        Err(e) => {
            tracing::error!(error = %e, uri = %request.uri, "upstream request failed");
            bad_gateway()
        }
    }
}

/// Absolute-form targets (forward proxy) are used as-is; origin-form ones are
/// resolved against the upstream.
fn resolve_target(upstream_url: &str, uri: &Uri) -> Option<Uri> {
    if uri.scheme().is_some() {
        return Some(uri.clone());
    }
    let upstream_uri = format!(
        "{}{}",
        upstream_url.trim_end_matches('/'),
        uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    );
    upstream_uri.parse().ok()
}

async fn pass_through(
    state: &AppState,
    request: &InterceptedRequest,
    body: Body,
    reason: PassReason,
) -> Response<Body> {
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::error!(error = %e, "failed to read request body");
            return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        }
    };

    match state.gateway.fetcher().send(request, body_bytes).await {
        Ok(response) => {
            tracing::debug!(
                method = %request.method,
                uri = %request.uri,
                ?reason,
                status = response.status,
                "passed through"
            );
            build_response(&response, "BYPASS", None)
        }
        Err(e) => {
            tracing::error!(error = %e, method = %request.method, "pass-through request failed");
            bad_gateway()
        }
    }
}

fn build_served_response(served: &Served) -> Response<Body> {
    let cache = match served.source {
        Source::Cache => "HIT",
        Source::Network => "MISS",
    };
    build_response(&served.response, cache, Some(served))
}

/// Build an HTTP response from a captured one, tagging cache status headers.
fn build_response(response: &CachedResponse, cache: &'static str, served: Option<&Served>) -> Response<Body> {
    let mut builder = Response::builder().status(response.status);

    for (key, value) in &response.headers {
        if is_hop_by_hop(key) {
            continue;
        }
        if let (Ok(k), Ok(v)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(k, v);
        }
    }

    builder = builder.header("X-Cache", cache);
    if let Some(served) = served {
        builder = builder.header("X-Cache-Policy", served.policy.label());
        if let Ok(partition) = HeaderValue::from_str(&served.partition) {
            builder = builder.header("X-Cache-Partition", partition);
        }
    }

    builder
        .body(Body::from(response.body.clone()))
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, status = response.status, "failed to build response");
            bad_gateway()
        })
}

fn bad_gateway() -> Response<Body> {
    (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
}
