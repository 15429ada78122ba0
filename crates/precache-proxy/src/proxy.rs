use crate::admin::{record_failure, record_served};
use crate::network::{is_hop_by_hop, UpstreamNetwork};
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use precache_core::{
    route, Destination, FetchOutcome, FetchRequest, Registration, ResponseSnapshot, Source,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub registration: Arc<Registration>,
    pub network: Arc<UpstreamNetwork>,
}

/// Every request on the main port is a fetch event for the worker.
pub async fn intercept_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let start = Instant::now();
    let url = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let destination = destination_for(req.headers(), req.uri().path());
    let fetch = FetchRequest::new(req.method().clone(), url, destination);
    let route = route(&fetch);
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(peer)| peer.ip().to_string());

    let outcome = state
        .registration
        .dispatch_fetch(&fetch, client.as_deref())
        .await;

    match outcome {
        Ok(FetchOutcome::Served(served)) => {
            record_served(route, served.source);
            tracing::debug!(
                method = %fetch.method,
                url = %fetch.url,
                destination = destination.as_str(),
                route = route.as_str(),
                source = served.source.as_str(),
                status = served.response.status,
                latency_us = start.elapsed().as_micros(),
                "fetch served"
            );
            build_response(served.response, served.source, Some(&served.generation))
        }
        Ok(FetchOutcome::Passthrough) => {
            let response = forward(&state, req).await;
            tracing::debug!(
                method = %fetch.method,
                url = %fetch.url,
                status = response.status().as_u16(),
                latency_us = start.elapsed().as_micros(),
                "fetch passed through"
            );
            response
        }
        Err(e) => {
            record_failure(route);
            tracing::warn!(url = %fetch.url, route = route.as_str(), error = %e, "fetch failed");
            bad_gateway()
        }
    }
}

/// Work out what a request is loading. Browsers say so in `Sec-Fetch-Dest`;
/// otherwise guess from the path extension and the `Accept` header.
pub fn destination_for(headers: &HeaderMap, path: &str) -> Destination {
    if let Some(dest) = headers.get("sec-fetch-dest").and_then(|v| v.to_str().ok()) {
        return Destination::from_fetch_dest(dest);
    }

    let last_segment = path.rsplit('/').next().unwrap_or("");
    let extension = last_segment
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("js" | "mjs") => Destination::Script,
        Some("css") => Destination::Style,
        Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "avif" | "svg" | "ico") => {
            Destination::Image
        }
        Some("html" | "htm") => Destination::Document,
        None if accepts_html(headers) => Destination::Document,
        _ => Destination::Other,
    }
}

fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"))
}

/// Send a request to the upstream untouched, streaming the response back.
async fn forward(state: &AppState, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let upstream_uri = state.network.upstream_uri(
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/"),
    );

    let mut builder = Request::builder().method(&parts.method).uri(&upstream_uri);
    for (key, value) in parts.headers.iter() {
        if key == header::HOST || is_hop_by_hop(key.as_str()) {
            continue;
        }
        builder = builder.header(key, value);
    }

    let upstream_req = match builder.body(body) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "failed to build upstream request");
            return bad_gateway();
        }
    };

    let upstream_resp = match state.network.client().request(upstream_req).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(error = %e, upstream = %upstream_uri, "upstream request failed");
            return bad_gateway();
        }
    };

    let (mut parts, incoming) = upstream_resp.into_parts();
    let hop_by_hop: Vec<_> = parts
        .headers
        .keys()
        .filter(|k| is_hop_by_hop(k.as_str()))
        .cloned()
        .collect();
    for k in hop_by_hop {
        parts.headers.remove(&k);
    }
    parts
        .headers
        .insert("x-cache", HeaderValue::from_static("BYPASS"));
    Response::from_parts(parts, Body::new(incoming))
}

/// Build an HTTP response from a served snapshot.
fn build_response(
    snapshot: ResponseSnapshot,
    source: Source,
    generation: Option<&str>,
) -> Response<Body> {
    let mut response = Response::builder().status(snapshot.status);

    for (key, value) in &snapshot.headers {
        if is_hop_by_hop(key) {
            continue;
        }
        if let Ok(v) = HeaderValue::from_str(value) {
            response = response.header(key.as_str(), v);
        }
    }

    let x_cache = match source {
        Source::Cache => "HIT",
        Source::Network => "MISS",
        Source::Fallback => "FALLBACK",
    };
    response = response.header("X-Cache", x_cache);
    if let Some(generation) = generation {
        response = response.header("X-Cache-Generation", generation);
    }

    response
        .body(Body::from(snapshot.body))
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to build response from snapshot");
            bad_gateway()
        })
}

fn bad_gateway() -> Response<Body> {
    (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
}
