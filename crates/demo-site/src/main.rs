use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Static origin for the precache proxy to sit in front of.
#[derive(Parser, Debug)]
#[command(name = "demo-site")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:3000")]
    addr: String,

    /// Upper bound of the simulated per-request latency, in milliseconds
    #[arg(long, default_value_t = 20)]
    max_latency_ms: u64,
}

struct SiteState {
    max_latency_ms: u64,
}

const REVIEWS: &[&str] = &["lovescape", "replika", "crushon", "janitorai"];

async fn simulate_latency(state: &SiteState) -> u64 {
    let delay = if state.max_latency_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(state.max_latency_ms.min(5)..=state.max_latency_ms)
    };
    tokio::time::sleep(Duration::from_millis(delay)).await;
    delay
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html><html><head><title>{title}</title>\
         <link rel=\"stylesheet\" href=\"/css/critical.css\">\
         <link rel=\"stylesheet\" href=\"/css/style.min.css\">\
         <link rel=\"stylesheet\" href=\"/css/aihub.v8.patch.css\">\
         </head><body>{body}\
         <script src=\"/js/app.min.js\"></script>\
         <script src=\"/js/aihub.v8.enhance.js\"></script>\
         </body></html>"
    )
}

async fn home(State(state): State<Arc<SiteState>>) -> Html<String> {
    simulate_latency(&state).await;
    let cards: String = REVIEWS
        .iter()
        .map(|slug| {
            format!("<a href=\"/reviews/{slug}\"><img src=\"/assets/{slug}.webp\" alt=\"{slug}\"></a>")
        })
        .collect();
    Html(page(
        "AI Hub",
        &format!("<img src=\"/assets/hero.webp\" alt=\"hero\"><main>{cards}</main>"),
    ))
}

async fn review(State(state): State<Arc<SiteState>>, Path(slug): Path<String>) -> Response {
    simulate_latency(&state).await;
    if !REVIEWS.contains(&slug.as_str()) {
        return (StatusCode::NOT_FOUND, Html(page("Not found", "<h1>Not found</h1>"))).into_response();
    }
    Html(page(
        &slug,
        &format!("<h1>{slug}</h1><img src=\"/assets/{slug}.webp\" alt=\"{slug}\">"),
    ))
    .into_response()
}

async fn stylesheet(State(state): State<Arc<SiteState>>, Path(name): Path<String>) -> Response {
    simulate_latency(&state).await;
    let css = match name.as_str() {
        "critical.css" => "body{margin:0;font-family:system-ui}",
        "style.min.css" => "main{display:grid;grid-template-columns:repeat(2,1fr)}",
        "aihub.v8.patch.css" => "img{max-width:100%}",
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    ([(header::CONTENT_TYPE, "text/css")], css).into_response()
}

async fn script(State(state): State<Arc<SiteState>>, Path(name): Path<String>) -> Response {
    simulate_latency(&state).await;
    let js = match name.as_str() {
        "app.min.js" => "document.documentElement.classList.add('js');",
        "aihub.v8.enhance.js" => "document.querySelectorAll('img').forEach(i=>i.loading='lazy');",
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    ([(header::CONTENT_TYPE, "application/javascript")], js).into_response()
}

async fn image(State(state): State<Arc<SiteState>>, Path(name): Path<String>) -> Response {
    simulate_latency(&state).await;
    let Some(stem) = name.strip_suffix(".webp") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if stem != "hero" && !REVIEWS.contains(&stem) {
        return StatusCode::NOT_FOUND.into_response();
    }
    ([(header::CONTENT_TYPE, "image/webp")], placeholder_webp(stem)).into_response()
}

/// A RIFF/WEBP container header followed by a name-dependent payload. Not a
/// decodable image, but the right size and shape for exercising the cache.
fn placeholder_webp(stem: &str) -> Vec<u8> {
    let payload: Vec<u8> = stem.bytes().cycle().take(4096).collect();
    let riff_len = (payload.len() + 4) as u32;
    let mut out = Vec::with_capacity(payload.len() + 12);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&riff_len.to_le_bytes());
    out.extend_from_slice(b"WEBP");
    out.extend_from_slice(&payload);
    out
}

async fn api_status(State(state): State<Arc<SiteState>>) -> Json<serde_json::Value> {
    let latency_ms = simulate_latency(&state).await;
    Json(json!({
        "reviews": REVIEWS.len(),
        "latency_ms": latency_ms,
    }))
}

async fn health() -> &'static str {
    "ok"
}

fn app(state: Arc<SiteState>) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/reviews/{slug}", get(review))
        .route("/css/{name}", get(stylesheet))
        .route("/js/{name}", get(script))
        .route("/assets/{name}", get(image))
        .route("/api/status", get(api_status))
        .route("/health", get(health))
        .with_state(state)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let state = Arc::new(SiteState {
        max_latency_ms: args.max_latency_ms,
    });

    tracing::info!(addr = %args.addr, max_latency_ms = args.max_latency_ms, "demo site starting");

    let listener = match tokio::net::TcpListener::bind(&args.addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, addr = %args.addr, "failed to bind");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app(state)).await {
        tracing::error!(error = %e, "demo site server error");
    }
}
