use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use rand::Rng;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct Game {
    id: &'static str,
    title: &'static str,
    category: &'static str,
    description: &'static str,
}

const GAMES: &[Game] = &[
    Game {
        id: "slope",
        title: "Slope",
        category: "arcade",
        description: "Roll down an endless neon slope without falling off.",
    },
    Game {
        id: "neon-drift",
        title: "Neon Drift",
        category: "racing",
        description: "High-speed racing on rain-slicked streets.",
    },
    Game {
        id: "shadow-realm",
        title: "Shadow Realm",
        category: "rpg",
        description: "A dark fantasy RPG set in cursed forests.",
    },
];

/// Every catalog response carries a fresh revision so refreshed copies are
/// distinguishable from stale ones.
#[derive(Default)]
struct Origin {
    revision: AtomicU64,
}

impl Origin {
    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::Relaxed) + 1
    }
}

async fn latency() -> u64 {
    // Simulate upstream latency (5-20ms)
    let delay = rand::thread_rng().gen_range(5..=20);
    tokio::time::sleep(Duration::from_millis(delay)).await;
    delay
}

fn entry(game: &Game) -> Value {
    json!({
        "id": game.id,
        "title": game.title,
        "category": game.category,
        "thumbnail": format!("thumbs/{}.png", game.id),
        "meta": format!("games/{}/description.txt", game.id),
    })
}

async fn games_index(State(origin): State<Arc<Origin>>) -> Json<Value> {
    let delay = latency().await;
    let items: Vec<Value> = GAMES.iter().map(entry).collect();
    Json(json!({
        "revision": origin.next_revision(),
        "latency_ms": delay,
        "items": items,
    }))
}

async fn apps_index(State(origin): State<Arc<Origin>>) -> Json<Value> {
    let delay = latency().await;
    Json(json!({
        "revision": origin.next_revision(),
        "latency_ms": delay,
        "items": [{ "id": "notes", "title": "Notes", "thumbnail": "thumbs/notes.png" }],
    }))
}

async fn categories_index(State(origin): State<Arc<Origin>>) -> Json<Value> {
    let delay = latency().await;
    let mut categories: Vec<&str> = GAMES.iter().map(|g| g.category).collect();
    categories.sort_unstable();
    categories.dedup();
    Json(json!({
        "revision": origin.next_revision(),
        "latency_ms": delay,
        "items": categories,
    }))
}

async fn description(
    State(origin): State<Arc<Origin>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    latency().await;
    match GAMES.iter().find(|g| g.id == id) {
        Some(game) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            format!("{} (rev {})\n", game.description, origin.next_revision()),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Deterministic fake PNG: the signature plus the id, enough for clients to
/// sniff the type.
async fn thumbnail(Path(file): Path<String>) -> impl IntoResponse {
    latency().await;
    let Some(id) = file.strip_suffix(".png") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mut body = b"\x89PNG\r\n\x1a\n".to_vec();
    body.extend_from_slice(id.as_bytes());
    ([(header::CONTENT_TYPE, "image/png")], body).into_response()
}

async fn health() -> &'static str {
    "ok"
}

fn app() -> Router {
    Router::new()
        .route("/g/index.json", get(games_index))
        .route("/a/index.json", get(apps_index))
        .route("/c/index.json", get(categories_index))
        .route("/games/{id}/description.txt", get(description))
        .route("/thumbs/{file}", get(thumbnail))
        .route("/health", get(health))
        .with_state(Arc::new(Origin::default()))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::var("DEMO_ORIGIN_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    tracing::info!(addr = %addr, "demo origin starting");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {addr}: {e}"));
    if let Err(e) = axum::serve(listener, app()).await {
        tracing::error!(error = %e, "demo origin stopped");
    }
}
