pub mod access_log;
pub mod backends;
pub mod config;
pub mod error;
pub mod proxy;
pub mod shutdown;
pub mod state;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    middleware,
    routing::{get, post},
};
use serde::Serialize;

pub use backends::Backends;
pub use error::ProxyError;
pub use state::AppState;

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    lookup: &'static str,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        lookup: state.backends.mode().as_str(),
    })
}

/// The public surface: the bootstrap endpoint plus the backend routes that
/// are relayed to the session's worker.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/start_session/:session", get(proxy::start_session))
        .route("/", get(proxy::relay))
        .route("/index.html", get(proxy::relay))
        .route("/bundle.js", get(proxy::relay))
        .route("/favicon.ico", get(proxy::relay))
        .route("/fonts/:file", get(proxy::relay))
        .route("/version", get(proxy::relay))
        .route("/get_questions", get(proxy::relay))
        .route("/project", get(proxy::relay))
        .route("/project/:id", get(proxy::relay))
        .route("/get_session_questions", post(proxy::relay))
        .route("/set_session_aliases", post(proxy::relay))
        .route("/end_session", post(proxy::relay))
        .route("/validate_answer", post(proxy::relay))
        .route("/give_answers", post(proxy::relay))
        .layer(DefaultBodyLimit::max(proxy::MAX_BODY_BYTES))
        .layer(middleware::from_fn(access_log::access_log))
        .with_state(state)
}
