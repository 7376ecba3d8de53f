pub mod config;

use axum::{
    Json, Router, middleware,
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use quill_api::middleware::require_auth;
use quill_api::{AppState, auth, chatrooms};

/// Assembles the HTTP surface. Everything under `/api/chatroom` requires a
/// bearer token.
pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/auth/send-otp", post(auth::send_otp))
        .route("/api/auth/verify-otp", post(auth::verify_otp));

    let protected_routes = Router::new()
        .route(
            "/api/chatroom",
            post(chatrooms::create_chatroom).get(chatrooms::list_chatrooms),
        )
        .route("/api/chatroom/{chatroom_id}", get(chatrooms::get_chatroom))
        .route("/api/chatroom/{chatroom_id}/message", post(chatrooms::send_message))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn root() -> &'static str {
    "Quill API is running"
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
