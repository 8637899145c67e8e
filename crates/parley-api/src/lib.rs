use axum::{
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use parley_core::AppState;
use serde_json::json;

pub mod error;
pub mod middleware;
pub mod routes;

pub fn build_router() -> Router<AppState> {
    let cors = build_cors_layer();
    Router::new()
        // Health
        .route("/health", get(health))
        .route("/api/v1/health", get(health))
        // Chat
        .route(
            "/api/v1/chat",
            get(routes::chat::list_chats),
        )
        .route("/api/v1/chat/start", post(routes::chat::start_chat))
        .route(
            "/api/v1/chat/{thread_id}/messages",
            get(routes::chat::get_messages),
        )
        .route(
            "/api/v1/chat/{thread_id}/message",
            post(routes::chat::send_message),
        )
        .route(
            "/api/v1/chat/{thread_id}/message/{message_id}",
            delete(routes::chat::delete_message),
        )
        .route(
            "/api/v1/chat/{thread_id}/message/{message_id}/pin",
            post(routes::chat::toggle_pin),
        )
        .route(
            "/api/v1/chat/{thread_id}/message/{message_id}/forward",
            post(routes::chat::forward_message),
        )
        // Presence
        .route(
            "/api/v1/presence/{user_id}",
            get(routes::presence::get_presence),
        )
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

fn build_cors_layer() -> tower_http::cors::CorsLayer {
    tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}

async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "success": true, "data": { "status": "ok", "service": "parley" } })),
    )
}
