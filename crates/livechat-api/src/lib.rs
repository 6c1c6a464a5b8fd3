use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use livechat_core::AppState;
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
        // Conversations
        .route(
            "/api/v1/conversations",
            post(routes::conversations::create_conversation),
        )
        .route(
            "/api/v1/conversations/{conversation_id}",
            get(routes::conversations::get_conversation),
        )
        .route(
            "/api/v1/conversations/{conversation_id}/assign",
            post(routes::conversations::assign_agent),
        )
        .route(
            "/api/v1/conversations/{conversation_id}/close",
            post(routes::conversations::close_conversation),
        )
        // Admin
        .route("/api/v1/admin/analytics", get(routes::admin::analytics))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

fn build_cors_layer() -> tower_http::cors::CorsLayer {
    tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "livechat",
            "liveRooms": state.conversations.rooms().room_count(),
        })),
    )
}
