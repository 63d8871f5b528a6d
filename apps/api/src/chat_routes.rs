use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use qa_core::{ChatSessionSummary, ChatTurnRequest, RateRequest, VectorSearchRequest};
use qa_error::{QaError, Result};
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/chat/sessions", post(create_session).get(list_sessions))
        .route("/api/v1/chat/sessions/:id/history", get(session_history))
        .route("/api/v1/chat/agents/:agent_id", post(chat_turn))
        .route("/api/v1/chat/messages/:id/rating", put(rate_message))
        .route("/api/v1/vectors/search", post(vector_search))
        .route("/api/v1/health", get(health))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// 调用方身份从 x-user-id 请求头取得（上游网关负责认证）
fn current_user(headers: &HeaderMap) -> Result<Uuid> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| QaError::Unauthorized {
            operation: "缺少或非法的 x-user-id 请求头".to_string(),
        })
}

#[derive(Deserialize)]
struct CreateSessionReq {
    agent_id: Uuid,
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionReq>,
) -> Result<impl IntoResponse> {
    let user_id = current_user(&headers)?;
    let session = state.pipeline.create_session(user_id, req.agent_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(ChatSessionSummary::from(session)),
    ))
}

#[derive(Deserialize)]
struct ListSessionsQuery {
    agent_id: Option<Uuid>,
}

async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<ListSessionsQuery>,
) -> Result<impl IntoResponse> {
    let user_id = current_user(&headers)?;
    let sessions = state.pipeline.list_sessions(user_id, q.agent_id).await?;
    Ok(Json(sessions))
}

async fn session_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let user_id = current_user(&headers)?;
    let messages = state.pipeline.history(user_id, session_id).await?;
    Ok(Json(json!({ "messages": messages })))
}

async fn chat_turn(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(agent_id): Path<Uuid>,
    Json(req): Json<ChatTurnRequest>,
) -> Result<impl IntoResponse> {
    let user_id = current_user(&headers)?;
    let response = state.pipeline.handle_turn(user_id, agent_id, req).await?;
    Ok(Json(response))
}

async fn rate_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<Uuid>,
    Json(req): Json<RateRequest>,
) -> Result<impl IntoResponse> {
    let user_id = current_user(&headers)?;
    let message = state.pipeline.rate_message(user_id, message_id, req).await?;
    Ok(Json(message))
}

async fn vector_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VectorSearchRequest>,
) -> Result<impl IntoResponse> {
    current_user(&headers)?;
    let hits = state.pipeline.vector_search(req).await?;
    Ok(Json(hits))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
