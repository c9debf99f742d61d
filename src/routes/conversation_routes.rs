// src/routes/conversation_routes.rs

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::clinic_context::ClinicContext,
    models::{AppState, Conversation, Message},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/conversations", get(list_conversations))
        .route(
            "/conversations/{conversation_id}",
            axum::routing::delete(delete_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(list_messages),
        )
}

pub async fn list_conversations(
    State(state): State<AppState>,
    clinic: ClinicContext,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let rows = state.store.list_conversations(clinic.clinic_id).await?;
    Ok(Json(rows))
}

/// Messages oldest first by origin timestamp; arrival order is not meaningful.
pub async fn list_messages(
    State(state): State<AppState>,
    clinic: ClinicContext,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let conv = state
        .store
        .get_conversation(conversation_id)
        .await?
        .filter(|c| c.clinic_id == clinic.clinic_id)
        .ok_or_else(|| ApiError::NotFound("NOT_FOUND", "conversation not found".into()))?;

    let rows = state.store.list_messages(conv.id).await?;
    Ok(Json(rows))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    clinic: ClinicContext,
    Path(conversation_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if !state
        .store
        .delete_conversation(clinic.clinic_id, conversation_id)
        .await?
    {
        return Err(ApiError::NotFound(
            "NOT_FOUND",
            "conversation not found".into(),
        ));
    }
    tracing::info!(conversation_id = %conversation_id, "conversation deleted");
    Ok(StatusCode::NO_CONTENT)
}
