// src/routes/gateway_routes.rs

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::AppState,
    phone::digits_only,
    supervisor::{ConnectionStatus, SessionState},
    transport::user_jid,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/init", post(init))
        .route("/logout", post(logout))
        .route("/send", post(send))
        .route("/read", post(read))
        .route("/sync-avatar", post(sync_avatar))
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl CommandResponse {
    fn ok() -> Self {
        Self {
            success: true,
            message: None,
            url: None,
        }
    }

    fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }
}

#[derive(Debug, Serialize)]
pub struct InitResponse {
    pub status: &'static str,
    pub message: &'static str,
}

pub async fn status(State(state): State<AppState>) -> Json<SessionState> {
    Json(state.supervisor.session())
}

pub async fn init(State(state): State<AppState>) -> Result<Json<InitResponse>, ApiError> {
    if state.supervisor.session().status == ConnectionStatus::Connected {
        return Ok(Json(InitResponse {
            status: "connected",
            message: "already connected",
        }));
    }
    state.supervisor.init().await?;
    Ok(Json(InitResponse {
        status: "initializing",
        message: "pairing started",
    }))
}

pub async fn logout(State(state): State<AppState>) -> Result<Json<CommandResponse>, ApiError> {
    state.supervisor.logout().await?;
    Ok(Json(
        CommandResponse::ok().with_message("disconnected, generating a new QR code"),
    ))
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub phone: String,
    pub message: String,
}

pub async fn send(
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    if !state.supervisor.is_connected() {
        return Err(ApiError::not_connected());
    }
    if req.message.trim().is_empty() {
        return Err(ApiError::validation("message is required"));
    }

    let target = state.phones.dialable(&req.phone);
    if target.is_empty() {
        return Err(ApiError::validation("phone is required"));
    }

    tracing::info!(target = %target, "sending message");
    state
        .transport
        .send_text(&user_jid(&target), &req.message)
        .await?;

    Ok(Json(CommandResponse::ok()))
}

#[derive(Debug, Deserialize)]
pub struct ReadRequest {
    #[serde(rename = "conversationId")]
    pub conversation_id: Option<Uuid>,
}

pub async fn read(
    State(state): State<AppState>,
    Json(req): Json<ReadRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let conversation_id = req
        .conversation_id
        .ok_or_else(|| ApiError::validation("conversationId is required"))?;

    if !state.store.mark_conversation_read(conversation_id).await? {
        return Err(ApiError::NotFound(
            "NOT_FOUND",
            "conversation not found".to_string(),
        ));
    }
    tracing::info!(conversation_id = %conversation_id, "conversation marked as read");
    Ok(Json(CommandResponse::ok()))
}

#[derive(Debug, Deserialize)]
pub struct SyncAvatarRequest {
    pub phone: String,
}

pub async fn sync_avatar(
    State(state): State<AppState>,
    Json(req): Json<SyncAvatarRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let digits = digits_only(&req.phone);
    if digits.is_empty() {
        return Err(ApiError::validation("phone is required"));
    }
    if !state.supervisor.is_connected() {
        return Err(ApiError::not_connected());
    }

    let Some(url) = state.transport.profile_picture_url(&user_jid(&digits)).await? else {
        return Ok(Json(CommandResponse {
            success: false,
            message: Some("photo not found or private".to_string()),
            url: None,
        }));
    };

    let variants: Vec<String> = state.phones.variants(&digits).into_iter().collect();
    let updated = state.store.set_avatar_by_phone(&variants, &url).await?;
    tracing::info!(phone = %digits, updated, "avatar refreshed");

    Ok(Json(CommandResponse {
        success: true,
        message: None,
        url: Some(url),
    }))
}
