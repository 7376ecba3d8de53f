use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use quill_db::models::{ChatroomRow, MessageRow};
use quill_types::api::{
    ChatroomDetailResponse, ChatroomResponse, Claims, CreateChatroomRequest, MessageResponse,
    SendMessageRequest, SendMessageResponse,
};
use quill_types::jobs::{PROCESS_MESSAGE, ReplyJob};
use quill_types::models::Sender;

use crate::error::{ApiError, non_blank, parse_json};
use crate::state::AppState;

const DEFAULT_MESSAGE_LIMIT: u32 = 50;
const MAX_MESSAGE_LIMIT: u32 = 200;

const CHATROOM_NOT_FOUND: &str = "Chatroom not found.";

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub limit: Option<u32>,
    /// Cursor: only messages created strictly before this timestamp.
    pub before: Option<DateTime<Utc>>,
}

pub async fn create_chatroom(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    const FAILED: &str = "Server error while creating chatroom.";

    let req: CreateChatroomRequest = parse_json(&body)?;
    let name = non_blank(req.name);

    let user_id = claims.user_id.to_string();
    let row = state
        .with_db(FAILED, move |db| db.create_chatroom(&user_id, name.as_deref()))
        .await?;
    let chatroom = chatroom_response(row).map_err(ApiError::internal(FAILED))?;

    // The creator's next list must include the new room.
    state.chatroom_cache.invalidate(&claims.user_id);

    info!(user_id = %claims.user_id, chatroom_id = %chatroom.id, "Chatroom created");
    Ok((StatusCode::CREATED, Json(chatroom)))
}

pub async fn list_chatrooms(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ChatroomResponse>>, ApiError> {
    const FAILED: &str = "Server error while fetching chatrooms.";

    if let Some(cached) = state.chatroom_cache.get(&claims.user_id) {
        debug!(user_id = %claims.user_id, "Chatroom list served from cache");
        return Ok(Json(cached));
    }

    let user_id = claims.user_id.to_string();
    let rows = state.with_db(FAILED, move |db| db.list_chatrooms(&user_id)).await?;
    let chatrooms = rows
        .into_iter()
        .map(chatroom_response)
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(ApiError::internal(FAILED))?;

    state.chatroom_cache.set(claims.user_id, chatrooms.clone());
    Ok(Json(chatrooms))
}

pub async fn get_chatroom(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(chatroom_id): Path<String>,
    query: Result<Query<MessageQuery>, QueryRejection>,
) -> Result<Json<ChatroomDetailResponse>, ApiError> {
    const FAILED: &str = "Server error while fetching chatroom details.";

    let Query(query) = query.map_err(|e| ApiError::validation(e.body_text()))?;
    let chatroom_id = parse_chatroom_id(&chatroom_id, CHATROOM_NOT_FOUND)?;
    let limit = query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT).clamp(1, MAX_MESSAGE_LIMIT);
    let before = query.before.map(quill_db::queries::timestamp);

    let user_id = claims.user_id.to_string();
    let found = state
        .with_db(FAILED, move |db| {
            let id = chatroom_id.to_string();
            let Some(chatroom) = db.get_chatroom_for_user(&id, &user_id)? else {
                return Ok(None);
            };
            let messages = db.get_messages(&id, limit, before.as_deref())?;
            Ok(Some((chatroom, messages)))
        })
        .await?;

    let Some((chatroom, mut messages)) = found else {
        return Err(ApiError::not_found(CHATROOM_NOT_FOUND));
    };

    // Fetched newest first so the limit keeps the latest; shown oldest first.
    messages.reverse();

    let detail = ChatroomDetailResponse {
        chatroom: chatroom_response(chatroom).map_err(ApiError::internal(FAILED))?,
        messages: messages
            .into_iter()
            .map(message_response)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(ApiError::internal(FAILED))?,
    };
    Ok(Json(detail))
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(chatroom_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    const FAILED: &str = "Server error while sending message.";
    const NOT_OWNED: &str = "Chatroom not found or access denied.";

    let req: SendMessageRequest = parse_json(&body)?;
    let content = non_blank(req.content).ok_or_else(|| ApiError::validation("Message content is required."))?;
    let chatroom_id = parse_chatroom_id(&chatroom_id, NOT_OWNED)?;

    let user_id = claims.user_id.to_string();
    let text = content.clone();
    let stored = state
        .with_db(FAILED, move |db| {
            let id = chatroom_id.to_string();
            if db.get_chatroom_for_user(&id, &user_id)?.is_none() {
                return Ok(None);
            }
            db.insert_message(&id, Sender::User, &text).map(Some)
        })
        .await?;

    let Some(message) = stored else {
        return Err(ApiError::not_found(NOT_OWNED));
    };

    let job = state
        .replies
        .enqueue(
            PROCESS_MESSAGE,
            &ReplyJob {
                chatroom_id,
                prompt: content,
            },
        )
        .await
        .map_err(ApiError::internal(FAILED))?;

    info!(
        chatroom_id = %chatroom_id,
        message_id = %message.id,
        job_id = %job.id,
        "Message stored, AI reply queued"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SendMessageResponse {
            message: "Message received. AI is responding shortly.".into(),
        }),
    ))
}

/// Ids that are not UUIDs cannot name a chatroom, so they are simply not found.
fn parse_chatroom_id(raw: &str, not_found: &'static str) -> Result<Uuid, ApiError> {
    raw.parse().map_err(|_| ApiError::not_found(not_found))
}

fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

pub fn chatroom_response(row: ChatroomRow) -> anyhow::Result<ChatroomResponse> {
    Ok(ChatroomResponse {
        id: row.id.parse()?,
        user_id: row.user_id.parse()?,
        name: row.name,
        created_at: parse_timestamp(&row.created_at)?,
    })
}

pub fn message_response(row: MessageRow) -> anyhow::Result<MessageResponse> {
    Ok(MessageResponse {
        id: row.id.parse()?,
        chatroom_id: row.chatroom_id.parse()?,
        sender: row.sender.parse().map_err(anyhow::Error::msg)?,
        content: row.content,
        created_at: parse_timestamp(&row.created_at)?,
    })
}
