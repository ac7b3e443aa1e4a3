//! Conversation handlers
//!
//! Queries stream back as Server-Sent Events: one `update` event per stream
//! item, the last one carrying `done: true`.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use fista_common::{
    errors::{AppError, Result},
    models::{ConversationId, ConversationSummary, FeedbackEvent, FeedbackKind, Message, MessageId, TaskState},
};
use fista_session::QueryStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct ConversationPath {
    #[validate(length(min = 1, max = 128))]
    pub id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MessagePath {
    #[validate(length(min = 1, max = 128))]
    pub id: String,
    pub message_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub kind: FeedbackKind,
}

#[derive(Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Serialize)]
pub struct MessagesResponse {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub conversation_id: ConversationId,
    pub cancelled: bool,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub conversation_id: ConversationId,
    pub state: TaskState,
}

fn conversation_id(path: &ConversationPath) -> Result<ConversationId> {
    path.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("id".to_string()),
    })?;
    Ok(ConversationId::new(path.id.clone()))
}

fn message_ids(path: &MessagePath) -> Result<(ConversationId, MessageId)> {
    path.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("id".to_string()),
    })?;
    Ok((ConversationId::new(path.id.clone()), MessageId::from(path.message_id)))
}

fn into_sse(stream: QueryStream) -> Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>> {
    let events = stream.into_stream().map(|update| {
        Event::default()
            .event("update")
            .id(update.revision.to_string())
            .json_data(&update)
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// List conversations, most recently active first
pub async fn list_conversations(State(state): State<AppState>) -> Json<ConversationListResponse> {
    Json(ConversationListResponse {
        conversations: state.store.list(),
    })
}

/// Message history snapshot
pub async fn get_messages(
    State(state): State<AppState>,
    Path(path): Path<ConversationPath>,
) -> Result<Json<MessagesResponse>> {
    let id = conversation_id(&path)?;
    let messages = state.store.get(&id)?;
    Ok(Json(MessagesResponse {
        conversation_id: id,
        messages,
    }))
}

/// Submit a query and stream the agent's answer
pub async fn submit_query(
    State(state): State<AppState>,
    Path(path): Path<ConversationPath>,
    Json(request): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>>> {
    let id = conversation_id(&path)?;
    let stream = state.orchestrator.submit_query(&id, &request.text).await?;

    tracing::info!(
        conversation_id = %id,
        message_id = %stream.message_id(),
        "Query accepted"
    );

    Ok(into_sse(stream))
}

/// Stop the active query; returns once its message is finalized
pub async fn cancel_query(
    State(state): State<AppState>,
    Path(path): Path<ConversationPath>,
) -> Result<Json<CancelResponse>> {
    let id = conversation_id(&path)?;
    let cancelled = state.orchestrator.cancel(&id).await;
    Ok(Json(CancelResponse {
        conversation_id: id,
        cancelled,
    }))
}

pub async fn get_status(
    State(state): State<AppState>,
    Path(path): Path<ConversationPath>,
) -> Result<Json<StatusResponse>> {
    let id = conversation_id(&path)?;
    let task_state = state.orchestrator.status(&id).await;
    Ok(Json(StatusResponse {
        conversation_id: id,
        state: task_state,
    }))
}

/// Re-run the query behind an agent message as a new turn
pub async fn regenerate(
    State(state): State<AppState>,
    Path(path): Path<MessagePath>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>>> {
    let (id, message_id) = message_ids(&path)?;
    let stream = state.orchestrator.regenerate(&id, &message_id).await?;
    Ok(into_sse(stream))
}

pub async fn feedback(
    State(state): State<AppState>,
    Path(path): Path<MessagePath>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<FeedbackEvent>> {
    let (id, message_id) = message_ids(&path)?;
    let event = state.orchestrator.feedback(&id, &message_id, request.kind)?;
    Ok(Json(event))
}
