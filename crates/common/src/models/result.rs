//! Backend results and task stream types

use super::message::{Completion, ConversationId, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw hit as produced by a connector, before the pool stamps it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendHit {
    /// Content fragment
    pub content: String,

    /// Relevance score, higher is better
    pub score: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl BackendHit {
    pub fn new(content: impl Into<String>, score: f64) -> Self {
        Self {
            content: content.into(),
            score,
            title: None,
            url: None,
        }
    }
}

/// A hit attributed to its source and arrival time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResult {
    /// Backend name that produced the hit
    pub source: String,

    /// Relevance score, higher is better
    pub score: f64,

    /// Content fragment
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// When the aggregation side received the hit
    pub arrived_at: DateTime<Utc>,
}

impl BackendResult {
    pub fn from_hit(source: impl Into<String>, hit: BackendHit, arrived_at: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            score: hit.score,
            content: hit.content,
            title: hit.title,
            url: hit.url,
            arrived_at,
        }
    }
}

/// Lifecycle of a query task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Normalizing,
    Dispatching,
    Streaming,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }
}

/// One item of the stream returned to the client for a submitted query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamUpdate {
    pub conversation_id: ConversationId,

    /// The agent message being streamed into
    pub message_id: MessageId,

    /// Strictly increasing per task
    pub revision: u64,

    /// Accumulated content so far
    pub content: String,

    pub done: bool,

    pub state: TaskState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<Completion>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_sources: Vec<String>,
}

/// Reaction to an agent message; never changes history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Copy,
    ThumbsUp,
    ThumbsDown,
}

impl FeedbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackKind::Copy => "copy",
            FeedbackKind::ThumbsUp => "thumbs_up",
            FeedbackKind::ThumbsDown => "thumbs_down",
        }
    }
}

/// Emitted for every feedback action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub kind: FeedbackKind,
    /// Message content, returned so the client can copy it
    pub content: String,
    pub recorded_at: DateTime<Utc>,
}
