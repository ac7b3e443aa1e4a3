//! Conversation and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque conversation token supplied by the client
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random token
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ConversationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Time-ordered message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
}

/// Why an agent message ended before aggregation finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationReason {
    /// Stopped by the user or superseded by a newer query
    Cancelled,
    /// Overall task deadline elapsed
    Timeout,
}

/// How a finalized agent message came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Completion {
    Complete,
    Truncated { reason: TruncationReason },
    Failed,
}

impl Completion {
    pub fn is_truncated(&self) -> bool {
        matches!(self, Completion::Truncated { .. })
    }
}

/// A single conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,

    /// True while the agent is still streaming into this message
    #[serde(default)]
    pub partial: bool,

    /// Set once a partial agent message is finalized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<Completion>,

    /// Backends that failed to contribute to this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_sources: Vec<String>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>, partial: bool) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            partial,
            completion: None,
            degraded_sources: Vec::new(),
        }
    }

    /// A complete user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, false)
    }

    /// A complete agent message
    pub fn agent(content: impl Into<String>) -> Self {
        let mut message = Self::new(Role::Agent, content, false);
        message.completion = Some(Completion::Complete);
        message
    }

    /// An empty agent message that will be streamed into
    pub fn placeholder() -> Self {
        Self::new(Role::Agent, String::new(), true)
    }
}

/// Sidebar entry for a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    /// First user message, shortened
    pub title: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_is_partial_agent_message() {
        let message = Message::placeholder();
        assert_eq!(message.role, Role::Agent);
        assert!(message.partial);
        assert!(message.content.is_empty());
        assert!(message.completion.is_none());
    }

    #[test]
    fn test_completion_serialization() {
        let truncated = Completion::Truncated {
            reason: TruncationReason::Timeout,
        };
        let json = serde_json::to_value(truncated).unwrap();
        assert_eq!(json["status"], "truncated");
        assert_eq!(json["reason"], "timeout");
        assert!(truncated.is_truncated());
        assert!(!Completion::Complete.is_truncated());
    }

    #[test]
    fn test_conversation_id_is_transparent() {
        let id = ConversationId::from("c1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"c1\"");
        assert_eq!(id.to_string(), "c1");
    }
}
