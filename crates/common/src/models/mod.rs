//! Shared data model

mod message;
mod result;

pub use message::{
    Completion, ConversationId, ConversationSummary, Message, MessageId, Role, TruncationReason,
};
pub use result::{
    BackendHit, BackendResult, FeedbackEvent, FeedbackKind, StreamUpdate, TaskState,
};
