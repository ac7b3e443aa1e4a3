//! Fista Session
//!
//! Per-conversation state and the query lifecycle:
//! - `ConversationStore` keeps bounded, append-only message history
//! - `Orchestrator` runs one cancellable query task per conversation

pub mod orchestrator;
pub mod store;

pub use orchestrator::{Orchestrator, QueryStream};
pub use store::{ActivityGuard, ConversationStore};
