//! Fista Common Library
//!
//! Shared code for the Fista query orchestrator crates including:
//! - Conversation, message, and backend result types
//! - Error types and handling
//! - Configuration management
//! - Query normalization
//! - Metrics and observability

pub mod config;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod query;

// Re-export commonly used types
pub use config::AppConfig;
pub use errors::{AppError, Result};
pub use query::QueryNormalizer;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
