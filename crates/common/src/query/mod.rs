//! Query normalization
//!
//! Canonicalizes raw user input before any task is created:
//! - Strips control characters
//! - Trims and collapses whitespace runs to a single space
//! - Enforces the configured length bound (in characters)

use crate::config::QueryConfig;
use crate::errors::{AppError, Result};
use regex_lite::Regex;
use std::sync::OnceLock;

fn control_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").expect("static pattern is valid")
    })
}

/// Validates and canonicalizes query text
#[derive(Debug, Clone)]
pub struct QueryNormalizer {
    max_length: usize,
}

impl QueryNormalizer {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    pub fn from_config(config: &QueryConfig) -> Self {
        Self::new(config.max_length)
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Return the canonical form of `raw`, or the reason it was rejected
    pub fn normalize(&self, raw: &str) -> Result<String> {
        let stripped = control_chars().replace_all(raw, "");
        let canonical = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

        if canonical.is_empty() {
            return Err(AppError::EmptyQuery);
        }

        let length = canonical.chars().count();
        if length > self.max_length {
            return Err(AppError::QueryTooLong {
                length,
                limit: self.max_length,
            });
        }

        Ok(canonical)
    }
}

impl Default for QueryNormalizer {
    fn default() -> Self {
        Self::from_config(&QueryConfig::default())
    }
}
