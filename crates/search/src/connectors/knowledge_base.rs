//! In-process knowledge base
//!
//! Lexical matching over a fixed document set: a document scores the share
//! of query terms it contains.

use super::{Connector, HitStream};
use async_trait::async_trait;
use fista_common::config::BackendConfig;
use fista_common::errors::{AppError, Result};
use fista_common::models::BackendHit;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::time::Duration;

/// A document indexed by the knowledge base
#[derive(Debug, Clone)]
pub struct Document {
    pub title: Option<String>,
    pub url: Option<String>,
    pub content: String,
    terms: HashSet<String>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let terms = tokenize(&content).collect();
        Self {
            title: None,
            url: None,
            content,
            terms,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Split text into lowercase terms, skipping short tokens
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|w| w.chars().count() > 2)
}

pub struct KnowledgeBaseConnector {
    name: String,
    documents: Vec<Document>,
    max_results: usize,
}

impl KnowledgeBaseConnector {
    pub fn new(name: impl Into<String>, documents: Vec<Document>, max_results: usize) -> Self {
        Self {
            name: name.into(),
            documents,
            max_results,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        let documents = config
            .documents
            .iter()
            .map(|d| {
                let mut doc = Document::new(d.content.clone());
                doc.title = d.title.clone();
                doc.url = d.url.clone();
                doc
            })
            .collect();
        Self::new(config.name.clone(), documents, config.max_results)
    }

    fn search(&self, text: &str) -> Vec<BackendHit> {
        let query_terms: HashSet<String> = tokenize(text).collect();
        if query_terms.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<BackendHit> = self
            .documents
            .iter()
            .filter_map(|doc| {
                let matched = query_terms.iter().filter(|t| doc.terms.contains(*t)).count();
                if matched == 0 {
                    return None;
                }
                Some(BackendHit {
                    content: doc.content.clone(),
                    score: matched as f64 / query_terms.len() as f64,
                    title: doc.title.clone(),
                    url: doc.url.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(self.max_results);
        hits
    }
}

#[async_trait]
impl Connector for KnowledgeBaseConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, text: &str, _timeout: Duration) -> Result<HitStream> {
        let hits = self.search(text);
        tracing::debug!(backend = %self.name, hits = hits.len(), "Knowledge base searched");
        Ok(stream::iter(hits.into_iter().map(Ok::<_, AppError>)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> KnowledgeBaseConnector {
        KnowledgeBaseConnector::new(
            "kb",
            vec![
                Document::new("Best hiking trails in the Alps").with_title("Alps"),
                Document::new("Hiking boots buying guide"),
                Document::new("Sourdough baking basics"),
            ],
            10,
        )
    }

    #[test]
    fn test_scores_by_term_overlap() {
        let hits = connector().search("best hiking trails");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "Best hiking trails in the Alps");
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[0].title.as_deref(), Some("Alps"));
        assert!((hits[1].score - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_and_punctuated_terms() {
        let hits = connector().search("Hiking?! a of");
        assert_eq!(hits.len(), 2);

        assert!(connector().search("a of to").is_empty());
    }

    #[test]
    fn test_max_results() {
        let kb = KnowledgeBaseConnector::new(
            "kb",
            (0..5).map(|i| Document::new(format!("trail number {}", i))).collect(),
            3,
        );
        assert_eq!(kb.search("trail").len(), 3);
    }

    #[tokio::test]
    async fn test_query_streams_hits() {
        let items: Vec<_> = connector()
            .query("sourdough", Duration::from_secs(1))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 1);
    }
}
