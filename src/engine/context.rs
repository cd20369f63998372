// Reference context and style profiles used to ground generation

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::Result;

/// A retrieved passage of reference material
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextChunk {
    pub source: String,
    pub content: String,
}

/// House style for one content type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StyleProfile {
    pub guide: String,
    pub examples: Vec<String>,
}

/// Knowledge-base lookups used by the context stages
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    /// Passages relevant to the topic and keywords, best first
    async fn reference_context(
        &self,
        topic: &str,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<ContextChunk>>;

    /// Style guide for a content type, if one was configured
    async fn style_profile(&self, content_type: &str) -> Result<Option<StyleProfile>>;
}

/// In-memory retriever ranking chunks by term overlap
#[derive(Default)]
pub struct InMemoryContextRetriever {
    chunks: RwLock<Vec<ContextChunk>>,
    styles: RwLock<HashMap<String, StyleProfile>>,
}

impl InMemoryContextRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_chunk(&self, source: impl Into<String>, content: impl Into<String>) {
        self.chunks.write().await.push(ContextChunk {
            source: source.into(),
            content: content.into(),
        });
    }

    pub async fn set_style(&self, content_type: impl Into<String>, profile: StyleProfile) {
        self.styles.write().await.insert(content_type.into(), profile);
    }
}

fn terms(topic: &str, keywords: &[String]) -> Vec<String> {
    topic
        .split_whitespace()
        .chain(keywords.iter().map(String::as_str))
        .map(|term| term.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|term| term.len() > 2)
        .collect()
}

#[async_trait]
impl ContextRetriever for InMemoryContextRetriever {
    async fn reference_context(
        &self,
        topic: &str,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<ContextChunk>> {
        let terms = terms(topic, keywords);
        let chunks = self.chunks.read().await;

        let mut scored: Vec<(usize, &ContextChunk)> = chunks
            .iter()
            .map(|chunk| {
                let haystack = chunk.content.to_lowercase();
                let score = terms.iter().filter(|term| haystack.contains(term.as_str())).count();
                (score, chunk)
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        // Stable sort keeps insertion order among equal scores
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, chunk)| chunk.clone())
            .collect())
    }

    async fn style_profile(&self, content_type: &str) -> Result<Option<StyleProfile>> {
        Ok(self.styles.read().await.get(content_type).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ranks_by_term_overlap() {
        let retriever = InMemoryContextRetriever::new();
        retriever.add_chunk("a", "Rust ownership and borrowing").await;
        retriever.add_chunk("b", "Gardening tips").await;
        retriever.add_chunk("c", "Async Rust with tokio and ownership").await;

        let found = retriever
            .reference_context("Rust ownership", &["tokio".to_string()], 5)
            .await
            .unwrap();
        let sources: Vec<_> = found.iter().map(|c| c.source.as_str()).collect();
        assert_eq!(sources, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_style_profile_lookup() {
        let retriever = InMemoryContextRetriever::new();
        retriever
            .set_style(
                "longread",
                StyleProfile {
                    guide: "Short sentences.".into(),
                    examples: vec![],
                },
            )
            .await;
        assert!(retriever.style_profile("longread").await.unwrap().is_some());
        assert!(retriever.style_profile("news").await.unwrap().is_none());
    }
}
