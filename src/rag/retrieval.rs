//! Thread-scoped document retrieval.

use super::InputAugmenter;
use super::embedding::Embedder;
use crate::domain::files::ChunkResult;
use crate::persistence::PersistenceLayer;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

/// Retrieval settings.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub similarity_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            similarity_threshold: 0.3,
        }
    }
}

/// Prepends matching chunks of the thread's uploaded files to the latest
/// user message.
#[derive(Debug, Clone)]
pub struct DocumentContextAugmenter {
    db: Arc<dyn PersistenceLayer>,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl DocumentContextAugmenter {
    pub fn new(
        db: Arc<dyn PersistenceLayer>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            db,
            embedder,
            config,
        }
    }

    /// Chunks of the thread's files relevant to `query`.
    pub async fn search(&self, thread_id: &str, query: &str) -> anyhow::Result<Vec<ChunkResult>> {
        let query_vec = self.embedder.embed(query).await?;
        let chunks = self
            .db
            .search_file_chunks(
                thread_id,
                &query_vec,
                self.config.top_k,
                self.config.similarity_threshold,
            )
            .await?;
        tracing::info!(thread_id, found = chunks.len(), "document chunks retrieved");
        Ok(chunks)
    }
}

/// Render chunks as the context block placed in front of the user message.
pub fn format_context(chunks: &[ChunkResult]) -> String {
    if chunks.is_empty() {
        return String::new();
    }
    let sources = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            format!(
                "[Source {}: {} (chunk {})]\n{}",
                i + 1,
                chunk.filename,
                chunk.chunk_index + 1,
                chunk.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");

    format!(
        "\nThe following context is retrieved from the user's uploaded documents. \n\
         Use this information to help answer the user's question or create visualizations:\n\n\
         {sources}\n\n---\nEnd of retrieved context.\n"
    )
}

fn is_user_message(message: &Value) -> bool {
    matches!(
        message
            .get("role")
            .or_else(|| message.get("type"))
            .and_then(Value::as_str),
        Some("user" | "human")
    )
}

/// Plain text of a message whose content is a string or a list of parts.
fn message_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn prepend_context(message: &mut Value, context: &str) {
    match message.get_mut("content") {
        Some(Value::String(s)) => *s = format!("{context}\n{s}"),
        Some(Value::Array(parts)) => parts.insert(0, json!({ "type": "text", "text": context })),
        _ => message["content"] = Value::String(context.to_string()),
    }
}

#[async_trait]
impl InputAugmenter for DocumentContextAugmenter {
    async fn augment(&self, thread_id: &str, mut input: Value) -> anyhow::Result<Value> {
        let Some(message) = input
            .get_mut("messages")
            .and_then(Value::as_array_mut)
            .and_then(|messages| messages.iter_mut().rev().find(|m| is_user_message(m)))
        else {
            return Ok(input);
        };

        let query = message_text(message);
        if query.trim().is_empty() || !self.db.thread_has_documents(thread_id).await? {
            return Ok(input);
        }

        let chunks = self.search(thread_id, &query).await?;
        if !chunks.is_empty() {
            prepend_context(message, &format_context(&chunks));
        }
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::threads::{Thread, ThreadStatus};
    use crate::persistence::providers::memory::MemoryProvider;
    use chrono::Utc;

    #[derive(Debug)]
    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    fn chunk(filename: &str, index: i32, text: &str) -> ChunkResult {
        ChunkResult {
            chunk_id: format!("{filename}-{index}"),
            file_id: filename.into(),
            filename: filename.into(),
            chunk_index: index,
            text: text.into(),
            similarity_score: 0.0,
            metadata: None,
        }
    }

    async fn augmenter_with_docs() -> (DocumentContextAugmenter, Arc<MemoryProvider>) {
        let db = Arc::new(MemoryProvider::new());
        db.create_thread(&Thread {
            thread_id: "t".into(),
            user_id: "u".into(),
            assistant_id: None,
            status: ThreadStatus::Idle,
            metadata: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
        let augmenter = DocumentContextAugmenter::new(
            Arc::clone(&db) as Arc<dyn PersistenceLayer>,
            Arc::new(FixedEmbedder(vec![1.0, 0.0])),
            RetrievalConfig::default(),
        );
        (augmenter, db)
    }

    #[test]
    fn test_context_block_format() {
        let block = format_context(&[chunk("a.pdf", 0, "alpha"), chunk("b.md", 3, "beta")]);
        assert!(block.contains("[Source 1: a.pdf (chunk 1)]\nalpha\n\n---\n\n[Source 2: b.md (chunk 4)]\nbeta"));
        assert!(block.ends_with("---\nEnd of retrieved context.\n"));
        assert!(format_context(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_prepends_to_latest_user_message_only() {
        let (augmenter, db) = augmenter_with_docs().await;
        db.insert_chunk("t", chunk("notes.txt", 0, "rust ownership"), vec![1.0, 0.0])
            .await;

        let input = json!({ "messages": [
            { "role": "user", "content": "first" },
            { "role": "assistant", "content": "ok" },
            { "role": "user", "content": "explain ownership" }
        ]});
        let out = augmenter.augment("t", input.clone()).await.unwrap();

        assert_eq!(out["messages"][0], input["messages"][0]);
        let latest = out["messages"][2]["content"].as_str().unwrap();
        assert!(latest.contains("[Source 1: notes.txt (chunk 1)]"));
        assert!(latest.ends_with("\nexplain ownership"));
    }

    #[tokio::test]
    async fn test_threads_without_documents_are_untouched() {
        let (augmenter, _db) = augmenter_with_docs().await;
        let input = json!({ "messages": [{ "role": "user", "content": "hi" }] });
        assert_eq!(augmenter.augment("t", input.clone()).await.unwrap(), input);

        let no_messages = json!({ "topic": "x" });
        assert_eq!(augmenter.augment("t", no_messages.clone()).await.unwrap(), no_messages);
    }
}
