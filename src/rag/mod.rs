//! Document-context retrieval for run inputs.
//!
//! Before a run starts, the executor hands a copy of the input to an
//! [`InputAugmenter`], which may prepend context retrieved from the thread's
//! uploaded documents to the latest user message.

pub mod embedding;
pub mod retrieval;

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait InputAugmenter: Send + Sync + std::fmt::Debug {
    /// Return `input` unchanged, or rewritten with retrieved context.
    async fn augment(&self, thread_id: &str, input: Value) -> anyhow::Result<Value>;
}
