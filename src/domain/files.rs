use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A chunk of an uploaded document returned by similarity search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkResult {
    pub chunk_id: String,
    pub file_id: String,
    pub filename: String,
    pub chunk_index: i32,
    pub text: String,
    pub similarity_score: f32,
    pub metadata: Option<Value>,
}
