use crate::domain::events::EventRecord;
use crate::domain::files::ChunkResult;
use crate::domain::runs::{Run, RunUpdate};
use crate::domain::threads::{Assistant, Thread, ThreadFilter, ThreadStatus};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

pub mod providers;

#[async_trait]
pub trait PersistenceLayer: Send + Sync + std::fmt::Debug {
    // =========================================================================
    // Threads
    // =========================================================================

    async fn create_thread(&self, thread: &Thread) -> Result<()>;

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>>;

    /// Threads owned by `user_id` matching `filter`, newest first, plus the
    /// total match count before paging.
    async fn search_threads(
        &self,
        user_id: &str,
        filter: &ThreadFilter,
    ) -> Result<(Vec<Thread>, usize)>;

    /// Replace a thread's assistant and metadata. Returns the updated thread,
    /// or `None` if it does not exist.
    async fn update_thread(
        &self,
        thread_id: &str,
        assistant_id: Option<&str>,
        metadata: &Value,
    ) -> Result<Option<Thread>>;

    async fn set_thread_status(&self, thread_id: &str, status: ThreadStatus) -> Result<()>;

    /// Delete a thread together with its runs and their events.
    async fn delete_thread(&self, thread_id: &str) -> Result<bool>;

    // =========================================================================
    // Assistants
    // =========================================================================

    async fn upsert_assistant(&self, assistant: &Assistant) -> Result<()>;

    async fn get_assistant(&self, assistant_id: &str) -> Result<Option<Assistant>>;

    // =========================================================================
    // Runs
    // =========================================================================

    async fn create_run(&self, run: &Run) -> Result<()>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// Runs of a thread, newest first.
    async fn list_runs(&self, thread_id: &str) -> Result<Vec<Run>>;

    /// Runs of a thread still in `pending` or `running`.
    async fn list_active_runs(&self, thread_id: &str) -> Result<Vec<Run>>;

    /// Conditionally apply `update`. The write only happens when the stored
    /// status may transition to `update.status`; returns whether it did.
    /// Output and error fields are only touched when set on the update.
    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<bool>;

    // =========================================================================
    // Run Events
    // =========================================================================

    /// Append an event. Re-appending an existing `event_id` is a no-op.
    async fn append_event(&self, record: &EventRecord) -> Result<()>;

    /// Up to `limit` events of a run with `seq > after_seq`, in order.
    async fn list_events(
        &self,
        run_id: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>>;

    // =========================================================================
    // Documents
    // =========================================================================

    async fn thread_has_documents(&self, thread_id: &str) -> Result<bool>;

    /// Chunks of the thread's uploaded files ranked by cosine similarity to
    /// `query_vec`, dropping anything scoring below `min_score`.
    async fn search_file_chunks(
        &self,
        thread_id: &str,
        query_vec: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<ChunkResult>>;
}
