use crate::domain::events::EventRecord;
use crate::domain::files::ChunkResult;
use crate::domain::runs::{Run, RunStatus, RunUpdate};
use crate::domain::threads::{Assistant, Thread, ThreadFilter, ThreadStatus};
use crate::persistence::PersistenceLayer;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredChunk {
    chunk: ChunkResult,
    thread_id: String,
    embedding: Vec<f32>,
}

#[derive(Debug, Default)]
struct State {
    threads: HashMap<String, Thread>,
    assistants: HashMap<String, Assistant>,
    runs: HashMap<String, Run>,
    // run_id -> seq -> event
    events: HashMap<String, BTreeMap<u64, EventRecord>>,
    chunks: Vec<StoredChunk>,
}

/// Process-local persistence. Nothing survives a restart; used for local
/// development and tests.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    state: RwLock<State>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document chunk for a thread. Ingestion is handled elsewhere in
    /// production; this exists so retrieval can be exercised without it.
    pub async fn insert_chunk(&self, thread_id: &str, chunk: ChunkResult, embedding: Vec<f32>) {
        self.state.write().await.chunks.push(StoredChunk {
            chunk,
            thread_id: thread_id.to_string(),
            embedding,
        });
    }
}

#[async_trait]
impl PersistenceLayer for MemoryProvider {
    async fn create_thread(&self, thread: &Thread) -> Result<()> {
        self.state
            .write()
            .await
            .threads
            .insert(thread.thread_id.clone(), thread.clone());
        Ok(())
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        Ok(self.state.read().await.threads.get(thread_id).cloned())
    }

    async fn search_threads(
        &self,
        user_id: &str,
        filter: &ThreadFilter,
    ) -> Result<(Vec<Thread>, usize)> {
        let state = self.state.read().await;
        let mut matches: Vec<&Thread> = state
            .threads
            .values()
            .filter(|t| t.user_id == user_id && filter.matches(t))
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matches.len();
        let page = matches
            .into_iter()
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn update_thread(
        &self,
        thread_id: &str,
        assistant_id: Option<&str>,
        metadata: &Value,
    ) -> Result<Option<Thread>> {
        let mut state = self.state.write().await;
        let Some(thread) = state.threads.get_mut(thread_id) else {
            return Ok(None);
        };
        if let Some(id) = assistant_id {
            thread.assistant_id = Some(id.to_string());
        }
        thread.metadata = metadata.clone();
        thread.updated_at = Utc::now();
        Ok(Some(thread.clone()))
    }

    async fn set_thread_status(&self, thread_id: &str, status: ThreadStatus) -> Result<()> {
        if let Some(thread) = self.state.write().await.threads.get_mut(thread_id) {
            thread.status = status;
            thread.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.threads.remove(thread_id).is_none() {
            return Ok(false);
        }
        let run_ids: Vec<String> = state
            .runs
            .values()
            .filter(|r| r.thread_id == thread_id)
            .map(|r| r.run_id.clone())
            .collect();
        for run_id in run_ids {
            state.runs.remove(&run_id);
            state.events.remove(&run_id);
        }
        state.chunks.retain(|c| c.thread_id != thread_id);
        Ok(true)
    }

    async fn upsert_assistant(&self, assistant: &Assistant) -> Result<()> {
        self.state
            .write()
            .await
            .assistants
            .insert(assistant.assistant_id.clone(), assistant.clone());
        Ok(())
    }

    async fn get_assistant(&self, assistant_id: &str) -> Result<Option<Assistant>> {
        Ok(self.state.read().await.assistants.get(assistant_id).cloned())
    }

    async fn create_run(&self, run: &Run) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.threads.contains_key(&run.thread_id) {
            anyhow::bail!("thread '{}' does not exist", run.thread_id);
        }
        state.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.state.read().await.runs.get(run_id).cloned())
    }

    async fn list_runs(&self, thread_id: &str) -> Result<Vec<Run>> {
        let state = self.state.read().await;
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|r| r.thread_id == thread_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn list_active_runs(&self, thread_id: &str) -> Result<Vec<Run>> {
        Ok(self
            .list_runs(thread_id)
            .await?
            .into_iter()
            .filter(|r| matches!(r.status, RunStatus::Pending | RunStatus::Running))
            .collect())
    }

    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(run) = state.runs.get_mut(run_id) else {
            return Ok(false);
        };
        if !run.status.can_transition_to(update.status) {
            return Ok(false);
        }
        run.status = update.status;
        if let Some(output) = &update.output {
            run.output = Some(output.clone());
        }
        if let Some(error) = &update.error_message {
            run.error_message = Some(error.clone());
        }
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn append_event(&self, record: &EventRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.runs.contains_key(&record.run_id) {
            anyhow::bail!("run '{}' does not exist", record.run_id);
        }
        state
            .events
            .entry(record.run_id.clone())
            .or_default()
            .entry(record.seq)
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn list_events(
        &self,
        run_id: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>> {
        let state = self.state.read().await;
        let Some(events) = state.events.get(run_id) else {
            return Ok(Vec::new());
        };
        Ok(events
            .range(after_seq.saturating_add(1)..)
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn thread_has_documents(&self, thread_id: &str) -> Result<bool> {
        Ok(self
            .state
            .read()
            .await
            .chunks
            .iter()
            .any(|c| c.thread_id == thread_id))
    }

    async fn search_file_chunks(
        &self,
        thread_id: &str,
        query_vec: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<ChunkResult>> {
        let state = self.state.read().await;
        let mut matches: Vec<ChunkResult> = state
            .chunks
            .iter()
            .filter(|c| c.thread_id == thread_id)
            .map(|c| ChunkResult {
                similarity_score: cosine_similarity(&c.embedding, query_vec),
                ..c.chunk.clone()
            })
            .collect();

        matches.sort_by(|a, b| {
            b.similarity_score
                .partial_cmp(&a.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(top_k);
        matches.retain(|c| c.similarity_score >= min_score);
        Ok(matches)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot_product: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::{RunEvent, StreamMode};
    use serde_json::json;

    fn thread(id: &str, user: &str) -> Thread {
        Thread {
            thread_id: id.into(),
            user_id: user.into(),
            assistant_id: None,
            status: ThreadStatus::Idle,
            metadata: json!({ "graph_id": "g" }),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn run(id: &str, thread_id: &str) -> Run {
        Run {
            run_id: id.into(),
            thread_id: thread_id.into(),
            assistant_id: "a".into(),
            user_id: "u".into(),
            status: RunStatus::Pending,
            input: json!({}),
            config: json!({}),
            context: json!({}),
            output: None,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_update_run_refuses_to_leave_terminal() {
        let db = MemoryProvider::new();
        db.create_thread(&thread("t", "u")).await.unwrap();
        db.create_run(&run("r", "t")).await.unwrap();

        assert!(db.update_run("r", &RunUpdate::status(RunStatus::Running)).await.unwrap());
        assert!(
            db.update_run(
                "r",
                &RunUpdate::status(RunStatus::Completed).with_output(json!({ "x": 1 }))
            )
            .await
            .unwrap()
        );
        assert!(
            !db.update_run("r", &RunUpdate::status(RunStatus::Cancelled).with_output(json!({})))
                .await
                .unwrap()
        );

        let stored = db.get_run("r").await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.output, Some(json!({ "x": 1 })));
    }

    #[tokio::test]
    async fn test_events_are_idempotent_and_paged() {
        let db = MemoryProvider::new();
        db.create_thread(&thread("t", "u")).await.unwrap();
        db.create_run(&run("r", "t")).await.unwrap();

        for seq in 1..=5 {
            let record = EventRecord::new(
                "r",
                seq,
                RunEvent {
                    mode: StreamMode::Values,
                    data: json!({ "n": seq }),
                },
            );
            db.append_event(&record).await.unwrap();
            db.append_event(&record).await.unwrap();
        }

        let page = db.list_events("r", 2, 2).await.unwrap();
        let seqs: Vec<u64> = page.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
        assert_eq!(db.list_events("r", 0, 100).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_delete_thread_cascades() {
        let db = MemoryProvider::new();
        db.create_thread(&thread("t", "u")).await.unwrap();
        db.create_run(&run("r", "t")).await.unwrap();

        assert!(db.delete_thread("t").await.unwrap());
        assert!(db.get_run("r").await.unwrap().is_none());
        assert!(db.list_events("r", 0, 10).await.unwrap().is_empty());
        assert!(!db.delete_thread("t").await.unwrap());
    }

    #[tokio::test]
    async fn test_chunk_search_is_thread_scoped() {
        let db = MemoryProvider::new();
        let chunk = |id: &str| ChunkResult {
            chunk_id: id.into(),
            file_id: "f".into(),
            filename: "notes.md".into(),
            chunk_index: 0,
            text: id.into(),
            similarity_score: 0.0,
            metadata: None,
        };
        db.insert_chunk("t1", chunk("near"), vec![1.0, 0.0]).await;
        db.insert_chunk("t1", chunk("far"), vec![0.0, 1.0]).await;
        db.insert_chunk("t2", chunk("other"), vec![1.0, 0.0]).await;

        let hits = db.search_file_chunks("t1", &[1.0, 0.1], 5, 0.5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "near");
        assert!(db.thread_has_documents("t2").await.unwrap());
        assert!(!db.thread_has_documents("t3").await.unwrap());
    }
}
