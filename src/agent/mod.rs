//! Agent runtime seam.
//!
//! The run executor treats an agent as an opaque, cancellable, lazy stream of
//! events. Runtimes are registered by graph id in a [`GraphRegistry`].

pub mod llm;
pub mod scripted;

use crate::domain::events::{AgentEvent, StreamMode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type AgentEventStream = Pin<Box<dyn Stream<Item = anyhow::Result<AgentEvent>> + Send>>;

/// Everything an agent runtime needs to execute one run.
#[derive(Debug, Clone)]
pub struct AgentRunConfig {
    pub run_id: String,
    pub thread_id: String,
    pub user_id: String,
    /// Merged run config; `configurable` mirrors `context`.
    pub config: Value,
    pub context: Value,
    /// Checkpoint to resume from instead of the thread's latest state.
    pub checkpoint: Option<Value>,
    pub interrupt_before: Vec<String>,
    pub interrupt_after: Vec<String>,
    pub stream_modes: Vec<StreamMode>,
    pub subgraphs: bool,
    /// Cancelled when a caller asks the run to pause at its next checkpoint.
    pub interrupt: CancellationToken,
}

impl AgentRunConfig {
    pub fn wants(&self, mode: StreamMode) -> bool {
        self.stream_modes.contains(&mode)
    }

    /// Checkpoint id requested through `checkpoint.checkpoint_id`.
    pub fn checkpoint_id(&self) -> Option<&str> {
        self.checkpoint
            .as_ref()
            .and_then(|c| c.get("checkpoint_id"))
            .and_then(Value::as_str)
    }
}

/// One entry of a thread's state history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    pub values: Value,
    pub next: Vec<String>,
    pub metadata: Value,
    pub created_at: Option<DateTime<Utc>>,
    pub checkpoint_id: Option<String>,
    pub parent_checkpoint_id: Option<String>,
}

/// Filters for [`AgentRuntime::state_history`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    /// Only checkpoints older than this checkpoint id.
    pub before: Option<String>,
    pub metadata: Option<serde_json::Map<String, Value>>,
    pub checkpoint: Option<Value>,
    pub checkpoint_ns: Option<String>,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync + std::fmt::Debug {
    fn graph_id(&self) -> &str;

    /// Start executing and return the event stream. Items are tagged with
    /// their stream mode; only modes listed in `config.stream_modes` are
    /// emitted.
    async fn stream(&self, input: Value, config: AgentRunConfig) -> anyhow::Result<AgentEventStream>;

    /// Checkpointed states of a thread, newest first.
    async fn state_history(
        &self,
        thread_id: &str,
        query: &HistoryQuery,
    ) -> anyhow::Result<Vec<StateSnapshot>>;
}

/// Agent runtimes available to runs, keyed by graph id.
#[derive(Debug, Clone, Default)]
pub struct GraphRegistry {
    graphs: BTreeMap<String, Arc<dyn AgentRuntime>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runtime: Arc<dyn AgentRuntime>) {
        self.graphs.insert(runtime.graph_id().to_string(), runtime);
    }

    pub fn with(mut self, runtime: Arc<dyn AgentRuntime>) -> Self {
        self.register(runtime);
        self
    }

    pub fn get(&self, graph_id: &str) -> Option<Arc<dyn AgentRuntime>> {
        self.graphs.get(graph_id).cloned()
    }

    pub fn contains(&self, graph_id: &str) -> bool {
        self.graphs.contains_key(graph_id)
    }

    pub fn graph_ids(&self) -> impl Iterator<Item = &str> {
        self.graphs.keys().map(String::as_str)
    }
}

/// Apply the query's `before`, `metadata` and `limit` filters to snapshots
/// ordered newest first.
pub fn filter_history(snapshots: Vec<StateSnapshot>, query: &HistoryQuery) -> Vec<StateSnapshot> {
    let mut iter: Box<dyn Iterator<Item = StateSnapshot>> = Box::new(snapshots.into_iter());
    if let Some(before) = query.before.clone() {
        iter = Box::new(
            iter.skip_while(move |s| s.checkpoint_id.as_deref() != Some(before.as_str()))
                .skip(1),
        );
    }
    if let Some(wanted) = query.metadata.clone() {
        iter = Box::new(iter.filter(move |s| {
            wanted
                .iter()
                .all(|(k, v)| s.metadata.get(k).is_some_and(|stored| stored == v))
        }));
    }
    iter.take(query.limit.unwrap_or(10)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(id: &str, step: i64) -> StateSnapshot {
        StateSnapshot {
            values: json!({}),
            next: vec![],
            metadata: json!({ "step": step }),
            created_at: None,
            checkpoint_id: Some(id.into()),
            parent_checkpoint_id: None,
        }
    }

    #[test]
    fn test_history_filters() {
        let history = vec![snap("c3", 3), snap("c2", 2), snap("c1", 1)];

        let before = filter_history(
            history.clone(),
            &HistoryQuery {
                before: Some("c3".into()),
                ..HistoryQuery::default()
            },
        );
        assert_eq!(before.len(), 2);
        assert_eq!(before[0].checkpoint_id.as_deref(), Some("c2"));

        let limited = filter_history(
            history.clone(),
            &HistoryQuery {
                limit: Some(1),
                ..HistoryQuery::default()
            },
        );
        assert_eq!(limited.len(), 1);

        let by_meta = filter_history(
            history,
            &HistoryQuery {
                metadata: json!({ "step": 1 }).as_object().cloned(),
                ..HistoryQuery::default()
            },
        );
        assert_eq!(by_meta.len(), 1);
        assert_eq!(by_meta[0].checkpoint_id.as_deref(), Some("c1"));
    }
}
