use super::RunError;
use super::broker::RunBroker;
use super::executor::{RunExecutor, RunJob};
use super::gateway::{RunStream, StreamingGateway};
use super::registry::RunRegistry;
use super::retry::RetryPolicy;
use super::store::EventStore;
use crate::agent::{GraphRegistry, HistoryQuery, StateSnapshot};
use crate::domain::events::{EventRecord, StreamMode, StreamModeRequest, StreamModeSelection};
use crate::domain::runs::{DisconnectPolicy, Run, RunStatus, RunUpdate};
use crate::domain::threads::{
    Assistant, SYSTEM_OWNER, Thread, ThreadFilter, ThreadStatus, assistant_id_for_graph,
};
use crate::persistence::PersistenceLayer;
use crate::rag::InputAugmenter;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

const DEFAULT_SEARCH_LIMIT: usize = 20;
const DEFAULT_HISTORY_LIMIT: usize = 10;
const MAX_HISTORY_LIMIT: usize = 1000;

// =============================================================================
// Requests
// =============================================================================

/// Step names given as a single string or a list.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum StepList {
    One(String),
    Many(Vec<String>),
}

impl StepList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(step) => vec![step],
            Self::Many(steps) => steps,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunCreate {
    pub assistant_id: Option<String>,
    pub input: Option<Value>,
    pub config: Option<Value>,
    pub context: Option<Value>,
    pub stream_mode: Option<StreamModeRequest>,
    pub checkpoint: Option<Value>,
    pub interrupt_before: Option<StepList>,
    pub interrupt_after: Option<StepList>,
    #[serde(default)]
    pub stream_subgraphs: bool,
    #[serde(default)]
    pub on_disconnect: DisconnectPolicy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThreadCreate {
    pub graph_id: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThreadUpdate {
    pub graph_id: Option<String>,
    pub thread_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadPage {
    pub threads: Vec<Thread>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// What a stop request does to a live run.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StopAction {
    #[default]
    Cancel,
    Interrupt,
}

// =============================================================================
// Manager
// =============================================================================

#[derive(Debug, Clone)]
pub struct RunManagerConfig {
    pub default_stream_modes: Vec<StreamMode>,
    pub settle_timeout: Duration,
    pub retry: RetryPolicy,
    pub replay_page_size: usize,
    pub tombstone_capacity: usize,
    /// Graph used for new threads that do not name one.
    pub default_graph_id: Option<String>,
}

impl Default for RunManagerConfig {
    fn default() -> Self {
        Self {
            default_stream_modes: vec![StreamMode::Values],
            settle_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            replay_page_size: 500,
            tombstone_capacity: 1024,
            default_graph_id: None,
        }
    }
}

/// Service facade over threads, runs and their event streams.
#[derive(Debug, Clone)]
pub struct RunManager {
    db: Arc<dyn PersistenceLayer>,
    graphs: Arc<GraphRegistry>,
    broker: RunBroker,
    registry: RunRegistry,
    executor: RunExecutor,
    gateway: StreamingGateway,
    config: RunManagerConfig,
}

impl RunManager {
    pub fn new(db: Arc<dyn PersistenceLayer>, graphs: GraphRegistry, config: RunManagerConfig) -> Self {
        let broker = RunBroker::new(config.tombstone_capacity);
        let registry = RunRegistry::new();
        let store = EventStore::new(Arc::clone(&db), config.retry, config.replay_page_size);
        let executor = RunExecutor::new(
            Arc::clone(&db),
            store.clone(),
            broker.clone(),
            registry.clone(),
            config.retry,
        );
        let gateway = StreamingGateway::new(Arc::clone(&db), store, broker.clone());
        Self {
            db,
            graphs: Arc::new(graphs),
            broker,
            registry,
            executor,
            gateway,
            config,
        }
    }

    pub fn with_augmenter(mut self, augmenter: Arc<dyn InputAugmenter>) -> Self {
        self.executor = self.executor.with_augmenter(augmenter);
        self
    }

    pub fn broker(&self) -> &RunBroker {
        &self.broker
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Make sure every registered graph has its system assistant.
    pub async fn seed_assistants(&self) -> anyhow::Result<()> {
        for graph_id in self.graphs.graph_ids() {
            let assistant = Assistant {
                assistant_id: assistant_id_for_graph(graph_id),
                graph_id: graph_id.to_string(),
                name: graph_id.to_string(),
                user_id: SYSTEM_OWNER.to_string(),
                config: json!({}),
                context: json!({}),
            };
            self.db.upsert_assistant(&assistant).await?;
            tracing::info!(name: "assistant.seeded", graph_id, assistant_id = %assistant.assistant_id, "System assistant ready");
        }
        Ok(())
    }

    // =========================================================================
    // Threads
    // =========================================================================

    async fn owned_thread(&self, user_id: &str, thread_id: &str) -> Result<Thread, RunError> {
        self.db
            .get_thread(thread_id)
            .await?
            .filter(|t| t.user_id == user_id)
            .ok_or_else(|| RunError::NotFound(format!("Thread '{thread_id}' not found")))
    }

    fn graph_assistant(&self, graph_id: &str) -> Result<String, RunError> {
        if self.graphs.contains(graph_id) {
            Ok(assistant_id_for_graph(graph_id))
        } else {
            Err(RunError::NotFound(format!("Graph '{graph_id}' not found")))
        }
    }

    #[instrument(skip(self, request))]
    pub async fn create_thread(&self, user_id: &str, request: ThreadCreate) -> Result<Thread, RunError> {
        let graph_id = request
            .graph_id
            .or_else(|| self.config.default_graph_id.clone())
            .or_else(|| self.graphs.graph_ids().next().map(ToString::to_string))
            .ok_or_else(|| RunError::BadRequest("no graph available for new threads".into()))?;
        let assistant_id = self.graph_assistant(&graph_id)?;

        let mut metadata = request.metadata.unwrap_or_default();
        metadata.insert("owner".into(), json!(user_id));
        metadata.insert("assistant_id".into(), json!(assistant_id));
        metadata.insert("graph_id".into(), json!(graph_id));
        metadata.insert("thread_name".into(), json!(""));

        let now = Utc::now();
        let thread = Thread {
            thread_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            assistant_id: Some(assistant_id),
            status: ThreadStatus::Idle,
            metadata: Value::Object(metadata),
            created_at: now,
            updated_at: now,
        };
        self.db.create_thread(&thread).await?;
        tracing::info!(name: "thread.created", thread_id = %thread.thread_id, "Thread created");
        Ok(thread)
    }

    pub async fn search_threads(&self, user_id: &str, mut filter: ThreadFilter) -> Result<ThreadPage, RunError> {
        let offset = *filter.offset.get_or_insert(0);
        let limit = *filter.limit.get_or_insert(DEFAULT_SEARCH_LIMIT);
        let (threads, total) = self.db.search_threads(user_id, &filter).await?;
        Ok(ThreadPage {
            threads,
            total,
            limit,
            offset,
        })
    }

    #[instrument(skip(self, request))]
    pub async fn update_thread(
        &self,
        user_id: &str,
        thread_id: &str,
        request: ThreadUpdate,
    ) -> Result<Thread, RunError> {
        let thread = self.owned_thread(user_id, thread_id).await?;
        let mut metadata = match thread.metadata {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let mut assistant_id = None;
        if let Some(graph_id) = request.graph_id.filter(|g| !g.is_empty()) {
            let id = self.graph_assistant(&graph_id)?;
            metadata.insert("graph_id".into(), json!(graph_id));
            metadata.insert("assistant_id".into(), json!(id));
            assistant_id = Some(id);
        }
        if let Some(name) = request.thread_name.filter(|n| !n.is_empty()) {
            metadata.insert("thread_name".into(), json!(name));
        }

        self.db
            .update_thread(thread_id, assistant_id.as_deref(), &Value::Object(metadata))
            .await?
            .ok_or_else(|| RunError::NotFound(format!("Thread '{thread_id}' not found")))
    }

    /// Cancel the thread's active runs, wait for them to settle, then delete
    /// the thread with its runs and events.
    #[instrument(skip(self))]
    pub async fn delete_thread(&self, user_id: &str, thread_id: &str) -> Result<(), RunError> {
        self.owned_thread(user_id, thread_id).await?;
        let active = self.db.list_active_runs(thread_id).await?;
        if !active.is_empty() {
            tracing::info!(thread_id, count = active.len(), "cancelling active runs before delete");
        }
        for run in &active {
            self.broker.cancel_run(&run.run_id);
        }
        for run in &active {
            if !self.settle(&run.run_id).await {
                self.force_cancel(run).await?;
            }
        }
        self.db.delete_thread(thread_id).await?;
        tracing::info!(name: "thread.deleted", thread_id, cancelled = active.len(), "Thread deleted");
        Ok(())
    }

    pub async fn thread_history(
        &self,
        user_id: &str,
        thread_id: &str,
        mut query: HistoryQuery,
    ) -> Result<Vec<StateSnapshot>, RunError> {
        let limit = *query.limit.get_or_insert(DEFAULT_HISTORY_LIMIT);
        if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
            return Err(RunError::Invalid(format!(
                "Invalid limit; must be an integer between 1 and {MAX_HISTORY_LIMIT}"
            )));
        }
        let thread = self.owned_thread(user_id, thread_id).await?;
        let Some(graph_id) = thread.graph_id() else {
            tracing::info!(thread_id, "no graph_id set for thread; empty history");
            return Ok(Vec::new());
        };
        let graph = self
            .graphs
            .get(graph_id)
            .ok_or_else(|| RunError::NotFound(format!("Graph '{graph_id}' not found")))?;
        graph
            .state_history(thread_id, &query)
            .await
            .map_err(|e| RunError::Agent(format!("Error retrieving thread history: {e}")))
    }

    // =========================================================================
    // Runs
    // =========================================================================

    async fn resolve_assistant(
        &self,
        user_id: &str,
        requested: Option<&str>,
        thread: &Thread,
    ) -> Result<Assistant, RunError> {
        let requested = requested
            .map(ToString::to_string)
            .or_else(|| thread.assistant_id.clone())
            .or_else(|| thread.graph_id().map(ToString::to_string))
            .ok_or_else(|| RunError::BadRequest("no assistant_id given and the thread has none".into()))?;
        // a graph id stands for that graph's system assistant
        let resolved = if self.graphs.contains(&requested) {
            assistant_id_for_graph(&requested)
        } else {
            requested
        };

        let assistant = self
            .db
            .get_assistant(&resolved)
            .await?
            .filter(|a| a.user_id == user_id || a.user_id == SYSTEM_OWNER)
            .ok_or_else(|| RunError::NotFound(format!("Assistant '{resolved}' not found")))?;
        if !self.graphs.contains(&assistant.graph_id) {
            return Err(RunError::NotFound(format!(
                "Graph '{}' not found for assistant",
                assistant.graph_id
            )));
        }
        Ok(assistant)
    }

    /// Persist a `pending` run and start executing it in the background.
    #[instrument(skip(self, request), fields(run_id = tracing::field::Empty))]
    pub async fn create_run(
        &self,
        user_id: &str,
        thread_id: &str,
        request: RunCreate,
    ) -> Result<Run, RunError> {
        let thread = self.owned_thread(user_id, thread_id).await?;

        let config = request.config.unwrap_or_else(|| json!({}));
        let context = request.context.unwrap_or_else(|| json!({}));
        if is_non_empty(config.get("configurable")) && is_non_empty(Some(&context)) {
            return Err(RunError::BadRequest(
                "Cannot specify both configurable and context. Prefer setting context alone.".into(),
            ));
        }

        let assistant = self
            .resolve_assistant(user_id, request.assistant_id.as_deref(), &thread)
            .await?;
        let (config, context) = merge_run_config(&assistant, config, context);

        let graph = self
            .graphs
            .get(&assistant.graph_id)
            .ok_or_else(|| RunError::NotFound(format!("Graph '{}' not found", assistant.graph_id)))?;

        let requested_modes = request
            .stream_mode
            .or_else(|| {
                config
                    .get("stream_mode")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
            })
            .map(StreamModeRequest::into_vec);
        let modes = StreamModeSelection::resolve(requested_modes, &self.config.default_stream_modes);

        let now = Utc::now();
        let run = Run {
            run_id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            assistant_id: assistant.assistant_id.clone(),
            user_id: user_id.to_string(),
            status: RunStatus::Pending,
            input: request.input.unwrap_or_else(|| json!({})),
            config,
            context,
            output: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        tracing::Span::current().record("run_id", run.run_id.as_str());

        self.db.set_thread_status(thread_id, ThreadStatus::Busy).await?;
        // the channel exists before any client can learn the run id
        let control = self.broker.open(&run.run_id);
        if let Err(err) = self.db.create_run(&run).await {
            self.broker.cleanup_run(&run.run_id);
            self.db.set_thread_status(thread_id, ThreadStatus::Idle).await?;
            return Err(err.into());
        }

        self.executor.spawn(RunJob {
            run: run.clone(),
            graph,
            modes,
            checkpoint: request.checkpoint,
            interrupt_before: request.interrupt_before.map(StepList::into_vec).unwrap_or_default(),
            interrupt_after: request.interrupt_after.map(StepList::into_vec).unwrap_or_default(),
            subgraphs: request.stream_subgraphs,
            control,
        });
        tracing::info!(name: "run.created", run_id = %run.run_id, graph_id = %assistant.graph_id, "Run scheduled");
        Ok(run)
    }

    /// Create a run and open its event stream right away.
    pub async fn create_and_stream(
        &self,
        user_id: &str,
        thread_id: &str,
        request: RunCreate,
    ) -> Result<(Run, RunStream), RunError> {
        let policy = request.on_disconnect;
        let run = self.create_run(user_id, thread_id, request).await?;
        let stream = self.gateway.open(&run, 0, policy);
        Ok((run, stream))
    }

    /// Event stream of a run from `after` onwards.
    pub async fn stream_run(
        &self,
        run_id: &str,
        after: u64,
        policy: DisconnectPolicy,
    ) -> Result<RunStream, RunError> {
        let run = self.require_run(run_id).await?;
        Ok(self.gateway.open(&run, after, policy))
    }

    /// Like [`Self::stream_run`], for a run the caller owns on `thread_id`.
    pub async fn join_stream(
        &self,
        user_id: &str,
        thread_id: &str,
        run_id: &str,
        after: u64,
        policy: DisconnectPolicy,
    ) -> Result<RunStream, RunError> {
        self.get_run(user_id, thread_id, run_id).await?;
        self.stream_run(run_id, after, policy).await
    }

    async fn require_run(&self, run_id: &str) -> Result<Run, RunError> {
        self.db
            .get_run(run_id)
            .await?
            .ok_or_else(|| RunError::NotFound(format!("Run '{run_id}' not found")))
    }

    pub async fn get_run(&self, user_id: &str, thread_id: &str, run_id: &str) -> Result<Run, RunError> {
        self.db
            .get_run(run_id)
            .await?
            .filter(|r| r.thread_id == thread_id && r.user_id == user_id)
            .ok_or_else(|| RunError::NotFound(format!("Run '{run_id}' not found")))
    }

    pub async fn list_runs(&self, user_id: &str, thread_id: &str) -> Result<Vec<Run>, RunError> {
        let runs = self.db.list_runs(thread_id).await?;
        Ok(runs.into_iter().filter(|r| r.user_id == user_id).collect())
    }

    /// Stored events of a run with `seq > after`.
    pub async fn run_events(
        &self,
        user_id: &str,
        thread_id: &str,
        run_id: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<EventRecord>, RunError> {
        self.get_run(user_id, thread_id, run_id).await?;
        Ok(self.db.list_events(run_id, after, limit.clamp(1, 1000)).await?)
    }

    /// Cancel or interrupt a run the caller owns and return its current state.
    pub async fn stop_run(
        &self,
        user_id: &str,
        thread_id: &str,
        run_id: &str,
        action: StopAction,
        wait: bool,
    ) -> Result<Run, RunError> {
        self.get_run(user_id, thread_id, run_id).await?;
        match action {
            StopAction::Cancel => self.cancel_run(run_id, wait).await,
            StopAction::Interrupt => self.interrupt_run(run_id, wait).await,
        }
    }

    /// Request cancellation. Terminal runs are left untouched. With `wait`,
    /// returns after the run settled, aborting its task if it does not.
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: &str, wait: bool) -> Result<Run, RunError> {
        let run = self.require_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        if self.broker.cancel_run(run_id) {
            tracing::info!(run_id, "cancellation requested");
            if wait && !self.settle(run_id).await {
                self.force_cancel(&run).await?;
            }
        } else {
            tracing::info!(run_id, "cancelling run with no task in this process");
            self.persist_stopped(&run, RunStatus::Cancelled).await?;
        }
        self.require_run(run_id).await
    }

    /// Ask the agent to pause at its next checkpoint. Terminal runs are left
    /// untouched.
    #[instrument(skip(self))]
    pub async fn interrupt_run(&self, run_id: &str, wait: bool) -> Result<Run, RunError> {
        let run = self.require_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        if self.broker.interrupt_run(run_id) {
            tracing::info!(run_id, "interrupt requested");
            if wait && !self.settle(run_id).await {
                tracing::warn!(run_id, "run did not reach its interrupt checkpoint in time");
            }
        } else {
            tracing::info!(run_id, "interrupting run with no task in this process");
            self.persist_stopped(&run, RunStatus::Interrupted).await?;
        }
        self.require_run(run_id).await
    }

    /// Wait for a registered run to settle. Returns `false` on timeout.
    async fn settle(&self, run_id: &str) -> bool {
        let Some(handle) = self.registry.get(run_id) else {
            return true;
        };
        tokio::time::timeout(self.config.settle_timeout, handle.settled())
            .await
            .is_ok()
    }

    async fn force_cancel(&self, run: &Run) -> Result<(), RunError> {
        tracing::warn!(run_id = %run.run_id, "run did not settle in time; aborting its task");
        self.broker.signal_run_cancelled(&run.run_id);
        if let Some(handle) = self.registry.get(&run.run_id) {
            handle.abort();
        }
        self.persist_stopped(run, RunStatus::Cancelled).await
    }

    /// Write a terminal status for a run whose task cannot do it itself.
    async fn persist_stopped(&self, run: &Run, status: RunStatus) -> Result<(), RunError> {
        let mut update = RunUpdate::status(status);
        if status == RunStatus::Cancelled {
            update = update.with_output(json!({}));
        }
        if self.db.update_run(&run.run_id, &update).await? {
            self.db
                .set_thread_status(&run.thread_id, status.settled_thread_status())
                .await?;
        }
        Ok(())
    }
}

fn is_non_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Object(map)) => !map.is_empty(),
        Some(_) => true,
    }
}

/// Shallow merge of two JSON objects; keys of `overlay` win.
fn merge_objects(base: &Value, overlay: &Value) -> Value {
    let mut merged = base.as_object().cloned().unwrap_or_default();
    if let Some(overlay) = overlay.as_object() {
        for (key, value) in overlay {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

/// Combine the assistant's defaults with the request. `context` and
/// `config.configurable` end up mirroring each other.
fn merge_run_config(assistant: &Assistant, config: Value, context: Value) -> (Value, Value) {
    let request_context = if is_non_empty(Some(&context)) {
        context
    } else {
        config.get("configurable").cloned().unwrap_or_else(|| json!({}))
    };

    let mut config = merge_objects(&assistant.config, &config);
    let context = merge_objects(&assistant.context, &request_context);
    if let Some(map) = config.as_object_mut() {
        map.insert("configurable".into(), context.clone());
    }
    (config, context)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant(config: Value, context: Value) -> Assistant {
        Assistant {
            assistant_id: "a".into(),
            graph_id: "g".into(),
            name: "g".into(),
            user_id: SYSTEM_OWNER.into(),
            config,
            context,
        }
    }

    #[test]
    fn test_context_mirrors_into_configurable() {
        let (config, context) = merge_run_config(
            &assistant(json!({ "recursion_limit": 5 }), json!({ "tone": "brief", "lang": "en" })),
            json!({ "tags": ["x"] }),
            json!({ "tone": "detailed" }),
        );
        assert_eq!(context, json!({ "tone": "detailed", "lang": "en" }));
        assert_eq!(config["configurable"], context);
        assert_eq!(config["recursion_limit"], 5);
        assert_eq!(config["tags"], json!(["x"]));
    }

    #[test]
    fn test_configurable_becomes_context() {
        let (config, context) = merge_run_config(
            &assistant(json!({}), json!({})),
            json!({ "configurable": { "model": "small" } }),
            json!({}),
        );
        assert_eq!(context, json!({ "model": "small" }));
        assert_eq!(config["configurable"], context);
    }

    #[test]
    fn test_step_list_accepts_string_or_list() {
        let one: StepList = serde_json::from_value(json!("agent")).unwrap();
        let many: StepList = serde_json::from_value(json!(["agent", "tools"])).unwrap();
        assert_eq!(one.into_vec(), vec!["agent"]);
        assert_eq!(many.into_vec(), vec!["agent", "tools"]);
    }
}
