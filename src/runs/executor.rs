//! Drives one run from `pending` to a terminal status.
//!
//! Every agent item is normalized, numbered, handed to the broker and then
//! appended to the store, in production order. The terminal status comes
//! from how the agent stream ended:
//!
//! | ending                         | status        | output              |
//! |--------------------------------|---------------|---------------------|
//! | exhausted, interrupt marker    | `interrupted` | last `values` event |
//! | exhausted                      | `completed`   | last `values` event |
//! | cancel signal                  | `cancelled`   | `{}`                |
//! | stream error                   | `failed`      | `{}` + error text   |

use super::RunError;
use super::broker::{RunBroker, RunControl};
use super::registry::RunRegistry;
use super::retry::{RetryPolicy, retry};
use super::serialize::storable_output;
use super::store::EventStore;
use crate::agent::{AgentRunConfig, AgentRuntime};
use crate::domain::events::{EventRecord, StreamModeSelection};
use crate::domain::runs::{Run, RunStatus, RunUpdate};
use crate::persistence::PersistenceLayer;
use crate::rag::InputAugmenter;
use futures::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Everything needed to execute one persisted run.
#[derive(Debug, Clone)]
pub struct RunJob {
    pub run: Run,
    pub graph: Arc<dyn AgentRuntime>,
    pub modes: StreamModeSelection,
    pub checkpoint: Option<Value>,
    pub interrupt_before: Vec<String>,
    pub interrupt_after: Vec<String>,
    pub subgraphs: bool,
    pub control: RunControl,
}

#[derive(Debug, Default)]
struct Progress {
    seq: u64,
    last_values: Option<Value>,
    interrupted: bool,
}

/// Releases the run's process-wide resources on every exit path, including
/// task abort and panic.
#[derive(Debug)]
struct CleanupGuard {
    broker: RunBroker,
    registry: RunRegistry,
    run_id: String,
    settled: CancellationToken,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.broker.cleanup_run(&self.run_id);
        self.registry.pop(&self.run_id);
        self.settled.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct RunExecutor {
    db: Arc<dyn PersistenceLayer>,
    store: EventStore,
    broker: RunBroker,
    registry: RunRegistry,
    augmenter: Option<Arc<dyn InputAugmenter>>,
    retry: RetryPolicy,
}

impl RunExecutor {
    pub fn new(
        db: Arc<dyn PersistenceLayer>,
        store: EventStore,
        broker: RunBroker,
        registry: RunRegistry,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            store,
            broker,
            registry,
            augmenter: None,
            retry,
        }
    }

    pub fn with_augmenter(mut self, augmenter: Arc<dyn InputAugmenter>) -> Self {
        self.augmenter = Some(augmenter);
        self
    }

    /// Register the run and execute it on a background task.
    pub fn spawn(&self, job: RunJob) -> JoinHandle<()> {
        let run_id = job.run.run_id.clone();
        let settled = self.registry.register(&run_id);
        let executor = self.clone();

        let task = tokio::spawn(async move {
            let run_id = job.run.run_id.clone();
            match executor.execute(job, settled).await {
                Ok(status) => {
                    tracing::info!(name: "run.finished", run_id = %run_id, status = %status, "Run finished");
                }
                Err(RunError::Cancelled) => {
                    tracing::debug!(name: "run.cancelled", run_id = %run_id, "Run cancelled");
                }
                Err(err) => {
                    tracing::error!(name: "run.failed", run_id = %run_id, error = %err, "Run failed");
                }
            }
        });
        self.registry.attach_abort(&run_id, task.abort_handle());
        task
    }

    /// Execute the run to a terminal status. Cancellation and agent failures
    /// are returned as errors after the terminal status was persisted.
    #[instrument(
        skip_all,
        fields(run_id = %job.run.run_id, thread_id = %job.run.thread_id)
    )]
    pub async fn execute(&self, job: RunJob, settled: CancellationToken) -> Result<RunStatus, RunError> {
        let run_id = job.run.run_id.clone();
        let thread_id = job.run.thread_id.clone();
        let _cleanup = CleanupGuard {
            broker: self.broker.clone(),
            registry: self.registry.clone(),
            run_id: run_id.clone(),
            settled,
        };

        let mut progress = Progress::default();
        match self.drive(&job, &mut progress).await {
            Ok(()) => {
                let status = if progress.interrupted {
                    RunStatus::Interrupted
                } else {
                    RunStatus::Completed
                };
                let output = storable_output(progress.last_values.as_ref());
                self.finalize(&run_id, &thread_id, RunUpdate::status(status).with_output(output))
                    .await;
                Ok(status)
            }
            Err(RunError::Cancelled) => {
                self.finalize(
                    &run_id,
                    &thread_id,
                    RunUpdate::status(RunStatus::Cancelled).with_output(json!({})),
                )
                .await;
                self.broker.signal_run_cancelled(&run_id);
                Err(RunError::Cancelled)
            }
            Err(err) => {
                let message = err.to_string();
                self.finalize(
                    &run_id,
                    &thread_id,
                    RunUpdate::status(RunStatus::Failed)
                        .with_output(json!({}))
                        .with_error(message.clone()),
                )
                .await;
                self.broker.signal_run_error(&run_id, message);
                Err(err)
            }
        }
    }

    async fn drive(&self, job: &RunJob, progress: &mut Progress) -> Result<(), RunError> {
        let run_id = job.run.run_id.as_str();
        let cancel = &job.control.cancel;

        let running = RunUpdate::status(RunStatus::Running);
        let started = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RunError::Cancelled),
            started = retry(self.retry, || self.db.update_run(run_id, &running)) => started?,
        };
        if !started {
            tracing::debug!(run_id, "run left pending before it started");
            return Err(RunError::Cancelled);
        }
        tracing::info!(
            name: "run.started",
            run_id,
            modes = ?job.modes.requested(),
            implicit_updates = job.modes.implicit_updates(),
            "Run started"
        );

        // a first embedding model load can take a while
        let input = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RunError::Cancelled),
            input = self.augmented_input(job) => input,
        };
        let config = AgentRunConfig {
            run_id: run_id.to_string(),
            thread_id: job.run.thread_id.clone(),
            user_id: job.run.user_id.clone(),
            config: job.run.config.clone(),
            context: job.run.context.clone(),
            checkpoint: job.checkpoint.clone(),
            interrupt_before: job.interrupt_before.clone(),
            interrupt_after: job.interrupt_after.clone(),
            stream_modes: job.modes.effective(),
            subgraphs: job.subgraphs,
            interrupt: job.control.interrupt.clone(),
        };

        let mut stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RunError::Cancelled),
            stream = job.graph.stream(input, config) => {
                stream.map_err(|e| RunError::Agent(e.to_string()))?
            }
        };

        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RunError::Cancelled),
                item = stream.next() => item,
            };
            let Some(item) = item else {
                return Ok(());
            };
            let event = item.map_err(|e| RunError::Agent(e.to_string()))?.normalize();

            progress.seq += 1;
            if event.carries_interrupt() {
                progress.interrupted = true;
            }
            if event.is_snapshot() {
                progress.last_values = Some(event.data.clone());
            }

            let record = EventRecord::new(run_id, progress.seq, event);
            self.broker.put_to_broker(record.clone());
            if self.store.store_event(&record).await {
                self.broker.mark_stored(run_id, record.seq);
            }
        }
    }

    /// Run input after best-effort context augmentation. The stored input is
    /// never modified.
    async fn augmented_input(&self, job: &RunJob) -> Value {
        let input = job.run.input.clone();
        let Some(augmenter) = &self.augmenter else {
            return input;
        };
        match augmenter.augment(&job.run.thread_id, input.clone()).await {
            Ok(augmented) => augmented,
            Err(err) => {
                tracing::warn!(
                    run_id = %job.run.run_id,
                    error = %err,
                    "context augmentation failed; using original input"
                );
                input
            }
        }
    }

    /// Persist the terminal status and settle the owning thread.
    async fn finalize(&self, run_id: &str, thread_id: &str, update: RunUpdate) {
        let status = update.status;
        match retry(self.retry, || self.db.update_run(run_id, &update)).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(run_id, status = %status, "run already terminal; status left unchanged");
            }
            Err(err) => {
                tracing::error!(run_id, status = %status, error = %err, "failed to persist run status");
            }
        }

        let thread_status = status.settled_thread_status();
        if let Err(err) = retry(self.retry, || self.db.set_thread_status(thread_id, thread_status)).await {
            tracing::error!(thread_id, error = %err, "failed to persist thread status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::scripted::{ScriptStep, ScriptedAgent};
    use crate::domain::events::StreamMode;
    use crate::domain::files::ChunkResult;
    use crate::domain::threads::{Assistant, Thread, ThreadFilter, ThreadStatus};
    use crate::persistence::providers::memory::MemoryProvider;
    use crate::runs::broker::{BrokerMessage, Subscription, Terminal};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tracing_subscriber::layer::SubscriberExt;

    struct Harness {
        db: Arc<MemoryProvider>,
        broker: RunBroker,
        registry: RunRegistry,
        executor: RunExecutor,
    }

    fn harness() -> Harness {
        let db = Arc::new(MemoryProvider::new());
        let dyn_db: Arc<dyn PersistenceLayer> = Arc::clone(&db) as Arc<dyn PersistenceLayer>;
        harness_over(db, dyn_db)
    }

    fn harness_over(db: Arc<MemoryProvider>, dyn_db: Arc<dyn PersistenceLayer>) -> Harness {
        let broker = RunBroker::default();
        let registry = RunRegistry::new();
        let retry = RetryPolicy::new(1, Duration::from_millis(1));
        let executor = RunExecutor::new(
            Arc::clone(&dyn_db),
            EventStore::new(dyn_db, retry, 100),
            broker.clone(),
            registry.clone(),
            retry,
        );
        Harness {
            db,
            broker,
            registry,
            executor,
        }
    }

    async fn job(h: &Harness, script: Vec<ScriptStep>, input: Value) -> RunJob {
        h.db.create_thread(&Thread {
            thread_id: "t".into(),
            user_id: "u".into(),
            assistant_id: None,
            status: ThreadStatus::Busy,
            metadata: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
        let run = Run {
            run_id: "r".into(),
            thread_id: "t".into(),
            assistant_id: "a".into(),
            user_id: "u".into(),
            status: RunStatus::Pending,
            input,
            config: json!({}),
            context: json!({}),
            output: None,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        h.db.create_run(&run).await.unwrap();
        RunJob {
            run,
            graph: Arc::new(ScriptedAgent::new("g", script)),
            modes: StreamModeSelection::resolve(Some(vec![StreamMode::Values]), &[]),
            checkpoint: None,
            interrupt_before: vec![],
            interrupt_after: vec![],
            subgraphs: false,
            control: h.broker.open("r"),
        }
    }

    /// Memory provider whose event writes always fail.
    #[derive(Debug)]
    struct EventWritesFail(Arc<MemoryProvider>);

    #[async_trait]
    impl PersistenceLayer for EventWritesFail {
        async fn create_thread(&self, thread: &Thread) -> anyhow::Result<()> {
            self.0.create_thread(thread).await
        }
        async fn get_thread(&self, thread_id: &str) -> anyhow::Result<Option<Thread>> {
            self.0.get_thread(thread_id).await
        }
        async fn search_threads(
            &self,
            user_id: &str,
            filter: &ThreadFilter,
        ) -> anyhow::Result<(Vec<Thread>, usize)> {
            self.0.search_threads(user_id, filter).await
        }
        async fn update_thread(
            &self,
            thread_id: &str,
            assistant_id: Option<&str>,
            metadata: &Value,
        ) -> anyhow::Result<Option<Thread>> {
            self.0.update_thread(thread_id, assistant_id, metadata).await
        }
        async fn set_thread_status(&self, thread_id: &str, status: ThreadStatus) -> anyhow::Result<()> {
            self.0.set_thread_status(thread_id, status).await
        }
        async fn delete_thread(&self, thread_id: &str) -> anyhow::Result<bool> {
            self.0.delete_thread(thread_id).await
        }
        async fn upsert_assistant(&self, assistant: &Assistant) -> anyhow::Result<()> {
            self.0.upsert_assistant(assistant).await
        }
        async fn get_assistant(&self, assistant_id: &str) -> anyhow::Result<Option<Assistant>> {
            self.0.get_assistant(assistant_id).await
        }
        async fn create_run(&self, run: &Run) -> anyhow::Result<()> {
            self.0.create_run(run).await
        }
        async fn get_run(&self, run_id: &str) -> anyhow::Result<Option<Run>> {
            self.0.get_run(run_id).await
        }
        async fn list_runs(&self, thread_id: &str) -> anyhow::Result<Vec<Run>> {
            self.0.list_runs(thread_id).await
        }
        async fn list_active_runs(&self, thread_id: &str) -> anyhow::Result<Vec<Run>> {
            self.0.list_active_runs(thread_id).await
        }
        async fn update_run(&self, run_id: &str, update: &RunUpdate) -> anyhow::Result<bool> {
            self.0.update_run(run_id, update).await
        }
        async fn append_event(&self, _record: &EventRecord) -> anyhow::Result<()> {
            anyhow::bail!("connection reset by peer")
        }
        async fn list_events(
            &self,
            run_id: &str,
            after_seq: u64,
            limit: usize,
        ) -> anyhow::Result<Vec<EventRecord>> {
            self.0.list_events(run_id, after_seq, limit).await
        }
        async fn thread_has_documents(&self, thread_id: &str) -> anyhow::Result<bool> {
            self.0.thread_has_documents(thread_id).await
        }
        async fn search_file_chunks(
            &self,
            thread_id: &str,
            query_vec: &[f32],
            top_k: usize,
            min_score: f32,
        ) -> anyhow::Result<Vec<ChunkResult>> {
            self.0.search_file_chunks(thread_id, query_vec, top_k, min_score).await
        }
    }

    /// Counts error-level log events.
    #[derive(Debug, Clone, Default)]
    struct ErrorCount(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ErrorCount {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::ERROR {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    async fn drain(sub: Subscription) -> (Vec<u64>, Vec<Terminal>) {
        let messages: Vec<BrokerMessage> = sub.collect().await;
        let mut seqs = Vec::new();
        let mut ends = Vec::new();
        for message in messages {
            match message {
                BrokerMessage::Event(e) => seqs.push(e.seq),
                BrokerMessage::End(t) => ends.push(t),
            }
        }
        (seqs, ends)
    }

    #[derive(Debug)]
    struct FailingAugmenter;

    /// Signals once it is entered, then never finishes.
    #[derive(Debug)]
    struct StuckAugmenter(Arc<Notify>);

    #[async_trait]
    impl InputAugmenter for StuckAugmenter {
        async fn augment(&self, _thread_id: &str, _input: Value) -> anyhow::Result<Value> {
            self.0.notify_one();
            futures::future::pending().await
        }
    }

    #[async_trait]
    impl InputAugmenter for FailingAugmenter {
        async fn augment(&self, _thread_id: &str, _input: Value) -> anyhow::Result<Value> {
            anyhow::bail!("embedding service down")
        }
    }

    #[tokio::test]
    async fn test_cleanup_runs_on_every_exit() {
        let h = harness();
        let job = job(&h, vec![ScriptStep::Fail("boom".into())], json!({})).await;
        let settled = h.registry.register("r");
        let result = h.executor.execute(job, settled.clone()).await;

        assert!(matches!(result, Err(RunError::Agent(ref m)) if m == "boom"));
        assert!(settled.is_cancelled());
        assert!(h.registry.is_empty());
        assert!(!h.broker.has_channel("r"));
    }

    #[tokio::test]
    async fn test_aborted_task_still_cleans_up() {
        let h = harness();
        let job = job(&h, vec![ScriptStep::Hang], json!({})).await;
        let task = h.executor.spawn(job);
        let handle = h.registry.get("r").unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        handle.settled().await;
        assert!(!h.broker.has_channel("r"));
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_augmentation_failure_uses_original_input() {
        let h = harness();
        let input = json!({ "messages": [{ "role": "user", "content": "hi" }] });
        let mut job = job(&h, vec![], input.clone()).await;
        let agent = Arc::new(ScriptedAgent::new("g", vec![ScriptStep::values(json!({ "n": 1 }))]));
        job.graph = Arc::clone(&agent) as Arc<dyn AgentRuntime>;
        let executor = h.executor.clone().with_augmenter(Arc::new(FailingAugmenter));

        let status = executor.execute(job, CancellationToken::new()).await.unwrap();
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(agent.seen_inputs(), vec![input.clone()]);
        let run = h.db.get_run("r").await.unwrap().unwrap();
        assert_eq!(run.input, input);
        assert_eq!(run.output, Some(json!({ "n": 1 })));
    }

    #[tokio::test]
    async fn test_cancel_before_first_event() {
        let h = harness();
        let job = job(&h, vec![ScriptStep::Hang], json!({})).await;
        let mut sub = h.broker.subscribe("r");
        job.control.cancel.cancel();

        let result = h.executor.execute(job, CancellationToken::new()).await;
        assert!(matches!(result, Err(RunError::Cancelled)));
        assert_eq!(sub.recv().await, Some(BrokerMessage::End(Terminal::Cancelled)));

        let run = h.db.get_run("r").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.output, Some(json!({})));
    }

    #[tokio::test]
    async fn test_event_write_failures_do_not_stop_the_run() {
        let db = Arc::new(MemoryProvider::new());
        let failing = Arc::new(EventWritesFail(Arc::clone(&db))) as Arc<dyn PersistenceLayer>;
        let h = harness_over(db, failing);
        let job = job(
            &h,
            vec![
                ScriptStep::values(json!({ "n": 1 })),
                ScriptStep::updates(json!({ "agent": { "n": 2 } })),
                ScriptStep::values(json!({ "n": 3 })),
            ],
            json!({}),
        )
        .await;
        let first = h.broker.subscribe("r");
        let second = h.broker.subscribe("r");

        let errors = ErrorCount::default();
        let _log = tracing::subscriber::set_default(tracing_subscriber::registry().with(errors.clone()));
        let status = h.executor.execute(job, CancellationToken::new()).await.unwrap();

        assert_eq!(status, RunStatus::Completed);
        let run = h.db.get_run("r").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(json!({ "n": 3 })));
        assert!(h.db.list_events("r", 0, 100).await.unwrap().is_empty());
        assert_eq!(errors.0.load(Ordering::SeqCst), 3);

        for sub in [first, second] {
            assert_eq!(drain(sub).await, (vec![1, 2, 3], vec![Terminal::Done]));
        }
    }

    #[tokio::test]
    async fn test_unstorable_output_is_replaced_and_run_completes() {
        let h = harness();
        let job = job(
            &h,
            vec![
                ScriptStep::values(json!({ "n": 1 })),
                ScriptStep::values(json!({ "label": "nul\u{0000}" })),
            ],
            json!({}),
        )
        .await;

        let status = h.executor.execute(job, CancellationToken::new()).await.unwrap();
        assert_eq!(status, RunStatus::Completed);
        let run = h.db.get_run("r").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let output = run.output.unwrap();
        assert_eq!(output["error"], "output could not be serialized");
        assert!(output["detail"].as_str().unwrap().contains("$.label"));
        assert_eq!(h.db.get_thread("t").await.unwrap().unwrap().status, ThreadStatus::Idle);
    }

    #[tokio::test]
    async fn test_cancel_is_seen_during_augmentation() {
        let h = harness();
        let entered = Arc::new(Notify::new());
        let job = job(&h, vec![ScriptStep::values(json!({ "n": 1 }))], json!({})).await;
        let cancel = job.control.cancel.clone();
        let executor = h
            .executor
            .clone()
            .with_augmenter(Arc::new(StuckAugmenter(Arc::clone(&entered))));

        let task = tokio::spawn(async move { executor.execute(job, CancellationToken::new()).await });
        entered.notified().await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("cancel must not wait for augmentation")
            .unwrap();
        assert!(matches!(result, Err(RunError::Cancelled)));
        let run = h.db.get_run("r").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }
}
