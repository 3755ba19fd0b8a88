//! Deterministic agent runtime that replays a fixed script.
//!
//! Used by tests and local demos to drive the run machinery without an LLM.

use super::{AgentEventStream, AgentRunConfig, AgentRuntime, HistoryQuery, StateSnapshot, filter_history};
use crate::domain::events::{AgentEvent, INTERRUPT_KEY, StreamMode};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Emit(AgentEvent),
    /// Raise an error from the stream.
    Fail(String),
    Sleep(Duration),
    /// Never produce another item.
    Hang,
    /// Block until notified.
    WaitFor(Arc<Notify>),
}

impl ScriptStep {
    pub fn values(data: Value) -> Self {
        Self::Emit(AgentEvent::tagged(StreamMode::Values, data))
    }

    pub fn updates(data: Value) -> Self {
        Self::Emit(AgentEvent::tagged(StreamMode::Updates, data))
    }

    pub fn interrupt(value: Value) -> Self {
        Self::updates(json!({ INTERRUPT_KEY: [{ "value": value }] }))
    }
}

#[derive(Debug, Default)]
struct Recorded {
    inputs: Vec<Value>,
    configs: Vec<AgentRunConfig>,
    history: HashMap<String, Vec<StateSnapshot>>,
}

#[derive(Debug, Clone)]
pub struct ScriptedAgent {
    graph_id: String,
    script: Vec<ScriptStep>,
    recorded: Arc<Mutex<Recorded>>,
}

impl ScriptedAgent {
    pub fn new(graph_id: impl Into<String>, script: Vec<ScriptStep>) -> Self {
        Self {
            graph_id: graph_id.into(),
            script,
            recorded: Arc::default(),
        }
    }

    /// Inputs passed to `stream`, in call order.
    pub fn seen_inputs(&self) -> Vec<Value> {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .inputs
            .clone()
    }

    /// Configs passed to `stream`, in call order.
    pub fn seen_configs(&self) -> Vec<AgentRunConfig> {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .configs
            .clone()
    }
}

fn interrupt_marker(reason: &str) -> AgentEvent {
    AgentEvent::tagged(
        StreamMode::Updates,
        json!({ INTERRUPT_KEY: [{ "value": { "reason": reason } }] }),
    )
}

#[async_trait]
impl AgentRuntime for ScriptedAgent {
    fn graph_id(&self) -> &str {
        &self.graph_id
    }

    async fn stream(&self, input: Value, config: AgentRunConfig) -> anyhow::Result<AgentEventStream> {
        {
            let mut recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
            recorded.inputs.push(input);
            recorded.configs.push(config.clone());
        }

        let script = self.script.clone();
        let recorded = Arc::clone(&self.recorded);

        let stream = async_stream::try_stream! {
            for step in script {
                // checkpoint between steps
                if config.interrupt.is_cancelled() {
                    if config.wants(StreamMode::Updates) {
                        yield interrupt_marker("interrupt requested");
                    }
                    break;
                }
                match step {
                    ScriptStep::Emit(event) => {
                        let mode = match &event {
                            AgentEvent::Tagged { mode, .. } => Some(*mode),
                            AgentEvent::Bare(_) => None,
                        };
                        if mode.is_some_and(|m| !config.wants(m)) {
                            continue;
                        }
                        if let AgentEvent::Tagged { mode: StreamMode::Values, data } = &event {
                            let mut guard = recorded.lock().unwrap_or_else(PoisonError::into_inner);
                            let history = guard.history.entry(config.thread_id.clone()).or_default();
                            let parent = history.first().and_then(|s| s.checkpoint_id.clone());
                            let step = history.len();
                            history.insert(0, StateSnapshot {
                                values: data.clone(),
                                next: vec![],
                                metadata: json!({ "run_id": config.run_id, "step": step }),
                                created_at: Some(Utc::now()),
                                checkpoint_id: Some(uuid::Uuid::new_v4().to_string()),
                                parent_checkpoint_id: parent,
                            });
                        }
                        yield event;
                    }
                    ScriptStep::Fail(message) => {
                        Err::<(), anyhow::Error>(anyhow::anyhow!(message))?;
                    }
                    ScriptStep::Sleep(duration) => tokio::time::sleep(duration).await,
                    ScriptStep::Hang => futures::future::pending::<()>().await,
                    ScriptStep::WaitFor(notify) => notify.notified().await,
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn state_history(
        &self,
        thread_id: &str,
        query: &HistoryQuery,
    ) -> anyhow::Result<Vec<StateSnapshot>> {
        let history = self
            .recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .get(thread_id)
            .cloned()
            .unwrap_or_default();
        Ok(filter_history(history, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tokio_util::sync::CancellationToken;

    fn config(modes: Vec<StreamMode>) -> AgentRunConfig {
        AgentRunConfig {
            run_id: "r".into(),
            thread_id: "t".into(),
            user_id: "u".into(),
            config: json!({}),
            context: json!({}),
            checkpoint: None,
            interrupt_before: vec![],
            interrupt_after: vec![],
            stream_modes: modes,
            subgraphs: false,
            interrupt: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_only_requested_modes_are_emitted() {
        let agent = ScriptedAgent::new(
            "g",
            vec![
                ScriptStep::values(json!({ "n": 1 })),
                ScriptStep::updates(json!({ "agent": {} })),
                ScriptStep::Emit(AgentEvent::tagged(StreamMode::Messages, json!(["hi"]))),
            ],
        );
        let events: Vec<AgentEvent> = agent
            .stream(json!({}), config(vec![StreamMode::Values, StreamMode::Updates]))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(events.len(), 2);

        let history = agent.state_history("t", &HistoryQuery::default()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].values, json!({ "n": 1 }));
    }

    #[tokio::test]
    async fn test_interrupt_request_stops_at_next_step() {
        let agent = ScriptedAgent::new(
            "g",
            vec![ScriptStep::values(json!({ "n": 1 })), ScriptStep::values(json!({ "n": 2 }))],
        );
        let cfg = config(vec![StreamMode::Values, StreamMode::Updates]);
        cfg.interrupt.cancel();
        let events: Vec<AgentEvent> = agent
            .stream(json!({}), cfg)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].clone().normalize().carries_interrupt());
    }

    #[tokio::test]
    async fn test_fail_step_raises() {
        let agent = ScriptedAgent::new("g", vec![ScriptStep::Fail("model unavailable".into())]);
        let result: anyhow::Result<Vec<AgentEvent>> = agent
            .stream(json!({}), config(vec![StreamMode::Values]))
            .await
            .unwrap()
            .try_collect()
            .await;
        assert_eq!(result.unwrap_err().to_string(), "model unavailable");
    }
}
