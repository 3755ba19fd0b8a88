//! LLM-backed diagram orchestrator.
//!
//! Talks to any OpenAI-compatible `/v1/chat/completions` endpoint with
//! streaming enabled. The model may call visualization tools; each call
//! produces a visualization that is surfaced as a `custom` event and kept in
//! the thread state so later turns can edit it. Thread state is checkpointed
//! in memory after every step, which gives conversation continuity, state
//! history and interrupt/resume.

use super::{AgentEventStream, AgentRunConfig, AgentRuntime, HistoryQuery, StateSnapshot, filter_history};
use crate::domain::events::{AgentEvent, INTERRUPT_KEY, StreamMode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

pub const DIAGRAM_GRAPH_ID: &str = "diagram_orchestrator";

const AGENT_NODE: &str = "agent";
const TOOLS_NODE: &str = "tools";
const DEFAULT_MAX_STEPS: usize = 8;

const SYSTEM_PROMPT: &str = "You turn conversations into visualizations. \
Call create_mindmap for a new topic unless the user asks for another form: \
create_timeline for chronologies, create_knowledge_graph for hierarchies or networks, \
create_sequence_diagram for processes. Use edit_visualization to change an existing one. \
Reply briefly after calling a tool.";

const VISUALIZATION_KINDS: &[(&str, &str)] = &[
    ("create_mindmap", "mindmap"),
    ("create_knowledge_graph", "knowledge_graph"),
    ("create_sequence_diagram", "sequence_diagram"),
    ("create_timeline", "timeline"),
];

/// LLM connection and model settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

// =============================================================================
// Model client
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    TextDelta(String),
    ToolCall {
        id: String,
        name: String,
        arguments_json: String,
    },
    Done,
}

pub type ModelStream = Pin<Box<dyn Stream<Item = anyhow::Result<ModelChunk>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync + std::fmt::Debug {
    async fn stream(&self, messages: Vec<Value>, tools: Vec<Value>) -> anyhow::Result<ModelStream>;
}

#[derive(Debug, Default)]
struct ToolAccum {
    id: Option<String>,
    name: Option<String>,
    args: String,
}

/// Incremental decoder for a chat completions SSE body.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    buf: Vec<u8>,
    tool_accum: BTreeMap<usize, ToolAccum>,
}

impl ChunkDecoder {
    pub fn feed(&mut self, bytes: &[u8]) -> anyhow::Result<Vec<ModelChunk>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        while let Some(pos) = find_double_newline(&self.buf) {
            let frame = self.buf.drain(..pos + 2).collect::<Vec<_>>();
            let text = String::from_utf8_lossy(&frame);

            for line in text.lines() {
                let line = line.trim();
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();

                if data == "[DONE]" {
                    self.flush_tool_calls(&mut out);
                    out.push(ModelChunk::Done);
                    continue;
                }

                let v: Value = serde_json::from_str(data)?;
                let choice = &v["choices"][0];
                let delta = &choice["delta"];

                if let Some(s) = delta.get("content").and_then(Value::as_str)
                    && !s.is_empty()
                {
                    out.push(ModelChunk::TextDelta(s.to_string()));
                }

                if let Some(arr) = delta.get("tool_calls").and_then(Value::as_array) {
                    for tc in arr {
                        let idx = tc
                            .get("index")
                            .and_then(Value::as_u64)
                            .and_then(|i| usize::try_from(i).ok())
                            .unwrap_or(0);
                        let entry = self.tool_accum.entry(idx).or_default();
                        if entry.id.is_none() {
                            entry.id = tc.get("id").and_then(Value::as_str).map(ToString::to_string);
                        }
                        let function = tc.get("function");
                        if entry.name.is_none() {
                            entry.name = function
                                .and_then(|f| f.get("name"))
                                .and_then(Value::as_str)
                                .map(ToString::to_string);
                        }
                        if let Some(args) = function
                            .and_then(|f| f.get("arguments"))
                            .and_then(Value::as_str)
                        {
                            entry.args.push_str(args);
                        }
                    }
                }

                if choice.get("finish_reason").and_then(Value::as_str) == Some("tool_calls") {
                    self.flush_tool_calls(&mut out);
                }
            }
        }
        Ok(out)
    }

    fn flush_tool_calls(&mut self, out: &mut Vec<ModelChunk>) {
        for (_, accum) in std::mem::take(&mut self.tool_accum) {
            if let (Some(id), Some(name)) = (accum.id, accum.name) {
                out.push(ModelChunk::ToolCall {
                    id,
                    name,
                    arguments_json: accum.args,
                });
            }
        }
    }
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// Streaming client for the chat completions API.
#[derive(Clone)]
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsClient")
            .field("base_url", &self.settings.base_url)
            .field("model", &self.settings.model)
            .finish_non_exhaustive()
    }
}

impl ChatCompletionsClient {
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }
}

#[async_trait]
impl ChatModel for ChatCompletionsClient {
    async fn stream(&self, messages: Vec<Value>, tools: Vec<Value>) -> anyhow::Result<ModelStream> {
        let url = format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );

        let body = json!({
            "model": self.settings.model,
            "stream": true,
            "messages": messages,
            "tools": if tools.is_empty() { Value::Null } else { Value::Array(tools) }
        });

        let mut rb = self.http.post(&url).json(&body);
        if let Some(k) = &self.settings.api_key {
            rb = rb.bearer_auth(k);
        }

        let resp = rb.send().await?.error_for_status()?;
        let byte_stream = resp.bytes_stream();

        let out = async_stream::try_stream! {
            let mut decoder = ChunkDecoder::default();
            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                for item in decoder.feed(&chunk?)? {
                    yield item;
                }
            }
        };

        Ok(Box::pin(out))
    }
}

// =============================================================================
// Checkpointer
// =============================================================================

#[derive(Debug, Clone)]
struct Checkpoint {
    id: String,
    parent: Option<String>,
    values: Value,
    next: Vec<String>,
    metadata: Value,
    created_at: DateTime<Utc>,
}

impl Checkpoint {
    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            values: self.values.clone(),
            next: self.next.clone(),
            metadata: self.metadata.clone(),
            created_at: Some(self.created_at),
            checkpoint_id: Some(self.id.clone()),
            parent_checkpoint_id: self.parent.clone(),
        }
    }
}

/// Per-thread checkpoint log, oldest first.
#[derive(Debug, Default)]
pub struct MemoryCheckpointer {
    threads: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointer {
    fn latest(&self, thread_id: &str) -> Option<Checkpoint> {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(thread_id)
            .and_then(|log| log.last().cloned())
    }

    fn get(&self, thread_id: &str, checkpoint_id: &str) -> Option<Checkpoint> {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(thread_id)
            .and_then(|log| log.iter().find(|c| c.id == checkpoint_id).cloned())
    }

    fn put(&self, thread_id: &str, parent: Option<String>, values: &Value, next: &[&str], metadata: Value) -> String {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            parent,
            values: values.clone(),
            next: next.iter().map(ToString::to_string).collect(),
            metadata,
            created_at: Utc::now(),
        };
        let id = checkpoint.id.clone();
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(thread_id.to_string())
            .or_default()
            .push(checkpoint);
        id
    }

    fn history(&self, thread_id: &str) -> Vec<StateSnapshot> {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(thread_id)
            .map(|log| log.iter().rev().map(Checkpoint::snapshot).collect())
            .unwrap_or_default()
    }
}

// =============================================================================
// Orchestrator graph
// =============================================================================

#[derive(Debug, Clone)]
pub struct DiagramOrchestrator {
    model: Arc<dyn ChatModel>,
    checkpointer: Arc<MemoryCheckpointer>,
    max_steps: usize,
}

impl DiagramOrchestrator {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            checkpointer: Arc::default(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn from_settings(settings: LlmSettings) -> Self {
        Self::new(Arc::new(ChatCompletionsClient::new(settings)))
    }
}

fn tool_schemas() -> Vec<Value> {
    let mut tools: Vec<Value> = VISUALIZATION_KINDS
        .iter()
        .map(|(name, kind)| {
            json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": format!("Create a {} visualization.", kind.replace('_', " ")),
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "title": { "type": "string" },
                            "content": { "type": "object", "description": "Visualization body." }
                        },
                        "required": ["title", "content"]
                    }
                }
            })
        })
        .collect();
    tools.push(json!({
        "type": "function",
        "function": {
            "name": "edit_visualization",
            "description": "Apply changes to an existing visualization.",
            "parameters": {
                "type": "object",
                "properties": {
                    "visualization_id": { "type": "string" },
                    "changes": { "type": "object" }
                },
                "required": ["visualization_id", "changes"]
            }
        }
    }));
    tools
}

fn empty_state() -> Value {
    json!({ "messages": [], "visualizations": [] })
}

/// Normalize `input.messages` into stored chat messages.
fn input_messages(input: &Value) -> anyhow::Result<Vec<Value>> {
    let Some(messages) = input.get("messages") else {
        return Ok(Vec::new());
    };
    let Some(messages) = messages.as_array() else {
        anyhow::bail!("input.messages must be a list");
    };
    messages
        .iter()
        .map(|m| {
            let role = m
                .get("role")
                .or_else(|| m.get("type"))
                .and_then(Value::as_str)
                .unwrap_or("human");
            let kind = match role {
                "user" | "human" => "human",
                "assistant" | "ai" => "ai",
                "system" => "system",
                other => anyhow::bail!("unsupported message role '{other}'"),
            };
            let content = m.get("content").cloned().unwrap_or(Value::String(String::new()));
            Ok(json!({
                "type": kind,
                "content": content,
                "id": m.get("id").cloned().unwrap_or_else(|| json!(Uuid::new_v4().to_string())),
            }))
        })
        .collect()
}

/// Render stored messages in chat completions wire format.
fn to_wire(messages: &[Value]) -> Vec<Value> {
    let mut out = vec![json!({ "role": "system", "content": SYSTEM_PROMPT })];
    for m in messages {
        let content = m.get("content").cloned().unwrap_or(Value::Null);
        match m.get("type").and_then(Value::as_str) {
            Some("human") => out.push(json!({ "role": "user", "content": content })),
            Some("system") => out.push(json!({ "role": "system", "content": content })),
            Some("tool") => out.push(json!({
                "role": "tool",
                "content": content,
                "tool_call_id": m.get("tool_call_id"),
            })),
            Some("ai") => {
                let mut msg = json!({ "role": "assistant", "content": content });
                if let Some(calls) = m.get("tool_calls").and_then(Value::as_array)
                    && !calls.is_empty()
                {
                    msg["tool_calls"] = calls
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c["id"],
                                "type": "function",
                                "function": { "name": c["name"], "arguments": c["args"].to_string() }
                            })
                        })
                        .collect();
                }
                out.push(msg);
            }
            _ => {}
        }
    }
    out
}

/// Execute one tool call against the state. Returns the tool message and the
/// created or updated visualization, if any.
fn run_tool(state: &mut Value, id: &str, name: &str, args: &Value) -> (Value, Option<(&'static str, Value)>) {
    let tool_message = |content: String| {
        json!({ "type": "tool", "content": content, "tool_call_id": id, "name": name })
    };

    if let Some((_, kind)) = VISUALIZATION_KINDS.iter().find(|(tool, _)| *tool == name) {
        let title = args.get("title").and_then(Value::as_str).unwrap_or("Untitled").to_string();
        let visualization = json!({
            "id": Uuid::new_v4().to_string(),
            "type": kind,
            "title": title,
            "content": args.get("content").cloned().unwrap_or(Value::Null),
        });
        if let Some(list) = state["visualizations"].as_array_mut() {
            list.push(visualization.clone());
        }
        return (
            tool_message(format!("Created {} '{title}'", kind.replace('_', " "))),
            Some(("created", visualization)),
        );
    }

    if name == "edit_visualization" {
        let target = args.get("visualization_id").and_then(Value::as_str).unwrap_or_default();
        let Some(changes) = args.get("changes").and_then(Value::as_object) else {
            return (tool_message("edit_visualization requires a 'changes' object".into()), None);
        };
        let found = state["visualizations"]
            .as_array_mut()
            .and_then(|list| list.iter_mut().find(|v| v["id"] == target));
        return match found {
            Some(visualization) => {
                for (key, value) in changes {
                    if key != "id" {
                        visualization[key.as_str()] = value.clone();
                    }
                }
                (
                    tool_message(format!("Updated visualization {target}")),
                    Some(("updated", visualization.clone())),
                )
            }
            None => (tool_message(format!("No visualization with id '{target}'")), None),
        };
    }

    (tool_message(format!("Unknown tool '{name}'")), None)
}

fn interrupt_event(node: &str, when: &str, reason: &str) -> AgentEvent {
    AgentEvent::tagged(
        StreamMode::Updates,
        json!({ INTERRUPT_KEY: [{ "value": { "node": node, "when": when, "reason": reason } }] }),
    )
}

#[async_trait]
impl AgentRuntime for DiagramOrchestrator {
    fn graph_id(&self) -> &str {
        DIAGRAM_GRAPH_ID
    }

    #[allow(clippy::too_many_lines)]
    async fn stream(&self, input: Value, config: AgentRunConfig) -> anyhow::Result<AgentEventStream> {
        let base = match config.checkpoint_id() {
            Some(id) => Some(
                self.checkpointer
                    .get(&config.thread_id, id)
                    .ok_or_else(|| anyhow::anyhow!("checkpoint '{id}' not found"))?,
            ),
            None => self.checkpointer.latest(&config.thread_id),
        };
        let incoming = input_messages(&input)?;
        let resuming = incoming.is_empty()
            && base.as_ref().is_some_and(|c| c.next.iter().any(|n| n == AGENT_NODE));

        let mut state = base.as_ref().map_or_else(empty_state, |c| c.values.clone());
        let mut parent = base.map(|c| c.id);
        if let Some(list) = state["messages"].as_array_mut() {
            list.extend(incoming);
        }

        let model = Arc::clone(&self.model);
        let checkpointer = Arc::clone(&self.checkpointer);
        let max_steps = self.max_steps;

        let stream = async_stream::try_stream! {
            let thread_id = config.thread_id.clone();
            let meta = |source: &str, step: usize| json!({ "source": source, "step": step, "run_id": config.run_id });

            parent = Some(checkpointer.put(&thread_id, parent.clone(), &state, &[AGENT_NODE], meta("input", 0)));
            if config.wants(StreamMode::Values) {
                yield AgentEvent::tagged(StreamMode::Values, state.clone());
            }

            if !resuming && config.interrupt_before.iter().any(|n| n == AGENT_NODE) {
                yield interrupt_event(AGENT_NODE, "before", "interrupt_before");
                return;
            }

            let mut step = 0;
            loop {
                if config.interrupt.is_cancelled() {
                    yield interrupt_event(AGENT_NODE, "before", "interrupt requested");
                    break;
                }
                step += 1;
                if step > max_steps {
                    Err::<(), anyhow::Error>(anyhow::anyhow!("agent exceeded {max_steps} steps without finishing"))?;
                }

                let history: Vec<Value> = state["messages"].as_array().cloned().unwrap_or_default();
                let mut chunks = model.stream(to_wire(&history), tool_schemas()).await?;

                let message_id = Uuid::new_v4().to_string();
                let mut text = String::new();
                let mut calls: Vec<(String, String, String)> = Vec::new();
                while let Some(chunk) = chunks.next().await {
                    match chunk? {
                        ModelChunk::TextDelta(delta) => {
                            text.push_str(&delta);
                            if config.wants(StreamMode::Messages) {
                                yield AgentEvent::tagged(
                                    StreamMode::Messages,
                                    json!([
                                        { "type": "AIMessageChunk", "content": delta, "id": message_id },
                                        { "langgraph_node": AGENT_NODE, "run_id": config.run_id }
                                    ]),
                                );
                            }
                        }
                        ModelChunk::ToolCall { id, name, arguments_json } => calls.push((id, name, arguments_json)),
                        ModelChunk::Done => break,
                    }
                }

                let mut tool_calls = Vec::with_capacity(calls.len());
                for (id, name, raw_args) in &calls {
                    let args: Value = serde_json::from_str(raw_args).unwrap_or_else(|_| json!({ "raw": raw_args }));
                    tool_calls.push(json!({ "id": id, "name": name, "args": args }));
                }
                let ai = json!({ "type": "ai", "content": text, "id": message_id, "tool_calls": tool_calls });
                if let Some(list) = state["messages"].as_array_mut() {
                    list.push(ai.clone());
                }
                let next: &[&str] = if calls.is_empty() { &[] } else { &[TOOLS_NODE] };
                parent = Some(checkpointer.put(&thread_id, parent.clone(), &state, next, meta("loop", step)));
                if config.wants(StreamMode::Updates) {
                    yield AgentEvent::tagged(StreamMode::Updates, json!({ AGENT_NODE: { "messages": [ai] } }));
                }
                if config.wants(StreamMode::Values) {
                    yield AgentEvent::tagged(StreamMode::Values, state.clone());
                }

                if !calls.is_empty() {
                    let mut tool_messages = Vec::with_capacity(calls.len());
                    for call in &tool_calls {
                        let id = call["id"].as_str().unwrap_or_default().to_string();
                        let name = call["name"].as_str().unwrap_or_default().to_string();
                        let (message, visualization) = run_tool(&mut state, &id, &name, &call["args"]);
                        if let Some((action, visualization)) = visualization
                            && config.wants(StreamMode::Custom)
                        {
                            yield AgentEvent::tagged(
                                StreamMode::Custom,
                                json!({ "type": "visualization", "action": action, "visualization": visualization }),
                            );
                        }
                        tool_messages.push(message);
                    }
                    if let Some(list) = state["messages"].as_array_mut() {
                        list.extend(tool_messages.iter().cloned());
                    }
                    parent = Some(checkpointer.put(&thread_id, parent.clone(), &state, &[AGENT_NODE], meta("loop", step)));
                    if config.wants(StreamMode::Updates) {
                        yield AgentEvent::tagged(StreamMode::Updates, json!({ TOOLS_NODE: { "messages": tool_messages } }));
                    }
                    if config.wants(StreamMode::Values) {
                        yield AgentEvent::tagged(StreamMode::Values, state.clone());
                    }
                }

                if config.interrupt_after.iter().any(|n| n == AGENT_NODE) {
                    yield interrupt_event(AGENT_NODE, "after", "interrupt_after");
                    break;
                }
                if calls.is_empty() {
                    break;
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
        let mut history = self.checkpointer.history(thread_id);
        if let Some(ns) = &query.checkpoint_ns
            && !ns.is_empty()
        {
            // single namespace graph
            history.clear();
        }
        Ok(filter_history(history, query))
    }
}
