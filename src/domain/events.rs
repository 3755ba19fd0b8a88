//! Run event model.
//!
//! Agents emit items either as a bare payload or as a `(mode, payload)` pair
//! depending on how they were asked to stream. Everything downstream of the
//! executor (store, broker, output tracking, interrupt detection) works on the
//! normalized [`RunEvent`] shape produced by [`AgentEvent::normalize`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved payload key an agent runtime uses to surface an interrupt.
pub const INTERRUPT_KEY: &str = "__interrupt__";

/// Granularity/category of events a caller can request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Full state snapshots. The only mode that defines a run's output.
    Values,
    /// Per-step state deltas. Interrupt markers arrive here.
    Updates,
    /// Message token deltas.
    #[serde(alias = "messages-tuple")]
    Messages,
    /// Side-channel data emitted by tools (e.g. rendered visualizations).
    Custom,
    Debug,
}

impl StreamMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Values => "values",
            Self::Updates => "updates",
            Self::Messages => "messages",
            Self::Custom => "custom",
            Self::Debug => "debug",
        }
    }
}

impl std::fmt::Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StreamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "values" => Ok(Self::Values),
            "updates" => Ok(Self::Updates),
            // legacy alias
            "messages" | "messages-tuple" => Ok(Self::Messages),
            "custom" => Ok(Self::Custom),
            "debug" => Ok(Self::Debug),
            other => Err(format!("unknown stream mode '{other}'")),
        }
    }
}

/// `stream_mode` as accepted on the wire: a single mode or a list.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum StreamModeRequest {
    One(StreamMode),
    Many(Vec<StreamMode>),
}

impl StreamModeRequest {
    pub fn into_vec(self) -> Vec<StreamMode> {
        match self {
            Self::One(mode) => vec![mode],
            Self::Many(modes) => modes,
        }
    }
}

/// The modes a run was asked for, plus the ones the executor adds on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamModeSelection {
    requested: Vec<StreamMode>,
    implicit_updates: bool,
}

impl StreamModeSelection {
    pub fn resolve(requested: Option<Vec<StreamMode>>, defaults: &[StreamMode]) -> Self {
        let mut modes: Vec<StreamMode> = Vec::new();
        for mode in requested.unwrap_or_else(|| defaults.to_vec()) {
            if !modes.contains(&mode) {
                modes.push(mode);
            }
        }
        let implicit_updates = !modes.contains(&StreamMode::Updates);
        Self {
            requested: modes,
            implicit_updates,
        }
    }

    /// Modes the caller asked for.
    pub fn requested(&self) -> &[StreamMode] {
        &self.requested
    }

    /// Whether `updates` was added only so interrupts can be detected.
    pub fn implicit_updates(&self) -> bool {
        self.implicit_updates
    }

    /// Modes the agent runtime is actually asked to emit.
    pub fn effective(&self) -> Vec<StreamMode> {
        let mut modes = self.requested.clone();
        if self.implicit_updates {
            modes.push(StreamMode::Updates);
        }
        modes
    }
}

/// An item exactly as produced by the agent runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Tagged { mode: StreamMode, data: Value },
    Bare(Value),
}

impl AgentEvent {
    pub fn tagged(mode: StreamMode, data: Value) -> Self {
        Self::Tagged { mode, data }
    }

    /// Bare payloads are full-state snapshots.
    pub fn normalize(self) -> RunEvent {
        match self {
            Self::Tagged { mode, data } => RunEvent { mode, data },
            Self::Bare(data) => RunEvent {
                mode: StreamMode::Values,
                data,
            },
        }
    }
}

/// One atomic unit of agent output in normalized `{mode, data}` form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    pub mode: StreamMode,
    pub data: Value,
}

impl RunEvent {
    pub fn carries_interrupt(&self) -> bool {
        self.data
            .as_object()
            .is_some_and(|map| map.contains_key(INTERRUPT_KEY))
    }

    pub fn is_snapshot(&self) -> bool {
        self.mode == StreamMode::Values
    }
}

/// A run event with its identity and position in the run's sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub run_id: String,
    pub event_id: String,
    pub seq: u64,
    #[serde(flatten)]
    pub event: RunEvent,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(run_id: &str, seq: u64, event: RunEvent) -> Self {
        Self {
            run_id: run_id.to_string(),
            event_id: event_id(run_id, seq),
            seq,
            event,
            created_at: Utc::now(),
        }
    }
}

/// Deterministic id of the `seq`-th (1-based) event of a run.
pub fn event_id(run_id: &str, seq: u64) -> String {
    format!("{run_id}_event_{seq}")
}

/// Sequence number encoded in an event id produced by [`event_id`] for `run_id`.
pub fn event_seq(run_id: &str, event_id: &str) -> Option<u64> {
    event_id
        .strip_prefix(run_id)?
        .strip_prefix("_event_")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_id_round_trip() {
        let id = event_id("run-1", 12);
        assert_eq!(id, "run-1_event_12");
        assert_eq!(event_seq("run-1", &id), Some(12));
        assert_eq!(event_seq("run-2", &id), None);
        assert_eq!(event_seq("run-1", "run-1_event_x"), None);
    }

    #[test]
    fn test_selection_adds_updates_once() {
        let sel = StreamModeSelection::resolve(Some(vec![StreamMode::Values]), &[]);
        assert!(sel.implicit_updates());
        assert_eq!(sel.requested(), &[StreamMode::Values]);
        assert_eq!(sel.effective(), vec![StreamMode::Values, StreamMode::Updates]);

        let explicit = StreamModeSelection::resolve(
            Some(vec![StreamMode::Updates, StreamMode::Values, StreamMode::Updates]),
            &[],
        );
        assert!(!explicit.implicit_updates());
        assert_eq!(
            explicit.effective(),
            vec![StreamMode::Updates, StreamMode::Values]
        );
    }

    #[test]
    fn test_selection_falls_back_to_defaults() {
        let sel = StreamModeSelection::resolve(None, &[StreamMode::Values]);
        assert_eq!(sel.requested(), &[StreamMode::Values]);
    }

    #[test]
    fn test_legacy_alias_normalizes() {
        let req: StreamModeRequest = serde_json::from_value(json!(["messages-tuple", "values"]))
            .unwrap();
        assert_eq!(req.into_vec(), vec![StreamMode::Messages, StreamMode::Values]);
        assert_eq!("messages-tuple".parse::<StreamMode>(), Ok(StreamMode::Messages));

        let single: StreamModeRequest =
            serde_json::from_value(json!("updates")).unwrap();
        assert_eq!(single.into_vec(), vec![StreamMode::Updates]);
    }

    #[test]
    fn test_normalize_and_interrupt_detection() {
        let bare = AgentEvent::Bare(json!({ "messages": [] })).normalize();
        assert!(bare.is_snapshot());

        let interrupt = AgentEvent::tagged(
            StreamMode::Updates,
            json!({ INTERRUPT_KEY: [{ "value": "approve?" }] }),
        )
        .normalize();
        assert!(interrupt.carries_interrupt());
        assert!(!interrupt.is_snapshot());

        let list = AgentEvent::tagged(StreamMode::Messages, json!([INTERRUPT_KEY])).normalize();
        assert!(!list.carries_interrupt());
    }

    #[test]
    fn test_record_serializes_flat() {
        let record = EventRecord::new(
            "r",
            1,
            RunEvent {
                mode: StreamMode::Custom,
                data: json!({ "kind": "mindmap" }),
            },
        );
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["event_id"], "r_event_1");
        assert_eq!(v["mode"], "custom");
        assert_eq!(v["data"]["kind"], "mindmap");
    }
}
