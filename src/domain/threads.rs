use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A persistent conversation owning zero or more runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub thread_id: String,
    pub user_id: String,
    pub assistant_id: Option<String>,
    pub status: ThreadStatus,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn graph_id(&self) -> Option<&str> {
        self.metadata.get("graph_id").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Idle,
    Busy,
    Interrupted,
}

impl ThreadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Interrupted => "interrupted",
        }
    }
}

impl std::str::FromStr for ThreadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(format!("unknown thread status '{other}'")),
        }
    }
}

/// Filter for thread search.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThreadFilter {
    pub status: Option<ThreadStatus>,
    /// Exact-match filter on top-level metadata keys (compared as strings).
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ThreadFilter {
    pub fn matches(&self, thread: &Thread) -> bool {
        if self.status.is_some_and(|s| s != thread.status) {
            return false;
        }
        let Some(wanted) = &self.metadata else {
            return true;
        };
        wanted.iter().all(|(key, value)| {
            thread
                .metadata
                .get(key)
                .is_some_and(|stored| value_as_text(stored) == value_as_text(value))
        })
    }
}

fn value_as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Agent configuration a thread runs against. Built-in assistants are owned
/// by `system` and derived from a registered graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assistant {
    pub assistant_id: String,
    pub graph_id: String,
    pub name: String,
    pub user_id: String,
    pub config: Value,
    pub context: Value,
}

pub const SYSTEM_OWNER: &str = "system";

/// Namespace for deterministic assistant ids derived from graph ids.
pub const ASSISTANT_NAMESPACE: uuid::Uuid =
    uuid::Uuid::from_u128(0x6ba7_b821_9dad_11d1_80b4_00c0_4fd4_30c8);

pub fn assistant_id_for_graph(graph_id: &str) -> String {
    uuid::Uuid::new_v5(&ASSISTANT_NAMESPACE, graph_id.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn thread(metadata: Value) -> Thread {
        Thread {
            thread_id: "t-1".into(),
            user_id: "u-1".into(),
            assistant_id: None,
            status: ThreadStatus::Idle,
            metadata,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_filter_matches_metadata_as_text() {
        let t = thread(json!({ "graph_id": "diagram", "pinned": true }));
        let mut filter = ThreadFilter::default();
        assert!(filter.matches(&t));

        filter.metadata = Some(
            json!({ "graph_id": "diagram", "pinned": "true" })
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert!(filter.matches(&t));

        filter.status = Some(ThreadStatus::Busy);
        assert!(!filter.matches(&t));
    }

    #[test]
    fn test_assistant_ids_are_deterministic() {
        assert_eq!(
            assistant_id_for_graph("diagram_orchestrator"),
            assistant_id_for_graph("diagram_orchestrator")
        );
        assert_ne!(
            assistant_id_for_graph("diagram_orchestrator"),
            assistant_id_for_graph("other")
        );
    }
}
