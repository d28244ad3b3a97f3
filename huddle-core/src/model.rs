//! Wire types shared across rooms, presence, memory and actions (§3, §6).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Current event schema version (§3 Event). Rows with `v` greater than this are rejected.
pub const EVENT_SCHEMA_VERSION: i64 = 1;

/// Event types accepted by [`crate::storage::parse_event_line`].
pub const EVENT_ALLOWED_TYPES: [&str; 5] = ["chat", "me", "system", "ai_prompt", "ai_response"];

/// One append-only message row (§3 Event).
///
/// Unknown fields round-trip through `extra` so that forward-compatible readers
/// never drop data a newer writer attached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub v: i64,
    pub ts: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub author: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub memory_ids_used: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub memory_topics_used: Vec<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Event {
    /// Builds a minimal event with the current schema version; timestamp/author/text are
    /// caller-supplied, everything else defaults to empty.
    pub fn new(kind: impl Into<String>, author: impl Into<String>, text: impl Into<String>, ts: impl Into<String>) -> Self {
        Self {
            v: EVENT_SCHEMA_VERSION,
            ts: ts.into(),
            kind: kind.into(),
            author: author.into(),
            text: text.into(),
            provider: None,
            model: None,
            request_id: None,
            memory_ids_used: Vec::new(),
            memory_topics_used: Vec::new(),
            extra: HashMap::new(),
        }
    }
}

/// Liveness record for one (peer, room) pair (§3 Presence entry).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceEntry {
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub status: String,
    pub client_id: String,
    pub room: String,
    /// Unix seconds; the authoritative liveness clock is the file mtime, but this field
    /// lets cross-room aggregation compare two entries without re-statting the file.
    pub last_seen: f64,
}

/// Confidence tag for a [`MemoryEntry`] (§3 MemoryEntry).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Med,
    High,
}

impl Confidence {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(Confidence::Low),
            "med" => Some(Confidence::Med),
            "high" => Some(Confidence::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Med => "med",
            Confidence::High => "high",
        }
    }
}

/// Storage partition selector for a [`MemoryEntry`] (§3 MemoryEntry, Glossary "Scope").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MemoryScope {
    Private,
    Repo,
    Team,
}

impl MemoryScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "private" => Some(MemoryScope::Private),
            "repo" => Some(MemoryScope::Repo),
            "team" => Some(MemoryScope::Team),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryScope::Private => "private",
            MemoryScope::Repo => "repo",
            MemoryScope::Team => "team",
        }
    }
}

/// A retained, reusable fact (§3 MemoryEntry). Append-only; never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    pub id: String,
    pub ts: String,
    pub author: String,
    pub summary: String,
    pub topic: String,
    pub confidence: String,
    pub source: String,
    pub room: String,
    #[serde(default)]
    pub origin_event_ref: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub scope: String,
}

/// Tool-use policy embedded in an [`AgentProfile`] (§3 AgentProfile).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolPolicy {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

/// Memory-scope policy embedded in an [`AgentProfile`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryPolicy {
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// One routed destination: `{provider, model}` for a task class.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouteTarget {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
}

/// Task-class routing table embedded in an [`AgentProfile`] (§4.7).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoutingPolicy {
    #[serde(default)]
    pub routes: HashMap<String, RouteTarget>,
}

/// Persisted agent configuration: prompt plus tool/memory/routing policy (§3 AgentProfile).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub tool_policy: ToolPolicy,
    #[serde(default)]
    pub memory_policy: MemoryPolicy,
    #[serde(default)]
    pub routing_policy: RoutingPolicy,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub updated_by: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub version: u64,
}

impl AgentProfile {
    /// The profile materialized on first start (§4.10).
    pub fn default_profile(created_by: impl Into<String>, now: impl Into<String>) -> Self {
        let created_by = created_by.into();
        let now = now.into();
        Self {
            id: "default".to_string(),
            name: "Default".to_string(),
            description: "Default agent profile.".to_string(),
            system_prompt: String::new(),
            tool_policy: ToolPolicy::default(),
            memory_policy: MemoryPolicy {
                scopes: vec!["team".to_string()],
            },
            routing_policy: RoutingPolicy::default(),
            created_by: created_by.clone(),
            updated_by: created_by,
            updated_at: now,
            version: 1,
        }
    }
}

/// Lifecycle states for a [`ToolAction`] (§3 ToolAction).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Approved,
    Denied,
    Running,
    Completed,
    Failed,
    Expired,
}

impl ActionStatus {
    /// Terminal states are never re-entered (§3 invariant, §8 property 6).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Denied | ActionStatus::Completed | ActionStatus::Failed | ActionStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Approved => "approved",
            ActionStatus::Denied => "denied",
            ActionStatus::Running => "running",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ActionStatus::Pending),
            "approved" => Some(ActionStatus::Approved),
            "denied" => Some(ActionStatus::Denied),
            "running" => Some(ActionStatus::Running),
            "completed" => Some(ActionStatus::Completed),
            "failed" => Some(ActionStatus::Failed),
            "expired" => Some(ActionStatus::Expired),
            _ => None,
        }
    }
}

/// An approval-gated, validated tool invocation (§3 ToolAction).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolAction {
    pub action_id: String,
    pub ts: String,
    pub user: String,
    pub agent_profile: String,
    pub tool: String,
    pub summary: String,
    pub command_preview: String,
    pub risk_level: String,
    pub status: String,
    #[serde(default)]
    pub inputs: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    /// Unix seconds after which approval is refused (§3 invariant, §8 property 7).
    pub expires_at: i64,
    pub ttl_seconds: i64,
}

impl ToolAction {
    pub fn status(&self) -> ActionStatus {
        ActionStatus::parse(&self.status).unwrap_or(ActionStatus::Failed)
    }
}

/// Outcome of one tool execution, appended to the actions audit log (§4.8 Execute).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolActionResult {
    pub action_id: String,
    pub ts: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub truncated: bool,
    pub output_preview: String,
}
