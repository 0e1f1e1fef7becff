use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{SyncError, SyncResult};

/// Event kind used by the backend for messages posted into a group chat.
pub const GROUP_MESSAGE_KIND: &str = "chat_group";

// ============================================================================
// Wire helpers
// ============================================================================

/// Ids arrive as strings (uuids) or integers depending on the endpoint.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Str(String),
    Num(serde_json::Number),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Str(s) => s,
            RawId::Num(n) => n.to_string(),
        }
    }
}

fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    RawId::deserialize(d).map(String::from)
}

fn de_opt_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<RawId>::deserialize(d)?.map(String::from))
}

fn de_id_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<RawId>>::deserialize(d)?
        .unwrap_or_default()
        .into_iter()
        .map(String::from)
        .collect())
}

/// Parse an RFC 3339 timestamp, or a naive ISO-8601 one interpreted as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

fn de_opt_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    match Option::<String>::deserialize(d)? {
        None => Ok(None),
        Some(s) => parse_timestamp(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {s}"))),
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub actor_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub target_id: Option<String>,
    #[serde(default, alias = "text")]
    pub description: String,
    /// Raw metadata; the backend sends it either as an object or as a
    /// JSON-encoded string.
    #[serde(rename = "metadata_json", alias = "metadata", default)]
    pub metadata: Option<Value>,
}

impl Event {
    /// Ordering key: timestamp first (missing sorts first), id breaks ties.
    pub fn sort_key(&self) -> (Option<DateTime<Utc>>, &str) {
        (self.timestamp, self.id.as_str())
    }

    pub fn is_group_message(&self) -> bool {
        self.kind.as_deref() == Some(GROUP_MESSAGE_KIND)
    }

    /// Conversation id carried in the metadata (`group_chat_id`), if any.
    pub fn conversation_id(&self) -> Option<String> {
        let parsed;
        let meta = match self.metadata.as_ref()? {
            Value::String(raw) => {
                parsed = serde_json::from_str::<Value>(raw).ok()?;
                &parsed
            }
            other => other,
        };
        match meta.get("group_chat_id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Sort events ascending by timestamp, id breaking ties. Stable.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

// ============================================================================
// Agents
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMemory {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    pub description: String,
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(default, alias = "with")]
    pub partner: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub name: String,
    /// In `[0, 1]`.
    #[serde(default)]
    pub mood: f64,
    /// In `[0, 100]`.
    #[serde(default)]
    pub energy: f64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub persona: Option<String>,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub memories: Vec<AgentMemory>,
    #[serde(default)]
    pub plans: Vec<Plan>,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
}

/// Partial agent update: only the fields present overwrite the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentPatch {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traits: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memories: Option<Vec<AgentMemory>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plans: Option<Vec<Plan>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interactions: Option<Vec<Interaction>>,
}

impl AgentPatch {
    /// Shallow merge over `agent`. Applying the same patch twice is a no-op
    /// the second time.
    pub fn apply(&self, agent: &mut Agent) {
        if let Some(ref name) = self.name {
            agent.name = name.clone();
        }
        if let Some(mood) = self.mood {
            agent.mood = mood;
        }
        if let Some(energy) = self.energy {
            agent.energy = energy;
        }
        if let Some(ref status) = self.status {
            agent.status = Some(status.clone());
        }
        if let Some(ref traits) = self.traits {
            agent.traits = traits.clone();
        }
        if let Some(ref persona) = self.persona {
            agent.persona = Some(persona.clone());
        }
        if let Some(ref task) = self.current_task {
            agent.current_task = Some(task.clone());
        }
        if let Some(ref memories) = self.memories {
            agent.memories = memories.clone();
        }
        if let Some(ref plans) = self.plans {
            agent.plans = plans.clone();
        }
        if let Some(ref interactions) = self.interactions {
            agent.interactions = interactions.clone();
        }
    }
}

// ============================================================================
// Relations
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    #[serde(deserialize_with = "de_id")]
    pub source: String,
    #[serde(deserialize_with = "de_id")]
    pub target: String,
    /// In `[-1, 1]`.
    pub affinity: f64,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_strength() -> f64 {
    1.0
}

/// `relation_changed` carries either the full recomputed set or a single
/// relation; both replace the cache wholesale.
#[derive(Deserialize)]
#[serde(untagged)]
enum RelationSet {
    Many(Vec<Relation>),
    One(Relation),
}

impl From<RelationSet> for Vec<Relation> {
    fn from(set: RelationSet) -> Self {
        match set {
            RelationSet::Many(all) => all,
            RelationSet::One(one) => vec![one],
        }
    }
}

// ============================================================================
// Conversations (group chats)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "de_id_list")]
    pub agent_ids: Vec<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

// ============================================================================
// Connection status
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Push messages
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Inbound push message, closed over the kinds the dashboard understands.
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    EventCreated(Event),
    AgentUpdate(AgentPatch),
    RelationChanged(Vec<Relation>),
    /// Any other `type`; ignored by dispatch.
    Unknown { kind: String },
}

impl PushMessage {
    pub fn parse(text: &str) -> SyncResult<Self> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| SyncError::Parse(e.to_string()))?;
        let data = envelope.data;
        let parse_err = |kind: &str, e: serde_json::Error| SyncError::Parse(format!("{kind}: {e}"));

        Ok(match envelope.kind.as_str() {
            "event_created" => PushMessage::EventCreated(
                serde_json::from_value(data).map_err(|e| parse_err("event_created", e))?,
            ),
            "agent_update" => PushMessage::AgentUpdate(
                serde_json::from_value(data).map_err(|e| parse_err("agent_update", e))?,
            ),
            "relation_changed" => PushMessage::RelationChanged(
                serde_json::from_value::<RelationSet>(data)
                    .map_err(|e| parse_err("relation_changed", e))?
                    .into(),
            ),
            _ => PushMessage::Unknown {
                kind: envelope.kind,
            },
        })
    }

    pub fn kind(&self) -> &str {
        match self {
            PushMessage::EventCreated(_) => "event_created",
            PushMessage::AgentUpdate(_) => "agent_update",
            PushMessage::RelationChanged(_) => "relation_changed",
            PushMessage::Unknown { kind } => kind,
        }
    }
}

// ============================================================================
// Collaborator request/response types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CreateAgentRequest {
    pub name: String,
    pub mood: f64,
    pub energy: f64,
    pub traits: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
}

impl CreateAgentRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mood: 0.5,
            energy: 80.0,
            traits: vec![],
            persona: None,
            current_task: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagePayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ControlRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ControlAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationStatus {
    pub speed: f64,
    pub is_paused: bool,
    #[serde(default)]
    pub tick_seconds: f64,
}
