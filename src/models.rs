use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Actors ────────────────────────────────────────────────────────────

/// Who performed a mutation. Member ids are opaque strings so human
/// members ("user-7") and AI agents ("ai-1") share one id space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub actor_type: ActorType,
}

impl Actor {
    pub fn human(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            actor_type: ActorType::Human,
        }
    }

    pub fn ai(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            actor_type: ActorType::Ai,
        }
    }

    pub fn system() -> Self {
        Self {
            id: "system".to_string(),
            actor_type: ActorType::System,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Human,
    Ai,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Ai => "ai",
            Self::System => "system",
        }
    }
}

impl FromStr for ActorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Self::Human),
            "ai" => Ok(Self::Ai),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid actor type: {}", s)),
        }
    }
}

// ── Lead field enums ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Temperature {
    Cold,
    Warm,
    Hot,
}

impl Temperature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cold => "cold",
            Self::Warm => "warm",
            Self::Hot => "hot",
        }
    }
}

impl FromStr for Temperature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cold" => Ok(Self::Cold),
            "warm" => Ok(Self::Warm),
            "hot" => Ok(Self::Hot),
            _ => Err(format!("Invalid temperature: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    New,
    Active,
    Waiting,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Waiting => "waiting",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "active" => Ok(Self::Active),
            "waiting" => Ok(Self::Waiting),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid conversation status: {}", s)),
        }
    }
}

/// How a lead left the pipeline. Set iff the current stage is marked
/// closed-won or closed-lost.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClosedType {
    Won,
    Lost,
}

impl ClosedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Won => "won",
            Self::Lost => "lost",
        }
    }
}

impl FromStr for ClosedType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "won" => Ok(Self::Won),
            "lost" => Ok(Self::Lost),
            _ => Err(format!("Invalid closed type: {}", s)),
        }
    }
}

// ── Handoff enums ─────────────────────────────────────────────────────

/// Handoff lifecycle: `pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Pending,
    Accepted,
    Rejected,
}

impl HandoffStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl FromStr for HandoffStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid handoff status: {}", s)),
        }
    }
}

// ── Audit enums ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Board,
    Stage,
    Lead,
    Contact,
    Handoff,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Board => "board",
            Self::Stage => "stage",
            Self::Lead => "lead",
            Self::Contact => "contact",
            Self::Handoff => "handoff",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "board" => Ok(Self::Board),
            "stage" => Ok(Self::Stage),
            "lead" => Ok(Self::Lead),
            "contact" => Ok(Self::Contact),
            "handoff" => Ok(Self::Handoff),
            _ => Err(format!("Invalid entity type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Move,
    Assign,
    Handoff,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Move => "move",
            Self::Assign => "assign",
            Self::Handoff => "handoff",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "move" => Ok(Self::Move),
            "assign" => Ok(Self::Assign),
            "handoff" => Ok(Self::Handoff),
            _ => Err(format!("Invalid audit action: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

// ── Dynamic values ────────────────────────────────────────────────────

/// Closed value union for custom fields and audit diffs. Kept deliberately
/// narrower than `serde_json::Value`: no nested arrays or objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Number(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Self::Null,
        }
    }
}

/// Ordered string→value map. `BTreeMap` keeps diff output deterministic.
pub type FieldMap = BTreeMap<String, Value>;

// ── Pipeline entities ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub id: i64,
    pub organization_id: i64,
    pub name: String,
    pub is_default: bool,
    pub display_order: i32,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: i64,
    pub organization_id: i64,
    pub board_id: i64,
    pub name: String,
    pub position: i32,
    pub is_closed_won: bool,
    pub is_closed_lost: bool,
    pub created_at: String,
}

impl Stage {
    /// True if the stage closes the pipeline either way.
    pub fn closed_type(&self) -> Option<ClosedType> {
        if self.is_closed_won {
            Some(ClosedType::Won)
        } else if self.is_closed_lost {
            Some(ClosedType::Lost)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardWithStages {
    pub board: Board,
    pub stages: Vec<Stage>,
}

// ── Leads ─────────────────────────────────────────────────────────────

/// Structured qualification score attached to a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qualification {
    pub score: i32,
    pub budget_confirmed: bool,
    pub decision_maker: bool,
    pub need_identified: bool,
    pub timeline: Option<String>,
}

/// Denormalized projection of a lead's pending handoff. Non-null on the
/// lead iff exactly one `pending` handoff row exists for it; the
/// `handoffs` table is the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffState {
    pub handoff_id: i64,
    pub status: HandoffStatus,
    pub from_member_id: String,
    pub reason: String,
    pub summary: Option<String>,
    pub suggested_actions: Vec<String>,
    pub requested_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    pub organization_id: i64,
    pub title: String,
    pub contact_id: String,
    pub board_id: i64,
    pub stage_id: i64,
    pub assigned_to: Option<String>,
    pub value: f64,
    pub currency: String,
    pub priority: Priority,
    pub temperature: Temperature,
    pub tags: Vec<String>,
    pub qualification: Option<Qualification>,
    pub conversation_status: ConversationStatus,
    pub handoff_state: Option<HandoffState>,
    pub custom_fields: FieldMap,
    pub closed_at: Option<String>,
    pub closed_type: Option<ClosedType>,
    pub created_at: String,
    pub updated_at: String,
}

// ── Handoffs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub id: i64,
    pub organization_id: i64,
    pub lead_id: i64,
    pub from_member_id: String,
    pub to_member_id: Option<String>,
    pub reason: String,
    pub summary: Option<String>,
    pub suggested_actions: Vec<String>,
    pub status: HandoffStatus,
    pub resolution_notes: Option<String>,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

// ── Audit log ─────────────────────────────────────────────────────────

/// Partial before/after field maps. Only fields that actually changed are
/// retained; fields absent from both sides are omitted entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditChanges {
    #[serde(default)]
    pub before: FieldMap,
    #[serde(default)]
    pub after: FieldMap,
}

impl AuditChanges {
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub organization_id: i64,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub action: AuditAction,
    pub actor_id: String,
    pub actor_type: ActorType,
    pub changes: AuditChanges,
    pub description: String,
    pub severity: Severity,
    pub created_at: String,
}

// ── Pagination envelope ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}
