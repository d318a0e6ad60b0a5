//! Persistent data model.
//!
//! These types describe the rows the [`Store`](crate::runtime::store::Store) contract operates
//! over. The core never owns storage — it only depends on this shape plus the store's async
//! trait — matching the teacher's own `ClientWrapper`/`ToolProtocol` seam-by-trait convention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type WorkspaceId = Uuid;
pub type AgentId = Uuid;
pub type GroupId = Uuid;
pub type MessageId = Uuid;
pub type TaskRunId = Uuid;
pub type ModelProfileId = Uuid;

/// Role an agent plays, driving scheduling eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    SystemHuman,
    SystemAssistant,
    Worker,
    GameEphemeral,
}

impl AgentKind {
    /// The façade never invokes model invocation on a `system_human` agent regardless of its
    /// auto-run flag.
    pub fn is_human(&self) -> bool {
        matches!(self, AgentKind::SystemHuman)
    }
}

/// A single entry in an agent's serialized conversational history.
///
/// A tagged sum type rather than duck-typed history entries, so each variant carries exactly
/// the fields its role needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    System { content: String },
    User { content: String },
    Assistant {
        content: String,
        reasoning: Option<String>,
        tool_calls: Vec<PendingToolCall>,
    },
    Tool {
        tool_call_id: String,
        name: String,
        result: serde_json::Value,
    },
}

/// A tool-call stub carried on an assistant history entry, prior to execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments_text: String,
}

/// Agent row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub workspace: WorkspaceId,
    pub role: String,
    pub kind: AgentKind,
    pub auto_run: bool,
    pub parent_id: Option<AgentId>,
    pub model_profile_id: Option<ModelProfileId>,
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_active_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Eligible for façade-driven model invocation: not human, not deleted, auto-run enabled.
    pub fn is_runnable(&self) -> bool {
        !self.kind.is_human() && !self.is_deleted() && self.auto_run
    }
}

/// Group kind; `Game(tag)` groups are driven by an external game-engine loop and are skipped by
/// `wake_agents_for_group`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Chat,
    Game(String),
}

impl GroupKind {
    pub fn is_game(&self) -> bool {
        matches!(self, GroupKind::Game(_))
    }
}

/// Per-member cursor into a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub agent_id: AgentId,
    pub last_read_message_id: Option<MessageId>,
    pub joined_at: DateTime<Utc>,
}

/// Group row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub workspace: WorkspaceId,
    pub name: Option<String>,
    pub kind: GroupKind,
    pub context_tokens: u64,
    pub members: Vec<GroupMember>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Group {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Active (non-soft-deleted) member ids.
    pub fn active_member_ids(&self) -> Vec<AgentId> {
        self.members.iter().map(|m| m.agent_id).collect()
    }

    /// Exact member-set match, order independent — used by P2P canonicalization.
    pub fn has_exact_members(&self, ids: &[AgentId]) -> bool {
        let mut a: Vec<AgentId> = self.active_member_ids();
        let mut b: Vec<AgentId> = ids.to_vec();
        a.sort();
        b.sort();
        a == b
    }
}

/// Message row. Immutable after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub workspace: WorkspaceId,
    pub group: GroupId,
    pub sender: AgentId,
    pub content_type: String,
    pub content: String,
    pub send_time: DateTime<Utc>,
}

/// Reusable upstream model endpoint description. At most one profile per workspace
/// has `default = true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    pub id: ModelProfileId,
    pub workspace: WorkspaceId,
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub api_key: String,
    pub extra_headers: HashMap<String, String>,
    pub default: bool,
}

/// Task run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Stopping,
    Stopped,
    Completed,
}

/// Budget limits fixed at task start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBudget {
    pub max_duration_ms: i64,
    pub max_turns: u64,
    pub max_token_delta: u64,
    pub start_group_tokens: u64,
    /// Thresholds snapshotted at start time so a config change mid-run doesn't retroactively
    /// change behavior (DESIGN.md Open Question 2).
    pub adjacent_similarity_threshold: f32,
    pub repeated_ratio_threshold: f32,
}

/// Live progress metrics, recomputed on every `evaluate`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskMetrics {
    pub total_turns: u64,
    pub total_messages: u64,
    pub repeated_ratio: f32,
    pub last_message_at_ms: i64,
    pub participant_ids: Vec<AgentId>,
}

/// Task run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: TaskRunId,
    pub workspace: WorkspaceId,
    pub root_group: GroupId,
    pub owner: AgentId,
    pub goal: String,
    pub status: TaskStatus,
    pub stop_reason: Option<crate::runtime::error::StopReason>,
    pub budget: TaskBudget,
    pub metrics: TaskMetrics,
    pub summary_message_id: Option<MessageId>,
    pub started_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Quality-review verdict bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Pass,
    Borderline,
    Fail,
}

/// Review score components, each in `[0,100]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewScore {
    pub completion: f32,
    pub relevance: f32,
    pub clarity: f32,
    pub non_redundancy: f32,
    pub safety: f32,
    pub overall: f32,
}

/// An issue surfaced by the quality review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: String,
    pub detail: String,
}

/// Task review row, one per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReview {
    pub task_run_id: TaskRunId,
    pub score: ReviewScore,
    pub verdict: ReviewVerdict,
    pub highlights: Vec<String>,
    pub issues: Vec<ReviewIssue>,
    pub next_actions: Vec<String>,
    pub narrative: String,
    pub created_at: DateTime<Utc>,
}

/// Reason a runner was woken, passed through to `wakeup(reason)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeReason {
    Manual,
    GroupMessage,
    DirectMessage,
    ContextStream,
}

impl std::fmt::Display for WakeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WakeReason::Manual => "manual",
            WakeReason::GroupMessage => "group_message",
            WakeReason::DirectMessage => "direct_message",
            WakeReason::ContextStream => "context_stream",
        };
        write!(f, "{}", s)
    }
}

/// The `channel` classification `sendDirectMessage` resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    NewThread,
    NewGroup,
    ReuseExistingGroup,
}
