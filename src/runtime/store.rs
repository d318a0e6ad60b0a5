//! Persistent store contract and an in-memory reference implementation.
//!
//! The core is storage-agnostic: every operation the runner, dispatcher, and supervisor need is
//! expressed as one `#[async_trait] Store` trait, the same "trait at the seam" pattern the
//! teacher uses for `ClientWrapper` (model providers) and `ToolProtocol` (tool backends). The
//! `InMemoryStore` below is the crate's own reference implementation, used by the integration
//! tests under `tests/` exactly the way the teacher's test suites construct throwaway in-process
//! fixtures rather than mocking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::model::*;

/// Filter for `list_agents` / `list_agents_meta`.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub workspace: Option<WorkspaceId>,
    pub include_deleted: bool,
    pub kinds: Option<Vec<AgentKind>>,
}

/// Result of a bulk operation: affected ids plus a count, so a partial failure still reports
/// what succeeded.
#[derive(Debug, Clone, Default)]
pub struct BulkResult {
    pub affected: Vec<AgentId>,
}

impl BulkResult {
    pub fn count(&self) -> usize {
        self.affected.len()
    }
}

/// Scope selector shared by `bulk_pause_agents` / `bulk_soft_delete_agents` / façade bulk ops.
#[derive(Debug, Clone, Default)]
pub struct AgentScope {
    pub workspace: WorkspaceId,
    pub include_kinds: Option<Vec<AgentKind>>,
    pub exclude_kinds: Option<Vec<AgentKind>>,
}

/// One group's unread batch for a given agent.
#[derive(Debug, Clone)]
pub struct UnreadBatch {
    pub group: GroupId,
    pub messages: Vec<Message>,
}

/// Summary row returned by `list_groups`.
#[derive(Debug, Clone)]
pub struct GroupSummary {
    pub id: GroupId,
    pub name: Option<String>,
    pub kind: GroupKind,
    pub member_ids: Vec<AgentId>,
    pub unread_count: usize,
    pub context_tokens: u64,
    pub last_message: Option<Message>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Arguments for `send_direct_message`.
#[derive(Debug, Clone)]
pub struct SendDirectMessageArgs {
    pub workspace: WorkspaceId,
    pub from: AgentId,
    pub to: AgentId,
    pub content: String,
    pub content_type: String,
    pub group_name: Option<String>,
    pub new_thread: bool,
}

/// Result of `send_direct_message` / the `send`/`send_direct_message` tools.
#[derive(Debug, Clone)]
pub struct SendDirectMessageResult {
    pub channel: Channel,
    pub group: GroupId,
    pub message: MessageId,
    pub send_time: DateTime<Utc>,
}

/// Workspace default rows, created idempotently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceDefaults {
    pub workspace_id: WorkspaceId,
    pub human_agent_id: AgentId,
    pub assistant_agent_id: AgentId,
    pub default_group_id: GroupId,
}

/// The persistent store contract. Every method must be total with the semantics
/// given there; implementations that back a real database must run multi-row operations
/// (`ensure_workspace_defaults`, `merge_duplicate_exact_p2p_groups`, sub-agent + group creation on
/// spawn) inside a transaction.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_agents(&self, filter: AgentFilter) -> RuntimeResult<Vec<Agent>>;
    async fn get_agent(&self, id: AgentId) -> RuntimeResult<Agent>;
    async fn insert_agent(&self, agent: Agent) -> RuntimeResult<()>;
    async fn set_agent_history(&self, id: AgentId, history: Vec<HistoryEntry>) -> RuntimeResult<()>;
    async fn set_agent_auto_run(&self, id: AgentId, enabled: bool) -> RuntimeResult<()>;
    async fn bulk_pause_agents(&self, scope: AgentScope) -> RuntimeResult<BulkResult>;
    async fn bulk_soft_delete_agents(&self, scope: AgentScope) -> RuntimeResult<BulkResult>;

    async fn list_unread_by_group(&self, agent: AgentId) -> RuntimeResult<Vec<UnreadBatch>>;
    async fn mark_group_read(&self, group: GroupId, reader: AgentId) -> RuntimeResult<()>;
    async fn mark_group_read_to_message(
        &self,
        group: GroupId,
        reader: AgentId,
        message_id: MessageId,
    ) -> RuntimeResult<()>;

    async fn send_message(
        &self,
        group: GroupId,
        sender: AgentId,
        content: String,
        content_type: String,
    ) -> RuntimeResult<Message>;
    async fn send_direct_message(
        &self,
        args: SendDirectMessageArgs,
    ) -> RuntimeResult<SendDirectMessageResult>;

    async fn find_latest_exact_p2p_group_id(
        &self,
        workspace: WorkspaceId,
        a: AgentId,
        b: AgentId,
        preferred_name: Option<String>,
    ) -> RuntimeResult<Option<GroupId>>;
    async fn merge_duplicate_exact_p2p_groups(
        &self,
        workspace: WorkspaceId,
        a: AgentId,
        b: AgentId,
        preferred_name: Option<String>,
    ) -> RuntimeResult<GroupId>;
    async fn find_latest_exact_group_id(
        &self,
        workspace: WorkspaceId,
        member_ids: Vec<AgentId>,
    ) -> RuntimeResult<Option<GroupId>>;

    async fn create_group(
        &self,
        workspace: WorkspaceId,
        member_ids: Vec<AgentId>,
        name: Option<String>,
        kind: GroupKind,
    ) -> RuntimeResult<GroupId>;
    async fn add_group_members(&self, group: GroupId, user_ids: Vec<AgentId>) -> RuntimeResult<()>;
    async fn get_group(&self, id: GroupId) -> RuntimeResult<Group>;
    async fn list_groups(
        &self,
        workspace: Option<WorkspaceId>,
        agent_id: Option<AgentId>,
    ) -> RuntimeResult<Vec<GroupSummary>>;
    async fn set_group_context_tokens(&self, group: GroupId, tokens: u64) -> RuntimeResult<()>;

    /// Most recent messages in a group, oldest first, capped at `limit` (most recent `limit` kept)
    /// when given. Used by the task supervisor's repeated-output check and the
    /// `get_group_messages` tool.
    async fn list_group_messages(
        &self,
        group: GroupId,
        limit: Option<usize>,
    ) -> RuntimeResult<Vec<Message>>;

    async fn create_task_run(&self, run: TaskRun) -> RuntimeResult<()>;
    async fn update_task_run(&self, run: TaskRun) -> RuntimeResult<()>;
    async fn get_task_run_by_id(&self, id: TaskRunId) -> RuntimeResult<TaskRun>;
    async fn get_latest_task_run(&self, workspace: WorkspaceId) -> RuntimeResult<Option<TaskRun>>;
    async fn list_running_task_runs(&self) -> RuntimeResult<Vec<TaskRun>>;

    async fn create_task_review(&self, review: TaskReview) -> RuntimeResult<()>;
    async fn get_task_review(&self, task_run_id: TaskRunId) -> RuntimeResult<Option<TaskReview>>;

    async fn soft_delete_orphan_groups(&self, workspace: WorkspaceId) -> RuntimeResult<BulkResult>;
    async fn soft_delete_redundant_system_groups(
        &self,
        workspace: WorkspaceId,
    ) -> RuntimeResult<BulkResult>;

    async fn ensure_workspace_defaults(
        &self,
        workspace: WorkspaceId,
    ) -> RuntimeResult<WorkspaceDefaults>;
}

/// In-memory reference implementation of [`Store`]. Guarded by a single `RwLock` over a plain
/// struct-of-maps, matching the granularity the teacher's `ToolRegistry` uses for its own
/// `Arc<RwLock<_>>`-protected internal state.
#[derive(Default)]
struct Tables {
    agents: HashMap<AgentId, Agent>,
    groups: HashMap<GroupId, Group>,
    messages: HashMap<GroupId, Vec<Message>>,
    task_runs: HashMap<TaskRunId, TaskRun>,
    task_reviews: HashMap<TaskRunId, TaskReview>,
    workspace_defaults: HashMap<WorkspaceId, WorkspaceDefaults>,
}

pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn list_agents(&self, filter: AgentFilter) -> RuntimeResult<Vec<Agent>> {
        let t = self.tables.read().await;
        Ok(t.agents
            .values()
            .filter(|a| filter.workspace.map_or(true, |w| a.workspace == w))
            .filter(|a| filter.include_deleted || !a.is_deleted())
            .filter(|a| filter.kinds.as_ref().map_or(true, |ks| ks.contains(&a.kind)))
            .cloned()
            .collect())
    }

    async fn get_agent(&self, id: AgentId) -> RuntimeResult<Agent> {
        let t = self.tables.read().await;
        match t.agents.get(&id) {
            Some(a) if !a.is_deleted() => Ok(a.clone()),
            _ => Err(RuntimeError::StoreUnavailable(format!(
                "agent {} missing or soft-deleted",
                id
            ))),
        }
    }

    async fn insert_agent(&self, agent: Agent) -> RuntimeResult<()> {
        let mut t = self.tables.write().await;
        t.agents.insert(agent.id, agent);
        Ok(())
    }

    async fn set_agent_history(&self, id: AgentId, history: Vec<HistoryEntry>) -> RuntimeResult<()> {
        let mut t = self.tables.write().await;
        let agent = t
            .agents
            .get_mut(&id)
            .ok_or_else(|| RuntimeError::StoreUnavailable(format!("agent {} missing", id)))?;
        agent.history = history;
        agent.last_active_at = Some(Utc::now());
        Ok(())
    }

    async fn set_agent_auto_run(&self, id: AgentId, enabled: bool) -> RuntimeResult<()> {
        let mut t = self.tables.write().await;
        let agent = t
            .agents
            .get_mut(&id)
            .ok_or_else(|| RuntimeError::StoreUnavailable(format!("agent {} missing", id)))?;
        agent.auto_run = enabled;
        Ok(())
    }

    async fn bulk_pause_agents(&self, scope: AgentScope) -> RuntimeResult<BulkResult> {
        let mut t = self.tables.write().await;
        let mut affected = Vec::new();
        for a in t.agents.values_mut() {
            if a.workspace != scope.workspace || a.is_deleted() || a.kind.is_human() {
                continue;
            }
            if let Some(inc) = &scope.include_kinds {
                if !inc.contains(&a.kind) {
                    continue;
                }
            }
            if let Some(exc) = &scope.exclude_kinds {
                if exc.contains(&a.kind) {
                    continue;
                }
            }
            if a.auto_run {
                a.auto_run = false;
                affected.push(a.id);
            }
        }
        Ok(BulkResult { affected })
    }

    async fn bulk_soft_delete_agents(&self, scope: AgentScope) -> RuntimeResult<BulkResult> {
        let mut t = self.tables.write().await;
        let mut affected = Vec::new();
        let now = Utc::now();
        for a in t.agents.values_mut() {
            if a.workspace != scope.workspace || a.is_deleted() || a.kind.is_human() {
                continue;
            }
            if let Some(inc) = &scope.include_kinds {
                if !inc.contains(&a.kind) {
                    continue;
                }
            }
            if let Some(exc) = &scope.exclude_kinds {
                if exc.contains(&a.kind) {
                    continue;
                }
            }
            a.deleted_at = Some(now);
            a.auto_run = false;
            affected.push(a.id);
        }
        Ok(BulkResult { affected })
    }

    async fn list_unread_by_group(&self, agent: AgentId) -> RuntimeResult<Vec<UnreadBatch>> {
        let t = self.tables.read().await;
        let agent_row = t
            .agents
            .get(&agent)
            .ok_or_else(|| RuntimeError::StoreUnavailable(format!("agent {} missing", agent)))?;
        if agent_row.is_deleted() || !agent_row.auto_run {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for g in t.groups.values() {
            if g.is_deleted() || g.workspace != agent_row.workspace {
                continue;
            }
            let member = match g.members.iter().find(|m| m.agent_id == agent) {
                Some(m) => m,
                None => continue,
            };
            let all_msgs = t.messages.get(&g.id).cloned().unwrap_or_default();
            let after = member.last_read_message_id;
            let unread: Vec<Message> = all_msgs
                .into_iter()
                .filter(|m| m.sender != agent)
                .filter(|m| match after {
                    None => true,
                    Some(cursor) => {
                        // total order within a group is by send_time; a message counts as
                        // unread if its send_time is strictly after the cursor message's.
                        t.messages
                            .get(&g.id)
                            .and_then(|all| all.iter().find(|c| c.id == cursor))
                            .map_or(true, |cursor_msg| m.send_time > cursor_msg.send_time)
                    }
                })
                .collect();
            if !unread.is_empty() {
                out.push(UnreadBatch {
                    group: g.id,
                    messages: unread,
                });
            }
        }
        Ok(out)
    }

    async fn mark_group_read(&self, group: GroupId, reader: AgentId) -> RuntimeResult<()> {
        let mut t = self.tables.write().await;
        let last_id = t.messages.get(&group).and_then(|m| m.last()).map(|m| m.id);
        let g = t
            .groups
            .get_mut(&group)
            .ok_or_else(|| RuntimeError::StoreUnavailable(format!("group {} missing", group)))?;
        if let Some(member) = g.members.iter_mut().find(|m| m.agent_id == reader) {
            member.last_read_message_id = last_id;
        }
        Ok(())
    }

    async fn mark_group_read_to_message(
        &self,
        group: GroupId,
        reader: AgentId,
        message_id: MessageId,
    ) -> RuntimeResult<()> {
        let mut t = self.tables.write().await;
        let g = t
            .groups
            .get_mut(&group)
            .ok_or_else(|| RuntimeError::StoreUnavailable(format!("group {} missing", group)))?;
        if let Some(member) = g.members.iter_mut().find(|m| m.agent_id == reader) {
            member.last_read_message_id = Some(message_id);
        }
        Ok(())
    }

    async fn send_message(
        &self,
        group: GroupId,
        sender: AgentId,
        content: String,
        content_type: String,
    ) -> RuntimeResult<Message> {
        let mut t = self.tables.write().await;
        let g = t
            .groups
            .get(&group)
            .ok_or_else(|| RuntimeError::StoreUnavailable(format!("group {} missing", group)))?;
        if g.is_deleted() {
            return Err(RuntimeError::ToolPermissionDenied(
                "group is deleted".to_string(),
            ));
        }
        if !g.members.iter().any(|m| m.agent_id == sender) {
            return Err(RuntimeError::ToolPermissionDenied("access_denied".to_string()));
        }
        let msg = Message {
            id: Uuid::new_v4(),
            workspace: g.workspace,
            group,
            sender,
            content_type,
            content,
            send_time: Utc::now(),
        };
        t.messages.entry(group).or_default().push(msg.clone());
        Ok(msg)
    }

    async fn send_direct_message(
        &self,
        args: SendDirectMessageArgs,
    ) -> RuntimeResult<SendDirectMessageResult> {
        let existing = if args.new_thread {
            None
        } else {
            self.find_latest_exact_p2p_group_id(
                args.workspace,
                args.from,
                args.to,
                args.group_name.clone(),
            )
            .await?
        };
        let (group, channel) = match existing {
            Some(_) => {
                // A canonical pairwise group already exists (possibly as one of several
                // duplicates). Run the full lookup+rank+pick+migrate+rename procedure rather than
                // just reusing the lookup's answer, so any duplicate loser groups and their
                // messages are folded into the survivor on every send, not just on an explicit
                // merge call.
                let g = self
                    .merge_duplicate_exact_p2p_groups(
                        args.workspace,
                        args.from,
                        args.to,
                        args.group_name.clone(),
                    )
                    .await?;
                (g, Channel::ReuseExistingGroup)
            }
            None => {
                let g = self
                    .create_group(
                        args.workspace,
                        vec![args.from, args.to],
                        args.group_name.clone(),
                        GroupKind::Chat,
                    )
                    .await?;
                (
                    g,
                    if args.new_thread {
                        Channel::NewThread
                    } else {
                        Channel::NewGroup
                    },
                )
            }
        };
        let msg = self
            .send_message(group, args.from, args.content, args.content_type)
            .await?;
        Ok(SendDirectMessageResult {
            channel,
            group,
            message: msg.id,
            send_time: msg.send_time,
        })
    }

    async fn find_latest_exact_p2p_group_id(
        &self,
        workspace: WorkspaceId,
        a: AgentId,
        b: AgentId,
        preferred_name: Option<String>,
    ) -> RuntimeResult<Option<GroupId>> {
        let t = self.tables.read().await;
        let mut candidates: Vec<&Group> = t
            .groups
            .values()
            .filter(|g| {
                g.workspace == workspace
                    && !g.is_deleted()
                    && g.members.len() == 2
                    && g.has_exact_members(&[a, b])
            })
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }
        // rank by (name == preferredName, name is non-null, latest message time, created time, id)
        candidates.sort_by(|x, y| {
            let x_pref = preferred_name.as_deref().map_or(false, |p| x.name.as_deref() == Some(p));
            let y_pref = preferred_name.as_deref().map_or(false, |p| y.name.as_deref() == Some(p));
            let x_last = t.messages.get(&x.id).and_then(|m| m.last()).map(|m| m.send_time);
            let y_last = t.messages.get(&y.id).and_then(|m| m.last()).map(|m| m.send_time);
            y_pref
                .cmp(&x_pref)
                .then(y.name.is_some().cmp(&x.name.is_some()))
                .then(y_last.cmp(&x_last))
                .then(y.created_at.cmp(&x.created_at))
                .then(y.id.cmp(&x.id))
        });
        Ok(Some(candidates[0].id))
    }

    async fn merge_duplicate_exact_p2p_groups(
        &self,
        workspace: WorkspaceId,
        a: AgentId,
        b: AgentId,
        preferred_name: Option<String>,
    ) -> RuntimeResult<GroupId> {
        let keep = self
            .find_latest_exact_p2p_group_id(workspace, a, b, preferred_name.clone())
            .await?
            .ok_or_else(|| {
                RuntimeError::StoreUnavailable("no P2P group to merge".to_string())
            })?;

        let mut t = self.tables.write().await;
        let losers: Vec<GroupId> = t
            .groups
            .values()
            .filter(|g| {
                g.id != keep
                    && g.workspace == workspace
                    && !g.is_deleted()
                    && g.members.len() == 2
                    && g.has_exact_members(&[a, b])
            })
            .map(|g| g.id)
            .collect();

        // Migrate messages from every loser into keep, preserving send-time order, then delete
        // loser rows and memberships.
        let mut keep_msgs = t.messages.remove(&keep).unwrap_or_default();
        for loser in &losers {
            if let Some(mut msgs) = t.messages.remove(loser) {
                for m in &mut msgs {
                    m.group = keep;
                }
                keep_msgs.append(&mut msgs);
            }
            if let Some(g) = t.groups.get_mut(loser) {
                g.deleted_at = Some(Utc::now());
            }
        }
        keep_msgs.sort_by_key(|m| m.send_time);
        t.messages.insert(keep, keep_msgs);

        if let Some(name) = preferred_name {
            if let Some(g) = t.groups.get_mut(&keep) {
                g.name = Some(name);
            }
        }
        Ok(keep)
    }

    async fn find_latest_exact_group_id(
        &self,
        workspace: WorkspaceId,
        member_ids: Vec<AgentId>,
    ) -> RuntimeResult<Option<GroupId>> {
        let t = self.tables.read().await;
        let mut candidates: Vec<&Group> = t
            .groups
            .values()
            .filter(|g| g.workspace == workspace && !g.is_deleted() && g.has_exact_members(&member_ids))
            .collect();
        candidates.sort_by(|x, y| y.created_at.cmp(&x.created_at));
        Ok(candidates.first().map(|g| g.id))
    }

    async fn create_group(
        &self,
        workspace: WorkspaceId,
        member_ids: Vec<AgentId>,
        name: Option<String>,
        kind: GroupKind,
    ) -> RuntimeResult<GroupId> {
        let mut dedup = member_ids.clone();
        dedup.sort();
        dedup.dedup();
        if dedup.len() < 2 {
            return Err(RuntimeError::ToolArgInvalid(
                "createGroup requires >= 2 distinct member ids".to_string(),
            ));
        }
        let mut t = self.tables.write().await;
        let now = Utc::now();
        let id = Uuid::new_v4();
        let members = dedup
            .into_iter()
            .map(|agent_id| GroupMember {
                agent_id,
                last_read_message_id: None,
                joined_at: now,
            })
            .collect();
        t.groups.insert(
            id,
            Group {
                id,
                workspace,
                name,
                kind,
                context_tokens: 0,
                members,
                created_at: now,
                deleted_at: None,
            },
        );
        Ok(id)
    }

    async fn add_group_members(&self, group: GroupId, user_ids: Vec<AgentId>) -> RuntimeResult<()> {
        let mut t = self.tables.write().await;
        let now = Utc::now();
        let g = t
            .groups
            .get_mut(&group)
            .ok_or_else(|| RuntimeError::StoreUnavailable(format!("group {} missing", group)))?;
        for id in user_ids {
            if !g.members.iter().any(|m| m.agent_id == id) {
                g.members.push(GroupMember {
                    agent_id: id,
                    last_read_message_id: None,
                    joined_at: now,
                });
            }
        }
        Ok(())
    }

    async fn get_group(&self, id: GroupId) -> RuntimeResult<Group> {
        let t = self.tables.read().await;
        t.groups
            .get(&id)
            .cloned()
            .ok_or_else(|| RuntimeError::StoreUnavailable(format!("group {} missing", id)))
    }

    async fn list_groups(
        &self,
        workspace: Option<WorkspaceId>,
        agent_id: Option<AgentId>,
    ) -> RuntimeResult<Vec<GroupSummary>> {
        let t = self.tables.read().await;
        let mut out = Vec::new();
        for g in t.groups.values() {
            if g.is_deleted() {
                continue;
            }
            if let Some(w) = workspace {
                if g.workspace != w {
                    continue;
                }
            }
            if let Some(agent) = agent_id {
                if !g.members.iter().any(|m| m.agent_id == agent) {
                    continue;
                }
            }
            let msgs = t.messages.get(&g.id).cloned().unwrap_or_default();
            let last_message = msgs.last().cloned();
            let unread_count = match agent_id {
                Some(agent) => {
                    let cursor = g
                        .members
                        .iter()
                        .find(|m| m.agent_id == agent)
                        .and_then(|m| m.last_read_message_id);
                    match cursor {
                        None => msgs.iter().filter(|m| m.sender != agent).count(),
                        Some(cursor_id) => {
                            let cursor_time =
                                msgs.iter().find(|m| m.id == cursor_id).map(|m| m.send_time);
                            msgs.iter()
                                .filter(|m| m.sender != agent)
                                .filter(|m| cursor_time.map_or(true, |t0| m.send_time > t0))
                                .count()
                        }
                    }
                }
                None => 0,
            };
            let updated_at = last_message
                .as_ref()
                .map(|m| m.send_time.max(g.created_at))
                .unwrap_or(g.created_at);
            out.push(GroupSummary {
                id: g.id,
                name: g.name.clone(),
                kind: g.kind.clone(),
                member_ids: g.active_member_ids(),
                unread_count,
                context_tokens: g.context_tokens,
                last_message,
                updated_at,
                created_at: g.created_at,
            });
        }
        Ok(out)
    }

    async fn set_group_context_tokens(&self, group: GroupId, tokens: u64) -> RuntimeResult<()> {
        let mut t = self.tables.write().await;
        let g = t
            .groups
            .get_mut(&group)
            .ok_or_else(|| RuntimeError::StoreUnavailable(format!("group {} missing", group)))?;
        g.context_tokens = tokens;
        Ok(())
    }

    async fn list_group_messages(
        &self,
        group: GroupId,
        limit: Option<usize>,
    ) -> RuntimeResult<Vec<Message>> {
        let t = self.tables.read().await;
        let mut msgs = t.messages.get(&group).cloned().unwrap_or_default();
        if let Some(limit) = limit {
            if msgs.len() > limit {
                msgs = msgs.split_off(msgs.len() - limit);
            }
        }
        Ok(msgs)
    }

    async fn create_task_run(&self, run: TaskRun) -> RuntimeResult<()> {
        let mut t = self.tables.write().await;
        t.task_runs.insert(run.id, run);
        Ok(())
    }

    async fn update_task_run(&self, run: TaskRun) -> RuntimeResult<()> {
        let mut t = self.tables.write().await;
        t.task_runs.insert(run.id, run);
        Ok(())
    }

    async fn get_task_run_by_id(&self, id: TaskRunId) -> RuntimeResult<TaskRun> {
        let t = self.tables.read().await;
        t.task_runs
            .get(&id)
            .cloned()
            .ok_or_else(|| RuntimeError::StoreUnavailable(format!("task run {} missing", id)))
    }

    async fn get_latest_task_run(&self, workspace: WorkspaceId) -> RuntimeResult<Option<TaskRun>> {
        let t = self.tables.read().await;
        Ok(t.task_runs
            .values()
            .filter(|r| r.workspace == workspace)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn list_running_task_runs(&self) -> RuntimeResult<Vec<TaskRun>> {
        let t = self.tables.read().await;
        Ok(t.task_runs
            .values()
            .filter(|r| matches!(r.status, TaskStatus::Running | TaskStatus::Stopping))
            .cloned()
            .collect())
    }

    async fn create_task_review(&self, review: TaskReview) -> RuntimeResult<()> {
        let mut t = self.tables.write().await;
        t.task_reviews.insert(review.task_run_id, review);
        Ok(())
    }

    async fn get_task_review(&self, task_run_id: TaskRunId) -> RuntimeResult<Option<TaskReview>> {
        let t = self.tables.read().await;
        Ok(t.task_reviews.get(&task_run_id).cloned())
    }

    async fn soft_delete_orphan_groups(&self, workspace: WorkspaceId) -> RuntimeResult<BulkResult> {
        let mut t = self.tables.write().await;
        let deleted_agents: std::collections::HashSet<AgentId> = t
            .agents
            .values()
            .filter(|a| a.is_deleted())
            .map(|a| a.id)
            .collect();
        let mut affected = Vec::new();
        for g in t.groups.values_mut() {
            if g.workspace != workspace || g.is_deleted() {
                continue;
            }
            let active = g
                .members
                .iter()
                .filter(|m| !deleted_agents.contains(&m.agent_id))
                .count();
            if active <= 1 {
                g.deleted_at = Some(Utc::now());
                affected.push(g.id);
            }
        }
        Ok(BulkResult { affected })
    }

    async fn soft_delete_redundant_system_groups(
        &self,
        workspace: WorkspaceId,
    ) -> RuntimeResult<BulkResult> {
        let mut t = self.tables.write().await;
        let kinds: HashMap<AgentId, AgentKind> =
            t.agents.values().map(|a| (a.id, a.kind)).collect();
        let deleted_agents: std::collections::HashSet<AgentId> = t
            .agents
            .values()
            .filter(|a| a.is_deleted())
            .map(|a| a.id)
            .collect();
        let mut affected = Vec::new();
        for g in t.groups.values_mut() {
            if g.workspace != workspace || g.is_deleted() {
                continue;
            }
            let active: Vec<AgentId> = g
                .members
                .iter()
                .filter(|m| !deleted_agents.contains(&m.agent_id))
                .map(|m| m.agent_id)
                .collect();
            let active_count = active.len();
            let orphan = active_count <= 1;
            let all_system = active_count > 0
                && active.iter().all(|id| {
                    matches!(
                        kinds.get(id),
                        Some(AgentKind::SystemHuman) | Some(AgentKind::SystemAssistant)
                    )
                });
            if orphan || all_system {
                g.deleted_at = Some(Utc::now());
                affected.push(g.id);
            }
        }
        Ok(BulkResult { affected })
    }

    async fn ensure_workspace_defaults(
        &self,
        workspace: WorkspaceId,
    ) -> RuntimeResult<WorkspaceDefaults> {
        {
            let t = self.tables.read().await;
            if let Some(defaults) = t.workspace_defaults.get(&workspace) {
                return Ok(defaults.clone());
            }
        }
        let mut t = self.tables.write().await;
        if let Some(defaults) = t.workspace_defaults.get(&workspace) {
            return Ok(defaults.clone());
        }
        let now = Utc::now();
        let human_agent_id = Uuid::new_v4();
        let assistant_agent_id = Uuid::new_v4();
        t.agents.insert(
            human_agent_id,
            Agent {
                id: human_agent_id,
                workspace,
                role: "human".to_string(),
                kind: AgentKind::SystemHuman,
                auto_run: false,
                parent_id: None,
                model_profile_id: None,
                history: Vec::new(),
                created_at: now,
                deleted_at: None,
                last_active_at: None,
            },
        );
        t.agents.insert(
            assistant_agent_id,
            Agent {
                id: assistant_agent_id,
                workspace,
                role: "assistant".to_string(),
                kind: AgentKind::SystemAssistant,
                auto_run: true,
                parent_id: None,
                model_profile_id: None,
                history: Vec::new(),
                created_at: now,
                deleted_at: None,
                last_active_at: None,
            },
        );
        let default_group_id = Uuid::new_v4();
        t.groups.insert(
            default_group_id,
            Group {
                id: default_group_id,
                workspace,
                name: Some("default".to_string()),
                kind: GroupKind::Chat,
                context_tokens: 0,
                members: vec![
                    GroupMember {
                        agent_id: human_agent_id,
                        last_read_message_id: None,
                        joined_at: now,
                    },
                    GroupMember {
                        agent_id: assistant_agent_id,
                        last_read_message_id: None,
                        joined_at: now,
                    },
                ],
                created_at: now,
                deleted_at: None,
            },
        );
        let defaults = WorkspaceDefaults {
            workspace_id: workspace,
            human_agent_id,
            assistant_agent_id,
            default_group_id,
        };
        t.workspace_defaults.insert(workspace, defaults.clone());
        Ok(defaults)
    }
}
