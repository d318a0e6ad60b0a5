//! UI Event Bus.
//!
//! In-process pub/sub, one bounded ring buffer per workspace, monotonically increasing ids,
//! replay-from-id semantics. Builds on the [`crate::cloudllm::event::AgentEvent`] /
//! `EventHandler` callback shape, generalized from a single-agent callback into a buffered,
//! replayable multi-subscriber bus so late-joining UI clients can catch up. A hand-rolled
//! `VecDeque` ring guarded by a `std::sync::Mutex` is used rather than pulling in a broadcast-
//! channel crate purely for a bounded buffer — matching the teacher's preference for explicit,
//! minimal primitives (see `Agent`'s own `Arc<RwLock<_>>`-guarded internal maps).

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::runtime::model::{AgentId, GroupId, MessageId, TaskRunId, WorkspaceId};

/// Names of the workspace-scoped UI events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "name", content = "payload")]
pub enum UiEventKind {
    #[serde(rename = "ui.agent.created")]
    AgentCreated { agent_id: AgentId },
    #[serde(rename = "ui.group.created")]
    GroupCreated { group_id: GroupId },
    #[serde(rename = "ui.message.created")]
    MessageCreated {
        group_id: GroupId,
        sender_id: AgentId,
        member_ids: Vec<AgentId>,
        message_id: MessageId,
    },
    #[serde(rename = "ui.agent.llm.start")]
    AgentLlmStart { agent_id: AgentId },
    #[serde(rename = "ui.agent.llm.done")]
    AgentLlmDone { agent_id: AgentId },
    #[serde(rename = "ui.agent.history.persisted")]
    AgentHistoryPersisted { agent_id: AgentId },
    #[serde(rename = "ui.agent.tool_call.start")]
    AgentToolCallStart { agent_id: AgentId, tool_name: String },
    #[serde(rename = "ui.agent.tool_call.done")]
    AgentToolCallDone {
        agent_id: AgentId,
        tool_name: String,
        ok: bool,
    },
    #[serde(rename = "ui.agent.interrupt_all")]
    AgentInterruptAll,
    #[serde(rename = "ui.agent.terminate_all")]
    AgentTerminateAll,
    #[serde(rename = "ui.agent.delete_all")]
    AgentDeleteAll,
    #[serde(rename = "ui.agent.autorun.changed")]
    AgentAutorunChanged { agent_id: AgentId, auto_run: bool },
    #[serde(rename = "ui.agent.deleted")]
    AgentDeleted { agent_id: AgentId },
    #[serde(rename = "ui.task.started")]
    TaskStarted { task_run_id: TaskRunId },
    #[serde(rename = "ui.task.progress")]
    TaskProgress { task_run_id: TaskRunId },
    #[serde(rename = "ui.task.stopping")]
    TaskStopping { task_run_id: TaskRunId },
    #[serde(rename = "ui.task.stopped")]
    TaskStopped { task_run_id: TaskRunId },
    #[serde(rename = "ui.task.summary.created")]
    TaskSummaryCreated { task_run_id: TaskRunId },
    #[serde(rename = "ui.task.review.created")]
    TaskReviewCreated { task_run_id: TaskRunId },
    #[serde(rename = "ui.db.write")]
    DbWrite { table: String },
}

/// A bus-assigned envelope: id and at-timestamp are assigned by the bus, never by the producer.
#[derive(Debug, Clone, Serialize)]
pub struct UiEvent {
    pub id: u64,
    pub at: chrono::DateTime<chrono::Utc>,
    pub event: UiEventKind,
}

struct Ring {
    buf: VecDeque<UiEvent>,
    next_id: u64,
    capacity: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            next_id: 1,
            capacity,
        }
    }

    fn push(&mut self, event: UiEventKind) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.buf.push_back(UiEvent {
            id,
            at: chrono::Utc::now(),
            event,
        });
        while self.buf.len() > self.capacity {
            self.buf.pop_front();
        }
        id
    }

    fn replay_from(&self, after_id: u64) -> Vec<UiEvent> {
        self.buf
            .iter()
            .filter(|e| e.id > after_id)
            .cloned()
            .collect()
    }
}

/// Per-workspace bounded event bus. `publish` never blocks on a slow subscriber because there is
/// no subscriber push model here — subscribers pull via `replay_from`, so missing events can
/// always be recovered by replaying from an afterId index.
pub struct EventBus {
    capacity: usize,
    rings: Mutex<HashMap<WorkspaceId, Ring>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            rings: Mutex::new(HashMap::new()),
        }
    }

    /// Publish an event to a workspace's ring, returning its assigned id.
    pub fn publish(&self, workspace: WorkspaceId, event: UiEventKind) -> u64 {
        let mut rings = self.rings.lock().unwrap();
        let ring = rings
            .entry(workspace)
            .or_insert_with(|| Ring::new(self.capacity));
        ring.push(event)
    }

    /// Replay every retained event with id strictly greater than `after_id`, in monotonic id
    /// order (oldest first).
    pub fn replay_from(&self, workspace: WorkspaceId, after_id: u64) -> Vec<UiEvent> {
        let rings = self.rings.lock().unwrap();
        match rings.get(&workspace) {
            Some(ring) => ring.replay_from(after_id),
            None => Vec::new(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(2000)
    }
}

/// Kind of a per-agent stream event, destined for the HTTP layer serving one agent's real-time
/// feed. `agent.stream` deltas are further tagged by [`AgentStreamKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStreamKind {
    Content,
    Reasoning,
    ToolCalls,
    ToolResult,
}

/// One event on an agent's per-agent stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum AgentStreamEvent {
    #[serde(rename = "agent.wakeup")]
    Wakeup { reason: String },
    #[serde(rename = "agent.unread")]
    Unread { groups: Vec<(GroupId, Vec<MessageId>)> },
    #[serde(rename = "agent.stream")]
    Stream {
        kind: AgentStreamKind,
        delta: String,
        tool_call_id: Option<String>,
        tool_call_name: Option<String>,
    },
    #[serde(rename = "agent.done")]
    Done,
    #[serde(rename = "agent.error")]
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn replay_yields_only_events_after_cursor_in_order() {
        let bus = EventBus::new(10);
        let ws = Uuid::new_v4();
        let agent = Uuid::new_v4();
        let id1 = bus.publish(ws, UiEventKind::AgentCreated { agent_id: agent });
        let id2 = bus.publish(ws, UiEventKind::AgentLlmStart { agent_id: agent });
        let _id3 = bus.publish(ws, UiEventKind::AgentLlmDone { agent_id: agent });

        let replayed = bus.replay_from(ws, id1);
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].id, id2);
        assert!(replayed.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn ring_drops_oldest_beyond_capacity() {
        let bus = EventBus::new(2);
        let ws = Uuid::new_v4();
        let agent = Uuid::new_v4();
        bus.publish(ws, UiEventKind::AgentCreated { agent_id: agent });
        bus.publish(ws, UiEventKind::AgentLlmStart { agent_id: agent });
        let last = bus.publish(ws, UiEventKind::AgentLlmDone { agent_id: agent });

        let replayed = bus.replay_from(ws, 0);
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed.last().unwrap().id, last);
    }

    #[test]
    fn separate_workspaces_have_independent_rings() {
        let bus = EventBus::new(10);
        let ws_a = Uuid::new_v4();
        let ws_b = Uuid::new_v4();
        let agent = Uuid::new_v4();
        bus.publish(ws_a, UiEventKind::AgentCreated { agent_id: agent });
        assert!(bus.replay_from(ws_b, 0).is_empty());
        assert_eq!(bus.replay_from(ws_a, 0).len(), 1);
    }
}
