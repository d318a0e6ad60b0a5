//! Agent Runner.
//!
//! One logical worker per agent: a re-armable wake signal plus a cooperative interrupt flag,
//! a promise/channel/condition-variable of arity one. Builds on
//! `crate::cloudllm::agent::Agent::send`'s tool-call loop (collect a streamed response, dispatch
//! tool calls, re-enter until none remain or a round cap is hit), generalized from the teacher's
//! 5-round cap down to 3, and from a single conversation to a per-group unread-batch drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::{broadcast, Notify};

use crate::runtime::config::RuntimeConfig;
use crate::runtime::dispatch::{DispatchContext, ToolDispatcher};
use crate::runtime::error::RuntimeResult;
use crate::runtime::event_bus::{AgentStreamEvent, AgentStreamKind, EventBus, UiEventKind};
use crate::runtime::model::*;
use crate::runtime::skill::SkillLoader;
use crate::runtime::store::Store;
use crate::runtime::stream::{collect_stream, ModelClient, StreamDelta, ToolSchema};

const SKILLS_MARKER: &str = "SKILLS:";

/// Resolves the model client an agent's calls should go through: the agent's own profile if
/// fully populated, else a process-wide default. The `Store` contract never lists
/// model-profile CRUD, so profile lookup/resolution is this crate's own pluggable seam rather
/// than a store method.
pub trait ModelClientProvider: Send + Sync {
    fn resolve(&self, profile_id: Option<ModelProfileId>) -> Arc<dyn ModelClient>;
}

/// Lets the runner ask whether the workspace currently has an active task run rooted at a given
/// group, for the Tool Dispatcher's task-mode guard. Implemented by the façade.
pub trait TaskContextProvider: Send + Sync {
    fn active_task_root_group(&self, workspace: WorkspaceId) -> Option<GroupId>;
    fn note_turn(&self, workspace: WorkspaceId, group: GroupId, agent: AgentId);
}

pub struct RunnerDeps {
    pub store: Arc<dyn Store>,
    pub events: Arc<EventBus>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub models: Arc<dyn ModelClientProvider>,
    pub skills: Arc<dyn SkillLoader>,
    pub tasks: Arc<dyn TaskContextProvider>,
    pub config: RuntimeConfig,
}

/// One agent's cooperative worker. Single-threaded per agent by construction: `drain` is only
/// ever invoked from the background loop spawned by [`AgentRunner::spawn`], never concurrently.
pub struct AgentRunner {
    pub agent_id: AgentId,
    pub workspace: WorkspaceId,
    wake: Notify,
    interrupt: AtomicBool,
    started: AtomicBool,
    stream_tx: broadcast::Sender<AgentStreamEvent>,
    deps: RunnerDeps,
}

impl AgentRunner {
    pub fn new(agent_id: AgentId, workspace: WorkspaceId, deps: RunnerDeps) -> Arc<Self> {
        let (stream_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            agent_id,
            workspace,
            wake: Notify::new(),
            interrupt: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stream_tx,
            deps,
        })
    }

    pub fn subscribe_stream(&self) -> broadcast::Receiver<AgentStreamEvent> {
        self.stream_tx.subscribe()
    }

    fn emit(&self, event: AgentStreamEvent) {
        let _ = self.stream_tx.send(event);
    }

    /// Idempotent: sets the wake signal and emits a `wakeup` stream event.
    pub fn wakeup(self: &Arc<Self>, reason: WakeReason) {
        debug!("agent {} wakeup: {}", self.agent_id, reason);
        self.emit(AgentStreamEvent::Wakeup {
            reason: reason.to_string(),
        });
        self.wake.notify_one();
    }

    /// Sets the interrupt flag and pulses the wake signal so a sleeping runner observes it on the
    /// next iteration. Does not synchronously cancel an in-flight stream.
    pub fn request_interrupt(self: &Arc<Self>) {
        self.interrupt.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::SeqCst);
    }

    /// Spawn the runner's background loop: wait to be woken, then drain, forever. Ensures the
    /// loop is only spawned once per runner, matching "runners are never destroyed during normal
    /// operation".
    pub fn spawn(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let runner = self.clone();
        tokio::spawn(async move {
            loop {
                runner.wake.notified().await;
                if let Err(e) = runner.drain().await {
                    warn!("agent {} drain failed: {}", runner.agent_id, e);
                    runner.emit(AgentStreamEvent::Error {
                        message: e.to_string(),
                    });
                }
            }
        });
    }

    /// Drain algorithm: fetch unread batches and consume each through one
    /// model round-trip, re-checking the interrupt flag between groups.
    async fn drain(self: &Arc<Self>) -> RuntimeResult<()> {
        let agent = match self.deps.store.get_agent(self.agent_id).await {
            Ok(a) => a,
            Err(_) => return Ok(()),
        };
        if agent.kind.is_human() || !agent.auto_run || agent.is_deleted() {
            return Ok(());
        }
        if self.interrupted() {
            self.clear_interrupt();
            return Ok(());
        }

        let batches = self.deps.store.list_unread_by_group(self.agent_id).await?;
        if batches.is_empty() {
            return Ok(());
        }

        self.emit(AgentStreamEvent::Unread {
            groups: batches
                .iter()
                .map(|b| (b.group, b.messages.iter().map(|m| m.id).collect()))
                .collect(),
        });

        for batch in batches {
            if self.interrupted() {
                self.clear_interrupt();
                break;
            }
            self.process_group_unread(batch.group, batch.messages).await?;
        }

        self.emit(AgentStreamEvent::Done);
        Ok(())
    }

    fn seed_history_entry(&self, agent: &Agent) -> HistoryEntry {
        let mut content = format!(
            "You are agent {} in workspace {} with role \"{}\". You participate by reading unread \
             messages and, when you have something to contribute, using the available tools — in \
             particular `send`, `send_group_message`, or `send_direct_message` — to produce output \
             other participants can see.",
            agent.id, agent.workspace, agent.role
        );
        if let Some(block) = self.deps.skills.metadata_block() {
            content.push_str("\n\n");
            content.push_str(SKILLS_MARKER);
            content.push('\n');
            content.push_str(&block);
        }
        HistoryEntry::System { content }
    }

    /// processGroupUnread.
    async fn process_group_unread(
        self: &Arc<Self>,
        group_id: GroupId,
        messages: Vec<Message>,
    ) -> RuntimeResult<()> {
        let mut agent = self.deps.store.get_agent(self.agent_id).await?;

        if agent.history.is_empty() {
            agent.history.push(self.seed_history_entry(&agent));
        } else if !agent
            .history
            .iter()
            .any(|e| matches!(e, HistoryEntry::System { content } if content.contains(SKILLS_MARKER)))
        {
            if let Some(block) = self.deps.skills.metadata_block() {
                agent.history.push(HistoryEntry::System {
                    content: format!("{}\n{}", SKILLS_MARKER, block),
                });
            }
        }

        let digest = messages
            .iter()
            .map(|m| format!("[group:{}] {}: {}", group_id, m.sender, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        agent.history.push(HistoryEntry::User { content: digest });

        if let Some(last) = messages.last() {
            self.deps
                .store
                .mark_group_read_to_message(group_id, self.agent_id, last.id)
                .await?;
        }

        let (content, reasoning, did_send) = self
            .run_with_tools(group_id, agent.workspace, &mut agent.history)
            .await?;
        agent.history.push(HistoryEntry::Assistant {
            content,
            reasoning,
            tool_calls: Vec::new(),
        });

        if !did_send && !self.interrupted() {
            agent.history.push(HistoryEntry::User {
                content:
                    "Your last turn produced no external output. If you have something to share, \
                     use send, send_group_message, or send_direct_message."
                        .to_string(),
            });
            let (content2, reasoning2, _) = self
                .run_with_tools(group_id, agent.workspace, &mut agent.history)
                .await?;
            agent.history.push(HistoryEntry::Assistant {
                content: content2,
                reasoning: reasoning2,
                tool_calls: Vec::new(),
            });
        }

        self.deps
            .store
            .set_agent_history(self.agent_id, agent.history)
            .await?;
        self.deps.events.publish(
            self.workspace,
            UiEventKind::AgentHistoryPersisted {
                agent_id: self.agent_id,
            },
        );
        self.deps
            .tasks
            .note_turn(self.workspace, group_id, self.agent_id);
        Ok(())
    }

    /// runWithTools, bounded at `config.max_tool_rounds`.
    async fn run_with_tools(
        self: &Arc<Self>,
        group_id: GroupId,
        workspace: WorkspaceId,
        history: &mut Vec<HistoryEntry>,
    ) -> RuntimeResult<(String, Option<String>, bool)> {
        let agent = self.deps.store.get_agent(self.agent_id).await?;
        let client = self.deps.models.resolve(agent.model_profile_id);
        let tools = ToolDispatcher::tool_schemas();
        let mut did_send = false;
        let mut last_content = String::new();
        let mut last_reasoning: Option<String> = None;

        self.deps.events.publish(
            workspace,
            UiEventKind::AgentLlmStart {
                agent_id: self.agent_id,
            },
        );

        for _round in 0..self.deps.config.max_tool_rounds {
            let snapshot = collect_stream(client.as_ref(), history.as_slice(), &tools, |delta| {
                self.emit_delta(delta);
            })
            .await?;

            last_content = snapshot.content.clone();
            last_reasoning = if snapshot.reasoning_content.is_empty() {
                None
            } else {
                Some(snapshot.reasoning_content.clone())
            };

            if let Some(usage) = snapshot.usage {
                let _ = self
                    .deps
                    .store
                    .set_group_context_tokens(group_id, usage.total_tokens)
                    .await;
            }

            if snapshot.tool_calls.is_empty() {
                break;
            }

            let pending: Vec<PendingToolCall> = snapshot
                .tool_calls
                .iter()
                .enumerate()
                .map(|(i, c)| PendingToolCall {
                    id: c.id.clone().unwrap_or_else(|| format!("call_{}", i)),
                    name: c.name.clone().unwrap_or_default(),
                    arguments_text: c.arguments_text.clone(),
                })
                .collect();
            history.push(HistoryEntry::Assistant {
                content: snapshot.content.clone(),
                reasoning: last_reasoning.clone(),
                tool_calls: pending.clone(),
            });

            let active_group = Some(group_id);
            let task_root_group = self.deps.tasks.active_task_root_group(workspace);
            let ctx = DispatchContext {
                workspace,
                caller: self.agent_id,
                active_group,
                task_root_group,
            };

            for call in &pending {
                let args: serde_json::Value =
                    serde_json::from_str(&call.arguments_text).unwrap_or(serde_json::Value::Null);
                let result = self.deps.dispatcher.dispatch(&ctx, &call.name, args).await;
                let result_json = serde_json::to_value(&result).unwrap_or(serde_json::Value::Null);

                self.emit(AgentStreamEvent::Stream {
                    kind: AgentStreamKind::ToolResult,
                    delta: result_json.to_string(),
                    tool_call_id: Some(call.id.clone()),
                    tool_call_name: Some(call.name.clone()),
                });

                history.push(HistoryEntry::Tool {
                    tool_call_id: call.id.clone(),
                    name: call.name.clone(),
                    result: result_json,
                });

                if matches!(
                    call.name.as_str(),
                    "send" | "send_group_message" | "send_direct_message"
                ) {
                    did_send = true;
                }
            }

            if self.interrupted() {
                break;
            }
        }

        self.deps.events.publish(
            workspace,
            UiEventKind::AgentLlmDone {
                agent_id: self.agent_id,
            },
        );

        Ok((last_content, last_reasoning, did_send))
    }

    fn emit_delta(&self, delta: &StreamDelta) {
        match delta {
            StreamDelta::Start | StreamDelta::Done { .. } => {}
            StreamDelta::Reasoning(s) => self.emit(AgentStreamEvent::Stream {
                kind: AgentStreamKind::Reasoning,
                delta: s.clone(),
                tool_call_id: None,
                tool_call_name: None,
            }),
            StreamDelta::Content(s) => self.emit(AgentStreamEvent::Stream {
                kind: AgentStreamKind::Content,
                delta: s.clone(),
                tool_call_id: None,
                tool_call_name: None,
            }),
            StreamDelta::ToolCall(frag) => self.emit(AgentStreamEvent::Stream {
                kind: AgentStreamKind::ToolCalls,
                delta: frag.arguments_text.clone(),
                tool_call_id: frag.id.clone(),
                tool_call_name: frag.name.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::dispatch::Awakener;
    use crate::runtime::event_bus::EventBus;
    use crate::runtime::skill::NullSkillLoader;
    use crate::runtime::store::InMemoryStore;
    use crate::runtime::stream::{DeltaStream, StreamSnapshot};
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::atomic::AtomicUsize;

    struct NoopAwakener;
    #[async_trait]
    impl Awakener for NoopAwakener {
        async fn wake_agent(&self, _agent: AgentId, _reason: WakeReason) {}
        async fn wake_agents_for_group(&self, _group: GroupId, _sender: AgentId, _content: &str) {}
        async fn ensure_runner(&self, _agent: AgentId) {}
    }

    struct NoopTasks;
    impl TaskContextProvider for NoopTasks {
        fn active_task_root_group(&self, _workspace: WorkspaceId) -> Option<GroupId> {
            None
        }
        fn note_turn(&self, _workspace: WorkspaceId, _group: GroupId, _agent: AgentId) {}
    }

    /// A model client that replies with fixed content and no tool calls, immediately.
    struct EchoClient {
        reply: String,
    }

    #[async_trait]
    impl ModelClient for EchoClient {
        fn model_name(&self) -> &str {
            "echo"
        }
        async fn stream(
            &self,
            _history: &[HistoryEntry],
            _tools: &[ToolSchema],
        ) -> RuntimeResult<DeltaStream> {
            let snapshot = StreamSnapshot {
                content: self.reply.clone(),
                ..Default::default()
            };
            let deltas: Vec<RuntimeResult<StreamDelta>> = vec![
                Ok(StreamDelta::Start),
                Ok(StreamDelta::Content(snapshot.content.clone())),
                Ok(StreamDelta::Done {
                    finish_reason: Some("stop".to_string()),
                    usage: None,
                }),
            ];
            Ok(Box::pin(stream::iter(deltas)))
        }
    }

    struct FixedModelProvider {
        reply: String,
    }
    impl ModelClientProvider for FixedModelProvider {
        fn resolve(&self, _profile_id: Option<ModelProfileId>) -> Arc<dyn ModelClient> {
            Arc::new(EchoClient {
                reply: self.reply.clone(),
            })
        }
    }

    #[tokio::test]
    async fn drain_processes_unread_and_persists_history_without_tool_calls() {
        let store = Arc::new(InMemoryStore::new());
        let ws = uuid::Uuid::new_v4();
        let defaults = store.ensure_workspace_defaults(ws).await.unwrap();

        let worker_id = uuid::Uuid::new_v4();
        store
            .insert_agent(Agent {
                id: worker_id,
                workspace: ws,
                role: "worker".into(),
                kind: AgentKind::Worker,
                auto_run: true,
                parent_id: None,
                model_profile_id: None,
                history: vec![],
                created_at: chrono::Utc::now(),
                deleted_at: None,
                last_active_at: None,
            })
            .await
            .unwrap();
        let group_id = store
            .create_group(ws, vec![worker_id, defaults.human_agent_id], None, GroupKind::Chat)
            .await
            .unwrap();
        store
            .send_message(group_id, defaults.human_agent_id, "hello".into(), "text".into())
            .await
            .unwrap();

        let events = Arc::new(EventBus::new(100));
        let awakener: Arc<dyn Awakener> = Arc::new(NoopAwakener);
        let skills = Arc::new(NullSkillLoader);
        let config = RuntimeConfig::default();
        let dispatcher = Arc::new(ToolDispatcher::new(
            store.clone() as Arc<dyn Store>,
            events.clone(),
            awakener,
            skills.clone(),
            config.clone(),
        ));
        let models: Arc<dyn ModelClientProvider> = Arc::new(FixedModelProvider {
            reply: "acknowledged, no action needed".to_string(),
        });
        let tasks: Arc<dyn TaskContextProvider> = Arc::new(NoopTasks);

        let runner = AgentRunner::new(
            worker_id,
            ws,
            RunnerDeps {
                store: store.clone() as Arc<dyn Store>,
                events,
                dispatcher,
                models,
                skills,
                tasks,
                config,
            },
        );

        runner.drain().await.unwrap();

        let updated = store.get_agent(worker_id).await.unwrap();
        assert!(updated
            .history
            .iter()
            .any(|e| matches!(e, HistoryEntry::User { .. })));
        assert!(updated
            .history
            .iter()
            .any(|e| matches!(e, HistoryEntry::Assistant { .. })));
    }

    #[test]
    fn wakeup_and_interrupt_do_not_panic_without_spawn() {
        let _ = AtomicUsize::new(0);
    }
}
