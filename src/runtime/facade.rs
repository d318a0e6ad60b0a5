//! Runtime Façade.
//!
//! The single process-wide entry point that owns every per-agent [`AgentRunner`], the one
//! [`ToolDispatcher`], and the one [`TaskSupervisor`] for the process. Breaks a circular
//! construction problem: the dispatcher needs an [`Awakener`] that is the façade, the supervisor
//! needs a [`TaskRunnerControl`] that is the façade, and every runner needs a
//! [`TaskContextProvider`] that is the façade too, while the façade itself needs to hold the
//! dispatcher and the supervisor. Since the façade's constructed children hold their link to it
//! directly, it reaches for `Arc::new_cyclic`, handing out a `Weak` through [`FacadeHandle`] until
//! its own `Arc` exists.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use log::warn;

use crate::runtime::config::RuntimeConfig;
use crate::runtime::dispatch::{Awakener, ToolDispatcher};
use crate::runtime::error::{RuntimeResult, StopReason};
use crate::runtime::event_bus::{EventBus, UiEventKind};
use crate::runtime::model::*;
use crate::runtime::runner::{AgentRunner, ModelClientProvider, RunnerDeps, TaskContextProvider};
use crate::runtime::skill::SkillLoader;
use crate::runtime::store::{AgentFilter, AgentScope, BulkResult, Store};
use crate::runtime::supervisor::{StartTaskParams, TaskRunnerControl, TaskSupervisor};

/// Delegates the three seam traits back to the façade through a `Weak` reference, so the façade
/// never has to hand out a strong self-reference during its own construction.
struct FacadeHandle(Weak<RuntimeFacade>);

impl FacadeHandle {
    fn strong(&self) -> Arc<RuntimeFacade> {
        self.0
            .upgrade()
            .expect("FacadeHandle outlived the RuntimeFacade it points to")
    }
}

#[async_trait]
impl Awakener for FacadeHandle {
    async fn wake_agent(&self, agent: AgentId, reason: WakeReason) {
        self.strong().wake_agent(agent, reason).await;
    }

    async fn wake_agents_for_group(&self, group: GroupId, sender: AgentId, content: &str) {
        self.strong().wake_agents_for_group(group, sender, content).await;
    }

    async fn ensure_runner(&self, agent: AgentId) {
        self.strong().ensure_runner(agent).await;
    }
}

impl TaskContextProvider for FacadeHandle {
    fn active_task_root_group(&self, workspace: WorkspaceId) -> Option<GroupId> {
        self.strong().supervisor.active_task_root_group(workspace)
    }

    /// Fire-and-forget: `noteTurn` is async on the supervisor but this trait's boundary (called
    /// from inside the runner's synchronous history-append path) must not await.
    fn note_turn(&self, workspace: WorkspaceId, group: GroupId, agent: AgentId) {
        let facade = self.strong();
        tokio::spawn(async move {
            facade.supervisor.note_turn(workspace, group, agent).await;
        });
    }
}

impl TaskRunnerControl for FacadeHandle {
    fn interrupt_agent(&self, agent: AgentId) {
        self.strong().interrupt_agent(agent);
    }
}

/// Process-wide singleton coordinating every agent runner, the tool dispatcher, and the task
/// supervisor.
pub struct RuntimeFacade {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    models: Arc<dyn ModelClientProvider>,
    skills: Arc<dyn SkillLoader>,
    config: RuntimeConfig,
    runners: Mutex<HashMap<AgentId, Arc<AgentRunner>>>,
    dispatcher: Arc<ToolDispatcher>,
    supervisor: Arc<TaskSupervisor>,
    handle: Arc<FacadeHandle>,
}

impl RuntimeFacade {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<EventBus>,
        models: Arc<dyn ModelClientProvider>,
        skills: Arc<dyn SkillLoader>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let handle = Arc::new(FacadeHandle(weak.clone()));
            let dispatcher = Arc::new(ToolDispatcher::new(
                store.clone(),
                events.clone(),
                handle.clone() as Arc<dyn Awakener>,
                skills.clone(),
                config.clone(),
            ));
            let supervisor = TaskSupervisor::new(
                store.clone(),
                events.clone(),
                models.clone(),
                handle.clone() as Arc<dyn TaskRunnerControl>,
                config.clone(),
            );
            RuntimeFacade {
                store,
                events,
                models,
                skills,
                config,
                runners: Mutex::new(HashMap::new()),
                dispatcher,
                supervisor,
                handle,
            }
        })
    }

    /// Bootstrap: scan every non-human, auto-run agent across all workspaces and
    /// ensure a runner exists for it, then rehydrate in-flight task runs.
    pub async fn bootstrap(&self) -> RuntimeResult<()> {
        let agents = self
            .store
            .list_agents(AgentFilter {
                workspace: None,
                include_deleted: false,
                kinds: None,
            })
            .await?;
        for agent in agents {
            if agent.is_runnable() {
                self.ensure_runner(agent.id).await;
            }
        }
        self.supervisor.bootstrap().await
    }

    /// Lazily construct and spawn an agent's runner if it doesn't exist yet. Runners are never
    /// destroyed during normal operation — only ever created once.
    pub async fn ensure_runner(&self, agent: AgentId) {
        if self.runners.lock().unwrap().contains_key(&agent) {
            return;
        }
        let agent_row = match self.store.get_agent(agent).await {
            Ok(a) => a,
            Err(e) => {
                warn!("ensure_runner: cannot load agent {}: {}", agent, e);
                return;
            }
        };
        let deps = RunnerDeps {
            store: self.store.clone(),
            events: self.events.clone(),
            dispatcher: self.dispatcher.clone(),
            models: self.models.clone(),
            skills: self.skills.clone(),
            tasks: self.handle.clone() as Arc<dyn TaskContextProvider>,
            config: self.config.clone(),
        };
        let runner = AgentRunner::new(agent, agent_row.workspace, deps);
        runner.spawn();
        self.runners.lock().unwrap().entry(agent).or_insert(runner);
    }

    /// Wake one agent's runner, creating it first if needed.
    pub async fn wake_agent(&self, agent: AgentId, reason: WakeReason) {
        self.ensure_runner(agent).await;
        let runner = self.runners.lock().unwrap().get(&agent).cloned();
        if let Some(runner) = runner {
            runner.wakeup(reason);
        }
    }

    /// Notify the task supervisor of the new message, then wake every other runnable, non-game
    /// member of the group.
    pub async fn wake_agents_for_group(&self, group: GroupId, sender: AgentId, content: &str) {
        let group_row = match self.store.get_group(group).await {
            Ok(g) => g,
            Err(_) => return,
        };
        self.supervisor
            .note_message(group_row.workspace, group, sender, content)
            .await;
        if group_row.kind.is_game() {
            return;
        }
        for member in group_row.active_member_ids() {
            if member == sender {
                continue;
            }
            let agent = match self.store.get_agent(member).await {
                Ok(a) => a,
                Err(_) => continue,
            };
            if !agent.is_runnable() {
                continue;
            }
            self.wake_agent(member, WakeReason::GroupMessage).await;
        }
    }

    /// Synchronous interrupt: request a runner unwind on its next check, if it exists.
    pub fn interrupt_agent(&self, agent: AgentId) {
        let runner = self.runners.lock().unwrap().get(&agent).cloned();
        if let Some(runner) = runner {
            runner.request_interrupt();
        }
    }

    /// `interruptAll(workspace)`: interrupt every non-human runner in the workspace.
    pub async fn interrupt_all(&self, workspace: WorkspaceId) -> RuntimeResult<()> {
        self.interrupt_scoped(workspace, None, None).await
    }

    /// Interrupt every non-human runner in the workspace, optionally narrowed to
    /// `includeKinds`/`excludeKinds`. Backs both `interruptAll` and the scoped interrupt half of
    /// `terminateAll`, so a kind-scoped termination never touches runners outside its scope.
    async fn interrupt_scoped(
        &self,
        workspace: WorkspaceId,
        include_kinds: Option<&[AgentKind]>,
        exclude_kinds: Option<&[AgentKind]>,
    ) -> RuntimeResult<()> {
        let agents = self
            .store
            .list_agents(AgentFilter {
                workspace: Some(workspace),
                include_deleted: false,
                kinds: None,
            })
            .await?;
        for a in &agents {
            if a.kind.is_human() {
                continue;
            }
            if let Some(inc) = include_kinds {
                if !inc.contains(&a.kind) {
                    continue;
                }
            }
            if let Some(exc) = exclude_kinds {
                if exc.contains(&a.kind) {
                    continue;
                }
            }
            self.interrupt_agent(a.id);
        }
        self.events.publish(workspace, UiEventKind::AgentInterruptAll);
        Ok(())
    }

    /// `interruptAgents(ids)`: interrupt a specific set of runners.
    pub fn interrupt_agents(&self, agent_ids: &[AgentId]) {
        for &id in agent_ids {
            self.interrupt_agent(id);
        }
    }

    /// `terminateAll({workspace, includeKinds?, excludeKinds?})`: interrupt, then pause auto-run
    /// for every non-human agent in the workspace matching the given kind scope.
    pub async fn terminate_all(
        &self,
        workspace: WorkspaceId,
        include_kinds: Option<Vec<AgentKind>>,
        exclude_kinds: Option<Vec<AgentKind>>,
    ) -> RuntimeResult<BulkResult> {
        self.interrupt_scoped(workspace, include_kinds.as_deref(), exclude_kinds.as_deref())
            .await?;
        let result = self
            .store
            .bulk_pause_agents(AgentScope {
                workspace,
                include_kinds,
                exclude_kinds,
            })
            .await?;
        self.events.publish(workspace, UiEventKind::AgentTerminateAll);
        Ok(result)
    }

    /// `softDeleteAll({workspace, includeKinds?, excludeKinds?})`: interrupt, soft-delete every
    /// matching non-human agent, then garbage-collect groups left orphaned or reduced to only
    /// system participants.
    pub async fn soft_delete_all(
        &self,
        workspace: WorkspaceId,
        include_kinds: Option<Vec<AgentKind>>,
        exclude_kinds: Option<Vec<AgentKind>>,
    ) -> RuntimeResult<BulkResult> {
        self.interrupt_scoped(workspace, include_kinds.as_deref(), exclude_kinds.as_deref())
            .await?;
        let result = self
            .store
            .bulk_soft_delete_agents(AgentScope {
                workspace,
                include_kinds,
                exclude_kinds,
            })
            .await?;
        for id in &result.affected {
            self.events
                .publish(workspace, UiEventKind::AgentDeleted { agent_id: *id });
        }
        self.store.soft_delete_orphan_groups(workspace).await?;
        self.store
            .soft_delete_redundant_system_groups(workspace)
            .await?;
        self.events.publish(workspace, UiEventKind::AgentDeleteAll);
        Ok(result)
    }

    /// `startTaskRun(...)`.
    pub async fn start_task_run(&self, params: StartTaskParams) -> RuntimeResult<TaskRunId> {
        self.supervisor.start_task_run(params).await
    }

    /// `stopTaskRun(workspace, reason)`: manual stop, defaults to `manual`.
    pub async fn stop_task_run(&self, workspace: WorkspaceId, reason: StopReason) -> RuntimeResult<()> {
        self.supervisor.stop_task_run(workspace, reason).await
    }

    /// `getActiveTaskRun(workspace)`.
    pub async fn get_active_task_run(&self, workspace: WorkspaceId) -> RuntimeResult<Option<TaskRun>> {
        self.supervisor.get_active_task_run(workspace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::skill::NullSkillLoader;
    use crate::runtime::store::InMemoryStore;
    use crate::runtime::stream::{DeltaStream, ModelClient, StreamDelta, ToolSchema};
    use async_trait::async_trait;
    use futures_util::stream;

    struct EchoClient;
    #[async_trait]
    impl ModelClient for EchoClient {
        fn model_name(&self) -> &str {
            "echo"
        }
        async fn stream(&self, _h: &[HistoryEntry], _t: &[ToolSchema]) -> RuntimeResult<DeltaStream> {
            let deltas: Vec<RuntimeResult<StreamDelta>> = vec![
                Ok(StreamDelta::Start),
                Ok(StreamDelta::Content("ok".to_string())),
                Ok(StreamDelta::Done {
                    finish_reason: Some("stop".to_string()),
                    usage: None,
                }),
            ];
            Ok(Box::pin(stream::iter(deltas)))
        }
    }

    struct EchoModelProvider;
    impl ModelClientProvider for EchoModelProvider {
        fn resolve(&self, _profile_id: Option<ModelProfileId>) -> Arc<dyn ModelClient> {
            Arc::new(EchoClient)
        }
    }

    fn make_facade() -> (Arc<RuntimeFacade>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let events = Arc::new(EventBus::new(100));
        let models: Arc<dyn ModelClientProvider> = Arc::new(EchoModelProvider);
        let skills: Arc<dyn SkillLoader> = Arc::new(NullSkillLoader);
        let config = RuntimeConfig::default();
        let facade = RuntimeFacade::new(store.clone() as Arc<dyn Store>, events, models, skills, config);
        (facade, store)
    }

    #[tokio::test]
    async fn wake_agent_constructs_runner_lazily() {
        let (facade, store) = make_facade();
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
        let _ = defaults;

        assert!(facade.runners.lock().unwrap().is_empty());
        facade.wake_agent(worker_id, WakeReason::Manual).await;
        assert!(facade.runners.lock().unwrap().contains_key(&worker_id));
    }

    #[tokio::test]
    async fn interrupt_agent_on_unknown_runner_is_a_noop() {
        let (facade, _store) = make_facade();
        facade.interrupt_agent(uuid::Uuid::new_v4());
    }

    #[tokio::test]
    async fn start_and_stop_task_run_round_trips_through_the_facade() {
        let (facade, store) = make_facade();
        let ws = uuid::Uuid::new_v4();
        let defaults = store.ensure_workspace_defaults(ws).await.unwrap();

        let task_id = facade
            .start_task_run(StartTaskParams {
                workspace: ws,
                goal: "say hello".to_string(),
                max_duration_ms: 60_000,
                max_turns: 100,
                max_token_delta: 100_000,
                root_group: Some(defaults.default_group_id),
                owner: defaults.assistant_agent_id,
            })
            .await
            .unwrap();

        let active = facade.get_active_task_run(ws).await.unwrap();
        assert_eq!(active.map(|r| r.id), Some(task_id));

        facade.stop_task_run(ws, StopReason::Manual).await.unwrap();
        let after = store.get_task_run_by_id(task_id).await.unwrap();
        assert_eq!(after.status, TaskStatus::Stopped);
        assert_eq!(after.stop_reason, Some(StopReason::Manual));
    }

    #[tokio::test]
    async fn soft_delete_all_honors_include_kinds_scope() {
        let (facade, store) = make_facade();
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

        let result = facade
            .soft_delete_all(ws, Some(vec![AgentKind::Worker]), None)
            .await
            .unwrap();
        assert_eq!(result.affected, vec![worker_id]);

        let assistant = store.get_agent(defaults.assistant_agent_id).await.unwrap();
        assert!(!assistant.is_deleted(), "scoped soft-delete leaves other kinds untouched");
    }

    #[tokio::test]
    async fn terminate_all_honors_include_kinds_scope() {
        let (facade, store) = make_facade();
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

        let result = facade
            .terminate_all(ws, Some(vec![AgentKind::Worker]), None)
            .await
            .unwrap();
        assert_eq!(result.affected, vec![worker_id]);

        let assistant = store.get_agent(defaults.assistant_agent_id).await.unwrap();
        assert!(assistant.auto_run, "scoped terminate leaves other kinds' auto_run untouched");
    }
}
