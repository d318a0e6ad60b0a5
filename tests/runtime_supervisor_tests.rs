// Integration test for task-run timeout enforcement, driven through the public facade.
use agentmesh::runtime::config::RuntimeConfig;
use agentmesh::runtime::event_bus::EventBus;
use agentmesh::runtime::facade::RuntimeFacade;
use agentmesh::runtime::model::{ModelProfileId, StopReason, TaskStatus};
use agentmesh::runtime::model::HistoryEntry;
use agentmesh::runtime::skill::{NullSkillLoader, SkillLoader};
use agentmesh::runtime::runner::ModelClientProvider;
use agentmesh::runtime::store::{InMemoryStore, Store};
use agentmesh::runtime::stream::{DeltaStream, ModelClient, StreamDelta, ToolSchema};
use agentmesh::runtime::supervisor::StartTaskParams;
use async_trait::async_trait;
use futures_util::stream;
use std::sync::Arc;
use std::time::Duration;

struct SilentClient;

#[async_trait]
impl ModelClient for SilentClient {
    fn model_name(&self) -> &str {
        "silent"
    }

    async fn stream(&self, _history: &[HistoryEntry], _tools: &[ToolSchema]) -> agentmesh::runtime::error::RuntimeResult<DeltaStream> {
        let deltas: Vec<agentmesh::runtime::error::RuntimeResult<StreamDelta>> = vec![
            Ok(StreamDelta::Start),
            Ok(StreamDelta::Done { finish_reason: Some("stop".to_string()), usage: None }),
        ];
        Ok(Box::pin(stream::iter(deltas)))
    }
}

struct SilentModelProvider;

impl ModelClientProvider for SilentModelProvider {
    fn resolve(&self, _profile_id: Option<ModelProfileId>) -> Arc<dyn ModelClient> {
        Arc::new(SilentClient)
    }
}

#[tokio::test]
async fn task_run_stops_itself_once_the_deadline_passes() {
    let store = Arc::new(InMemoryStore::new());
    let events = Arc::new(EventBus::new(100));
    let models: Arc<dyn ModelClientProvider> = Arc::new(SilentModelProvider);
    let skills: Arc<dyn SkillLoader> = Arc::new(NullSkillLoader);
    let config = RuntimeConfig {
        task_tick_interval: Duration::from_millis(20),
        ..RuntimeConfig::default()
    };
    let facade = RuntimeFacade::new(store.clone() as Arc<dyn Store>, events, models, skills, config);

    let ws = uuid::Uuid::new_v4();
    let defaults = store.ensure_workspace_defaults(ws).await.unwrap();

    let task_id = facade
        .start_task_run(StartTaskParams {
            workspace: ws,
            goal: "say hello once".to_string(),
            max_duration_ms: 0,
            max_turns: 1000,
            max_token_delta: 1_000_000,
            root_group: Some(defaults.default_group_id),
            owner: defaults.assistant_agent_id,
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    let active = facade.get_active_task_run(ws).await.unwrap();
    assert!(active.is_none(), "the task stopped itself once its own tick observed the passed deadline");

    let run = store.get_task_run_by_id(task_id).await.unwrap();
    assert_eq!(run.status, TaskStatus::Stopped);
    assert_eq!(run.stop_reason, Some(StopReason::Timeout));
}
