//! Tool Dispatcher.
//!
//! Maps `(agent, group, toolCall)` to a structured result. Reuses
//! `crate::cloudllm::tool_protocol::ToolResult` directly for the `{ok, ...}` envelope — its
//! `{success, output, error, metadata}` shape already fits — rather than inventing a parallel
//! type. Membership checks before send mirror
//! `crate::cloudllm::multi_participant_session`'s gated send paths; `bash` is a thin adapter over
//! `crate::cloudllm::tools::bash::BashTool`.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::cloudllm::tool_protocol::ToolResult;
use crate::cloudllm::tools::bash::{BashTool, Platform};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::event_bus::{EventBus, UiEventKind};
use crate::runtime::model::*;
use crate::runtime::skill::SkillLoader;
use crate::runtime::store::{AgentFilter, SendDirectMessageArgs, Store};

/// Abstraction the dispatcher uses to wake downstream agents after a send, without depending on
/// the runtime façade directly — a send triggers a wake fan-out through this seam. The façade
/// implements this.
#[async_trait]
pub trait Awakener: Send + Sync {
    async fn wake_agent(&self, agent: AgentId, reason: WakeReason);
    async fn wake_agents_for_group(&self, group: GroupId, sender: AgentId, content: &str);
    async fn ensure_runner(&self, agent: AgentId);
}

/// Context describing who is calling and what task guard (if any) applies.
pub struct DispatchContext {
    pub workspace: WorkspaceId,
    pub caller: AgentId,
    /// The group the caller is currently draining, if any — used for the task-mode guard.
    pub active_group: Option<GroupId>,
    /// The active task run's root group, if a task is running in this workspace.
    pub task_root_group: Option<GroupId>,
}

pub struct ToolDispatcher {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    awakener: Arc<dyn Awakener>,
    skills: Arc<dyn SkillLoader>,
    config: RuntimeConfig,
    bash: BashTool,
}

impl ToolDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<EventBus>,
        awakener: Arc<dyn Awakener>,
        skills: Arc<dyn SkillLoader>,
        config: RuntimeConfig,
    ) -> Self {
        use crate::runtime::config::ShellToggle;
        match config.shell_toggle {
            ShellToggle::PowerShell | ShellToggle::Cmd => {
                log::warn!(
                    "shell_toggle requested a Windows shell, but the bash tool only runs Unix \
                     shells; falling back to the platform default"
                );
            }
            ShellToggle::Auto | ShellToggle::Bash => {}
        }
        let platform = if cfg!(target_os = "macos") {
            Platform::macOS
        } else {
            Platform::Linux
        };
        let bash = BashTool::new(platform)
            .with_timeout(config.bash_default_timeout.as_secs())
            .with_max_output_size(config.bash_default_max_output_bytes)
            .with_cwd_restriction(config.workspace_root.clone());
        Self {
            store,
            events,
            awakener,
            skills,
            config,
            bash,
        }
    }

    /// The fixed tool table's schema, for wiring into the streaming model call.
    pub fn tool_schemas() -> Vec<crate::runtime::stream::ToolSchema> {
        use crate::runtime::stream::ToolSchema;
        let simple = |name: &str, description: &str, parameters: serde_json::Value| ToolSchema {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        };
        vec![
            simple("self", "Look up the caller's own agent identity.", json!({"type":"object","properties":{},"required":[]})),
            simple("list_agents", "List non-deleted agents in the workspace.", json!({"type":"object","properties":{},"required":[]})),
            simple("list_groups", "List groups visible to the caller.", json!({"type":"object","properties":{},"required":[]})),
            simple("list_group_members", "List a group's members.", json!({"type":"object","properties":{"groupId":{"type":"string"}},"required":["groupId"]})),
            simple("get_group_messages", "Fetch a group's messages.", json!({"type":"object","properties":{"groupId":{"type":"string"}},"required":["groupId"]})),
            simple("create", "Create a sub-agent with a pairwise chat to the human.", json!({"type":"object","properties":{"role":{"type":"string"},"guidance":{"type":"string"}},"required":["role"]})),
            simple("create_group", "Create (or canonicalize) a chat group.", json!({"type":"object","properties":{"memberIds":{"type":"array","items":{"type":"string"}},"name":{"type":"string"}},"required":["memberIds"]})),
            simple("send", "Send a direct message, resolving or creating a pairwise group.", json!({"type":"object","properties":{"to":{"type":"string"},"content":{"type":"string"}},"required":["to","content"]})),
            simple("send_group_message", "Send a message into an existing group.", json!({"type":"object","properties":{"groupId":{"type":"string"},"content":{"type":"string"},"contentType":{"type":"string"}},"required":["groupId","content"]})),
            simple("send_direct_message", "Send a direct message by target agent id.", json!({"type":"object","properties":{"toAgentId":{"type":"string"},"content":{"type":"string"},"contentType":{"type":"string"}},"required":["toAgentId","content"]})),
            simple("bash", "Execute a shell command inside the workspace root.", json!({"type":"object","properties":{"command":{"type":"string"},"cwd":{"type":"string"},"timeoutMs":{"type":"integer"},"maxOutputKB":{"type":"integer"}},"required":["command"]})),
            simple("get_skill", "Fetch a named skill's full content.", json!({"type":"object","properties":{"skill_name":{"type":"string"}},"required":["skill_name"]})),
        ]
    }

    /// True if `name` is subject to the in-task fan-out restriction, applied when the caller's
    /// active group equals the task's root group.
    fn is_fanout_tool(name: &str) -> bool {
        matches!(name, "create" | "create_group" | "send" | "send_direct_message")
    }

    fn check_task_guard(
        &self,
        ctx: &DispatchContext,
        name: &str,
        target_group: Option<GroupId>,
    ) -> Option<ToolResult> {
        let root = match ctx.task_root_group {
            Some(r) => r,
            None => return None,
        };
        if ctx.active_group != Some(root) {
            return None;
        }
        let blocked = if Self::is_fanout_tool(name) {
            true
        } else if name == "send_group_message" {
            target_group.map_or(false, |g| g != root)
        } else {
            false
        };
        if blocked {
            Some(ToolResult::failure(format!(
                "Tool '{}' is disabled during an active task run; fan-out is confined to the task's root group.",
                name
            )))
        } else {
            None
        }
    }

    /// Dispatch a named tool call with raw JSON arguments. Emits
    /// `ui.agent.tool_call.start`/`.done` around the invocation.
    pub async fn dispatch(
        &self,
        ctx: &DispatchContext,
        name: &str,
        args: serde_json::Value,
    ) -> ToolResult {
        self.events.publish(
            ctx.workspace,
            UiEventKind::AgentToolCallStart {
                agent_id: ctx.caller,
                tool_name: name.to_string(),
            },
        );

        let target_group = args.get("groupId").and_then(|v| v.as_str()).and_then(|s| s.parse().ok());
        if let Some(guard) = self.check_task_guard(ctx, name, target_group) {
            self.events.publish(
                ctx.workspace,
                UiEventKind::AgentToolCallDone {
                    agent_id: ctx.caller,
                    tool_name: name.to_string(),
                    ok: false,
                },
            );
            return guard;
        }

        let result = match name {
            "self" => self.tool_self(ctx).await,
            "list_agents" => self.tool_list_agents(ctx).await,
            "list_groups" => self.tool_list_groups(ctx).await,
            "list_group_members" => self.tool_list_group_members(ctx, &args).await,
            "get_group_messages" => self.tool_get_group_messages(ctx, &args).await,
            "create" => self.tool_create(ctx, &args).await,
            "create_group" => self.tool_create_group(ctx, &args).await,
            "send" => self.tool_send(ctx, &args).await,
            "send_group_message" => self.tool_send_group_message(ctx, &args).await,
            "send_direct_message" => self.tool_send_direct_message(ctx, &args).await,
            "bash" => self.tool_bash(&args).await,
            "get_skill" => self.tool_get_skill(&args),
            other => ToolResult::failure(format!("Unknown tool: {}", other)),
        };

        self.events.publish(
            ctx.workspace,
            UiEventKind::AgentToolCallDone {
                agent_id: ctx.caller,
                tool_name: name.to_string(),
                ok: result.success,
            },
        );
        result
    }

    async fn tool_self(&self, ctx: &DispatchContext) -> ToolResult {
        match self.store.get_agent(ctx.caller).await {
            Ok(agent) => ToolResult::success(json!({
                "agentId": agent.id,
                "workspaceId": agent.workspace,
                "role": agent.role,
            })),
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }

    async fn tool_list_agents(&self, ctx: &DispatchContext) -> ToolResult {
        match self
            .store
            .list_agents(AgentFilter {
                workspace: Some(ctx.workspace),
                include_deleted: false,
                kinds: None,
            })
            .await
        {
            Ok(agents) => {
                let list: Vec<_> = agents
                    .iter()
                    .map(|a| json!({"agentId": a.id, "role": a.role, "kind": a.kind}))
                    .collect();
                ToolResult::success(json!({"agents": list}))
            }
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }

    async fn tool_list_groups(&self, ctx: &DispatchContext) -> ToolResult {
        match self
            .store
            .list_groups(Some(ctx.workspace), Some(ctx.caller))
            .await
        {
            Ok(groups) => {
                let list: Vec<_> = groups
                    .iter()
                    .map(|g| {
                        json!({
                            "groupId": g.id,
                            "name": g.name,
                            "memberIds": g.member_ids,
                            "unreadCount": g.unread_count,
                        })
                    })
                    .collect();
                ToolResult::success(json!({"groups": list}))
            }
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }

    fn parse_group_id(args: &serde_json::Value) -> Result<GroupId, ToolResult> {
        args.get("groupId")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ToolResult::failure("groupId is required and must be a valid id".to_string()))
    }

    async fn tool_list_group_members(&self, ctx: &DispatchContext, args: &serde_json::Value) -> ToolResult {
        let group_id = match Self::parse_group_id(args) {
            Ok(g) => g,
            Err(r) => return r,
        };
        let group = match self.store.get_group(group_id).await {
            Ok(g) => g,
            Err(e) => return ToolResult::failure(e.to_string()),
        };
        if !group.members.iter().any(|m| m.agent_id == ctx.caller) {
            return ToolResult::failure("access_denied".to_string());
        }
        ToolResult::success(json!({"members": group.active_member_ids()}))
    }

    async fn tool_get_group_messages(&self, ctx: &DispatchContext, args: &serde_json::Value) -> ToolResult {
        let group_id = match Self::parse_group_id(args) {
            Ok(g) => g,
            Err(r) => return r,
        };
        let group = match self.store.get_group(group_id).await {
            Ok(g) => g,
            Err(e) => return ToolResult::failure(e.to_string()),
        };
        if !group.members.iter().any(|m| m.agent_id == ctx.caller) {
            return ToolResult::failure("access_denied".to_string());
        }
        let limit = args.get("limit").and_then(|v| v.as_u64()).map(|n| n as usize);
        match self.store.list_group_messages(group_id, limit).await {
            Ok(messages) => {
                let messages: Vec<_> = messages
                    .into_iter()
                    .map(|m| json!({"id": m.id, "sender": m.sender, "content": m.content, "sendTime": m.send_time}))
                    .collect();
                ToolResult::success(json!({"messages": messages}))
            }
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }

    async fn tool_create(&self, ctx: &DispatchContext, args: &serde_json::Value) -> ToolResult {
        let role = match args.get("role").and_then(|v| v.as_str()) {
            Some(r) => r.to_string(),
            None => return ToolResult::failure("role is required".to_string()),
        };
        let guidance = args.get("guidance").and_then(|v| v.as_str()).map(|s| s.to_string());

        let defaults = match self.store.ensure_workspace_defaults(ctx.workspace).await {
            Ok(d) => d,
            Err(e) => return ToolResult::failure(e.to_string()),
        };

        let now = chrono::Utc::now();
        let agent_id = uuid::Uuid::new_v4();
        let mut history = Vec::new();
        if let Some(g) = guidance {
            history.push(HistoryEntry::System { content: g });
        }
        let agent = Agent {
            id: agent_id,
            workspace: ctx.workspace,
            role: role.clone(),
            kind: AgentKind::Worker,
            auto_run: false,
            parent_id: Some(ctx.caller),
            model_profile_id: None,
            history,
            created_at: now,
            deleted_at: None,
            last_active_at: None,
        };
        if let Err(e) = self.store.insert_agent(agent).await {
            return ToolResult::failure(e.to_string());
        }
        let group_id = match self
            .store
            .create_group(
                ctx.workspace,
                vec![agent_id, defaults.human_agent_id],
                None,
                GroupKind::Chat,
            )
            .await
        {
            Ok(g) => g,
            Err(e) => return ToolResult::failure(e.to_string()),
        };
        self.events
            .publish(ctx.workspace, UiEventKind::AgentCreated { agent_id });
        self.events
            .publish(ctx.workspace, UiEventKind::GroupCreated { group_id });
        ToolResult::success(json!({"agentId": agent_id, "role": role, "groupId": group_id}))
    }

    async fn tool_create_group(&self, ctx: &DispatchContext, args: &serde_json::Value) -> ToolResult {
        let member_ids: Vec<AgentId> = match args.get("memberIds").and_then(|v| v.as_array()) {
            Some(arr) => arr
                .iter()
                .filter_map(|v| v.as_str().and_then(|s| s.parse().ok()))
                .collect(),
            None => return ToolResult::failure("memberIds is required".to_string()),
        };
        let name = args.get("name").and_then(|v| v.as_str()).map(|s| s.to_string());

        let mut all_members = member_ids.clone();
        if !all_members.contains(&ctx.caller) {
            all_members.push(ctx.caller);
        }
        all_members.sort();
        all_members.dedup();
        if all_members.len() < 2 {
            return ToolResult::failure("createGroup requires >= 2 distinct member ids".to_string());
        }

        if all_members.len() == 2 {
            let a = all_members[0];
            let b = all_members[1];
            match self
                .store
                .find_latest_exact_p2p_group_id(ctx.workspace, a, b, name.clone())
                .await
            {
                Ok(Some(existing)) => {
                    return ToolResult::success(json!({"groupId": existing, "name": name}));
                }
                Ok(None) => {}
                Err(e) => return ToolResult::failure(e.to_string()),
            }
        }

        match self
            .store
            .create_group(ctx.workspace, all_members, name.clone(), GroupKind::Chat)
            .await
        {
            Ok(group_id) => {
                self.events
                    .publish(ctx.workspace, UiEventKind::GroupCreated { group_id });
                ToolResult::success(json!({"groupId": group_id, "name": name}))
            }
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }

    async fn after_send(
        &self,
        ctx: &DispatchContext,
        group_id: GroupId,
        message_id: MessageId,
        content: &str,
    ) {
        if let Ok(group) = self.store.get_group(group_id).await {
            let member_ids = group.active_member_ids();
            self.events.publish(
                ctx.workspace,
                UiEventKind::MessageCreated {
                    group_id,
                    sender_id: ctx.caller,
                    member_ids,
                    message_id,
                },
            );
        }
        self.awakener
            .wake_agents_for_group(group_id, ctx.caller, content)
            .await;
    }

    async fn tool_send(&self, ctx: &DispatchContext, args: &serde_json::Value) -> ToolResult {
        let to: AgentId = match args.get("to").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()) {
            Some(id) => id,
            None => return ToolResult::failure("to is required and must be a valid agent id".to_string()),
        };
        let content = match args.get("content").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolResult::failure("content is required".to_string()),
        };
        let result = self
            .store
            .send_direct_message(SendDirectMessageArgs {
                workspace: ctx.workspace,
                from: ctx.caller,
                to,
                content: content.clone(),
                content_type: "text".to_string(),
                group_name: None,
                new_thread: false,
            })
            .await;
        match result {
            Ok(r) => {
                self.after_send(ctx, r.group, r.message, &content).await;
                ToolResult::success(json!({
                    "groupId": r.group,
                    "messageId": r.message,
                    "channel": r.channel,
                }))
            }
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }

    async fn tool_send_group_message(&self, ctx: &DispatchContext, args: &serde_json::Value) -> ToolResult {
        let group_id = match Self::parse_group_id(args) {
            Ok(g) => g,
            Err(r) => return r,
        };
        let content = match args.get("content").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolResult::failure("content is required".to_string()),
        };
        let content_type = args
            .get("contentType")
            .and_then(|v| v.as_str())
            .unwrap_or("text")
            .to_string();
        match self
            .store
            .send_message(group_id, ctx.caller, content.clone(), content_type)
            .await
        {
            Ok(msg) => {
                self.after_send(ctx, group_id, msg.id, &content).await;
                ToolResult::success(json!({"messageId": msg.id, "sendTime": msg.send_time}))
            }
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }

    async fn tool_send_direct_message(&self, ctx: &DispatchContext, args: &serde_json::Value) -> ToolResult {
        let to: AgentId = match args
            .get("toAgentId")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
        {
            Some(id) => id,
            None => return ToolResult::failure("toAgentId is required and must be a valid agent id".to_string()),
        };
        let content = match args.get("content").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolResult::failure("content is required".to_string()),
        };
        let content_type = args
            .get("contentType")
            .and_then(|v| v.as_str())
            .unwrap_or("text")
            .to_string();
        let result = self
            .store
            .send_direct_message(SendDirectMessageArgs {
                workspace: ctx.workspace,
                from: ctx.caller,
                to,
                content: content.clone(),
                content_type,
                group_name: None,
                new_thread: false,
            })
            .await;
        match result {
            Ok(r) => {
                self.after_send(ctx, r.group, r.message, &content).await;
                ToolResult::success(json!({
                    "channel": r.channel,
                    "groupId": r.group,
                    "messageId": r.message,
                    "sendTime": r.send_time,
                }))
            }
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }

    async fn tool_bash(&self, args: &serde_json::Value) -> ToolResult {
        let command = match args.get("command").and_then(|v| v.as_str()) {
            Some(c) => c,
            None => return ToolResult::failure("command is required".to_string()),
        };
        if let Some(cwd) = args.get("cwd").and_then(|v| v.as_str()) {
            let resolved = self.config.workspace_root.join(cwd);
            if !resolved.starts_with(&self.config.workspace_root) {
                return ToolResult::failure(
                    "cwd must resolve inside the configured workspace root".to_string(),
                );
            }
        }
        match self.bash.execute(command).await {
            Ok(r) => ToolResult::success(json!({
                "ok": r.success,
                "stdout": r.stdout,
                "stderr": r.stderr,
                "exitCode": r.exit_code,
                "durationMs": r.duration_ms,
            })),
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }

    fn tool_get_skill(&self, args: &serde_json::Value) -> ToolResult {
        let name = match args.get("skill_name").and_then(|v| v.as_str()) {
            Some(n) => n,
            None => return ToolResult::failure("skill_name is required".to_string()),
        };
        match self.skills.get_skill(name) {
            Some(content) => ToolResult::success(json!({"ok": true, "content": content})),
            None => ToolResult::failure(format!("unknown skill: {}", name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopAwakener {
        wakes: AtomicUsize,
    }

    #[async_trait]
    impl Awakener for NoopAwakener {
        async fn wake_agent(&self, _agent: AgentId, _reason: WakeReason) {
            self.wakes.fetch_add(1, Ordering::SeqCst);
        }
        async fn wake_agents_for_group(&self, _group: GroupId, _sender: AgentId, _content: &str) {
            self.wakes.fetch_add(1, Ordering::SeqCst);
        }
        async fn ensure_runner(&self, _agent: AgentId) {}
    }

    async fn make_dispatcher() -> (ToolDispatcher, Arc<InMemoryStore>, Arc<NoopAwakener>, WorkspaceId, AgentId, AgentId) {
        let store = Arc::new(InMemoryStore::new());
        let events = Arc::new(EventBus::new(100));
        let awakener = Arc::new(NoopAwakener { wakes: AtomicUsize::new(0) });
        let skills = Arc::new(NullSkillLoaderForTest);
        let config = RuntimeConfig::default();
        let ws = uuid::Uuid::new_v4();
        let defaults = store.ensure_workspace_defaults(ws).await.unwrap();

        let dispatcher = ToolDispatcher::new(
            store.clone() as Arc<dyn Store>,
            events,
            awakener.clone() as Arc<dyn Awakener>,
            skills,
            config,
        );
        (dispatcher, store, awakener, ws, defaults.human_agent_id, defaults.assistant_agent_id)
    }

    #[derive(Default)]
    struct NullSkillLoaderForTest;
    impl SkillLoader for NullSkillLoaderForTest {
        fn get_skill(&self, _name: &str) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn send_creates_new_group_without_adding_third_party() {
        let (dispatcher, store, _awakener, ws, _human, assistant) = make_dispatcher().await;
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

        let ctx = DispatchContext {
            workspace: ws,
            caller: assistant,
            active_group: None,
            task_root_group: None,
        };
        let result = dispatcher
            .dispatch(&ctx, "send", json!({"to": worker_id.to_string(), "content": "hi"}))
            .await;
        assert!(result.success);
        let group_id: GroupId = result.output["groupId"].as_str().unwrap().parse().unwrap();
        let group = store.get_group(group_id).await.unwrap();
        let mut members = group.active_member_ids();
        members.sort();
        let mut expected = vec![assistant, worker_id];
        expected.sort();
        assert_eq!(members, expected, "human must not be auto-added to a `send` target group");
    }

    #[tokio::test]
    async fn task_guard_blocks_fanout_tools_in_root_group() {
        let (dispatcher, _store, _awakener, ws, _human, assistant) = make_dispatcher().await;
        let root_group = uuid::Uuid::new_v4();
        let ctx = DispatchContext {
            workspace: ws,
            caller: assistant,
            active_group: Some(root_group),
            task_root_group: Some(root_group),
        };
        let result = dispatcher
            .dispatch(&ctx, "create", json!({"role": "critic"}))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("disabled during an active task run"));
    }

    #[tokio::test]
    async fn unknown_tool_returns_failure_envelope() {
        let (dispatcher, _store, _awakener, ws, _human, assistant) = make_dispatcher().await;
        let ctx = DispatchContext {
            workspace: ws,
            caller: assistant,
            active_group: None,
            task_root_group: None,
        };
        let result = dispatcher.dispatch(&ctx, "frobnicate", json!({})).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap(), "Unknown tool: frobnicate");
    }
}
