//! Task Supervisor.
//!
//! Enforces "at most one active task per workspace", gates which agents may run while a task is
//! live, evaluates stop conditions on a per-workspace ticker plus event-driven notifications, and
//! finalizes a stopped task with a summary message and an LLM-judged (or heuristic-fallback)
//! quality review. The repeated-output check is adapted from
//! `crate::cloudllm::orchestration::Orchestrator::{calculate_convergence_score, jaccard_similarity}`,
//! generalized from "average similarity across one round of N agents" to "ratio of adjacent pairs
//! above a threshold over the last `repeat_window` root-group messages".

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use futures_util::StreamExt;
use log::warn;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::runtime::config::RuntimeConfig;
use crate::runtime::error::{RuntimeResult, StopReason};
use crate::runtime::event_bus::{EventBus, UiEventKind};
use crate::runtime::model::*;
use crate::runtime::runner::ModelClientProvider;
use crate::runtime::store::{AgentFilter, AgentScope, Store};
use crate::runtime::stream::GenerationParams;

/// The completion markers that end a task early with `goal_reached`, checked
/// case-insensitively against every message posted into a running task's root group.
const COMPLETION_MARKERS: &[&str] = &[
    "final summary",
    "debate concluded",
    "最终总结",
    "最终结果",
    "任务完成",
    "辩论结束",
    "本场辩论圆满结束",
    "debate finished",
];

/// Lets the supervisor request an interrupt on a runner without depending on the façade's runner
/// map directly, the same seam `crate::runtime::dispatch::Awakener` gives the dispatcher. The
/// façade implements this.
pub trait TaskRunnerControl: Send + Sync {
    fn interrupt_agent(&self, agent: AgentId);
}

/// Arguments for `startTaskRun`.
pub struct StartTaskParams {
    pub workspace: WorkspaceId,
    pub goal: String,
    pub max_duration_ms: i64,
    pub max_turns: u64,
    pub max_token_delta: u64,
    pub root_group: Option<GroupId>,
    pub owner: AgentId,
}

struct ActiveTask {
    run: TaskRun,
    ticker: tokio::task::JoinHandle<()>,
}

pub struct TaskSupervisor {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    models: Arc<dyn ModelClientProvider>,
    control: Arc<dyn TaskRunnerControl>,
    config: RuntimeConfig,
    active: AsyncMutex<HashMap<WorkspaceId, ActiveTask>>,
    /// Sync-readable mirror of `active`'s root groups, for `TaskContextProvider`'s sync boundary
    ///.
    root_group_cache: RwLock<HashMap<WorkspaceId, GroupId>>,
}

impl TaskSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<EventBus>,
        models: Arc<dyn ModelClientProvider>,
        control: Arc<dyn TaskRunnerControl>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            models,
            control,
            config,
            active: AsyncMutex::new(HashMap::new()),
            root_group_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Sync lookup for the task-mode tool guard; `None` means no active task.
    pub fn active_task_root_group(&self, workspace: WorkspaceId) -> Option<GroupId> {
        self.root_group_cache.read().unwrap().get(&workspace).copied()
    }

    /// On process start, rehydrate every persisted row with status ∈ {running, stopping} and
    /// resume its ticker without shifting its deadline. A `stopping` row
    /// is rehydrated the same way as `running`: the next `evaluate` tick re-derives the same stop
    /// condition (the budget that triggered it hasn't un-exceeded itself) and re-runs `finalize`,
    /// which is idempotent at the store layer though it may re-post the summary/review messages if
    /// the process crashed mid-finalize. See DESIGN.md Open Question resolution.
    pub async fn bootstrap(self: &Arc<Self>) -> RuntimeResult<()> {
        let rows = self.store.list_running_task_runs().await?;
        for run in rows {
            self.root_group_cache
                .write()
                .unwrap()
                .insert(run.workspace, run.root_group);
            let workspace = run.workspace;
            let handle = self.spawn_ticker(workspace);
            self.active.lock().await.insert(workspace, ActiveTask { run, ticker: handle });
        }
        Ok(())
    }

    fn spawn_ticker(self: &Arc<Self>, workspace: WorkspaceId) -> tokio::task::JoinHandle<()> {
        let supervisor = self.clone();
        let interval_dur = self.config.task_tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_dur);
            loop {
                interval.tick().await;
                if let Err(e) = supervisor.evaluate(workspace).await {
                    warn!("task supervisor evaluate({}) failed: {}", workspace, e);
                }
            }
        })
    }

    async fn has_active(&self, workspace: WorkspaceId) -> bool {
        self.active.lock().await.contains_key(&workspace)
    }

    /// `start(goal, maxDurationMs, maxTurns, maxTokenDelta, rootGroup?, owner)`.
    pub async fn start_task_run(self: &Arc<Self>, params: StartTaskParams) -> RuntimeResult<TaskRunId> {
        let workspace = params.workspace;
        if self.has_active(workspace).await {
            self.stop_task_run(workspace, StopReason::ManualReplaced).await?;
        }

        let root_group = match params.root_group {
            Some(g) => g,
            None => self.store.ensure_workspace_defaults(workspace).await?.default_group_id,
        };
        let group = self.store.get_group(root_group).await?;

        self.store
            .bulk_pause_agents(AgentScope {
                workspace,
                include_kinds: None,
                exclude_kinds: Some(vec![AgentKind::SystemHuman]),
            })
            .await?;
        for member in group.active_member_ids() {
            self.store.set_agent_auto_run(member, true).await?;
        }
        self.store.set_agent_auto_run(params.owner, true).await?;

        let now = Utc::now();
        let run = TaskRun {
            id: Uuid::new_v4(),
            workspace,
            root_group,
            owner: params.owner,
            goal: params.goal,
            status: TaskStatus::Running,
            stop_reason: None,
            budget: TaskBudget {
                max_duration_ms: params.max_duration_ms,
                max_turns: params.max_turns,
                max_token_delta: params.max_token_delta,
                start_group_tokens: group.context_tokens,
                adjacent_similarity_threshold: self.config.adjacent_similarity_threshold,
                repeated_ratio_threshold: self.config.repeated_ratio_threshold,
            },
            metrics: TaskMetrics::default(),
            summary_message_id: None,
            started_at: now,
            deadline_at: now + chrono::Duration::milliseconds(params.max_duration_ms),
            stopped_at: None,
        };
        self.store.create_task_run(run.clone()).await?;

        self.root_group_cache.write().unwrap().insert(workspace, run.root_group);
        let handle = self.spawn_ticker(workspace);
        let run_id = run.id;
        self.active.lock().await.insert(workspace, ActiveTask { run, ticker: handle });

        self.events.publish(workspace, UiEventKind::TaskStarted { task_run_id: run_id });
        Ok(run_id)
    }

    /// `evaluate()`: recompute metrics, check stop conditions in order, persist.
    pub async fn evaluate(self: &Arc<Self>, workspace: WorkspaceId) -> RuntimeResult<()> {
        let run = {
            let active = self.active.lock().await;
            match active.get(&workspace) {
                Some(a) if matches!(a.run.status, TaskStatus::Running) => a.run.clone(),
                _ => return Ok(()),
            }
        };

        let messages = self
            .store
            .list_group_messages(run.root_group, Some(self.config.repeat_window))
            .await?;
        let repeated_ratio = Self::compute_repeated_ratio(&messages, run.budget.adjacent_similarity_threshold);
        let last_message_at = messages.last().map(|m| m.send_time).unwrap_or(run.started_at);
        let idle_ms = (Utc::now() - last_message_at).num_milliseconds().max(0);
        let group = self.store.get_group(run.root_group).await?;
        let token_delta = group.context_tokens.saturating_sub(run.budget.start_group_tokens);
        let idle_timeout_ms = self.config.idle_timeout.as_millis() as i64;

        let now = Utc::now();
        let stop_reason = if now >= run.deadline_at {
            Some(StopReason::Timeout)
        } else if run.metrics.total_turns >= run.budget.max_turns {
            Some(StopReason::MaxTurns)
        } else if idle_ms >= idle_timeout_ms {
            Some(StopReason::NoProgress)
        } else if repeated_ratio >= run.budget.repeated_ratio_threshold {
            Some(StopReason::RepeatedOutput)
        } else if token_delta >= run.budget.max_token_delta {
            Some(StopReason::TokenDeltaExceeded)
        } else {
            None
        };

        if let Some(reason) = stop_reason {
            return self.stop_task_run(workspace, reason).await;
        }

        let mut updated = run.clone();
        updated.metrics.repeated_ratio = repeated_ratio;
        updated.metrics.last_message_at_ms = last_message_at.timestamp_millis();
        {
            let mut active = self.active.lock().await;
            if let Some(a) = active.get_mut(&workspace) {
                a.run = updated.clone();
            }
        }
        self.store.update_task_run(updated).await?;
        self.events.publish(workspace, UiEventKind::TaskProgress { task_run_id: run.id });
        Ok(())
    }

    /// `noteTurn(workspace, group, agent)`.
    pub async fn note_turn(self: &Arc<Self>, workspace: WorkspaceId, group: GroupId, agent: AgentId) {
        let matched = {
            let mut active = self.active.lock().await;
            match active.get_mut(&workspace) {
                Some(a) if a.run.root_group == group && matches!(a.run.status, TaskStatus::Running) => {
                    a.run.metrics.total_turns += 1;
                    if !a.run.metrics.participant_ids.contains(&agent) {
                        a.run.metrics.participant_ids.push(agent);
                    }
                    true
                }
                _ => false,
            }
        };
        if matched {
            if let Err(e) = self.evaluate(workspace).await {
                warn!("task supervisor evaluate after note_turn failed: {}", e);
            }
        }
    }

    /// `noteMessage(workspace, group, sender, content)`.
    pub async fn note_message(
        self: &Arc<Self>,
        workspace: WorkspaceId,
        group: GroupId,
        sender: AgentId,
        content: &str,
    ) {
        let goal_reached = {
            let mut active = self.active.lock().await;
            match active.get_mut(&workspace) {
                Some(a) if a.run.root_group == group && matches!(a.run.status, TaskStatus::Running) => {
                    a.run.metrics.total_messages += 1;
                    if !a.run.metrics.participant_ids.contains(&sender) {
                        a.run.metrics.participant_ids.push(sender);
                    }
                    let lower = content.to_lowercase();
                    Some(COMPLETION_MARKERS.iter().any(|m| lower.contains(&m.to_lowercase())))
                }
                _ => None,
            }
        };
        match goal_reached {
            Some(true) => {
                if let Err(e) = self.stop_task_run(workspace, StopReason::GoalReached).await {
                    warn!("task supervisor stop(goal_reached) failed: {}", e);
                }
            }
            Some(false) => {
                if let Err(e) = self.evaluate(workspace).await {
                    warn!("task supervisor evaluate after note_message failed: {}", e);
                }
            }
            None => {}
        }
    }

    /// `stop(reason)`: finalize transitions, interrupt participants, post the
    /// summary then the quality review, and persist the terminal row.
    pub async fn stop_task_run(self: &Arc<Self>, workspace: WorkspaceId, reason: StopReason) -> RuntimeResult<()> {
        let mut run = {
            let mut active = self.active.lock().await;
            match active.remove(&workspace) {
                Some(a) => {
                    a.ticker.abort();
                    a.run
                }
                None => return Ok(()),
            }
        };
        self.root_group_cache.write().unwrap().remove(&workspace);

        run.status = TaskStatus::Stopping;
        run.stop_reason = Some(reason);
        self.store.update_task_run(run.clone()).await?;
        self.events.publish(workspace, UiEventKind::TaskStopping { task_run_id: run.id });

        let agents = self
            .store
            .list_agents(AgentFilter {
                workspace: Some(workspace),
                include_deleted: false,
                kinds: None,
            })
            .await?;
        for a in &agents {
            if a.kind.is_human() || a.id == run.owner {
                continue;
            }
            self.control.interrupt_agent(a.id);
            self.store.set_agent_auto_run(a.id, false).await?;
        }

        let group = self.store.get_group(run.root_group).await?;
        let duration_s = (Utc::now() - run.started_at).num_seconds().max(0);
        let recent = self.store.list_group_messages(run.root_group, Some(5)).await?;
        let mut log_lines = String::new();
        for m in &recent {
            let short_id: String = m.sender.to_string().chars().take(8).collect();
            let trimmed: String = m.content.chars().take(120).collect();
            log_lines.push_str(&format!("- {}: {}\n", short_id, trimmed));
        }
        let summary = format!(
            "## Task Summary\n- Goal: {}\n- Stop reason: {}\n- Duration: {}s\n- Turns: {}\n- Messages: {}\n- Repeat ratio: {:.2}\n\n### Recent key logs\n{}",
            run.goal, reason, duration_s, run.metrics.total_turns, run.metrics.total_messages, run.metrics.repeated_ratio, log_lines
        );
        let summary_msg = self
            .store
            .send_message(run.root_group, run.owner, summary, "text".to_string())
            .await?;
        run.summary_message_id = Some(summary_msg.id);
        self.events.publish(
            workspace,
            UiEventKind::MessageCreated {
                group_id: run.root_group,
                sender_id: run.owner,
                member_ids: group.active_member_ids(),
                message_id: summary_msg.id,
            },
        );
        self.events.publish(workspace, UiEventKind::TaskSummaryCreated { task_run_id: run.id });

        let review = self.synthesize_review(&run, reason).await;
        self.store.create_task_review(review.clone()).await?;
        let review_content = format!(
            "## Task Review\n- Verdict: {}\n- Overall: {:.0}\n\n{}",
            Self::verdict_label(review.verdict),
            review.score.overall,
            review.narrative
        );
        let review_msg = self
            .store
            .send_message(run.root_group, run.owner, review_content, "text".to_string())
            .await?;
        self.events.publish(
            workspace,
            UiEventKind::MessageCreated {
                group_id: run.root_group,
                sender_id: run.owner,
                member_ids: group.active_member_ids(),
                message_id: review_msg.id,
            },
        );
        self.events.publish(workspace, UiEventKind::TaskReviewCreated { task_run_id: run.id });

        let run_id = run.id;
        run.status = TaskStatus::Stopped;
        run.stopped_at = Some(Utc::now());
        self.store.update_task_run(run).await?;
        self.events.publish(workspace, UiEventKind::TaskStopped { task_run_id: run_id });
        Ok(())
    }

    /// `getActiveTaskRun(workspace)`: prefer in-memory state, fall back to the latest persisted
    /// row.
    pub async fn get_active_task_run(&self, workspace: WorkspaceId) -> RuntimeResult<Option<TaskRun>> {
        {
            let active = self.active.lock().await;
            if let Some(a) = active.get(&workspace) {
                return Ok(Some(a.run.clone()));
            }
        }
        self.store.get_latest_task_run(workspace).await
    }

    fn verdict_label(v: ReviewVerdict) -> &'static str {
        match v {
            ReviewVerdict::Pass => "pass",
            ReviewVerdict::Borderline => "borderline",
            ReviewVerdict::Fail => "fail",
        }
    }

    fn verdict_for(overall: f32) -> ReviewVerdict {
        if overall >= 75.0 {
            ReviewVerdict::Pass
        } else if overall >= 55.0 {
            ReviewVerdict::Borderline
        } else {
            ReviewVerdict::Fail
        }
    }

    /// Ratio of adjacent message pairs (within the last `repeat_window` root-group messages)
    /// whose Jaccard similarity is ≥ `threshold`.
    fn compute_repeated_ratio(messages: &[Message], threshold: f32) -> f32 {
        if messages.len() < 2 {
            return 0.0;
        }
        let mut similar = 0usize;
        let mut pairs = 0usize;
        for w in messages.windows(2) {
            pairs += 1;
            if Self::jaccard_similarity(&w[0].content, &w[1].content) >= threshold {
                similar += 1;
            }
        }
        if pairs == 0 {
            0.0
        } else {
            similar as f32 / pairs as f32
        }
    }

    /// Word-set Jaccard similarity: lowercased, whitespace-split, punctuation stripped per token.
    /// Adapted from `Orchestrator::jaccard_similarity`, with the teacher's short-word filter
    /// dropped since nothing here calls for one.
    fn jaccard_similarity(a: &str, b: &str) -> f32 {
        use std::collections::HashSet;
        let tokenize = |s: &str| -> HashSet<String> {
            s.to_lowercase()
                .split_whitespace()
                .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
                .filter(|w| !w.is_empty())
                .collect()
        };
        let wa = tokenize(a);
        let wb = tokenize(b);
        if wa.is_empty() && wb.is_empty() {
            return 1.0;
        }
        if wa.is_empty() || wb.is_empty() {
            return 0.0;
        }
        let inter = wa.intersection(&wb).count();
        let union = wa.union(&wb).count();
        inter as f32 / union as f32
    }

    /// Base `(completion, relevance, clarity, nonRedundancy, safety)` scores per stop reason
    /// category before the repeated-ratio penalty. Extends a three-tier shape (goal reached /
    /// manual stop / anything else) across all five components. See DESIGN.md.
    fn heuristic_base(reason: StopReason) -> (f32, f32, f32, f32, f32) {
        match reason {
            StopReason::GoalReached => (82.0, 80.0, 78.0, 75.0, 95.0),
            StopReason::Manual | StopReason::ManualReplaced => (68.0, 66.0, 70.0, 65.0, 95.0),
            _ => (60.0, 58.0, 62.0, 55.0, 90.0),
        }
    }

    fn heuristic_review(reason: StopReason, repeated_ratio: f32) -> ReviewScore {
        let (c, r, cl, nr, s) = Self::heuristic_base(reason);
        let clamp = |v: f32| v.clamp(0.0, 100.0);
        let completion = clamp(c - 45.0 * repeated_ratio);
        let relevance = clamp(r - 30.0 * repeated_ratio);
        let clarity = clamp(cl - 10.0 * repeated_ratio);
        let non_redundancy = clamp(nr - 60.0 * repeated_ratio);
        let safety = clamp(s);
        let overall = (completion + relevance + clarity + non_redundancy + safety) / 5.0;
        ReviewScore {
            completion,
            relevance,
            clarity,
            non_redundancy,
            safety,
            overall,
        }
    }

    async fn synthesize_review(self: &Arc<Self>, run: &TaskRun, reason: StopReason) -> TaskReview {
        if let Some((score, verdict, highlights, issues, next_actions, narrative)) =
            self.try_model_review(run, reason).await
        {
            return TaskReview {
                task_run_id: run.id,
                score,
                verdict,
                highlights,
                issues,
                next_actions,
                narrative,
                created_at: Utc::now(),
            };
        }
        let score = Self::heuristic_review(reason, run.metrics.repeated_ratio);
        let verdict = Self::verdict_for(score.overall);
        TaskReview {
            task_run_id: run.id,
            score,
            verdict,
            highlights: Vec::new(),
            issues: Vec::new(),
            next_actions: Vec::new(),
            narrative: format!(
                "Automated heuristic review (stop reason={}, repeatedRatio={:.2}).",
                reason, run.metrics.repeated_ratio
            ),
            created_at: Utc::now(),
        }
    }

    #[allow(clippy::type_complexity)]
    async fn try_model_review(
        self: &Arc<Self>,
        run: &TaskRun,
        reason: StopReason,
    ) -> Option<(ReviewScore, ReviewVerdict, Vec<String>, Vec<ReviewIssue>, Vec<String>, String)> {
        let owner = self.store.get_agent(run.owner).await.ok()?;
        let client = self.models.resolve(owner.model_profile_id);
        let prompt = format!(
            "Evaluate this just-completed collaborative task. Respond with ONLY a JSON object of \
             the exact shape {{\"score\":{{\"completion\":0-100,\"relevance\":0-100,\"clarity\":0-100,\
             \"nonRedundancy\":0-100,\"safety\":0-100,\"overall\":0-100}},\"verdict\":\"pass\"|\"borderline\"|\"fail\",\
             \"highlights\":[\"...\"],\"issues\":[{{\"severity\":\"...\",\"detail\":\"...\"}}],\
             \"nextActions\":[\"...\"],\"narrative\":\"...\"}}.\n\nGoal: {}\nStop reason: {}\nTurns: {}\n\
             Messages: {}\nRepeat ratio: {:.2}",
            run.goal, reason, run.metrics.total_turns, run.metrics.total_messages, run.metrics.repeated_ratio,
        );
        let history = vec![HistoryEntry::User { content: prompt }];
        let params = GenerationParams {
            temperature: Some(0.2),
            top_p: Some(0.9),
            max_tokens: Some(700),
        };
        let mut stream = client.stream_with_params(&history, &[], params).await.ok()?;
        let mut content = String::new();
        while let Some(item) = stream.next().await {
            if let Ok(crate::runtime::stream::StreamDelta::Content(s)) = item {
                content.push_str(&s);
            }
        }

        let parsed: ReviewJson = serde_json::from_str(Self::strip_fences(&content)).ok()?;
        let clamp = |v: f32| v.clamp(0.0, 100.0);
        let completion = clamp(parsed.score.completion);
        let relevance = clamp(parsed.score.relevance);
        let clarity = clamp(parsed.score.clarity);
        let non_redundancy = clamp(parsed.score.non_redundancy);
        let safety = clamp(parsed.score.safety);
        let overall = if parsed.score.overall <= 0.0 {
            (completion + relevance + clarity + non_redundancy + safety) / 5.0
        } else {
            clamp(parsed.score.overall)
        };
        let verdict = match parsed.verdict.to_lowercase().as_str() {
            "pass" => ReviewVerdict::Pass,
            "borderline" => ReviewVerdict::Borderline,
            "fail" => ReviewVerdict::Fail,
            _ => Self::verdict_for(overall),
        };
        let issues = parsed
            .issues
            .into_iter()
            .map(|i| ReviewIssue {
                severity: i.severity,
                detail: i.detail,
            })
            .collect();
        Some((
            ReviewScore {
                completion,
                relevance,
                clarity,
                non_redundancy,
                safety,
                overall,
            },
            verdict,
            parsed.highlights,
            issues,
            parsed.next_actions,
            parsed.narrative,
        ))
    }

    fn strip_fences(s: &str) -> &str {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("```json") {
            rest.trim_end_matches("```").trim()
        } else if let Some(rest) = s.strip_prefix("```") {
            rest.trim_end_matches("```").trim()
        } else {
            s
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReviewJson {
    score: ReviewScoreJson,
    verdict: String,
    #[serde(default)]
    highlights: Vec<String>,
    #[serde(default)]
    issues: Vec<ReviewIssueJson>,
    #[serde(default, rename = "nextActions")]
    next_actions: Vec<String>,
    #[serde(default)]
    narrative: String,
}

#[derive(Debug, Deserialize)]
struct ReviewScoreJson {
    completion: f32,
    relevance: f32,
    clarity: f32,
    #[serde(rename = "nonRedundancy")]
    non_redundancy: f32,
    safety: f32,
    #[serde(default)]
    overall: f32,
}

#[derive(Debug, Deserialize)]
struct ReviewIssueJson {
    severity: String,
    detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::dispatch::Awakener;
    use crate::runtime::event_bus::EventBus;
    use crate::runtime::store::InMemoryStore;
    use crate::runtime::stream::{DeltaStream, ToolSchema};
    use async_trait::async_trait;
    use futures_util::stream;

    struct NoopControl;
    impl TaskRunnerControl for NoopControl {
        fn interrupt_agent(&self, _agent: AgentId) {}
    }

    struct FailingClient;
    #[async_trait]
    impl crate::runtime::stream::ModelClient for FailingClient {
        fn model_name(&self) -> &str {
            "unavailable"
        }
        async fn stream(&self, _h: &[HistoryEntry], _t: &[ToolSchema]) -> RuntimeResult<DeltaStream> {
            let deltas: Vec<RuntimeResult<crate::runtime::stream::StreamDelta>> =
                vec![Ok(crate::runtime::stream::StreamDelta::Start)];
            Ok(Box::pin(stream::iter(deltas)))
        }
    }

    struct FailingModelProvider;
    impl ModelClientProvider for FailingModelProvider {
        fn resolve(&self, _profile_id: Option<ModelProfileId>) -> Arc<dyn crate::runtime::stream::ModelClient> {
            Arc::new(FailingClient)
        }
    }

    fn jaccard(a: &str, b: &str) -> f32 {
        TaskSupervisor::jaccard_similarity(a, b)
    }

    #[test]
    fn jaccard_identical_messages_score_one() {
        assert_eq!(jaccard("ping", "ping"), 1.0);
    }

    #[test]
    fn jaccard_disjoint_messages_score_zero() {
        assert_eq!(jaccard("alpha beta", "gamma delta"), 0.0);
    }

    #[tokio::test]
    async fn repeat_detection_stops_with_repeated_output() {
        let store = Arc::new(InMemoryStore::new());
        let ws = uuid::Uuid::new_v4();
        let defaults = store.ensure_workspace_defaults(ws).await.unwrap();
        let owner = defaults.assistant_agent_id;
        let root_group = defaults.default_group_id;

        for _ in 0..8 {
            store
                .send_message(root_group, owner, "ping".to_string(), "text".to_string())
                .await
                .unwrap();
        }

        let events = Arc::new(EventBus::new(100));
        let models: Arc<dyn ModelClientProvider> = Arc::new(FailingModelProvider);
        let control: Arc<dyn TaskRunnerControl> = Arc::new(NoopControl);
        let config = RuntimeConfig::default();
        let supervisor = TaskSupervisor::new(
            store.clone() as Arc<dyn Store>,
            events,
            models,
            control,
            config,
        );

        let task_id = supervisor
            .start_task_run(StartTaskParams {
                workspace: ws,
                goal: "ping-pong".to_string(),
                max_duration_ms: 60_000,
                max_turns: 1000,
                max_token_delta: 1_000_000,
                root_group: Some(root_group),
                owner,
            })
            .await
            .unwrap();

        supervisor.evaluate(ws).await.unwrap();

        let run = store.get_task_run_by_id(task_id).await.unwrap();
        assert_eq!(run.status, TaskStatus::Stopped);
        assert_eq!(run.stop_reason, Some(StopReason::RepeatedOutput));
        assert!(supervisor.active_task_root_group(ws).is_none());

        let review = store.get_task_review(task_id).await.unwrap();
        assert!(review.is_some());
    }

    #[tokio::test]
    async fn in_task_tool_guard_blocks_fanout_via_cache() {
        let store = Arc::new(InMemoryStore::new());
        let ws = uuid::Uuid::new_v4();
        let defaults = store.ensure_workspace_defaults(ws).await.unwrap();
        let events = Arc::new(EventBus::new(100));
        let models: Arc<dyn ModelClientProvider> = Arc::new(FailingModelProvider);
        let control: Arc<dyn TaskRunnerControl> = Arc::new(NoopControl);
        let config = RuntimeConfig::default();
        let supervisor = TaskSupervisor::new(store.clone() as Arc<dyn Store>, events, models, control, config);

        supervisor
            .start_task_run(StartTaskParams {
                workspace: ws,
                goal: "goal".to_string(),
                max_duration_ms: 60_000,
                max_turns: 1000,
                max_token_delta: 1_000_000,
                root_group: Some(defaults.default_group_id),
                owner: defaults.assistant_agent_id,
            })
            .await
            .unwrap();

        assert_eq!(
            supervisor.active_task_root_group(ws),
            Some(defaults.default_group_id)
        );
    }

    #[allow(dead_code)]
    fn _awakener_trait_object_compiles(a: Arc<dyn Awakener>) -> Arc<dyn Awakener> {
        a
    }
}
