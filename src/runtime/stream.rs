//! Streaming Model Invocation.
//!
//! Translates an agent history plus a fixed tool schema into a stream of deltas over a provider-
//! specific wire dialect, exposing the same snapshot shape regardless of provider. Builds on
//! `crate::cloudllm::client_wrapper::{ClientWrapper, MessageChunk, MessageChunkStream}` and the
//! chunk-accumulation loop in `crate::cloudllm::clients::openai::OpenAIClient::send_message_stream`,
//! generalized from "one content string" to three parallel channels (reasoning, content,
//! tool-call argument fragments) plus a terminal usage total. [`ClientWrapperModelClient`]
//! is the production bridge from any of the four wrapped dialects to [`ModelClient`].

use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::model::{HistoryEntry, ModelProfile, ModelProfileId};
use crate::runtime::runner::ModelClientProvider;

/// A tool schema entry as seen by the model provider: name, description, and parameters
/// assembled dynamically from the fixed tool table rather than declared statically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One in-flight tool-call fragment inside a streaming snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallFragment {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments_text: String,
}

/// Cumulative token usage, mirroring `crate::cloudllm::client_wrapper::TokenUsage`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub total_tokens: u64,
}

/// The provider-agnostic snapshot shape every dialect-specific assembler must converge to
///: `{content, reasoningContent, toolCalls, finishReason?, usage}`.
#[derive(Debug, Clone, Default)]
pub struct StreamSnapshot {
    pub content: String,
    pub reasoning_content: String,
    pub tool_calls: Vec<ToolCallFragment>,
    pub finish_reason: Option<String>,
    pub usage: Option<UsageTotals>,
}

/// A delta emitted by diffing the current snapshot against the previous one.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    Start,
    Reasoning(String),
    Content(String),
    ToolCall(ToolCallFragment),
    Done {
        finish_reason: Option<String>,
        usage: Option<UsageTotals>,
    },
}

/// A parsed NDJSON/SSE chunk, provider-dialect specific until turned into a [`StreamSnapshot`] by
/// the assembler. The invoker only needs `into_snapshot` to hold the same shape.
#[async_trait]
pub trait ChunkAssembler: Send {
    /// Fold one newly-parsed chunk into the running snapshot, returning the updated snapshot.
    fn fold(&mut self, raw_chunk: &serde_json::Value) -> RuntimeResult<StreamSnapshot>;
}

/// Diff two snapshots into the zero-or-more deltas the new one introduces. Pure and
/// provider-agnostic; every dialect-specific assembler's output funnels through this.
pub fn diff_snapshots(prev: &StreamSnapshot, next: &StreamSnapshot) -> Vec<StreamDelta> {
    let mut deltas = Vec::new();

    if next.reasoning_content.len() > prev.reasoning_content.len()
        && next.reasoning_content.starts_with(&prev.reasoning_content)
    {
        deltas.push(StreamDelta::Reasoning(
            next.reasoning_content[prev.reasoning_content.len()..].to_string(),
        ));
    }
    if next.content.len() > prev.content.len() && next.content.starts_with(&prev.content) {
        deltas.push(StreamDelta::Content(
            next.content[prev.content.len()..].to_string(),
        ));
    }
    for call in &next.tool_calls {
        let prev_len = prev
            .tool_calls
            .iter()
            .find(|c| c.index == call.index)
            .map(|c| c.arguments_text.len())
            .unwrap_or(0);
        if call.arguments_text.len() > prev_len {
            deltas.push(StreamDelta::ToolCall(ToolCallFragment {
                index: call.index,
                id: call.id.clone(),
                name: call.name.clone(),
                arguments_text: call.arguments_text[prev_len..].to_string(),
            }));
        }
    }
    deltas
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = RuntimeResult<StreamDelta>> + Send>>;

/// Sampling parameters a caller may request for a single call, overriding the model profile's
/// own defaults. The quality-review call the task supervisor makes pins
/// `temperature=0.2`, `top_p=0.9`, `max_tokens<=700` to keep the verdict deterministic-ish and
/// cheap; ordinary agent turns leave every field `None` and inherit provider defaults.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A streaming model client: translate history + tool schema into a delta stream bracketed by
/// `Start`/`Done`. Builds on `crate::cloudllm::client_wrapper::ClientWrapper`, generalized from
/// its `send_message`/`send_message_stream` pair into a single always-streaming call, since the
/// runner always consumes the streaming form when it drives `run_with_tools`.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn model_name(&self) -> &str;

    /// Stream a response for `history` given the fixed `tools` schema. Implementations parse
    /// their provider's SSE/NDJSON body, fold each chunk with a dialect-specific
    /// [`ChunkAssembler`], diff consecutive snapshots with [`diff_snapshots`], and emit
    /// `Start`/.../`Done`.
    async fn stream(
        &self,
        history: &[HistoryEntry],
        tools: &[ToolSchema],
    ) -> RuntimeResult<DeltaStream>;

    /// Same as [`stream`](Self::stream) but with explicit sampling overrides. Implementations that
    /// don't need per-call overrides inherit this default, which just ignores `params`.
    async fn stream_with_params(
        &self,
        history: &[HistoryEntry],
        tools: &[ToolSchema],
        _params: GenerationParams,
    ) -> RuntimeResult<DeltaStream> {
        self.stream(history, tools).await
    }
}

/// Adapts any `crate::cloudllm::client_wrapper::ClientWrapper` (OpenAI, Claude, Gemini, Grok — all
/// four dialects already implemented in `crate::cloudllm::clients`) into a [`ModelClient`].
///
/// `ClientWrapper::send_message_stream` ties its returned chunk stream's lifetime to the borrowed
/// `&[Message]` passed in, which can't be turned into the `'static` [`DeltaStream`] a
/// [`ModelClient`] must hand back without pinning the request alongside the stream. Rather than
/// box that up, this adapter drives the request/response `send_message` call and synthesizes the
/// stream contract from the single finished [`Message`]: one `Start`, one `Content` delta carrying
/// the whole body, one `ToolCall` delta per native tool call the provider selected, then `Done`.
/// Call sites see the same [`StreamDelta`] sequence either way; only the cadence differs.
pub struct ClientWrapperModelClient {
    inner: Arc<dyn crate::cloudllm::client_wrapper::ClientWrapper>,
}

impl ClientWrapperModelClient {
    pub fn new(inner: Arc<dyn crate::cloudllm::client_wrapper::ClientWrapper>) -> Self {
        Self { inner }
    }
}

fn history_entry_to_message(entry: &HistoryEntry) -> crate::cloudllm::client_wrapper::Message {
    use crate::cloudllm::client_wrapper::{Message, Role};
    match entry {
        HistoryEntry::System { content } => Message {
            role: Role::System,
            content: Arc::from(content.as_str()),
            tool_calls: Vec::new(),
        },
        HistoryEntry::User { content } => Message {
            role: Role::User,
            content: Arc::from(content.as_str()),
            tool_calls: Vec::new(),
        },
        HistoryEntry::Assistant { content, .. } => Message {
            role: Role::Assistant,
            content: Arc::from(content.as_str()),
            tool_calls: Vec::new(),
        },
        HistoryEntry::Tool {
            tool_call_id,
            result,
            ..
        } => Message {
            role: Role::Tool {
                call_id: tool_call_id.clone(),
            },
            content: Arc::from(result.to_string().as_str()),
            tool_calls: Vec::new(),
        },
    }
}

fn tool_schema_to_definition(schema: &ToolSchema) -> crate::cloudllm::client_wrapper::ToolDefinition {
    crate::cloudllm::client_wrapper::ToolDefinition {
        name: schema.name.clone(),
        description: schema.description.clone(),
        parameters_schema: schema.parameters.clone(),
    }
}

#[async_trait]
impl ModelClient for ClientWrapperModelClient {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn stream(
        &self,
        history: &[HistoryEntry],
        tools: &[ToolSchema],
    ) -> RuntimeResult<DeltaStream> {
        let messages: Vec<_> = history.iter().map(history_entry_to_message).collect();
        let defs: Vec<_> = tools.iter().map(tool_schema_to_definition).collect();
        let defs = if defs.is_empty() { None } else { Some(defs) };

        let response = self
            .inner
            .send_message(&messages, defs)
            .await
            .map_err(|e| RuntimeError::UpstreamModel {
                status: None,
                message: e.to_string(),
            })?;

        let usage = self.inner.get_last_usage().await.map(|u| UsageTotals {
            total_tokens: u.total_tokens as u64,
        });

        let mut deltas = vec![StreamDelta::Start];
        if !response.content.is_empty() {
            deltas.push(StreamDelta::Content(response.content.to_string()));
        }
        for (index, call) in response.tool_calls.iter().enumerate() {
            deltas.push(StreamDelta::ToolCall(ToolCallFragment {
                index,
                id: Some(call.id.clone()),
                name: Some(call.name.clone()),
                arguments_text: call.arguments.to_string(),
            }));
        }
        deltas.push(StreamDelta::Done {
            finish_reason: Some("stop".to_string()),
            usage,
        });

        Ok(Box::pin(futures_util::stream::iter(deltas.into_iter().map(Ok))))
    }
}

fn client_wrapper_for_profile(
    profile: &ModelProfile,
) -> Arc<dyn crate::cloudllm::client_wrapper::ClientWrapper> {
    use crate::cloudllm::clients::{claude::ClaudeClient, gemini::GeminiClient, grok::GrokClient, openai::OpenAIClient};

    let key = profile.api_key.as_str();
    let model = profile.model.as_str();
    match profile.provider.to_ascii_lowercase().as_str() {
        "claude" | "anthropic" => {
            if profile.base_url.is_empty() {
                Arc::new(ClaudeClient::new_with_model_str(key, model))
            } else {
                Arc::new(ClaudeClient::new_with_base_url(key, model, &profile.base_url))
            }
        }
        "gemini" | "google" => {
            if profile.base_url.is_empty() {
                Arc::new(GeminiClient::new_with_model_string(key, model))
            } else {
                Arc::new(GeminiClient::new_with_base_url(key, model, &profile.base_url))
            }
        }
        "grok" | "xai" => {
            if profile.base_url.is_empty() {
                Arc::new(GrokClient::new_with_model_str(key, model))
            } else {
                Arc::new(GrokClient::new_with_base_url(key, model, &profile.base_url))
            }
        }
        _ => {
            if profile.base_url.is_empty() {
                Arc::new(OpenAIClient::new_with_model_string(key, model))
            } else {
                Arc::new(OpenAIClient::new_with_base_url(key, model, &profile.base_url))
            }
        }
    }
}

/// Process-wide [`ModelClientProvider`]: one [`ClientWrapperModelClient`] per configured
/// [`ModelProfile`], keyed by id, falling back to the workspace's `default: true` profile (or the
/// first profile registered, if none is marked default) when an agent carries no
/// `model_profile_id` of its own. Built once at startup from whatever profile rows the host
/// application loads; the `Store` contract has no profile CRUD (see [`ModelClientProvider`]'s own
/// doc comment), so this registry is this crate's answer to "where do profiles come from".
pub struct ModelProfileRegistry {
    clients: HashMap<ModelProfileId, Arc<dyn ModelClient>>,
    default: Arc<dyn ModelClient>,
}

impl ModelProfileRegistry {
    /// Builds one client per profile eagerly; `profiles` should be every profile for every
    /// workspace this process serves. Picks the profile marked `default`, or the first one if
    /// none is, as the fallback for agents with no `model_profile_id`. Panics if `profiles` is
    /// empty — a process with zero configured model profiles cannot run any agent turn, so this
    /// is a startup-time configuration error, not a runtime one.
    pub fn new(profiles: &[ModelProfile]) -> Self {
        assert!(
            !profiles.is_empty(),
            "ModelProfileRegistry requires at least one configured model profile"
        );
        let mut clients = HashMap::new();
        for profile in profiles {
            let client: Arc<dyn ModelClient> =
                Arc::new(ClientWrapperModelClient::new(client_wrapper_for_profile(profile)));
            clients.insert(profile.id, client);
        }
        let default_profile = profiles.iter().find(|p| p.default).unwrap_or(&profiles[0]);
        let default = clients[&default_profile.id].clone();
        Self { clients, default }
    }
}

impl ModelClientProvider for ModelProfileRegistry {
    fn resolve(&self, profile_id: Option<ModelProfileId>) -> Arc<dyn ModelClient> {
        profile_id
            .and_then(|id| self.clients.get(&id).cloned())
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Drive a [`ModelClient`] stream to completion, collecting the final snapshot. Used by
/// `run_with_tools` which needs the assembled content/reasoning/tool-calls after
/// the stream finishes, not just the deltas.
pub async fn collect_stream(
    client: &dyn ModelClient,
    history: &[HistoryEntry],
    tools: &[ToolSchema],
    mut on_delta: impl FnMut(&StreamDelta),
) -> RuntimeResult<StreamSnapshot> {
    let mut stream = client.stream(history, tools).await?;
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<ToolCallFragment> = Vec::new();
    let mut finish_reason = None;
    let mut usage = None;

    on_delta(&StreamDelta::Start);
    while let Some(item) = stream.next().await {
        let delta = item.map_err(|e| match e {
            RuntimeError::UpstreamModel { status, message } => {
                RuntimeError::UpstreamModel { status, message }
            }
            other => other,
        })?;
        match &delta {
            StreamDelta::Start => {}
            StreamDelta::Reasoning(s) => reasoning.push_str(s),
            StreamDelta::Content(s) => content.push_str(s),
            StreamDelta::ToolCall(frag) => {
                match tool_calls.iter_mut().find(|c| c.index == frag.index) {
                    Some(existing) => {
                        existing.arguments_text.push_str(&frag.arguments_text);
                        if frag.id.is_some() {
                            existing.id = frag.id.clone();
                        }
                        if frag.name.is_some() {
                            existing.name = frag.name.clone();
                        }
                    }
                    None => tool_calls.push(frag.clone()),
                }
            }
            StreamDelta::Done {
                finish_reason: fr,
                usage: u,
            } => {
                finish_reason = fr.clone();
                usage = *u;
            }
        }
        on_delta(&delta);
    }
    on_delta(&StreamDelta::Done {
        finish_reason: finish_reason.clone(),
        usage,
    });

    Ok(StreamSnapshot {
        content,
        reasoning_content: reasoning,
        tool_calls,
        finish_reason,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_emits_only_new_suffix() {
        let prev = StreamSnapshot {
            content: "Hel".to_string(),
            ..Default::default()
        };
        let next = StreamSnapshot {
            content: "Hello".to_string(),
            ..Default::default()
        };
        let deltas = diff_snapshots(&prev, &next);
        assert_eq!(deltas.len(), 1);
        match &deltas[0] {
            StreamDelta::Content(s) => assert_eq!(s, "lo"),
            other => panic!("unexpected delta {:?}", other),
        }
    }

    #[test]
    fn diff_tracks_independent_tool_call_indices() {
        let prev = StreamSnapshot {
            tool_calls: vec![ToolCallFragment {
                index: 0,
                id: Some("call_1".into()),
                name: Some("bash".into()),
                arguments_text: "{\"cmd\":".into(),
            }],
            ..Default::default()
        };
        let next = StreamSnapshot {
            tool_calls: vec![
                ToolCallFragment {
                    index: 0,
                    id: Some("call_1".into()),
                    name: Some("bash".into()),
                    arguments_text: "{\"cmd\":\"ls\"}".into(),
                },
                ToolCallFragment {
                    index: 1,
                    id: Some("call_2".into()),
                    name: Some("self".into()),
                    arguments_text: "{}".into(),
                },
            ],
            ..Default::default()
        };
        let deltas = diff_snapshots(&prev, &next);
        assert_eq!(deltas.len(), 2);
    }
}
