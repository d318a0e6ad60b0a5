//! Skill-file loader interface.
//!
//! The skill-file loader itself lives outside this crate; only the `get_skill` tool and the
//! system-prompt "skills metadata block" it feeds into a freshly-seeded agent history are in
//! scope here. This defines only the trait boundary, the same way
//! `crate::cloudllm::tool_protocol::ToolProtocol` is a trait several concrete tools implement —
//! the runtime depends on the trait, not a specific file-backed loader.

/// Supplies skill content and optional metadata to be woven into an agent's system prompt.
pub trait SkillLoader: Send + Sync {
    /// Full content of a named skill, or `None` if unknown.
    fn get_skill(&self, name: &str) -> Option<String>;

    /// An optional block describing available skills, appended to a freshly-seeded agent history.
    fn metadata_block(&self) -> Option<String> {
        None
    }
}

/// Default loader with no skills registered; keeps the crate runnable standalone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSkillLoader;

impl SkillLoader for NullSkillLoader {
    fn get_skill(&self, _name: &str) -> Option<String> {
        None
    }
}
