//! Configuration for the collaboration runtime.
//!
//! Mirrors [`crate::cloudllm::config::CloudLLMConfig`]'s philosophy: a plain struct built with
//! struct-literal syntax or [`Default`], no config-file parsing dependency. Values that could
//! have been implementation constants (tool-round cap, similarity thresholds) are fields here
//! rather than `const`s so they can be tuned without a rebuild.

use std::path::PathBuf;
use std::time::Duration;

/// Global configuration for the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root directory the `bash` tool's `cwd` must resolve inside of.
    pub workspace_root: PathBuf,
    /// Maximum tool-call rounds per `run_with_tools` invocation. Default 3.
    pub max_tool_rounds: usize,
    /// Task supervisor evaluation tick cadence. Default 10s.
    pub task_tick_interval: Duration,
    /// Idle time after which a task stops with `no_progress`. Default 90s.
    pub idle_timeout: Duration,
    /// Jaccard similarity threshold above which two adjacent messages count as "repeated".
    /// Default 0.9.
    pub adjacent_similarity_threshold: f32,
    /// Ratio of repeated adjacent pairs (over the last 8 root-group messages) above which a task
    /// stops with `repeated_output`. Default 0.6.
    pub repeated_ratio_threshold: f32,
    /// Number of trailing root-group messages considered when computing `repeatedRatio`. Default 8.
    pub repeat_window: usize,
    /// Default wall-clock timeout for the `bash` tool. Default 120s.
    pub bash_default_timeout: Duration,
    /// Default combined stdout+stderr cap for the `bash` tool, in bytes. Default 1024 KiB.
    pub bash_default_max_output_bytes: usize,
    /// Minimum number of events retained per workspace in the UI event bus ring buffer. Default 2000.
    pub event_bus_capacity: usize,
    /// Shell-selection toggle consumed by the `bash` tool (`auto`, `bash`, `powershell`, `cmd`).
    pub shell_toggle: ShellToggle,
}

/// Shell selection policy for the `bash` tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellToggle {
    Auto,
    Bash,
    PowerShell,
    Cmd,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            max_tool_rounds: 3,
            task_tick_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            adjacent_similarity_threshold: 0.9,
            repeated_ratio_threshold: 0.6,
            repeat_window: 8,
            bash_default_timeout: Duration::from_secs(120),
            bash_default_max_output_bytes: 1024 * 1024,
            event_bus_capacity: 2000,
            shell_toggle: ShellToggle::Auto,
        }
    }
}
