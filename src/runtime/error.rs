//! Error taxonomy for the collaboration runtime.
//!
//! Mirrors the six-way split the runtime's failures surface under: a failure is always one of
//! these kinds, never a bare string, so callers can pattern-match on origin rather than parse
//! messages. See [`RuntimeError`].

use std::fmt;

/// The finite set of stop reasons a task run can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Manual,
    Timeout,
    NoProgress,
    RepeatedOutput,
    GoalReached,
    MaxTurns,
    ManualReplaced,
    TokenDeltaExceeded,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Manual => "manual",
            StopReason::Timeout => "timeout",
            StopReason::NoProgress => "no_progress",
            StopReason::RepeatedOutput => "repeated_output",
            StopReason::GoalReached => "goal_reached",
            StopReason::MaxTurns => "max_turns",
            StopReason::ManualReplaced => "manual_replaced",
            StopReason::TokenDeltaExceeded => "token_delta_exceeded",
        };
        write!(f, "{}", s)
    }
}

/// A failure surfaced anywhere in the runtime, tagged by origin.
#[derive(Debug, Clone)]
pub enum RuntimeError {
    /// The persistent store could not complete the operation; the caller must abort without
    /// mutating in-memory history.
    StoreUnavailable(String),
    /// The streaming model call failed upstream; `status` is the HTTP-style status class when
    /// known (e.g. 429, 500), `None` for transport-level failures.
    UpstreamModel {
        status: Option<u16>,
        message: String,
    },
    /// A tool call's arguments failed validation before dispatch.
    ToolArgInvalid(String),
    /// A tool call was rejected by a permission guard (task-mode restriction, membership check,
    /// cwd containment).
    ToolPermissionDenied(String),
    /// A task's budget was exceeded. Not treated as an error path by the supervisor itself (it's
    /// a structured stop reason) but callers outside the supervisor may still observe it as a
    /// `RuntimeError` when propagated through a generic `Result`.
    TaskBudgetExceeded(StopReason),
    /// The runner observed a cooperative interrupt and unwound cleanly; never surfaced to a user.
    Interrupt,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::StoreUnavailable(msg) => write!(f, "store unavailable: {}", msg),
            RuntimeError::UpstreamModel { status, message } => match status {
                Some(code) => write!(f, "upstream model error ({}): {}", code, message),
                None => write!(f, "upstream model error: {}", message),
            },
            RuntimeError::ToolArgInvalid(msg) => write!(f, "invalid tool arguments: {}", msg),
            RuntimeError::ToolPermissionDenied(msg) => write!(f, "permission denied: {}", msg),
            RuntimeError::TaskBudgetExceeded(reason) => {
                write!(f, "task budget exceeded: {}", reason)
            }
            RuntimeError::Interrupt => write!(f, "interrupted"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl RuntimeError {
    /// Classify an upstream HTTP status into the `upstream_model_4xx/5xx` taxonomy bucket.
    pub fn from_upstream_status(status: u16, message: impl Into<String>) -> Self {
        RuntimeError::UpstreamModel {
            status: Some(status),
            message: message.into(),
        }
    }

    /// True for 4xx-class upstream failures (treated as "arrears" — caller-side, e.g. quota/auth).
    pub fn is_client_error(&self) -> bool {
        matches!(self, RuntimeError::UpstreamModel { status: Some(s), .. } if (400..500).contains(s))
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
