use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("invalid function arguments: {0}")]
    InvalidFunctionArguments(String),

    #[error("tool execution failed ({function}): {message}")]
    FunctionExecution { function: String, message: String },
}

/// Failures of a single workflow run.
///
/// `MalformedToolCall` and `ToolFailed` are produced by the tool adapter but never leave the
/// tool node: the engine turns them into tool-result messages so the model can correct itself.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown topology: {0}")]
    UnknownTopology(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("model invocation failed: {0}")]
    ModelInvocation(#[from] LLMError),

    #[error("malformed call to {tool}: {reason}")]
    MalformedToolCall { tool: String, reason: String },

    #[error("tool {tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("maximum rounds exceeded ({0})")]
    MaxRoundsExceeded(usize),

    #[error("model call timed out after {0} ms")]
    ModelTimeout(u64),

    #[error("prompt rendering failed: {0}")]
    Prompt(String),

    #[error("approval request was cancelled")]
    ApprovalCancelled,

    #[error("approval request timed out")]
    ApprovalTimeout,

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("no provider registered for '{0}'")]
    UnknownProvider(String),

    #[error("temperature {temperature} is outside [0, {max}] for model {model}")]
    TemperatureOutOfRange {
        model: String,
        temperature: f32,
        max: f32,
    },
}

impl WorkflowError {
    /// Errors a tool node reports back into the conversation instead of aborting the turn.
    pub fn is_recoverable_tool_error(&self) -> bool {
        matches!(
            self,
            WorkflowError::MalformedToolCall { .. } | WorkflowError::ToolFailed { .. }
        )
    }
}
