pub mod error;
pub mod providers;
pub mod types;
pub mod functions;
pub mod models;
pub mod agents;
pub mod history;
pub mod workflow;
pub mod session;
pub mod config;

pub use error::{LLMError, WorkflowError};
pub use providers::LLMProvider;
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
pub use functions::{
    render_tool_output, DynToolFunction, FunctionCall, FunctionDefinition, FunctionParameter,
    Tool, ToolCall, ToolChoice, ToolFunction, ToolRegistry,
};
pub use models::{ChatModel, ModelRegistry, ModelSpec};
pub use agents::{default_agents, AgentCatalog, AgentDefinition, AgentError};
pub use history::{ChatEntry, ChatHistory};
pub use workflow::{
    ApprovalDecision, ApprovalProvider, ApprovalRequest, AutoApprove, ChannelApproval,
    PendingApproval, StateUpdate, TopologyKind, TurnState, WorkflowEngine, WorkflowEvent,
};
pub use session::{AgentSession, SessionManager, SharedSession, Turn, TurnOutcome};
pub use config::{check_environment, AppConfig, ConfigError};
pub use schemars::JsonSchema;
