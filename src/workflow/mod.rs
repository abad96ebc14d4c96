//! The agent workflow engine.
//!
//! A turn flows through one of four fixed topologies (see [`graph::TopologyKind`]); nodes
//! call the model and tool adapters and return partial state updates, edges pick the next
//! node from the updated [`state::TurnState`].

pub mod approval;
pub mod engine;
pub mod graph;
pub(crate) mod nodes;
pub mod state;

pub use approval::{
    ApprovalDecision, ApprovalProvider, ApprovalRequest, AutoApprove, ChannelApproval,
    PendingApproval,
};
pub use engine::{WorkflowEngine, WorkflowEvent, DEFAULT_MAX_ROUNDS};
pub use graph::{CompiledTopology, NodeKind, TopologyDiagram, TopologyKind, Transition, FINAL_ANSWER};
pub use state::{StateUpdate, TurnState};
