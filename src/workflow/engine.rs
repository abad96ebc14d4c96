use std::sync::Arc;

use crate::{
    agents::AgentDefinition,
    functions::ToolRegistry,
    models::{ModelRegistry, DEFAULT_ROUTER_MODEL},
    workflow::{
        approval::{ApprovalProvider, AutoApprove},
        graph::{NodeKind, TopologyKind, Transition},
        nodes::{self, NodeContext},
        state::TurnState,
    },
    WorkflowError,
};

pub const DEFAULT_MAX_ROUNDS: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    Started { agent: String, topology: TopologyKind },
    NodeEntered { node: NodeKind, round: usize },
    ToolInvoked { tool: String, call_id: String, succeeded: bool },
    ApprovalDecided { round: usize, approved: bool },
    Finished { agent: String, rounds: usize },
}

type EventCallback = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct EventSink {
    callback: Option<EventCallback>,
}

impl EventSink {
    pub(crate) fn emit(&self, event: &WorkflowEvent) {
        if let Some(callback) = &self.callback {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (callback)(event)));
        }
    }
}

/// Interprets the fixed topologies over a [`TurnState`].
///
/// Models, tools and the approval provider are handed in at construction; the engine keeps
/// no state between runs, so one engine can serve concurrent turns that each own their
/// state.
pub struct WorkflowEngine {
    models: ModelRegistry,
    tools: ToolRegistry,
    approval: Arc<dyn ApprovalProvider>,
    max_rounds: Option<usize>,
    router_model: String,
    events: EventSink,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("models", &self.models)
            .field("tools", &self.tools)
            .field("max_rounds", &self.max_rounds)
            .field("router_model", &self.router_model)
            .finish()
    }
}

impl WorkflowEngine {
    pub fn new(models: ModelRegistry, tools: ToolRegistry) -> Self {
        Self {
            models,
            tools,
            approval: Arc::new(AutoApprove),
            max_rounds: Some(DEFAULT_MAX_ROUNDS),
            router_model: DEFAULT_ROUTER_MODEL.to_string(),
            events: EventSink::default(),
        }
    }

    pub fn with_approval(mut self, approval: Arc<dyn ApprovalProvider>) -> Self {
        self.approval = approval;
        self
    }

    /// Bound on agent/router rounds per run; `None` lets a run loop for as long as the
    /// model keeps requesting tools.
    pub fn with_max_rounds(mut self, max_rounds: Option<usize>) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Routing model for agents that do not name a secondary model.
    pub fn with_router_model(mut self, model_id: impl Into<String>) -> Self {
        self.router_model = model_id.into();
        self
    }

    pub fn with_event_callback(
        mut self,
        callback: impl Fn(&WorkflowEvent) + Send + Sync + 'static,
    ) -> Self {
        self.events = EventSink {
            callback: Some(Arc::new(callback)),
        };
        self
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run one turn of `agent` under the topology named by `topology`.
    pub async fn run(
        &self,
        topology: &str,
        agent: &AgentDefinition,
        state: TurnState,
    ) -> Result<TurnState, WorkflowError> {
        let kind: TopologyKind = topology.parse()?;
        self.run_kind(kind, agent, state).await
    }

    pub async fn run_kind(
        &self,
        kind: TopologyKind,
        agent: &AgentDefinition,
        mut state: TurnState,
    ) -> Result<TurnState, WorkflowError> {
        let graph = kind.compiled();
        let ctx = self.context(kind, agent)?;

        tracing::info!(agent = %agent.name, topology = %kind, messages = state.history().len(), "workflow run started");
        self.events.emit(&WorkflowEvent::Started {
            agent: agent.name.clone(),
            topology: kind,
        });

        let mut node = graph.entry();
        let mut rounds = 0usize;

        loop {
            if node.is_decision() {
                rounds += 1;
                if let Some(limit) = self.max_rounds {
                    if rounds > limit {
                        tracing::warn!(agent = %agent.name, topology = %kind, limit, "workflow exceeded round limit");
                        return Err(WorkflowError::MaxRoundsExceeded(limit));
                    }
                }
            }

            tracing::debug!(agent = %agent.name, node = %node, round = rounds, "entering node");
            self.events.emit(&WorkflowEvent::NodeEntered { node, round: rounds });

            let update = nodes::execute(node, &ctx, &state, rounds).await?;
            state.apply(update);

            match graph.next(node, &state) {
                Transition::To(next) => node = next,
                Transition::End => break,
            }
        }

        tracing::info!(agent = %agent.name, topology = %kind, rounds, "workflow run finished");
        self.events.emit(&WorkflowEvent::Finished {
            agent: agent.name.clone(),
            rounds,
        });
        Ok(state)
    }

    fn context<'a>(
        &'a self,
        kind: TopologyKind,
        agent: &'a AgentDefinition,
    ) -> Result<NodeContext<'a>, WorkflowError> {
        let tools = if kind.uses_tools() {
            self.tools.bind(&agent.tools)?
        } else {
            ToolRegistry::new()
        };

        let primary = self.models.resolve(&agent.model_id, agent.temperature)?;
        let (primary, router) = match kind {
            TopologyKind::Plain => (primary, None),
            TopologyKind::React | TopologyKind::ReactHuman => (primary.bind_tools(&tools), None),
            TopologyKind::AdvancedReact => {
                let router_id = agent
                    .secondary_model_id
                    .as_deref()
                    .unwrap_or(&self.router_model);
                let router = self
                    .models
                    .resolve(router_id, agent.temperature)?
                    .bind_tools(&tools);
                (primary, Some(router))
            }
        };

        Ok(NodeContext {
            kind,
            agent,
            primary,
            router,
            tools,
            approval: self.approval.as_ref(),
            events: &self.events,
        })
    }
}
