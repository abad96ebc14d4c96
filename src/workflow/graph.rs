//! The four fixed workflow topologies as static node/edge tables.
//!
//! Each [`TopologyKind`] is compiled once into a [`CompiledTopology`]: an entry node, the
//! node list and one outgoing edge per node. Conditional edges name their branches the
//! way a routing function labels its decision, which also lets a topology describe itself.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::workflow::state::TurnState;
use crate::WorkflowError;

/// Text a router reply contains when it has gathered enough information.
pub const FINAL_ANSWER: &str = "FINAL_ANSWER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    Plain,
    React,
    ReactHuman,
    AdvancedReact,
}

impl TopologyKind {
    pub const ALL: [TopologyKind; 4] = [
        TopologyKind::Plain,
        TopologyKind::React,
        TopologyKind::ReactHuman,
        TopologyKind::AdvancedReact,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyKind::Plain => "plain",
            TopologyKind::React => "react",
            TopologyKind::ReactHuman => "react_human",
            TopologyKind::AdvancedReact => "advanced_react",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TopologyKind::Plain => {
                "A simple agent that calls the model directly without tools: the system prompt \
                 and the conversation go in, one reply comes out."
            }
            TopologyKind::React => {
                "A ReAct agent: the model decides whether tools are needed, requested tools are \
                 executed and their results fed back until the model answers without tool calls."
            }
            TopologyKind::ReactHuman => {
                "A ReAct agent with a human in the loop: every batch of tool calls waits for \
                 approval; rejected calls send the model back to reconsider."
            }
            TopologyKind::AdvancedReact => {
                "A two-model agent: a fast router model gathers information with tools until it \
                 signals FINAL_ANSWER, then a response model writes the answer from the \
                 collected information alone."
            }
        }
    }

    pub fn uses_tools(&self) -> bool {
        !matches!(self, TopologyKind::Plain)
    }

    pub fn compiled(&self) -> &'static CompiledTopology {
        match self {
            TopologyKind::Plain => &PLAIN,
            TopologyKind::React => &REACT,
            TopologyKind::ReactHuman => &REACT_HUMAN,
            TopologyKind::AdvancedReact => &ADVANCED_REACT,
        }
    }
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopologyKind {
    type Err = WorkflowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        TopologyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value.trim())
            .ok_or_else(|| WorkflowError::UnknownTopology(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Agent,
    HumanApproval,
    Tools,
    Router,
    Response,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Agent => "agent",
            NodeKind::HumanApproval => "human_approval",
            NodeKind::Tools => "tools",
            NodeKind::Router => "router",
            NodeKind::Response => "response",
        }
    }

    /// Nodes that ask a model what to do next; each entry counts as one round.
    pub fn is_decision(&self) -> bool {
        matches!(self, NodeKind::Agent | NodeKind::Router)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    To(NodeKind),
    End,
}

impl Transition {
    fn label(&self) -> &'static str {
        match self {
            Transition::To(node) => node.as_str(),
            Transition::End => "__end__",
        }
    }
}

type RouteFn = fn(&TurnState) -> &'static str;

#[derive(Clone)]
pub enum Edge {
    Always(Transition),
    Conditional {
        route: RouteFn,
        branches: Vec<(&'static str, Transition)>,
    },
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Always(transition) => f.debug_tuple("Always").field(transition).finish(),
            Edge::Conditional { branches, .. } => f
                .debug_struct("Conditional")
                .field("branches", branches)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug)]
pub struct CompiledTopology {
    kind: TopologyKind,
    entry: NodeKind,
    nodes: Vec<NodeKind>,
    edges: Vec<(NodeKind, Edge)>,
}

impl CompiledTopology {
    pub fn kind(&self) -> TopologyKind {
        self.kind
    }

    pub fn entry(&self) -> NodeKind {
        self.entry
    }

    pub fn nodes(&self) -> &[NodeKind] {
        &self.nodes
    }

    pub fn edge(&self, from: NodeKind) -> Option<&Edge> {
        self.edges
            .iter()
            .find(|(node, _)| *node == from)
            .map(|(_, edge)| edge)
    }

    /// Where the run goes after `from` has updated `state`.
    pub fn next(&self, from: NodeKind, state: &TurnState) -> Transition {
        match self.edge(from) {
            None => Transition::End,
            Some(Edge::Always(transition)) => *transition,
            Some(Edge::Conditional { route, branches }) => {
                let label = route(state);
                branches
                    .iter()
                    .find(|(branch, _)| *branch == label)
                    .map(|(_, transition)| *transition)
                    .unwrap_or(Transition::End)
            }
        }
    }

    pub fn describe(&self) -> TopologyDiagram {
        let mut edges = Vec::new();
        for (from, edge) in &self.edges {
            match edge {
                Edge::Always(to) => edges.push(DiagramEdge {
                    from: from.as_str().to_string(),
                    to: to.label().to_string(),
                    label: None,
                }),
                Edge::Conditional { branches, .. } => {
                    for (label, to) in branches {
                        edges.push(DiagramEdge {
                            from: from.as_str().to_string(),
                            to: to.label().to_string(),
                            label: Some((*label).to_string()),
                        });
                    }
                }
            }
        }

        TopologyDiagram {
            kind: self.kind,
            description: self.kind.description().to_string(),
            entry: self.entry.as_str().to_string(),
            nodes: self.nodes.iter().map(|node| node.as_str().to_string()).collect(),
            edges,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramEdge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyDiagram {
    pub kind: TopologyKind,
    pub description: String,
    pub entry: String,
    pub nodes: Vec<String>,
    pub edges: Vec<DiagramEdge>,
}

impl TopologyDiagram {
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");
        out.push_str(&format!("    __start__ --> {}\n", self.entry));
        for edge in &self.edges {
            match &edge.label {
                Some(label) => {
                    out.push_str(&format!("    {} -.->|{}| {}\n", edge.from, label, edge.to))
                }
                None => out.push_str(&format!("    {} --> {}\n", edge.from, edge.to)),
            }
        }
        out
    }
}

fn last_has_tool_calls(state: &TurnState) -> bool {
    state
        .last_message()
        .map_or(false, |message| message.has_tool_calls())
}

fn route_after_agent(state: &TurnState) -> &'static str {
    if last_has_tool_calls(state) {
        "continue"
    } else {
        "end"
    }
}

fn route_after_approval(state: &TurnState) -> &'static str {
    if state.approved() {
        "execute"
    } else {
        "agent"
    }
}

fn route_after_router(state: &TurnState) -> &'static str {
    let Some(last) = state.last_message() else {
        return "respond";
    };
    let signalled = last.text().map_or(false, |text| text.contains(FINAL_ANSWER));
    if signalled || !last.has_tool_calls() {
        "respond"
    } else {
        "continue"
    }
}

static PLAIN: Lazy<CompiledTopology> = Lazy::new(|| CompiledTopology {
    kind: TopologyKind::Plain,
    entry: NodeKind::Agent,
    nodes: vec![NodeKind::Agent],
    edges: vec![(NodeKind::Agent, Edge::Always(Transition::End))],
});

static REACT: Lazy<CompiledTopology> = Lazy::new(|| CompiledTopology {
    kind: TopologyKind::React,
    entry: NodeKind::Agent,
    nodes: vec![NodeKind::Agent, NodeKind::Tools],
    edges: vec![
        (
            NodeKind::Agent,
            Edge::Conditional {
                route: route_after_agent,
                branches: vec![
                    ("continue", Transition::To(NodeKind::Tools)),
                    ("end", Transition::End),
                ],
            },
        ),
        (NodeKind::Tools, Edge::Always(Transition::To(NodeKind::Agent))),
    ],
});

static REACT_HUMAN: Lazy<CompiledTopology> = Lazy::new(|| CompiledTopology {
    kind: TopologyKind::ReactHuman,
    entry: NodeKind::Agent,
    nodes: vec![NodeKind::Agent, NodeKind::HumanApproval, NodeKind::Tools],
    edges: vec![
        (
            NodeKind::Agent,
            Edge::Conditional {
                route: route_after_agent,
                branches: vec![
                    ("continue", Transition::To(NodeKind::HumanApproval)),
                    ("end", Transition::End),
                ],
            },
        ),
        (
            NodeKind::HumanApproval,
            Edge::Conditional {
                route: route_after_approval,
                branches: vec![
                    ("execute", Transition::To(NodeKind::Tools)),
                    ("agent", Transition::To(NodeKind::Agent)),
                ],
            },
        ),
        (NodeKind::Tools, Edge::Always(Transition::To(NodeKind::Agent))),
    ],
});

static ADVANCED_REACT: Lazy<CompiledTopology> = Lazy::new(|| CompiledTopology {
    kind: TopologyKind::AdvancedReact,
    entry: NodeKind::Router,
    nodes: vec![NodeKind::Router, NodeKind::Tools, NodeKind::Response],
    edges: vec![
        (
            NodeKind::Router,
            Edge::Conditional {
                route: route_after_router,
                branches: vec![
                    ("continue", Transition::To(NodeKind::Tools)),
                    ("respond", Transition::To(NodeKind::Response)),
                ],
            },
        ),
        (NodeKind::Tools, Edge::Always(Transition::To(NodeKind::Router))),
        (NodeKind::Response, Edge::Always(Transition::End)),
    ],
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::ToolCall;
    use crate::types::ChatMessage;
    use serde_json::json;

    fn state_ending_with(message: ChatMessage) -> TurnState {
        TurnState::new(vec![ChatMessage::user("q"), message])
    }

    fn with_call(content: &str) -> ChatMessage {
        ChatMessage::assistant(content)
            .with_tool_calls(vec![ToolCall::named("search", json!({})).with_id("1")])
    }

    #[test]
    fn parses_known_tags_and_rejects_others() {
        for kind in TopologyKind::ALL {
            assert_eq!(kind.as_str().parse::<TopologyKind>().expect("tag"), kind);
        }
        let error = "swarm".parse::<TopologyKind>().unwrap_err();
        assert!(matches!(error, WorkflowError::UnknownTopology(tag) if tag == "swarm"));
    }

    #[test]
    fn react_agent_edge_follows_tool_calls() {
        let graph = TopologyKind::React.compiled();
        assert_eq!(
            graph.next(NodeKind::Agent, &state_ending_with(with_call(""))),
            Transition::To(NodeKind::Tools)
        );
        assert_eq!(
            graph.next(NodeKind::Agent, &state_ending_with(ChatMessage::assistant("hi"))),
            Transition::End
        );
        assert_eq!(
            graph.next(NodeKind::Tools, &TurnState::default()),
            Transition::To(NodeKind::Agent)
        );
    }

    #[test]
    fn router_prefers_final_answer_over_tool_calls() {
        let graph = TopologyKind::AdvancedReact.compiled();
        assert_eq!(
            graph.next(NodeKind::Router, &state_ending_with(with_call("FINAL_ANSWER"))),
            Transition::To(NodeKind::Response)
        );
        assert_eq!(
            graph.next(NodeKind::Router, &state_ending_with(with_call("searching"))),
            Transition::To(NodeKind::Tools)
        );
    }

    #[test]
    fn approval_edge_reads_flag() {
        let graph = TopologyKind::ReactHuman.compiled();
        let mut state = TurnState::default();
        assert_eq!(
            graph.next(NodeKind::HumanApproval, &state),
            Transition::To(NodeKind::Agent)
        );
        state.apply(crate::workflow::state::StateUpdate::default().with_approved(true));
        assert_eq!(
            graph.next(NodeKind::HumanApproval, &state),
            Transition::To(NodeKind::Tools)
        );
    }

    #[test]
    fn diagram_lists_every_branch() {
        let diagram = TopologyKind::ReactHuman.compiled().describe();
        assert_eq!(diagram.entry, "agent");
        assert_eq!(diagram.edges.len(), 5);
        let mermaid = diagram.to_mermaid();
        assert!(mermaid.contains("human_approval -.->|execute| tools"));
        assert!(mermaid.contains("agent -.->|end| __end__"));
    }
}
