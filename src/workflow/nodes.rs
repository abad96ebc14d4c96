use handlebars::Handlebars;
use once_cell::sync::Lazy;
use serde_json::json;

use crate::{
    agents::AgentDefinition,
    functions::{render_tool_output, ToolRegistry},
    models::ChatModel,
    types::{ChatMessage, MessageRole},
    workflow::{
        approval::{ApprovalDecision, ApprovalProvider, ApprovalRequest},
        engine::{EventSink, WorkflowEvent},
        graph::{NodeKind, TopologyKind},
        state::{StateUpdate, TurnState},
    },
    WorkflowError,
};

const ROUTER_PROMPT: &str = "You are a routing agent. Your job is to either:
1. Use tools to gather information (respond with tool calls)
2. Signal that you have enough information (respond with \"FINAL_ANSWER\")

Only respond with \"FINAL_ANSWER\" when you have all needed information.";

const RESPONSE_TEMPLATE: &str = "response";
const RESPONSE_PROMPT: &str = "You are a response generator. Using the collected information, \
provide a detailed and helpful response to the user's query.

Collected Information:
{{collected_info}}";

static PROMPTS: Lazy<Handlebars<'static>> = Lazy::new(|| {
    let mut registry = Handlebars::new();
    registry.register_escape_fn(handlebars::no_escape);
    registry.set_strict_mode(true);
    if let Err(error) = registry.register_template_string(RESPONSE_TEMPLATE, RESPONSE_PROMPT) {
        tracing::error!(%error, "response prompt template is invalid");
    }
    registry
});

/// Everything a node needs besides the state: resolved models and the bound tool set.
pub(crate) struct NodeContext<'a> {
    pub kind: TopologyKind,
    pub agent: &'a AgentDefinition,
    /// The agent model; in the router topology, the response model.
    pub primary: ChatModel,
    pub router: Option<ChatModel>,
    pub tools: ToolRegistry,
    pub approval: &'a dyn ApprovalProvider,
    pub events: &'a EventSink,
}

pub(crate) async fn execute(
    node: NodeKind,
    ctx: &NodeContext<'_>,
    state: &TurnState,
    round: usize,
) -> Result<StateUpdate, WorkflowError> {
    match node {
        NodeKind::Agent => agent(ctx, state).await,
        NodeKind::HumanApproval => human_approval(ctx, state, round).await,
        NodeKind::Tools => tools(ctx, state).await,
        NodeKind::Router => router(ctx, state).await,
        NodeKind::Response => response(ctx, state).await,
    }
}

fn with_system_prompt(prompt: &str, history: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage::system(prompt));
    messages.extend(history.iter().cloned());
    messages
}

async fn agent(ctx: &NodeContext<'_>, state: &TurnState) -> Result<StateUpdate, WorkflowError> {
    let messages = with_system_prompt(&ctx.agent.system_prompt, state.history());
    let reply = ctx.primary.invoke(&messages).await?;
    let update = StateUpdate::message(reply);

    Ok(match ctx.kind {
        TopologyKind::ReactHuman => update.with_approved(false),
        _ => update,
    })
}

async fn router(ctx: &NodeContext<'_>, state: &TurnState) -> Result<StateUpdate, WorkflowError> {
    let model = ctx.router.as_ref().unwrap_or(&ctx.primary);
    let messages = with_system_prompt(ROUTER_PROMPT, state.history());
    let reply = model.invoke(&messages).await?;
    Ok(StateUpdate::message(reply))
}

async fn human_approval(
    ctx: &NodeContext<'_>,
    state: &TurnState,
    round: usize,
) -> Result<StateUpdate, WorkflowError> {
    let pending = state
        .last_message()
        .filter(|message| message.role == MessageRole::Assistant)
        .map(|message| message.tool_calls.clone())
        .unwrap_or_default();

    let request = ApprovalRequest {
        agent: ctx.agent.name.clone(),
        round,
        tool_calls: pending,
    };
    let decision = ctx.approval.decide(&request).await?;
    ctx.events.emit(&WorkflowEvent::ApprovalDecided {
        round,
        approved: decision.is_approved(),
    });

    match decision {
        ApprovalDecision::Approve => Ok(StateUpdate::default().with_approved(true)),
        ApprovalDecision::Reject { reason } => {
            tracing::warn!(agent = %ctx.agent.name, round, ?reason, "tool calls rejected");
            let note = match reason {
                Some(reason) => format!("Tool call rejected by the user: {reason}"),
                None => "Tool call rejected by the user.".to_string(),
            };
            // Answer every pending call so the next model request stays well-formed.
            let mut update = StateUpdate::default().with_approved(false);
            for call in &request.tool_calls {
                update.push_message(ChatMessage::tool(call.call_id(), note.clone()).with_name(call.name()));
            }
            Ok(update)
        }
    }
}

async fn tools(ctx: &NodeContext<'_>, state: &TurnState) -> Result<StateUpdate, WorkflowError> {
    let calls = state
        .last_message()
        .filter(|message| message.role == MessageRole::Assistant)
        .map(|message| message.tool_calls.as_slice())
        .unwrap_or_default();

    // Resolve the whole batch first: an unknown name fails the turn before anything runs.
    for call in calls {
        ctx.tools.resolve(call.name())?;
    }

    let collect = ctx.kind == TopologyKind::AdvancedReact;
    let mut update = StateUpdate::default();

    for call in calls {
        let outcome = ctx.tools.invoke(&call.function).await;
        let (content, succeeded) = match outcome {
            Ok(value) => (render_tool_output(&value), true),
            Err(error) if error.is_recoverable_tool_error() => {
                tracing::warn!(tool = %call.name(), call_id = %call.call_id(), %error, "tool call failed; reporting to model");
                (format!("Error: {error}"), false)
            }
            Err(error) => return Err(error),
        };

        ctx.events.emit(&WorkflowEvent::ToolInvoked {
            tool: call.name().to_string(),
            call_id: call.call_id().to_string(),
            succeeded,
        });

        if collect {
            update.push_info(format!("{}: {}", call.name(), content));
        }
        update.push_message(ChatMessage::tool(call.call_id(), content).with_name(call.name()));
    }

    Ok(match ctx.kind {
        TopologyKind::ReactHuman => update.with_approved(false),
        _ => update,
    })
}

async fn response(ctx: &NodeContext<'_>, state: &TurnState) -> Result<StateUpdate, WorkflowError> {
    let system = PROMPTS
        .render(
            RESPONSE_TEMPLATE,
            &json!({ "collected_info": state.collected_info().join("\n") }),
        )
        .map_err(|error| WorkflowError::Prompt(error.to_string()))?;
    let query = state.original_query().unwrap_or_default();

    let messages = vec![ChatMessage::system(system), ChatMessage::user(query)];
    let reply = ctx.primary.invoke(&messages).await?;
    Ok(StateUpdate::message(reply))
}
