use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use turnwerk::{
    providers::scripted::ScriptedProvider,
    workflow::{ApprovalDecision, ApprovalRequest, NodeKind},
    AgentDefinition, ChatMessage, FunctionDefinition, FunctionParameter, LLMError, LLMProvider,
    MessageRole, ModelRegistry, ToolCall, ToolFunction, ToolRegistry, TopologyKind, TurnState,
    WorkflowEngine, WorkflowError, WorkflowEvent,
};

const MODEL: &str = "llama-3.3-70b-versatile";

/// Tool that records its invocations and answers `"{name} saw {query}"`.
struct Recorder {
    name: &'static str,
    calls: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

#[async_trait]
impl ToolFunction for Recorder {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition::new(self.name)
            .with_description("records the query")
            .with_parameter(FunctionParameter::new("query", json!({ "type": "string" })))
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, LLMError> {
        let query = arguments["query"].as_str().unwrap_or_default().to_string();
        self.calls
            .lock()
            .expect("calls")
            .push(format!("{}:{}", self.name, query));
        if self.fail {
            return Err(LLMError::FunctionExecution {
                function: self.name.to_string(),
                message: "backend unavailable".to_string(),
            });
        }
        Ok(Value::String(format!("{} saw {}", self.name, query)))
    }
}

struct Harness {
    provider: Arc<ScriptedProvider>,
    calls: Arc<Mutex<Vec<String>>>,
    engine: WorkflowEngine,
}

impl Harness {
    fn new(replies: Vec<ChatMessage>) -> Self {
        Self::with_failing(replies, &[])
    }

    fn with_failing(replies: Vec<ChatMessage>, failing: &[&str]) -> Self {
        let provider = Arc::new(ScriptedProvider::from_replies(replies));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut tools = ToolRegistry::new();
        for name in ["search", "lookup"] {
            tools.register(Arc::new(Recorder {
                name,
                calls: calls.clone(),
                fail: failing.contains(&name),
            }));
        }
        let shared: Arc<dyn LLMProvider> = provider.clone();
        let engine = WorkflowEngine::new(ModelRegistry::new().with_provider_for_all(shared), tools);
        Self {
            provider,
            calls,
            engine,
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

fn agent(kind: TopologyKind) -> AgentDefinition {
    let agent = AgentDefinition::new("Tester", kind, MODEL).with_system_prompt("be brief");
    if kind.uses_tools() {
        agent.with_tools(["search", "lookup"])
    } else {
        agent
    }
}

fn calling(calls: Vec<ToolCall>) -> ChatMessage {
    ChatMessage::assistant("").with_tool_calls(calls)
}

fn search(id: &str, query: &str) -> ToolCall {
    ToolCall::named("search", json!({ "query": query })).with_id(id)
}

fn turn(query: &str) -> TurnState {
    TurnState::from_turn(Vec::<(MessageRole, String)>::new(), query)
}

fn counting_rounds(engine: WorkflowEngine) -> (WorkflowEngine, Arc<Mutex<Vec<WorkflowEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let engine = engine.with_event_callback(move |event| {
        sink.lock().expect("events").push(event.clone());
    });
    (engine, events)
}

#[tokio::test]
async fn every_topology_stops_after_one_round_without_tool_calls() {
    for kind in TopologyKind::ALL {
        let replies = match kind {
            TopologyKind::AdvancedReact => vec![
                ChatMessage::assistant("FINAL_ANSWER"),
                ChatMessage::assistant("done"),
            ],
            _ => vec![ChatMessage::assistant("done")],
        };
        let harness = Harness::new(replies);
        let (engine, events) = counting_rounds(harness.engine);

        let state = engine
            .run(kind.as_str(), &agent(kind), turn("hello"))
            .await
            .expect("run");

        assert_eq!(state.final_reply(), Some("done"), "{kind}");
        let rounds = events
            .lock()
            .expect("events")
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    WorkflowEvent::NodeEntered { node: NodeKind::Agent | NodeKind::Router, .. }
                )
            })
            .count();
        assert_eq!(rounds, 1, "{kind}");
        assert!(harness.calls.lock().expect("calls").is_empty());
    }
}

#[tokio::test]
async fn react_history_holds_call_result_and_answer() {
    let harness = Harness::new(vec![
        calling(vec![search("a", "scores")]),
        ChatMessage::assistant("the Celtics won"),
    ]);

    let state = harness
        .engine
        .run("react", &agent(TopologyKind::React), turn("who won?"))
        .await
        .expect("run");

    let history = state.history();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0], ChatMessage::user("who won?"));
    assert_eq!(history[1].tool_calls, vec![search("a", "scores")]);
    assert_eq!(history[2].role, MessageRole::Tool);
    assert_eq!(history[2].tool_call_id.as_deref(), Some("a"));
    assert_eq!(history[2].text(), Some("search saw scores"));
    assert_eq!(history[3].text(), Some("the Celtics won"));
    assert!(!history.iter().any(|message| message.role == MessageRole::System));

    assert_eq!(harness.provider.requests().len(), 2);
    let second = &harness.provider.requests()[1];
    assert_eq!(second.messages[0], ChatMessage::system("be brief"));
    assert_eq!(second.tools.len(), 2);
}

#[tokio::test]
async fn tool_results_follow_call_order() {
    let harness = Harness::new(vec![
        calling(vec![
            ToolCall::named("lookup", json!({ "query": "x" })).with_id("X"),
            search("Y", "y"),
        ]),
        ChatMessage::assistant("ok"),
    ]);

    let state = harness
        .engine
        .run("react", &agent(TopologyKind::React), turn("go"))
        .await
        .expect("run");

    let results: Vec<(&str, &str)> = state
        .history()
        .iter()
        .filter(|message| message.role == MessageRole::Tool)
        .map(|message| {
            (
                message.tool_call_id.as_deref().unwrap_or_default(),
                message.text().unwrap_or_default(),
            )
        })
        .collect();
    assert_eq!(results, vec![("X", "lookup saw x"), ("Y", "search saw y")]);
    assert_eq!(harness.calls(), vec!["lookup:x", "search:y"]);
}

#[tokio::test]
async fn router_collects_one_entry_per_call_and_answers_the_original_query() {
    let harness = Harness::new(vec![
        calling(vec![search("1", "standings"), search("2", "injuries")]),
        calling(vec![ToolCall::named("lookup", json!({ "query": "schedule" })).with_id("3")]),
        ChatMessage::assistant("FINAL_ANSWER"),
        ChatMessage::assistant("Here is the summary"),
    ]);
    let agent = agent(TopologyKind::AdvancedReact);

    let state = harness
        .engine
        .run("advanced_react", &agent, turn("how are the Lakers doing?"))
        .await
        .expect("run");

    assert_eq!(
        state.collected_info(),
        [
            "search: search saw standings",
            "search: search saw injuries",
            "lookup: lookup saw schedule",
        ]
    );
    assert_eq!(state.final_reply(), Some("Here is the summary"));

    let requests = harness.provider.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[0].model, turnwerk::models::DEFAULT_ROUTER_MODEL);
    let response = &requests[3];
    assert_eq!(response.model, MODEL);
    assert!(response.tools.is_empty());
    assert_eq!(response.messages.len(), 2);
    assert!(response.messages[0]
        .text()
        .unwrap_or_default()
        .ends_with("Collected Information:\nsearch: search saw standings\nsearch: search saw injuries\nlookup: lookup saw schedule"));
    assert_eq!(response.messages[1], ChatMessage::user("how are the Lakers doing?"));
}

#[tokio::test]
async fn secondary_model_drives_routing() {
    let harness = Harness::new(vec![
        ChatMessage::assistant("FINAL_ANSWER"),
        ChatMessage::assistant("answer"),
    ]);
    let agent = agent(TopologyKind::AdvancedReact).with_secondary_model("llama3-groq-8b-8192-tool-use-preview");

    harness
        .engine
        .run("advanced_react", &agent, turn("q"))
        .await
        .expect("run");

    let requests = harness.provider.requests();
    assert_eq!(requests[0].model, "llama3-groq-8b-8192-tool-use-preview");
    assert_eq!(requests[1].model, MODEL);
}

#[tokio::test]
async fn rejection_returns_to_agent_without_running_tools() {
    let harness = Harness::new(vec![
        calling(vec![search("a", "secrets")]),
        ChatMessage::assistant("I will answer without searching"),
    ]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let engine = harness.engine.with_approval(Arc::new(move |request: &ApprovalRequest| {
        record.lock().expect("seen").push(request.tool_calls.clone());
        ApprovalDecision::reject("too risky")
    }));

    let state = engine
        .run("react_human", &agent(TopologyKind::ReactHuman), turn("search it"))
        .await
        .expect("run");

    assert!(harness.calls.lock().expect("calls").is_empty());
    assert_eq!(seen.lock().expect("seen").as_slice(), [vec![search("a", "secrets")]]);
    assert_eq!(state.history()[2].text(), Some("Tool call rejected by the user: too risky"));
    assert_eq!(state.history()[2].tool_call_id.as_deref(), Some("a"));
    assert_eq!(state.final_reply(), Some("I will answer without searching"));
    assert!(!state.approved());
}

#[tokio::test]
async fn approval_runs_exactly_the_requested_tools() {
    let harness = Harness::new(vec![
        calling(vec![search("a", "one")]),
        calling(vec![ToolCall::named("lookup", json!({ "query": "two" })).with_id("b")]),
        ChatMessage::assistant("done"),
    ]);
    let (engine, events) = counting_rounds(harness.engine);

    let state = engine
        .run("react_human", &agent(TopologyKind::ReactHuman), turn("go"))
        .await
        .expect("run");

    assert_eq!(harness.calls.lock().expect("calls").clone(), vec!["search:one", "lookup:two"]);
    assert!(!state.approved());
    let approvals = events
        .lock()
        .expect("events")
        .iter()
        .filter(|event| matches!(event, WorkflowEvent::ApprovalDecided { approved: true, .. }))
        .count();
    assert_eq!(approvals, 2);
}

#[tokio::test]
async fn identical_input_yields_identical_output() {
    let script = || {
        vec![
            calling(vec![search("a", "q")]),
            ChatMessage::assistant("answer"),
        ]
    };
    let first = Harness::new(script());
    let second = Harness::new(script());
    let agent = agent(TopologyKind::React);

    let a = first.engine.run("react", &agent, turn("q")).await.expect("run");
    let b = second.engine.run("react", &agent, turn("q")).await.expect("run");
    assert_eq!(a, b);
}

#[tokio::test]
async fn unknown_tool_fails_the_batch_before_anything_runs() {
    let harness = Harness::new(vec![calling(vec![
        search("a", "first"),
        ToolCall::named("teleport", json!({})).with_id("b"),
    ])]);

    let error = harness
        .engine
        .run("react", &agent(TopologyKind::React), turn("go"))
        .await
        .unwrap_err();

    assert!(matches!(error, WorkflowError::ToolNotFound(name) if name == "teleport"));
    assert!(harness.calls().is_empty());
}

#[tokio::test]
async fn failing_tool_is_reported_and_the_batch_continues() {
    let harness = Harness::with_failing(
        vec![
            calling(vec![search("a", "x"), ToolCall::named("lookup", json!({ "query": "y" })).with_id("b")]),
            ChatMessage::assistant("recovered"),
        ],
        &["search"],
    );

    let state = harness
        .engine
        .run("react", &agent(TopologyKind::React), turn("go"))
        .await
        .expect("run");

    assert_eq!(harness.calls(), vec!["search:x", "lookup:y"]);
    let failed = state.history()[2].text().unwrap_or_default();
    assert!(failed.starts_with("Error: "), "{failed}");
    assert!(failed.contains("backend unavailable"));
    assert_eq!(state.history()[3].text(), Some("lookup saw y"));
    assert_eq!(state.final_reply(), Some("recovered"));
}

#[tokio::test]
async fn malformed_arguments_become_a_tool_message() {
    let harness = Harness::new(vec![
        calling(vec![ToolCall::named("search", json!({ "query": 42 })).with_id("a")]),
        ChatMessage::assistant("let me fix that"),
    ]);

    let state = harness
        .engine
        .run("react", &agent(TopologyKind::React), turn("go"))
        .await
        .expect("run");

    assert!(harness.calls().is_empty());
    let report = state.history()[2].text().unwrap_or_default();
    assert!(report.starts_with("Error: malformed call to search"), "{report}");
    assert_eq!(state.final_reply(), Some("let me fix that"));
}

#[tokio::test]
async fn truncated_argument_json_from_the_wire_is_reported_back() {
    let truncated: ChatMessage = serde_json::from_value(json!({
        "role": "assistant",
        "content": null,
        "tool_calls": [{
            "id": "a",
            "type": "function",
            "function": { "name": "search", "arguments": "{\"query\": \"nba" }
        }]
    }))
    .expect("reply with truncated arguments still decodes");
    let harness = Harness::new(vec![truncated, ChatMessage::assistant("retrying was not needed")]);

    let state = harness
        .engine
        .run("react", &agent(TopologyKind::React), turn("go"))
        .await
        .expect("run");

    assert!(harness.calls().is_empty());
    let report = &state.history()[2];
    assert_eq!(report.role, MessageRole::Tool);
    assert_eq!(report.tool_call_id.as_deref(), Some("a"));
    let text = report.text().unwrap_or_default();
    assert!(text.starts_with("Error: malformed call to search"), "{text}");
    assert!(text.contains("not valid JSON"), "{text}");
    assert_eq!(state.final_reply(), Some("retrying was not needed"));

    // The second request echoes the model's own argument text back to it.
    let requests = harness.provider.requests();
    let echoed = &requests[1].messages[2].tool_calls[0].function;
    assert_eq!(echoed.raw_arguments.as_deref(), Some("{\"query\": \"nba"));
}

#[tokio::test]
async fn round_guard_stops_a_looping_model() {
    let loop_forever: Vec<ChatMessage> = (0..10)
        .map(|index| calling(vec![search(&format!("c{index}"), "again")]))
        .collect();
    let harness = Harness::new(loop_forever);
    let engine = harness.engine.with_max_rounds(Some(3));

    let error = engine
        .run("react", &agent(TopologyKind::React), turn("go"))
        .await
        .unwrap_err();

    assert!(matches!(error, WorkflowError::MaxRoundsExceeded(3)));
    assert_eq!(harness.calls.lock().expect("calls").len(), 3);
}

#[tokio::test]
async fn unknown_topology_is_a_configuration_error() {
    let harness = Harness::new(vec![]);
    let error = harness
        .engine
        .run("swarm", &agent(TopologyKind::Plain), turn("go"))
        .await
        .unwrap_err();
    assert!(matches!(error, WorkflowError::UnknownTopology(tag) if tag == "swarm"));
    assert!(harness.provider.requests().is_empty());
}

#[tokio::test]
async fn plain_model_may_not_request_tools() {
    let harness = Harness::new(vec![calling(vec![search("a", "x")])]);
    let error = harness
        .engine
        .run("plain", &agent(TopologyKind::Plain), turn("go"))
        .await
        .unwrap_err();
    assert!(matches!(error, WorkflowError::ModelInvocation(_)));
}
