use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turnwerk::{
    check_environment, providers::scripted::ScriptedProvider, AgentDefinition, AgentError,
    AppConfig, ChatEntry, LLMProvider, SessionManager, TopologyKind, WorkflowError,
};

#[derive(Parser)]
#[command(name = "turnwerk-server")]
#[command(about = "HTTP API for chatting with turnwerk agents")]
struct Args {
    /// Answer every turn with a canned reply instead of calling Groq
    #[arg(long)]
    scripted: bool,

    /// Listen address (defaults to TURNWERK_BIND or 0.0.0.0:3002)
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,turnwerk=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = AppConfig::from_env()?;

    let models = if args.scripted {
        let provider: Arc<dyn LLMProvider> =
            Arc::new(ScriptedProvider::new().with_fallback("This is a scripted reply."));
        config.models_with(provider)
    } else {
        check_environment(&["GROQ_API_KEY"])?;
        config.models()?
    };
    let tools = config.tools()?;
    let catalog = config.catalog(&models)?;
    let engine = Arc::new(config.engine(models, tools));

    let app_state = Arc::new(AppState {
        sessions: Mutex::new(SessionManager::new(engine, catalog)),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/agents", get(list_agents).post(create_agent))
        .route("/api/models", get(list_models))
        .route("/api/sessions/{agent}", get(get_session))
        .route("/api/sessions/{agent}/messages", post(send_message))
        .route("/api/topologies/{kind}", get(get_topology))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = args.bind.unwrap_or(config.bind);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, scripted = args.scripted, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

struct AppState {
    sessions: Mutex<SessionManager>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    success: bool,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse {
        data,
        message: None,
        success: true,
    })
    .into_response()
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse {
            data: (),
            message: Some(message.into()),
            success: false,
        }),
    )
        .into_response()
}

fn agent_error(error: AgentError) -> Response {
    let status = match &error {
        AgentError::UnknownAgent(_) => StatusCode::NOT_FOUND,
        AgentError::InvalidAgent { .. }
        | AgentError::Workflow(WorkflowError::UnknownModel(_))
        | AgentError::Workflow(WorkflowError::UnknownTopology(_))
        | AgentError::Workflow(WorkflowError::TemperatureOutOfRange { .. }) => StatusCode::BAD_REQUEST,
        AgentError::Workflow(WorkflowError::ModelTimeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        AgentError::Workflow(WorkflowError::ModelInvocation(_)) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(%error, status = status.as_u16(), "request failed");
    fail(status, error.to_string())
}

#[derive(Serialize)]
struct AgentSummary {
    key: String,
    #[serde(flatten)]
    agent: AgentDefinition,
}

async fn list_agents(State(state): State<Arc<AppState>>) -> Response {
    let sessions = state.sessions.lock().await;
    let agents: Vec<AgentSummary> = sessions
        .catalog()
        .list()
        .into_iter()
        .map(|(key, agent)| AgentSummary {
            key: key.to_string(),
            agent: agent.clone(),
        })
        .collect();
    ok(agents)
}

async fn create_agent(
    State(state): State<Arc<AppState>>,
    Json(agent): Json<AgentDefinition>,
) -> Response {
    let mut sessions = state.sessions.lock().await;
    let name = agent.name.clone();
    match sessions.register_agent(agent) {
        Ok(()) => (
            StatusCode::CREATED,
            Json(ApiResponse {
                data: serde_json::json!({ "name": name }),
                message: Some("Agent created".into()),
                success: true,
            }),
        )
            .into_response(),
        Err(error) => agent_error(error),
    }
}

#[derive(Serialize)]
struct ModelSummary {
    id: String,
    #[serde(flatten)]
    spec: turnwerk::ModelSpec,
}

async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let sessions = state.sessions.lock().await;
    let models: Vec<ModelSummary> = sessions
        .engine()
        .models()
        .models()
        .map(|(id, spec)| ModelSummary {
            id: id.clone(),
            spec: spec.clone(),
        })
        .collect();
    ok(models)
}

#[derive(Serialize)]
struct SessionView {
    agent: AgentDefinition,
    messages: Vec<ChatEntry>,
}

async fn get_session(State(state): State<Arc<AppState>>, Path(agent): Path<String>) -> Response {
    let opened = {
        let mut sessions = state.sessions.lock().await;
        sessions.open(&agent).and_then(|session| {
            let definition = sessions.catalog().get(&agent)?.clone();
            Ok((definition, session))
        })
    };
    match opened {
        Ok((agent, session)) => {
            let session = session.lock().await;
            ok(SessionView {
                agent,
                messages: session.history().entries().to_vec(),
            })
        }
        Err(error) => agent_error(error),
    }
}

#[derive(Deserialize)]
struct SendMessageRequest {
    content: String,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Response {
    if request.content.trim().is_empty() {
        return fail(StatusCode::BAD_REQUEST, "message content must not be empty");
    }
    // The manager is only locked while the turn is prepared; the turn locks its own conversation.
    let turn = state.sessions.lock().await.turn(&agent);
    let outcome = match turn {
        Ok(turn) => turn.run(&request.content).await,
        Err(error) => Err(error),
    };
    match outcome {
        Ok(outcome) => ok(outcome),
        Err(error) => agent_error(error),
    }
}

#[derive(Serialize)]
struct TopologyView {
    #[serde(flatten)]
    diagram: turnwerk::workflow::TopologyDiagram,
    mermaid: String,
}

async fn get_topology(Path(kind): Path<String>) -> Response {
    match kind.parse::<TopologyKind>() {
        Ok(kind) => {
            let diagram = kind.compiled().describe();
            let mermaid = diagram.to_mermaid();
            ok(TopologyView { diagram, mermaid })
        }
        Err(error) => fail(StatusCode::NOT_FOUND, error.to_string()),
    }
}
