//! Per-agent conversations on top of the workflow engine.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{
    agents::{AgentCatalog, AgentDefinition, AgentError},
    history::ChatHistory,
    workflow::{TopologyKind, TurnState, WorkflowEngine},
};

/// What a turn hands back for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub agent: String,
    pub reply: String,
    /// Router topology only; empty otherwise.
    pub collected_info: Vec<String>,
}

/// One agent's conversation. The agent's definition is read from the catalogue on every
/// turn, so re-registering an agent applies to conversations that are already open.
#[derive(Debug)]
pub struct AgentSession {
    key: String,
    history: ChatHistory,
    created_at: DateTime<Utc>,
}

impl AgentSession {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            history: ChatHistory::new(),
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// A conversation shared between the manager and the turns running against it.
pub type SharedSession = Arc<Mutex<AgentSession>>;

/// Maps agent names to their conversation and hands out [`Turn`]s to run against them.
///
/// Preparing a turn only needs the manager briefly; the turn itself runs without it.
/// Turns on the same conversation wait for each other, turns on different conversations
/// run concurrently.
pub struct SessionManager {
    engine: Arc<WorkflowEngine>,
    catalog: AgentCatalog,
    sessions: HashMap<String, SharedSession>,
    current: Option<String>,
}

impl SessionManager {
    pub fn new(engine: Arc<WorkflowEngine>, catalog: AgentCatalog) -> Self {
        Self {
            engine,
            catalog,
            sessions: HashMap::new(),
            current: None,
        }
    }

    pub fn catalog(&self) -> &AgentCatalog {
        &self.catalog
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn register_agent(&mut self, agent: AgentDefinition) -> Result<(), AgentError> {
        self.catalog.register(agent, self.engine.models())
    }

    /// Open (or reopen) the conversation with `key` and make it current.
    ///
    /// An existing conversation keeps its history.
    pub fn open(&mut self, key: &str) -> Result<SharedSession, AgentError> {
        self.catalog.get(key)?;
        self.current = Some(key.to_string());
        let session = self.sessions.entry(key.to_string()).or_insert_with(|| {
            tracing::info!(agent = %key, "opened agent session");
            Arc::new(Mutex::new(AgentSession::new(key)))
        });
        Ok(session.clone())
    }

    pub fn switch(&mut self, key: &str) -> Result<SharedSession, AgentError> {
        self.open(key)
    }

    pub fn current_key(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current(&self) -> Option<SharedSession> {
        self.current.as_deref().and_then(|key| self.session(key))
    }

    pub fn session(&self, key: &str) -> Option<SharedSession> {
        self.sessions.get(key).cloned()
    }

    /// Prepare a turn against `key`'s conversation, opening it first if needed.
    ///
    /// The turn carries the agent's current definition and does not borrow the manager.
    pub fn turn(&mut self, key: &str) -> Result<Turn, AgentError> {
        let session = match self.sessions.get(key) {
            Some(session) => session.clone(),
            None => self.open(key)?,
        };
        let agent = self.catalog.get(key)?.clone();
        Ok(Turn {
            key: key.to_string(),
            agent,
            session,
            engine: self.engine.clone(),
        })
    }

    /// Run one turn against the current session.
    pub async fn send(&mut self, text: &str) -> Result<TurnOutcome, AgentError> {
        let key = self.current.clone().ok_or(AgentError::NoActiveSession)?;
        self.send_to(&key, text).await
    }

    /// Run one turn against `key`'s conversation, opening it first if needed.
    pub async fn send_to(&mut self, key: &str, text: &str) -> Result<TurnOutcome, AgentError> {
        self.turn(key)?.run(text).await
    }
}

/// One prepared turn: the agent definition, its conversation and the engine to run it on.
pub struct Turn {
    key: String,
    agent: AgentDefinition,
    session: SharedSession,
    engine: Arc<WorkflowEngine>,
}

impl Turn {
    /// Run the turn. The conversation stays locked until the turn finishes, and its history
    /// is only extended when the turn succeeds.
    pub async fn run(self, text: &str) -> Result<TurnOutcome, AgentError> {
        let kind = self.agent.topology_kind()?;
        let mut session = self.session.lock().await;

        let state = TurnState::from_turn(session.history.as_pairs(), text).with_collected_info(Vec::new());
        let finished = self.engine.run_kind(kind, &self.agent, state).await?;

        let reply = finished.final_reply().unwrap_or_default().to_string();
        let collected_info = match kind {
            TopologyKind::AdvancedReact => finished.collected_info().to_vec(),
            _ => Vec::new(),
        };

        session.history.push_user(text);
        session.history.push_assistant(reply.clone());

        Ok(TurnOutcome {
            agent: self.key,
            reply,
            collected_info,
        })
    }
}
