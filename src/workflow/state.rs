use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, MessageRole};

/// State threaded through one workflow run.
///
/// `history` is append-only for the duration of a run. `collected_info` is only written by
/// the router topology and `approved` only by the human-approval topology; the other
/// topologies leave them at their seed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnState {
    history: Vec<ChatMessage>,
    #[serde(default)]
    collected_info: Vec<String>,
    #[serde(default)]
    approved: bool,
}

impl TurnState {
    pub fn new(history: Vec<ChatMessage>) -> Self {
        Self {
            history,
            collected_info: Vec::new(),
            approved: false,
        }
    }

    /// Prior `(role, content)` pairs followed by the new user utterance.
    pub fn from_turn<I, S>(prior: I, utterance: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = (MessageRole, S)>,
        S: Into<String>,
    {
        let mut history: Vec<ChatMessage> = prior
            .into_iter()
            .map(|(role, content)| ChatMessage::new(role, content))
            .collect();
        history.push(ChatMessage::user(utterance));
        Self::new(history)
    }

    pub fn with_collected_info(mut self, seed: Vec<String>) -> Self {
        self.collected_info = seed;
        self
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn into_history(self) -> Vec<ChatMessage> {
        self.history
    }

    pub fn collected_info(&self) -> &[String] {
        &self.collected_info
    }

    pub fn approved(&self) -> bool {
        self.approved
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.history.last()
    }

    /// The most recent user message, i.e. the query this turn answers.
    pub fn original_query(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::User)
            .and_then(ChatMessage::text)
    }

    /// Content of the closing assistant reply, once the run has terminated.
    pub fn final_reply(&self) -> Option<&str> {
        self.last_message()
            .filter(|message| message.role == MessageRole::Assistant && !message.has_tool_calls())
            .and_then(ChatMessage::text)
    }

    pub(crate) fn apply(&mut self, update: StateUpdate) {
        for message in &update.messages {
            debug_assert!(
                message.role != MessageRole::Tool || self.answers_pending_call(message),
                "tool result does not answer a call of the preceding assistant message"
            );
            self.history.push(message.clone());
        }
        self.collected_info.extend(update.collected_info);
        if let Some(approved) = update.approved {
            self.approved = approved;
        }
    }

    fn answers_pending_call(&self, message: &ChatMessage) -> bool {
        let Some(id) = message.tool_call_id.as_deref() else {
            return false;
        };
        self.history
            .iter()
            .rev()
            .find(|candidate| candidate.role == MessageRole::Assistant)
            .map_or(false, |assistant| {
                assistant.tool_calls.iter().any(|call| call.call_id() == id)
            })
    }
}

/// Partial state produced by a node; the driver appends it to the running state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub messages: Vec<ChatMessage>,
    pub collected_info: Vec<String>,
    pub approved: Option<bool>,
}

impl StateUpdate {
    pub fn message(message: ChatMessage) -> Self {
        Self {
            messages: vec![message],
            ..Self::default()
        }
    }

    pub fn push_message(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn push_info(&mut self, info: impl Into<String>) {
        self.collected_info.push(info.into());
    }

    pub fn with_approved(mut self, approved: bool) -> Self {
        self.approved = Some(approved);
        self
    }
}
