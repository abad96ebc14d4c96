//! Model catalogue and the model invocation adapter.
//!
//! A [`ModelRegistry`] knows which models exist, their temperature bounds and which
//! [`LLMProvider`] serves them. Resolving a model id yields a [`ChatModel`], the callable
//! the workflow nodes use: optionally bound to a tool set, it turns a message list into
//! exactly one assistant reply.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time;

use crate::{
    functions::{Tool, ToolChoice, ToolRegistry},
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, MessageRole},
    LLMError, WorkflowError,
};

pub const DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";
pub const DEFAULT_ROUTER_MODEL: &str = "llama3-groq-70b-8192-tool-use-preview";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaSupport {
    TextOnly,
    TextAndImage,
    ImageOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub provider: String,
    pub max_temperature: f32,
    pub default_temperature: f32,
    pub description: String,
    pub media: MediaSupport,
    pub cost_per_1k: f64,
    pub context_length: u32,
}

impl ModelSpec {
    fn groq(description: &str) -> Self {
        Self {
            provider: "groq".to_string(),
            max_temperature: 1.0,
            default_temperature: 0.7,
            description: description.to_string(),
            media: MediaSupport::TextOnly,
            cost_per_1k: 0.0007,
            context_length: 8192,
        }
    }

    pub fn check_temperature(&self, model: &str, temperature: f32) -> Result<(), WorkflowError> {
        if !(0.0..=self.max_temperature).contains(&temperature) {
            return Err(WorkflowError::TemperatureOutOfRange {
                model: model.to_string(),
                temperature,
                max: self.max_temperature,
            });
        }
        Ok(())
    }
}

/// The models offered out of the box.
pub fn builtin_models() -> BTreeMap<String, ModelSpec> {
    let mut models = BTreeMap::new();
    models.insert(
        DEFAULT_MODEL.to_string(),
        ModelSpec::groq("High-performance open source model, good for general tasks"),
    );
    models.insert(
        "llama3-groq-8b-8192-tool-use-preview".to_string(),
        ModelSpec::groq("Small model, fine tuned for tool routing"),
    );
    models.insert(
        DEFAULT_ROUTER_MODEL.to_string(),
        ModelSpec::groq("Large model, fine tuned for tool routing"),
    );
    models
}

#[derive(Clone)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelSpec>,
    providers: HashMap<String, Arc<dyn LLMProvider>>,
    call_timeout: Option<Duration>,
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    /// Registry holding the built-in catalogue and no providers.
    pub fn new() -> Self {
        Self {
            models: builtin_models(),
            providers: HashMap::new(),
            call_timeout: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            models: BTreeMap::new(),
            providers: HashMap::new(),
            call_timeout: None,
        }
    }

    pub fn with_model(mut self, id: impl Into<String>, spec: ModelSpec) -> Self {
        self.models.insert(id.into(), spec);
        self
    }

    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn LLMProvider>) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    /// Serve every catalogued provider name with the same backend.
    pub fn with_provider_for_all(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        let names: Vec<String> = self.models.values().map(|spec| spec.provider.clone()).collect();
        for name in names {
            self.providers.insert(name, provider.clone());
        }
        self
    }

    /// Upper bound for a single model call; the engine itself never retries.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn spec(&self, model_id: &str) -> Option<&ModelSpec> {
        self.models.get(model_id)
    }

    pub fn models(&self) -> impl Iterator<Item = (&String, &ModelSpec)> {
        self.models.iter()
    }

    pub fn models_by_provider(&self, provider: &str) -> Vec<(&String, &ModelSpec)> {
        self.models
            .iter()
            .filter(|(_, spec)| spec.provider == provider)
            .collect()
    }

    pub fn resolve(&self, model_id: &str, temperature: f32) -> Result<ChatModel, WorkflowError> {
        let spec = self
            .spec(model_id)
            .ok_or_else(|| WorkflowError::UnknownModel(model_id.to_string()))?;
        spec.check_temperature(model_id, temperature)?;
        let provider = self
            .providers
            .get(&spec.provider)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownProvider(spec.provider.clone()))?;

        Ok(ChatModel {
            provider,
            model_id: model_id.to_string(),
            temperature,
            tools: Vec::new(),
            call_timeout: self.call_timeout,
        })
    }
}

/// A resolved model: provider, model id and sampling temperature, optionally tool-bound.
#[derive(Clone)]
pub struct ChatModel {
    provider: Arc<dyn LLMProvider>,
    model_id: String,
    temperature: f32,
    tools: Vec<Tool>,
    call_timeout: Option<Duration>,
}

impl fmt::Debug for ChatModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatModel")
            .field("provider", &self.provider.name())
            .field("model_id", &self.model_id)
            .field("temperature", &self.temperature)
            .field("tools", &self.tools.len())
            .finish()
    }
}

impl ChatModel {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn is_tool_bound(&self) -> bool {
        !self.tools.is_empty()
    }

    /// Permit (not require) the model to request calls to the tools in `registry`.
    pub fn bind_tools(mut self, registry: &ToolRegistry) -> Self {
        self.tools = registry.tools();
        self
    }

    /// One model call: `messages` in, exactly one assistant reply out.
    pub async fn invoke(&self, messages: &[ChatMessage]) -> Result<ChatMessage, WorkflowError> {
        let mut request = CompletionRequest::new(self.model_id.clone(), messages.to_vec())
            .with_temperature(self.temperature);
        if self.is_tool_bound() {
            request = request
                .with_tools(self.tools.iter().cloned())
                .with_tool_choice(ToolChoice::Auto);
        }

        let call = self.provider.complete(request);
        let response = match self.call_timeout {
            Some(limit) => time::timeout(limit, call)
                .await
                .map_err(|_| WorkflowError::ModelTimeout(limit.as_millis() as u64))??,
            None => call.await?,
        };

        self.normalize(response.message)
    }

    fn normalize(&self, mut reply: ChatMessage) -> Result<ChatMessage, WorkflowError> {
        if reply.role != MessageRole::Assistant {
            return Err(LLMError::InvalidResponse("reply was not an assistant message").into());
        }
        if reply.has_tool_calls() && !self.is_tool_bound() {
            return Err(
                LLMError::InvalidResponse("model requested tools but none were bound").into(),
            );
        }
        // Generated ids skip any the provider already used in this reply.
        let mut taken: HashSet<String> = reply
            .tool_calls
            .iter()
            .filter_map(|call| call.id.clone())
            .filter(|id| !id.is_empty())
            .collect();
        let mut next = 0usize;
        for call in &mut reply.tool_calls {
            if call.id.as_deref().map_or(true, str::is_empty) {
                while taken.contains(&format!("call_{next}")) {
                    next += 1;
                }
                let id = format!("call_{next}");
                taken.insert(id.clone());
                call.id = Some(id);
                next += 1;
            }
        }
        if reply.content.is_none() {
            reply.content = Some(String::new());
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::ToolCall;
    use crate::providers::scripted::ScriptedProvider;
    use crate::types::CompletionResponse;
    use async_trait::async_trait;
    use serde_json::json;

    fn registry(provider: Arc<dyn LLMProvider>) -> ModelRegistry {
        ModelRegistry::new().with_provider("groq", provider)
    }

    #[test]
    fn rejects_temperature_above_model_maximum() {
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider::new());
        let error = registry(provider).resolve(DEFAULT_MODEL, 1.5).unwrap_err();
        assert!(matches!(error, WorkflowError::TemperatureOutOfRange { .. }));
    }

    #[test]
    fn unknown_model_and_provider_are_reported() {
        let models = ModelRegistry::new();
        assert!(matches!(
            models.resolve("gpt-x", 0.5).unwrap_err(),
            WorkflowError::UnknownModel(_)
        ));
        assert!(matches!(
            models.resolve(DEFAULT_MODEL, 0.5).unwrap_err(),
            WorkflowError::UnknownProvider(_)
        ));
    }

    #[tokio::test]
    async fn fills_missing_tool_call_ids() {
        let provider = Arc::new(ScriptedProvider::from_replies(vec![ChatMessage::assistant("")
            .with_tool_calls(vec![
                ToolCall::named("a", json!({})),
                ToolCall::named("b", json!({})).with_id("keep"),
            ])]));
        let mut model = registry(provider).resolve(DEFAULT_MODEL, 0.7).expect("model");
        model.tools.push(crate::functions::FunctionDefinition::new("a").to_tool());

        let reply = model.invoke(&[ChatMessage::user("hi")]).await.expect("reply");
        assert_eq!(reply.tool_calls[0].call_id(), "call_0");
        assert_eq!(reply.tool_calls[1].call_id(), "keep");
    }

    #[tokio::test]
    async fn generated_ids_do_not_collide_with_provider_ids() {
        let provider = Arc::new(ScriptedProvider::from_replies(vec![ChatMessage::assistant("")
            .with_tool_calls(vec![
                ToolCall::named("a", json!({})),
                ToolCall::named("a", json!({})).with_id("call_0"),
                ToolCall::named("a", json!({})),
                ToolCall::named("a", json!({})).with_id("call_2"),
            ])]));
        let mut model = registry(provider).resolve(DEFAULT_MODEL, 0.7).expect("model");
        model.tools.push(crate::functions::FunctionDefinition::new("a").to_tool());

        let reply = model.invoke(&[ChatMessage::user("hi")]).await.expect("reply");
        let ids: Vec<&str> = reply.tool_calls.iter().map(|call| call.call_id()).collect();
        assert_eq!(ids, vec!["call_1", "call_0", "call_3", "call_2"]);
        let unique: HashSet<&str> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[tokio::test]
    async fn unbound_model_may_not_request_tools() {
        let provider = Arc::new(ScriptedProvider::from_replies(vec![ChatMessage::assistant("")
            .with_tool_calls(vec![ToolCall::named("a", json!({})).with_id("1")])]));
        let model = registry(provider).resolve(DEFAULT_MODEL, 0.7).expect("model");
        let error = model.invoke(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(matches!(error, WorkflowError::ModelInvocation(_)));
    }

    struct Stalled;

    #[async_trait]
    impl LLMProvider for Stalled {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
            time::sleep(Duration::from_secs(60)).await;
            Ok(CompletionResponse::new(ChatMessage::assistant("late")))
        }

        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn call_timeout_surfaces_as_model_timeout() {
        let model = registry(Arc::new(Stalled))
            .with_call_timeout(Duration::from_millis(50))
            .resolve(DEFAULT_MODEL, 0.2)
            .expect("model");
        let error = model.invoke(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(matches!(error, WorkflowError::ModelTimeout(50)));
    }
}
