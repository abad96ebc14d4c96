use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use crate::{
    error::LLMError,
    functions::{Tool, ToolChoice},
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse, TokenUsage},
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
    pub label: &'static str,
}

impl OpenAIConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            label: "openai",
        }
    }

    /// Groq serves the same chat-completions API under its own base URL.
    pub fn groq(api_key: impl Into<String>) -> Self {
        Self {
            base_url: GROQ_BASE_URL.to_string(),
            label: "groq",
            ..Self::new(api_key)
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

/// Client for any OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAI {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAI {
    pub fn from_config(config: OpenAIConfig) -> Result<Self, LLMError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn with_default_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.config.api_key)
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequestBody {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ResponseChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorEnvelope {
    error: OpenAIError,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
}

#[async_trait]
impl LLMProvider for OpenAI {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LLMError> {
        let CompletionRequest {
            model,
            messages,
            temperature,
            tools,
            tool_choice,
        } = request;

        let body = OpenAIRequestBody {
            model,
            messages,
            temperature,
            tools: if tools.is_empty() { None } else { Some(tools) },
            tool_choice,
        };

        let builder = self
            .with_default_headers(self.client.post(self.endpoint("chat/completions")))
            .json(&body);

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await?;
            if let Ok(error) = serde_json::from_str::<OpenAIErrorEnvelope>(&text) {
                return Err(LLMError::Provider(error.error.message));
            }

            return Err(LLMError::Provider(format!("unexpected status {status}: {text}")));
        }

        let parsed: ChatCompletionResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(LLMError::InvalidResponse("response did not contain any choices"))?;

        Ok(CompletionResponse {
            message: choice.message,
            usage: parsed.usage,
        })
    }

    fn name(&self) -> &'static str {
        self.config.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{FunctionCall, ToolCall};
    use crate::types::MessageRole;
    use serde_json::json;

    #[test]
    fn groq_config_uses_groq_endpoint() {
        let provider = OpenAI::from_config(OpenAIConfig::groq("key")).expect("client");
        assert_eq!(
            provider.endpoint("/chat/completions"),
            "https://api.groq.com/openai/v1/chat/completions"
        );
        assert_eq!(provider.name(), "groq");
    }

    #[test]
    fn parses_reply_with_tool_calls_and_null_content() {
        let raw = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_a",
                        "type": "function",
                        "function": { "name": "tavily_tool", "arguments": "{\"query\":\"nba\"}" }
                    }]
                }
            }],
            "usage": { "prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7 }
        });
        let parsed: ChatCompletionResponse = serde_json::from_value(raw).expect("parse");
        let message = &parsed.choices[0].message;
        assert_eq!(message.role, MessageRole::Assistant);
        assert!(message.content.is_none());
        assert_eq!(
            message.tool_calls[0],
            ToolCall::new(FunctionCall::new("tavily_tool", json!({ "query": "nba" }))).with_id("call_a")
        );
    }

    #[test]
    fn reply_with_truncated_arguments_still_parses() {
        let raw = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_a",
                        "type": "function",
                        "function": { "name": "tavily_tool", "arguments": "{\"query\": \"nba" }
                    }]
                }
            }]
        });
        let parsed: ChatCompletionResponse = serde_json::from_value(raw).expect("parse");
        let call = &parsed.choices[0].message.tool_calls[0];
        assert_eq!(call.id.as_deref(), Some("call_a"));
        assert_eq!(call.function.name, "tavily_tool");
        assert_eq!(call.function.raw_arguments.as_deref(), Some("{\"query\": \"nba"));
        assert!(call.function.arguments_error().is_some());
    }

    #[test]
    fn request_body_omits_empty_tools() {
        let body = OpenAIRequestBody {
            model: "m".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: Some(0.7),
            tools: None,
            tool_choice: None,
        };
        let encoded = serde_json::to_value(&body).expect("serialize");
        assert!(encoded.get("tools").is_none());
        assert_eq!(encoded["messages"][0]["role"], json!("user"));
    }
}
