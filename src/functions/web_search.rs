use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::LLMError;
use crate::functions::{json_schema_for, FunctionDefinition, FunctionParameter, ToolFunction};

pub const WEB_SEARCH_TOOL: &str = "tavily_tool";

const DEFAULT_ENDPOINT: &str = "https://api.tavily.com/search";
const DEFAULT_MAX_RESULTS: u64 = 5;

#[derive(Debug, Clone)]
pub struct WebSearchConfig {
    pub api_key: String,
    pub endpoint: String,
    pub max_results: u64,
    pub request_timeout: Duration,
}

impl WebSearchConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            max_results: DEFAULT_MAX_RESULTS,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Internet search through the Tavily API. Best for generic information gathering.
#[derive(Debug, Clone)]
pub struct WebSearch {
    client: reqwest::Client,
    config: WebSearchConfig,
}

impl WebSearch {
    pub fn new(config: WebSearchConfig) -> Result<Self, LLMError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: Option<String>,
    url: String,
    #[serde(default)]
    content: String,
}

#[async_trait]
impl ToolFunction for WebSearch {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition::new(WEB_SEARCH_TOOL)
            .with_description(
                "Searches the internet for information. Best for generic information gathering.",
            )
            .with_parameter(
                FunctionParameter::new("query", json_schema_for::<String>())
                    .with_description("The search query."),
            )
            .with_parameter(
                FunctionParameter::new("max_results", json!({ "type": "integer", "minimum": 1 }))
                    .with_description("Maximum number of results to return.")
                    .optional(),
            )
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, LLMError> {
        let query = arguments
            .get("query")
            .and_then(Value::as_str)
            .filter(|query| !query.trim().is_empty())
            .ok_or_else(|| LLMError::InvalidFunctionArguments("query must be a non-empty string".into()))?;
        let max_results = arguments
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(self.config.max_results);

        let body = SearchRequest {
            api_key: &self.config.api_key,
            query,
            max_results,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LLMError::FunctionExecution {
                function: WEB_SEARCH_TOOL.to_string(),
                message: format!("unexpected status {status}: {text}"),
            });
        }

        let parsed: SearchResponse = response.json().await?;
        Ok(serde_json::to_value(parsed.results)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::ToolRegistry;
    use std::sync::Arc;

    #[test]
    fn definition_requires_query_only() {
        let tool = WebSearch::new(WebSearchConfig::new("test-key")).expect("client");
        let definition = tool.definition();
        assert_eq!(definition.name, WEB_SEARCH_TOOL);
        assert_eq!(definition.parameters.required, vec!["query".to_string()]);
    }

    #[test]
    fn registry_rejects_non_integer_limit() {
        let tool = WebSearch::new(WebSearchConfig::new("test-key")).expect("client");
        let registry = ToolRegistry::new().with_tool(Arc::new(tool));
        let result = registry
            .validate_arguments(WEB_SEARCH_TOOL, &json!({ "query": "rust", "max_results": "ten" }));
        assert!(result.is_err());
    }
}
