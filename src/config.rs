//! Environment configuration for the binaries.

use std::{env, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use crate::{
    agents::{AgentCatalog, AgentError},
    functions::{web_search::WebSearch, web_search::WebSearchConfig, ToolRegistry},
    models::ModelRegistry,
    providers::{
        openai::{OpenAI, OpenAIConfig},
        LLMProvider,
    },
    workflow::{WorkflowEngine, DEFAULT_MAX_ROUNDS},
    LLMError,
};

pub const DEFAULT_BIND: &str = "0.0.0.0:3002";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Provider(#[from] LLMError),
}

/// Fail with every variable of `names` that is unset or empty.
pub fn check_environment(names: &[&str]) -> Result<(), ConfigError> {
    check_with(names, |name| env::var(name).ok())
}

fn check_with(names: &[&str], lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    let missing: Vec<String> = names
        .iter()
        .filter(|name| lookup(name).map_or(true, |value| value.trim().is_empty()))
        .map(|name| name.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Missing(missing))
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub groq_api_key: Option<String>,
    pub groq_base_url: Option<String>,
    pub tavily_api_key: Option<String>,
    /// `None` disables the round guard.
    pub max_rounds: Option<usize>,
    pub llm_timeout: Option<Duration>,
    pub agents_file: Option<PathBuf>,
    pub bind: SocketAddr,
}

impl AppConfig {
    /// Read the configuration from the process environment, after loading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let max_rounds = match non_empty("TURNWERK_MAX_ROUNDS") {
            Some(raw) => match parse::<usize>("TURNWERK_MAX_ROUNDS", &raw)? {
                0 => None,
                rounds => Some(rounds),
            },
            None => Some(DEFAULT_MAX_ROUNDS),
        };

        let llm_timeout = non_empty("TURNWERK_LLM_TIMEOUT_MS")
            .map(|raw| parse::<u64>("TURNWERK_LLM_TIMEOUT_MS", &raw))
            .transpose()?
            .map(Duration::from_millis);

        let bind = parse::<SocketAddr>(
            "TURNWERK_BIND",
            &non_empty("TURNWERK_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
        )?;

        Ok(Self {
            groq_api_key: non_empty("GROQ_API_KEY"),
            groq_base_url: non_empty("GROQ_BASE_URL"),
            tavily_api_key: non_empty("TAVILY_API_KEY"),
            max_rounds,
            llm_timeout,
            agents_file: non_empty("TURNWERK_AGENTS_FILE").map(PathBuf::from),
            bind,
        })
    }

    /// The model catalogue served by Groq.
    pub fn models(&self) -> Result<ModelRegistry, ConfigError> {
        let api_key = self
            .groq_api_key
            .clone()
            .ok_or_else(|| ConfigError::Missing(vec!["GROQ_API_KEY".to_string()]))?;
        let mut config = OpenAIConfig::groq(api_key);
        if let Some(base_url) = &self.groq_base_url {
            config = config.with_base_url(base_url.clone());
        }
        let provider: Arc<dyn LLMProvider> = Arc::new(OpenAI::from_config(config)?);
        Ok(self.models_with(provider))
    }

    /// The model catalogue served entirely by `provider`.
    pub fn models_with(&self, provider: Arc<dyn LLMProvider>) -> ModelRegistry {
        let models = ModelRegistry::new().with_provider_for_all(provider);
        match self.llm_timeout {
            Some(timeout) => models.with_call_timeout(timeout),
            None => models,
        }
    }

    /// Registered tools; the web search tool only when a Tavily key is configured.
    pub fn tools(&self) -> Result<ToolRegistry, ConfigError> {
        let mut tools = ToolRegistry::new();
        match &self.tavily_api_key {
            Some(api_key) => {
                tools.register(Arc::new(WebSearch::new(WebSearchConfig::new(api_key.clone()))?));
            }
            None => tracing::warn!("TAVILY_API_KEY is not set; web search is unavailable"),
        }
        Ok(tools)
    }

    pub fn engine(&self, models: ModelRegistry, tools: ToolRegistry) -> WorkflowEngine {
        WorkflowEngine::new(models, tools).with_max_rounds(self.max_rounds)
    }

    /// Default roster plus the agents of `TURNWERK_AGENTS_FILE`, if set.
    pub fn catalog(&self, models: &ModelRegistry) -> Result<AgentCatalog, AgentError> {
        let mut catalog = AgentCatalog::new();
        if let Some(path) = &self.agents_file {
            let loaded = catalog.load_yaml(path, models)?;
            tracing::info!(path = %path.display(), loaded, "loaded agents file");
        }
        Ok(catalog)
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|error: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = AppConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.max_rounds, Some(DEFAULT_MAX_ROUNDS));
        assert_eq!(config.bind, DEFAULT_BIND.parse::<SocketAddr>().expect("addr"));
        assert!(config.llm_timeout.is_none());
        assert!(matches!(config.models(), Err(ConfigError::Missing(_))));
        assert!(config.tools().expect("tools").is_empty());
    }

    #[test]
    fn zero_rounds_disables_guard() {
        let config = AppConfig::from_lookup(lookup(&[
            ("TURNWERK_MAX_ROUNDS", "0"),
            ("TURNWERK_LLM_TIMEOUT_MS", "1500"),
        ]))
        .expect("config");
        assert_eq!(config.max_rounds, None);
        assert_eq!(config.llm_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn unparsable_values_name_the_variable() {
        let error = AppConfig::from_lookup(lookup(&[("TURNWERK_MAX_ROUNDS", "many")])).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { var: "TURNWERK_MAX_ROUNDS", .. }));
    }

    #[test]
    fn missing_variables_are_listed_together() {
        let error = check_with(&["A", "B", "C"], lookup(&[("B", "set"), ("C", " ")])).unwrap_err();
        match error {
            ConfigError::Missing(names) => assert_eq!(names, vec!["A", "C"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn tavily_key_registers_web_search() {
        let config = AppConfig::from_lookup(lookup(&[("TAVILY_API_KEY", "tvly-test")])).expect("config");
        let tools = config.tools().expect("tools");
        assert!(tools.contains(crate::functions::web_search::WEB_SEARCH_TOOL));
    }
}
