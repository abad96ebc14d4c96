use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};

use crate::{
    models::{ModelRegistry, DEFAULT_MODEL},
    functions::web_search::WEB_SEARCH_TOOL,
    workflow::TopologyKind,
    WorkflowError,
};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("invalid agent '{name}': {reason}")]
    InvalidAgent { name: String, reason: String },
    #[error("no agent session is open")]
    NoActiveSession,
    #[error("template file not found: {0}")]
    TemplateNotFound(PathBuf),
    #[error("template render error: {0}")]
    TemplateRender(#[from] handlebars::RenderError),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

fn default_temperature() -> f32 {
    0.7
}

fn default_icon() -> String {
    "🤖".to_string()
}

/// Configuration of one agent personality. Read-only input to a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    /// Topology tag: `plain`, `react`, `react_human` or `advanced_react`.
    #[serde(alias = "agent_type")]
    pub topology: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_model_id: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub system_prompt: String,
    /// Handlebars file rendered into `system_prompt` when the agent is loaded from YAML.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_template: Option<PathBuf>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_icon")]
    pub icon: String,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, topology: TopologyKind, model_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topology: topology.as_str().to_string(),
            model_id: model_id.into(),
            secondary_model_id: None,
            temperature: default_temperature(),
            system_prompt: String::new(),
            system_prompt_template: None,
            tools: Vec::new(),
            icon: default_icon(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_secondary_model(mut self, model_id: impl Into<String>) -> Self {
        self.secondary_model_id = Some(model_id.into());
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = icon.into();
        self
    }

    pub fn topology_kind(&self) -> Result<TopologyKind, WorkflowError> {
        self.topology.parse()
    }

    /// Render a Handlebars prompt template with `data` into the system prompt.
    pub fn with_prompt_template<T: Serialize>(
        mut self,
        template_path: impl AsRef<Path>,
        data: &T,
    ) -> Result<Self, AgentError> {
        let template_path = template_path.as_ref();
        let template = fs::read_to_string(template_path)
            .map_err(|_| AgentError::TemplateNotFound(template_path.to_path_buf()))?;
        let mut hb = Handlebars::new();
        hb.register_escape_fn(handlebars::no_escape);
        self.system_prompt = hb.render_template(&template, data)?;
        Ok(self)
    }

    /// Check the definition against the model catalogue.
    pub fn validate(&self, models: &ModelRegistry) -> Result<(), AgentError> {
        if self.name.trim().is_empty() {
            return Err(self.invalid("name must not be empty"));
        }
        self.topology_kind()?;

        let spec = models
            .spec(&self.model_id)
            .ok_or_else(|| WorkflowError::UnknownModel(self.model_id.clone()))?;
        spec.check_temperature(&self.model_id, self.temperature)?;

        if let Some(secondary) = &self.secondary_model_id {
            if models.spec(secondary).is_none() {
                return Err(WorkflowError::UnknownModel(secondary.clone()).into());
            }
        }

        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.as_str()) {
                return Err(self.invalid(format!("tool '{tool}' is listed twice")));
            }
        }
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> AgentError {
        AgentError::InvalidAgent {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }
}

/// The roster available before any user agents are created, keyed by catalogue name.
pub fn default_agents() -> BTreeMap<String, AgentDefinition> {
    let mut agents = BTreeMap::new();
    agents.insert(
        "Simple Chat".to_string(),
        AgentDefinition::new("Simple Chat", TopologyKind::Plain, DEFAULT_MODEL),
    );
    agents.insert(
        "Coach Theo".to_string(),
        AgentDefinition::new("Theo", TopologyKind::React, DEFAULT_MODEL)
            .with_icon("🏀")
            .with_system_prompt(
                "You are Theo, a basketball coach and analyst. You like to respond with \
                 come on son when someone says something ridiculous.",
            )
            .with_tools([WEB_SEARCH_TOOL]),
    );
    agents.insert(
        "Quest Craft".to_string(),
        AgentDefinition::new("Quest Craft", TopologyKind::React, DEFAULT_MODEL)
            .with_icon("🗡️")
            .with_system_prompt(
                "You are a helpful AI assistant for Dungeons & Dragons. Your role is to assist \
                 players and Dungeon Masters with rules, dice rolls, and general gameplay questions.",
            )
            .with_tools([WEB_SEARCH_TOOL]),
    );
    agents.insert(
        "Crypto Pal".to_string(),
        AgentDefinition::new("Crypto Pal", TopologyKind::React, DEFAULT_MODEL)
            .with_icon("₿")
            .with_system_prompt(
                "You are a helpful AI assistant for Bitcoin. You are a Bitcoin expert and can \
                 answer any questions about Bitcoin or other crypto currencies.",
            )
            .with_tools([WEB_SEARCH_TOOL]),
    );
    agents
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AgentFile {
    #[serde(default)]
    agents: Vec<AgentDefinition>,
}

/// Default agents merged with user-created ones; a user agent shadows a default of the
/// same catalogue name.
#[derive(Debug, Clone)]
pub struct AgentCatalog {
    defaults: BTreeMap<String, AgentDefinition>,
    user: BTreeMap<String, AgentDefinition>,
}

impl Default for AgentCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentCatalog {
    pub fn new() -> Self {
        Self {
            defaults: default_agents(),
            user: BTreeMap::new(),
        }
    }

    pub fn empty() -> Self {
        Self {
            defaults: BTreeMap::new(),
            user: BTreeMap::new(),
        }
    }

    /// Validate and register a user agent under its own name.
    pub fn register(&mut self, agent: AgentDefinition, models: &ModelRegistry) -> Result<(), AgentError> {
        agent.validate(models)?;
        tracing::info!(agent = %agent.name, topology = %agent.topology, "registered agent");
        self.user.insert(agent.name.clone(), agent);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<&AgentDefinition, AgentError> {
        self.user
            .get(key)
            .or_else(|| self.defaults.get(key))
            .ok_or_else(|| AgentError::UnknownAgent(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.user.contains_key(key) || self.defaults.contains_key(key)
    }

    /// Every agent as `(catalogue name, definition)`, sorted by name.
    pub fn list(&self) -> Vec<(&str, &AgentDefinition)> {
        let mut merged: BTreeMap<&str, &AgentDefinition> = self
            .defaults
            .iter()
            .map(|(key, agent)| (key.as_str(), agent))
            .collect();
        for (key, agent) in &self.user {
            merged.insert(key.as_str(), agent);
        }
        merged.into_iter().collect()
    }

    pub fn user_agents(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.user.values()
    }

    /// Load user agents from a YAML document of the form `agents: [...]`.
    ///
    /// `system_prompt_template` paths are resolved relative to the file and rendered with the
    /// agent definition itself as template data.
    pub fn load_yaml(&mut self, path: impl AsRef<Path>, models: &ModelRegistry) -> Result<usize, AgentError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let file: AgentFile = serde_yaml::from_str(&raw)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut loaded = 0;
        for agent in file.agents {
            let agent = match agent.system_prompt_template.clone() {
                Some(template) => {
                    let data = agent.clone();
                    agent.with_prompt_template(base.join(template), &data)?
                }
                None => agent,
            };
            self.register(agent, models)?;
            loaded += 1;
        }
        tracing::debug!(path = %path.display(), loaded, "loaded user agents");
        Ok(loaded)
    }

    pub fn to_yaml(&self) -> Result<String, AgentError> {
        let file = AgentFile {
            agents: self.user.values().cloned().collect(),
        };
        Ok(serde_yaml::to_string(&file)?)
    }

    pub fn save_user_agents(&self, path: impl AsRef<Path>) -> Result<(), AgentError> {
        fs::write(path, self.to_yaml()?)?;
        Ok(())
    }
}
