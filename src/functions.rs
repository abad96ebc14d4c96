use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use schemars::JsonSchema;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::{LLMError, WorkflowError};

pub mod web_search;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: FunctionParameters,
}

impl FunctionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: FunctionParameters::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameter(mut self, parameter: FunctionParameter) -> Self {
        self.add_parameter(parameter);
        self
    }

    pub fn add_parameter(&mut self, parameter: FunctionParameter) {
        let FunctionParameter {
            name,
            mut schema,
            description,
            required,
            default,
        } = parameter;

        if let Some(object) = schema.as_object_mut() {
            if let Some(description) = description {
                object.insert("description".to_string(), Value::String(description));
            }
            if let Some(default) = default {
                object.insert("default".to_string(), default);
            }
        }

        if required {
            self.parameters.required.push(name.clone());
        }

        self.parameters.properties.insert(name, schema);
    }

    pub fn to_tool(&self) -> Tool {
        Tool::from(self.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionParameters {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(rename = "additionalProperties", skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
}

impl FunctionParameters {
    pub fn new() -> Self {
        Self {
            kind: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: Some(false),
        }
    }
}

impl Default for FunctionParameters {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct FunctionParameter {
    pub name: String,
    pub schema: Value,
    pub description: Option<String>,
    pub required: bool,
    pub default: Option<Value>,
}

impl FunctionParameter {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
            description: None,
            required: true,
            default: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: ToolType,
    pub function: FunctionDefinition,
}

impl From<FunctionDefinition> for Tool {
    fn from(function: FunctionDefinition) -> Self {
        Self {
            kind: ToolType::Function,
            function,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    Function,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Value,
    /// The argument text exactly as the model sent it, kept only when it is not valid JSON.
    pub raw_arguments: Option<String>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            raw_arguments: None,
        }
    }

    pub fn with_raw_arguments(mut self, raw: impl Into<String>) -> Self {
        self.raw_arguments = Some(raw.into());
        self
    }

    /// Why the model's argument text could not be parsed, if it could not.
    pub fn arguments_error(&self) -> Option<String> {
        let raw = self.raw_arguments.as_deref()?;
        serde_json::from_str::<Value>(raw)
            .err()
            .map(|error| format!("arguments are not valid JSON ({error}): {raw}"))
    }
}

/// A tool invocation requested by an assistant reply.
///
/// `id` pairs the eventual tool-result message with this request. Providers always send
/// one; the model adapter fills in a deterministic id when a reply arrives without it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: Option<String>,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(function: FunctionCall) -> Self {
        Self { id: None, function }
    }

    pub fn named(name: impl Into<String>, arguments: Value) -> Self {
        Self::new(FunctionCall::new(name, arguments))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    pub fn call_id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }
}

impl Serialize for ToolCall {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("ToolCall", 3)?;
        if let Some(id) = &self.id {
            state.serialize_field("id", id)?;
        }
        state.serialize_field("type", &ToolType::Function)?;
        state.serialize_field("function", &SerializableFunctionCall(&self.function))?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ToolCall {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawFunctionCall {
            name: String,
            #[serde(default)]
            arguments: Option<Value>,
        }

        #[derive(Deserialize)]
        struct RawToolCall {
            #[serde(default)]
            id: Option<String>,
            #[serde(rename = "type", default)]
            kind: Option<String>,
            function: RawFunctionCall,
        }

        let raw = RawToolCall::deserialize(deserializer)?;
        if let Some(kind) = raw.kind.as_deref() {
            if kind != "function" {
                return Err(serde::de::Error::custom(format!(
                    "unsupported tool call type '{kind}'"
                )));
            }
        }

        // Providers send arguments as a JSON-encoded string; stored transcripts may hold an object.
        // Text that does not parse is kept verbatim so the tool node can report it to the model.
        let mut raw_arguments = None;
        let arguments = match raw.function.arguments {
            None => Value::Object(serde_json::Map::new()),
            Some(Value::String(encoded)) if encoded.trim().is_empty() => {
                Value::Object(serde_json::Map::new())
            }
            Some(Value::String(encoded)) => match serde_json::from_str(&encoded) {
                Ok(parsed) => parsed,
                Err(_) => {
                    raw_arguments = Some(encoded);
                    Value::Null
                }
            },
            Some(other) => other,
        };

        Ok(Self {
            id: raw.id,
            function: FunctionCall {
                name: raw.function.name,
                arguments,
                raw_arguments,
            },
        })
    }
}

struct SerializableFunctionCall<'a>(&'a FunctionCall);

impl<'a> Serialize for SerializableFunctionCall<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("function", 2)?;
        state.serialize_field("name", &self.0.name)?;
        let raw = match &self.0.raw_arguments {
            Some(raw) => raw.clone(),
            None => serde_json::to_string(&self.0.arguments)
                .map_err(|error| serde::ser::Error::custom(error.to_string()))?,
        };
        state.serialize_field("arguments", &raw)?;
        state.end()
    }
}

/// A named capability the model may call.
#[async_trait]
pub trait ToolFunction: Send + Sync {
    fn definition(&self) -> FunctionDefinition;

    async fn invoke(&self, arguments: &Value) -> Result<Value, LLMError>;
}

pub type DynToolFunction = Arc<dyn ToolFunction>;

struct RegisteredTool {
    function: DynToolFunction,
    definition: FunctionDefinition,
    validator: Option<Arc<JSONSchema>>,
}

impl Clone for RegisteredTool {
    fn clone(&self) -> Self {
        Self {
            function: self.function.clone(),
            definition: self.definition.clone(),
            validator: self.validator.clone(),
        }
    }
}

/// Explicit tool name → capability mapping handed to the engine at construction time.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, function: DynToolFunction) {
        let definition = function.definition();
        let validator = compile_validator(&definition);
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool {
                function,
                definition,
                validator,
            },
        );
    }

    pub fn register_all<I>(&mut self, functions: I)
    where
        I: IntoIterator<Item = DynToolFunction>,
    {
        for function in functions {
            self.register(function);
        }
    }

    pub fn with_tool(mut self, function: DynToolFunction) -> Self {
        self.register(function);
        self
    }

    pub fn get(&self, name: &str) -> Option<&DynToolFunction> {
        self.tools.get(name).map(|tool| &tool.function)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn resolve(&self, name: &str) -> Result<DynToolFunction, WorkflowError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| WorkflowError::ToolNotFound(name.to_string()))
    }

    /// The subset an agent declares. Every declared name must be registered.
    pub fn bind<S: AsRef<str>>(&self, names: &[S]) -> Result<ToolRegistry, WorkflowError> {
        let mut bound = ToolRegistry::new();
        for name in names {
            let name = name.as_ref();
            let tool = self
                .tools
                .get(name)
                .ok_or_else(|| WorkflowError::ToolNotFound(name.to_string()))?;
            bound.tools.insert(name.to_string(), tool.clone());
        }
        Ok(bound)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<FunctionDefinition> {
        self.tools
            .values()
            .map(|tool| tool.definition.clone())
            .collect()
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.definitions().into_iter().map(Tool::from).collect()
    }

    pub fn validate_arguments(&self, name: &str, arguments: &Value) -> Result<(), WorkflowError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| WorkflowError::ToolNotFound(name.to_string()))?;

        if !arguments.is_object() {
            return Err(WorkflowError::MalformedToolCall {
                tool: name.to_string(),
                reason: "arguments must be a JSON object".to_string(),
            });
        }

        let Some(validator) = &tool.validator else {
            return Ok(());
        };

        let result = validator.validate(arguments);
        if let Err(errors) = result {
            let reason = errors
                .map(|error| error.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(WorkflowError::MalformedToolCall {
                tool: name.to_string(),
                reason,
            });
        }
        Ok(())
    }

    /// Validates and executes one call. Argument and execution failures come back as
    /// recoverable errors; only an unregistered name is fatal.
    pub async fn invoke(&self, call: &FunctionCall) -> Result<Value, WorkflowError> {
        let function = self.resolve(&call.name)?;
        if let Some(reason) = call.arguments_error() {
            return Err(WorkflowError::MalformedToolCall {
                tool: call.name.clone(),
                reason,
            });
        }
        self.validate_arguments(&call.name, &call.arguments)?;

        function
            .invoke(&call.arguments)
            .await
            .map_err(|error| match error {
                LLMError::InvalidFunctionArguments(reason) => WorkflowError::MalformedToolCall {
                    tool: call.name.clone(),
                    reason,
                },
                LLMError::FunctionExecution { function, message } => WorkflowError::ToolFailed {
                    tool: function,
                    message,
                },
                other => WorkflowError::ToolFailed {
                    tool: call.name.clone(),
                    message: other.to_string(),
                },
            })
    }
}

fn compile_validator(definition: &FunctionDefinition) -> Option<Arc<JSONSchema>> {
    let schema = serde_json::to_value(&definition.parameters).ok()?;
    match JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema)
    {
        Ok(compiled) => Some(Arc::new(compiled)),
        Err(error) => {
            tracing::warn!(tool = %definition.name, %error, "tool schema does not compile; arguments will not be validated");
            None
        }
    }
}

/// Text form of a tool result, used both for tool-result messages and collected info.
pub fn render_tool_output(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn json_schema_for<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema.schema).unwrap_or(Value::Null)
}

/// Tool selection sent with bound models. The model always decides for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
}
