//! Agent and Handoff configuration (§3 "Agent", "Handoff"), grounded in
//! `machi::chat::ChatRequest`'s builder style and
//! `machi::guardrail::InputGuardrailResult::new(...).with_metadata(...)`.
//!
//! An [`Agent`] is immutable, long-lived configuration, shared across runs
//! (§3 "Lifecycle"). It is built via chained `#[must_use]` methods rather
//! than public struct-literal construction, so name/handoff-uniqueness
//! invariants can be checked once at [`Agent::validate`] rather than on
//! every field access.

use std::fmt;
use std::sync::Arc;

use convert_case::{Case, Casing};
use serde_json::Value;

use crate::context::RunContext;
use crate::error::{HandoffError, RaafError};
use crate::guardrail::{InputGuardrail, OutputGuardrail};
use crate::tool::{AgentTool, HostedToolKind, LocalTool, ToolDefinition};

/// An agent's instructions: a fixed string, or a function of the run
/// context evaluated fresh for each turn (§3 "Agent").
#[derive(Clone)]
pub enum Instructions {
    Static(String),
    Dynamic(Arc<dyn Fn(&RunContext) -> String + Send + Sync>),
}

impl fmt::Debug for Instructions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(text) => f.debug_tuple("Static").field(text).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl Instructions {
    #[must_use]
    pub fn render(&self, ctx: &RunContext) -> String {
        match self {
            Self::Static(text) => text.clone(),
            Self::Dynamic(render) => render(ctx),
        }
    }
}

impl From<&str> for Instructions {
    fn from(value: &str) -> Self {
        Self::Static(value.to_string())
    }
}

impl From<String> for Instructions {
    fn from(value: String) -> Self {
        Self::Static(value)
    }
}

/// How the model should be steered toward (or away from) using tools (§3 "Agent").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Specific(String),
}

/// Provider-agnostic sampling knobs, folded into the request's
/// `model_params` (§4.4) alongside any provider-specific `extra` values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSettings {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u64>,
    pub extra: Value,
}

impl ModelSettings {
    #[must_use]
    pub fn to_params(&self) -> Value {
        let mut map = serde_json::Map::new();
        if let Some(t) = self.temperature {
            map.insert("temperature".into(), serde_json::json!(t));
        }
        if let Some(p) = self.top_p {
            map.insert("top_p".into(), serde_json::json!(p));
        }
        if let Some(m) = self.max_tokens {
            map.insert("max_tokens".into(), serde_json::json!(m));
        }
        if let Value::Object(extra) = &self.extra {
            for (k, v) in extra {
                map.insert(k.clone(), v.clone());
            }
        }
        Value::Object(map)
    }
}

/// Callback invoked when a handoff to the owning agent is confirmed (§3 "Handoff").
pub type OnHandoff = Arc<dyn Fn(&RunContext, &Value) + Send + Sync>;

/// Rewrites a handoff's input payload before it reaches the target agent
/// (§3 "Handoff").
pub type InputFilter = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// A transfer of control from one agent to another, presented to the model
/// as a synthetic tool (§3 "Handoff", §6 "Handoff tool naming").
#[derive(Clone)]
pub struct Handoff {
    target: Arc<Agent>,
    tool_name: Option<String>,
    tool_description: Option<String>,
    input_schema: Option<Value>,
    input_filter: Option<InputFilter>,
    on_handoff: Option<OnHandoff>,
}

impl fmt::Debug for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handoff")
            .field("target", &self.target.name())
            .field("tool_name", &self.tool_name())
            .finish_non_exhaustive()
    }
}

impl Handoff {
    #[must_use]
    pub fn new(target: Arc<Agent>) -> Self {
        Self {
            target,
            tool_name: None,
            tool_description: None,
            input_schema: None,
            input_filter: None,
            on_handoff: None,
        }
    }

    #[must_use]
    pub fn with_tool_name(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    #[must_use]
    pub fn with_tool_description(mut self, description: impl Into<String>) -> Self {
        self.tool_description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    #[must_use]
    pub fn with_input_filter(mut self, filter: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.input_filter = Some(Arc::new(filter));
        self
    }

    #[must_use]
    pub fn with_on_handoff(mut self, callback: impl Fn(&RunContext, &Value) + Send + Sync + 'static) -> Self {
        self.on_handoff = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn target(&self) -> &Agent {
        &self.target
    }

    #[must_use]
    pub fn target_arc(&self) -> Arc<Agent> {
        Arc::clone(&self.target)
    }

    /// The tool name the model invokes to trigger this handoff: an explicit
    /// override, or `transfer_to_<snake_case(target.name)>` (§6).
    #[must_use]
    pub fn tool_name(&self) -> String {
        self.tool_name
            .clone()
            .unwrap_or_else(|| format!("transfer_to_{}", snake_case(self.target.name())))
    }

    /// Apply the configured input filter, if any (§3 "Handoff").
    #[must_use]
    pub fn filter_input(&self, input: Value) -> Value {
        self.input_filter.as_ref().map_or_else(|| input.clone(), |f| f(input))
    }

    /// Invoke the configured `on_handoff` callback, if any (§3 "Handoff").
    pub fn invoke_on_handoff(&self, ctx: &RunContext, input: &Value) {
        if let Some(callback) = &self.on_handoff {
            callback(ctx, input);
        }
    }

    /// Render this handoff's model-facing [`ToolDefinition`] (§6).
    ///
    /// # Errors
    /// Propagates [`RaafError::InvalidSchema`] from normalization.
    pub fn tool_definition(&self) -> Result<ToolDefinition, RaafError> {
        let description = self.tool_description.clone().unwrap_or_else(|| {
            let mut text = format!(
                "Handoff to the {} agent to handle the request.",
                self.target.name()
            );
            if let Some(handoff_description) = self.target.handoff_description() {
                text.push(' ');
                text.push_str(handoff_description);
            }
            text
        });
        let parameters = self.input_schema.clone().unwrap_or_else(|| {
            serde_json::json!({
                "type": "object",
                "properties": {"context": {"type": "string"}},
                "required": [],
            })
        });
        ToolDefinition::new(self.tool_name(), description, &parameters)
    }
}

/// Convert a name to `snake_case` for default handoff tool naming (§6).
#[must_use]
pub fn snake_case(name: &str) -> String {
    name.to_case(Case::Snake)
}

/// Immutable agent configuration (§3 "Agent"). Built via chained `#[must_use]`
/// methods; share across runs behind an `Arc`.
#[derive(Clone)]
pub struct Agent {
    name: String,
    instructions: Instructions,
    model: String,
    max_turns: u32,
    tools: Vec<AgentTool>,
    handoffs: Vec<Handoff>,
    handoff_description: Option<String>,
    input_guardrails: Vec<InputGuardrail>,
    output_guardrails: Vec<OutputGuardrail>,
    response_format: Option<Value>,
    tool_choice: Option<ToolChoice>,
    reset_tool_choice: bool,
    model_settings: ModelSettings,
    on_handoff: Option<OnHandoff>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("max_turns", &self.max_turns)
            .field("tools", &self.tools.iter().map(AgentTool::name).collect::<Vec<_>>())
            .field("handoffs", &self.handoffs.iter().map(|h| h.target().name().to_string()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Agent {
    #[must_use]
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Instructions::Static(String::new()),
            model: model.into(),
            max_turns: 10,
            tools: Vec::new(),
            handoffs: Vec::new(),
            handoff_description: None,
            input_guardrails: Vec::new(),
            output_guardrails: Vec::new(),
            response_format: None,
            tool_choice: None,
            reset_tool_choice: false,
            model_settings: ModelSettings::default(),
            on_handoff: None,
        }
    }

    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<Instructions>) -> Self {
        self.instructions = instructions.into();
        self
    }

    #[must_use]
    pub fn with_dynamic_instructions(
        mut self,
        render: impl Fn(&RunContext) -> String + Send + Sync + 'static,
    ) -> Self {
        self.instructions = Instructions::Dynamic(Arc::new(render));
        self
    }

    #[must_use]
    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    #[must_use]
    pub fn with_tool(mut self, tool: LocalTool) -> Self {
        self.tools.push(AgentTool::Local(Arc::new(tool)));
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: impl IntoIterator<Item = LocalTool>) -> Self {
        self.tools.extend(tools.into_iter().map(|t| AgentTool::Local(Arc::new(t))));
        self
    }

    #[must_use]
    pub fn with_hosted_tool(mut self, kind: HostedToolKind) -> Self {
        self.tools.push(AgentTool::Hosted(kind));
        self
    }

    #[must_use]
    pub fn with_handoff(mut self, handoff: Handoff) -> Self {
        self.handoffs.push(handoff);
        self
    }

    #[must_use]
    pub fn with_handoffs(mut self, handoffs: impl IntoIterator<Item = Handoff>) -> Self {
        self.handoffs.extend(handoffs);
        self
    }

    #[must_use]
    pub fn with_handoff_description(mut self, description: impl Into<String>) -> Self {
        self.handoff_description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_input_guardrails(mut self, guardrails: impl IntoIterator<Item = InputGuardrail>) -> Self {
        self.input_guardrails.extend(guardrails);
        self
    }

    #[must_use]
    pub fn with_output_guardrails(mut self, guardrails: impl IntoIterator<Item = OutputGuardrail>) -> Self {
        self.output_guardrails.extend(guardrails);
        self
    }

    #[must_use]
    pub fn with_response_format(mut self, schema: Value) -> Self {
        self.response_format = Some(schema);
        self
    }

    #[must_use]
    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = Some(tool_choice);
        self
    }

    #[must_use]
    pub fn with_reset_tool_choice(mut self, reset: bool) -> Self {
        self.reset_tool_choice = reset;
        self
    }

    #[must_use]
    pub fn with_model_settings(mut self, settings: ModelSettings) -> Self {
        self.model_settings = settings;
        self
    }

    #[must_use]
    pub fn with_on_handoff(mut self, callback: impl Fn(&RunContext, &Value) + Send + Sync + 'static) -> Self {
        self.on_handoff = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn instructions(&self) -> &Instructions {
        &self.instructions
    }

    #[must_use]
    pub const fn max_turns(&self) -> u32 {
        self.max_turns
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn tools(&self) -> &[AgentTool] {
        &self.tools
    }

    #[must_use]
    pub fn handoffs(&self) -> &[Handoff] {
        &self.handoffs
    }

    #[must_use]
    pub fn handoff_description(&self) -> Option<&str> {
        self.handoff_description.as_deref()
    }

    #[must_use]
    pub fn input_guardrails(&self) -> &[InputGuardrail] {
        &self.input_guardrails
    }

    #[must_use]
    pub fn output_guardrails(&self) -> &[OutputGuardrail] {
        &self.output_guardrails
    }

    #[must_use]
    pub fn response_format(&self) -> Option<&Value> {
        self.response_format.as_ref()
    }

    #[must_use]
    pub fn tool_choice(&self) -> Option<&ToolChoice> {
        self.tool_choice.as_ref()
    }

    #[must_use]
    pub const fn reset_tool_choice(&self) -> bool {
        self.reset_tool_choice
    }

    #[must_use]
    pub fn model_settings(&self) -> &ModelSettings {
        &self.model_settings
    }

    /// Invoke this agent's own `on_handoff` callback (distinct from a
    /// per-[`Handoff`] callback), when it becomes the target of a handoff
    /// (§3 "Agent").
    pub fn invoke_on_handoff(&self, ctx: &RunContext, input: &Value) {
        if let Some(callback) = &self.on_handoff {
            callback(ctx, input);
        }
    }

    /// Validate this agent's invariants (§3 "Agent": "every handoff target's
    /// `name` is unique within the agent's handoff list").
    ///
    /// # Errors
    /// Returns [`HandoffError::DuplicateTarget`] on a name collision.
    pub fn validate(&self) -> Result<(), RaafError> {
        let mut seen = std::collections::HashSet::new();
        for handoff in &self.handoffs {
            let target_name = handoff.target().name();
            if !seen.insert(target_name.to_string()) {
                return Err(RaafError::Handoff(HandoffError::DuplicateTarget {
                    agent: self.name.clone(),
                    name: target_name.to_string(),
                }));
            }
        }
        Ok(())
    }
}
