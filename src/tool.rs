//! Tool Registry & Dispatch (C7): the model-facing wire shape for tools,
//! local/hosted/handoff tool classification, transitive tool collection,
//! and parallel local-tool dispatch (§4.7), grounded in
//! `machi::tool::traits::ToolDyn` and `machi::tools::executor::Tool`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;

use crate::agent::Agent;
use crate::context::RunContext;
use crate::hooks::HookPair;
use crate::item::Item;
use crate::schema::normalize_strict;

/// The nested `function` object inside a [`ToolDefinition`] (§6, "Tool
/// definition shape").
#[derive(Debug, Clone, Serialize)]
pub struct ToolFunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// The wire shape a tool (local, hosted, or synthetic handoff) is advertised
/// to the model in: `{type:"function", name, function:{name, description,
/// parameters}}` (§6).
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: String,
    pub function: ToolFunctionDef,
}

impl ToolDefinition {
    /// Build a definition with `parameters` already strict-normalized (§4.1).
    ///
    /// # Errors
    /// Propagates [`crate::error::RaafError::InvalidSchema`] from normalization.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: &Value,
    ) -> Result<Self, crate::error::RaafError> {
        let name = name.into();
        let parameters = normalize_strict(parameters)?;
        Ok(Self {
            kind: "function",
            function: ToolFunctionDef {
                name: name.clone(),
                description: description.into(),
                parameters,
            },
            name,
        })
    }
}

/// A kind of tool provided by the provider itself, not dispatched in-process
/// (§3 "Tool"). The engine tracks these in `tools_used` but never executes
/// them (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostedToolKind {
    WebSearch,
    CodeInterpreter,
    FileSearch,
}

/// The sentinel a local tool's handler returns to signal "this call is
/// actually a handoff", routed to the handoff path instead of becoming a
/// normal tool output (§3 "Tool", §4.7).
#[must_use]
pub fn handoff_sentinel(target_agent: impl Into<String>, data: Value) -> Value {
    serde_json::json!({
        "__handoff__": true,
        "target_agent": target_agent.into(),
        "data": data,
    })
}

/// If `value` is a handoff sentinel produced by [`handoff_sentinel`], extract
/// `(target_agent, data)`.
#[must_use]
pub fn as_handoff_sentinel(value: &Value) -> Option<(String, Value)> {
    let obj = value.as_object()?;
    if obj.get("__handoff__")?.as_bool()? {
        let target = obj.get("target_agent")?.as_str()?.to_string();
        let data = obj.get("data").cloned().unwrap_or(Value::Null);
        Some((target, data))
    } else {
        None
    }
}

/// A local, in-process tool's callable (§3 "Tool"). Arguments arrive
/// pre-parsed (invalid JSON is rejected by the dispatcher before the
/// handler is ever invoked, per §4.7); the handler returns a JSON value
/// (objects/arrays are re-encoded as the tool output string) or a
/// human-readable error string, which is *not* raised but embedded as the
/// tool's output so the model can see and react to it (§4.7, §7).
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: &RunContext, arguments: Value) -> Result<Value, String>;
}

/// A local function tool: name, description, parameters schema, and callable
/// (§3 "Tool").
pub struct LocalTool {
    name: String,
    description: String,
    parameters: Value,
    handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for LocalTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl Clone for LocalTool {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl LocalTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(handler),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render this tool's model-facing [`ToolDefinition`], strict-normalizing
    /// its parameter schema (§4.1, §6).
    ///
    /// # Errors
    /// Propagates [`crate::error::RaafError::InvalidSchema`] from normalization.
    pub fn definition(&self) -> Result<ToolDefinition, crate::error::RaafError> {
        ToolDefinition::new(&self.name, &self.description, &self.parameters)
    }

    async fn call(&self, ctx: &RunContext, arguments: Value) -> Result<Value, String> {
        self.handler.call(ctx, arguments).await
    }
}

/// A tool entry as held by an [`Agent`]: either a local function tool or a
/// hosted tool the provider executes remotely (§3 "Tool").
#[derive(Clone)]
pub enum AgentTool {
    Local(Arc<LocalTool>),
    Hosted(HostedToolKind),
}

impl AgentTool {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Local(tool) => tool.name(),
            Self::Hosted(HostedToolKind::WebSearch) => "web_search",
            Self::Hosted(HostedToolKind::CodeInterpreter) => "code_interpreter",
            Self::Hosted(HostedToolKind::FileSearch) => "file_search",
        }
    }
}

impl std::fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(tool) => f.debug_tuple("Local").field(tool).finish(),
            Self::Hosted(kind) => f.debug_tuple("Hosted").field(kind).finish(),
        }
    }
}

/// Collect the tool set offered to the model for `agent`: its own tools,
/// plus the (deduped by name, first-wins) tools of every agent transitively
/// reachable via handoffs, with a visited-set breaking cycles (§4.7).
#[must_use]
pub fn collect_transitive_tools(agent: &Agent) -> Vec<AgentTool> {
    let mut seen_names = HashSet::new();
    let mut out = Vec::new();
    let mut visited_agents = HashSet::new();
    collect_into(agent, &mut visited_agents, &mut seen_names, &mut out);
    out
}

fn collect_into(
    agent: &Agent,
    visited_agents: &mut HashSet<String>,
    seen_names: &mut HashSet<String>,
    out: &mut Vec<AgentTool>,
) {
    if !visited_agents.insert(agent.name().to_string()) {
        return;
    }
    for tool in agent.tools() {
        if seen_names.insert(tool.name().to_string()) {
            out.push(tool.clone());
        }
    }
    for handoff in agent.handoffs() {
        collect_into(handoff.target(), visited_agents, seen_names, out);
    }
}

/// Build the full [`ToolDefinition`] list sent to the model for `agent`:
/// its transitively-collected tools, plus a synthetic handoff tool for each
/// of its *direct* handoffs (§4.7: "Synthetic handoff tools ... are always
/// added for direct handoffs").
///
/// # Errors
/// Propagates [`crate::error::RaafError::InvalidSchema`] from normalization.
pub fn build_tool_definitions(agent: &Agent) -> Result<Vec<ToolDefinition>, crate::error::RaafError> {
    let mut defs = Vec::new();
    for tool in collect_transitive_tools(agent) {
        match tool {
            AgentTool::Local(local) => defs.push(local.definition()?),
            AgentTool::Hosted(kind) => defs.push(hosted_tool_definition(kind)),
        }
    }
    for handoff in agent.handoffs() {
        defs.push(handoff.tool_definition()?);
    }
    Ok(defs)
}

fn hosted_tool_definition(kind: HostedToolKind) -> ToolDefinition {
    let (name, description) = match kind {
        HostedToolKind::WebSearch => ("web_search", "Search the web for current information."),
        HostedToolKind::CodeInterpreter => {
            ("code_interpreter", "Execute code in a sandboxed interpreter.")
        }
        HostedToolKind::FileSearch => ("file_search", "Search over attached files."),
    };
    ToolDefinition {
        kind: "function",
        name: name.to_string(),
        function: ToolFunctionDef {
            name: name.to_string(),
            description: description.to_string(),
            parameters: serde_json::json!({"type": "object", "properties": {}, "required": [], "additionalProperties": false}),
        },
    }
}

/// One local function call extracted from a response, ready to dispatch (C6/C7).
#[derive(Debug, Clone)]
pub struct ToolRunFunction {
    pub call_id: String,
    pub tool_call_item: Item,
    pub tool_name: String,
    pub arguments_json: String,
}

/// The outcome of dispatching one local tool call: either a normal output
/// item, or a handoff sentinel routed back to the step processor (§4.7).
pub enum ToolDispatchOutcome {
    Output(Item),
    Handoff { target_agent: String, data: Value, call_id: String },
}

/// Resolve `tool_name` within `agent`'s transitively-collected tool set.
#[must_use]
pub fn find_local_tool(agent: &Agent, tool_name: &str) -> Option<Arc<LocalTool>> {
    collect_transitive_tools(agent).into_iter().find_map(|tool| match tool {
        AgentTool::Local(local) if local.name() == tool_name => Some(local),
        _ => None,
    })
}

/// Dispatch one local tool call (§4.7): parse arguments, invoke the handler,
/// and classify the result as either a normal tool output or a handoff
/// sentinel. Errors (parse failure or handler failure) are *locally
/// recovered* into an error-string output, never raised (§4.7, §7).
/// `on_tool_start` fires before the attempt; `on_tool_end` or `on_tool_error`
/// fires once the outcome is known (§6 "Hook surface").
pub async fn dispatch_one(
    ctx: &RunContext,
    agent: &Agent,
    call: &ToolRunFunction,
    hooks: &HookPair<'_>,
) -> ToolDispatchOutcome {
    hooks.tool_start(ctx, agent, &call.tool_name).await;

    let Some(tool) = find_local_tool(agent, &call.tool_name) else {
        let error = format!("error: tool `{}` not found", call.tool_name);
        hooks.tool_error(ctx, agent, &call.tool_name, &error).await;
        return ToolDispatchOutcome::Output(Item::ToolCallOutput {
            call_id: call.call_id.clone(),
            output: error,
            agent: agent.name().to_string(),
        });
    };

    let arguments: Value = match serde_json::from_str(&call.arguments_json) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(tool = %call.tool_name, call_id = %call.call_id, error = %err, "invalid tool arguments");
            let error = format!("error: invalid tool arguments: {err}");
            hooks.tool_error(ctx, agent, &call.tool_name, &error).await;
            return ToolDispatchOutcome::Output(Item::ToolCallOutput {
                call_id: call.call_id.clone(),
                output: error,
                agent: agent.name().to_string(),
            });
        }
    };

    match tool.call(ctx, arguments).await {
        Ok(result) => {
            if let Some((target_agent, data)) = as_handoff_sentinel(&result) {
                hooks.tool_end(ctx, agent, &call.tool_name, "handoff").await;
                ToolDispatchOutcome::Handoff {
                    target_agent,
                    data,
                    call_id: call.call_id.clone(),
                }
            } else {
                let output = match result {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                hooks.tool_end(ctx, agent, &call.tool_name, &output).await;
                ToolDispatchOutcome::Output(Item::ToolCallOutput {
                    call_id: call.call_id.clone(),
                    output,
                    agent: agent.name().to_string(),
                })
            }
        }
        Err(message) => {
            hooks.tool_error(ctx, agent, &call.tool_name, &message).await;
            ToolDispatchOutcome::Output(Item::ToolCallOutput {
                call_id: call.call_id.clone(),
                output: format!("error: {message}"),
                agent: agent.name().to_string(),
            })
        }
    }
}

/// Execute every local tool call in `calls` concurrently (§4.7, §5). The
/// caller is responsible for restoring `call_id` order afterward (§5
/// "Ordering guarantees") — dispatch here only fires hooks and collects
/// results in completion order.
pub async fn dispatch_all(
    ctx: &RunContext,
    agent: &Agent,
    calls: &[ToolRunFunction],
    hooks: &HookPair<'_>,
) -> Vec<ToolDispatchOutcome> {
    let futures = calls.iter().map(|call| dispatch_one(ctx, agent, call, hooks));
    join_all(futures).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::hooks::NoopHooks;

    struct Echo;
    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, _ctx: &RunContext, arguments: Value) -> Result<Value, String> {
            Ok(arguments)
        }
    }

    struct Fails;
    #[async_trait]
    impl ToolHandler for Fails {
        async fn call(&self, _ctx: &RunContext, _arguments: Value) -> Result<Value, String> {
            Err("boom".into())
        }
    }

    struct Handsoff;
    #[async_trait]
    impl ToolHandler for Handsoff {
        async fn call(&self, _ctx: &RunContext, _arguments: Value) -> Result<Value, String> {
            Ok(handoff_sentinel("B", serde_json::json!({"note": "go"})))
        }
    }

    fn agent_with_echo() -> Agent {
        let tool = LocalTool::new("echo", "Echoes input", serde_json::json!({"type": "object", "properties": {}}), Echo);
        Agent::new("A", "gpt-test").with_tool(tool)
    }

    #[tokio::test]
    async fn dispatch_parses_and_invokes() {
        let agent = agent_with_echo();
        let ctx = RunContext::new("A");
        let call = ToolRunFunction {
            call_id: "call_1".into(),
            tool_call_item: Item::ToolCall {
                id: "id_1".into(),
                call_id: "call_1".into(),
                name: "echo".into(),
                arguments_json: r#"{"x":1}"#.into(),
                agent: "A".into(),
            },
            tool_name: "echo".into(),
            arguments_json: r#"{"x":1}"#.into(),
        };
        let hooks = NoopHooks;
        let pair = HookPair::new(&hooks, None);
        match dispatch_one(&ctx, &agent, &call, &pair).await {
            ToolDispatchOutcome::Output(Item::ToolCallOutput { output, .. }) => {
                assert_eq!(output, r#"{"x":1}"#);
            }
            _ => panic!("expected a tool output"),
        }
    }

    #[tokio::test]
    async fn invalid_arguments_recover_to_error_output() {
        let agent = agent_with_echo();
        let ctx = RunContext::new("A");
        let call = ToolRunFunction {
            call_id: "call_1".into(),
            tool_call_item: Item::ToolCall {
                id: "id_1".into(),
                call_id: "call_1".into(),
                name: "echo".into(),
                arguments_json: "not json".into(),
                agent: "A".into(),
            },
            tool_name: "echo".into(),
            arguments_json: "not json".into(),
        };
        let hooks = NoopHooks;
        let pair = HookPair::new(&hooks, None);
        match dispatch_one(&ctx, &agent, &call, &pair).await {
            ToolDispatchOutcome::Output(Item::ToolCallOutput { output, .. }) => {
                assert!(output.starts_with("error:"));
            }
            _ => panic!("expected a tool output"),
        }
    }

    #[tokio::test]
    async fn handler_failure_recovers_to_error_output_not_raise() {
        let tool = LocalTool::new("fail", "Always fails", serde_json::json!({"type": "object", "properties": {}}), Fails);
        let agent = Agent::new("A", "gpt-test").with_tool(tool);
        let ctx = RunContext::new("A");
        let call = ToolRunFunction {
            call_id: "call_1".into(),
            tool_call_item: Item::ToolCall {
                id: "id_1".into(),
                call_id: "call_1".into(),
                name: "fail".into(),
                arguments_json: "{}".into(),
                agent: "A".into(),
            },
            tool_name: "fail".into(),
            arguments_json: "{}".into(),
        };
        let hooks = NoopHooks;
        let pair = HookPair::new(&hooks, None);
        match dispatch_one(&ctx, &agent, &call, &pair).await {
            ToolDispatchOutcome::Output(Item::ToolCallOutput { output, .. }) => {
                assert_eq!(output, "error: boom");
            }
            _ => panic!("expected a tool output"),
        }
    }

    #[tokio::test]
    async fn tool_returning_sentinel_routes_to_handoff() {
        let tool = LocalTool::new("go", "Hands off", serde_json::json!({"type": "object", "properties": {}}), Handsoff);
        let agent = Agent::new("A", "gpt-test").with_tool(tool);
        let ctx = RunContext::new("A");
        let call = ToolRunFunction {
            call_id: "call_1".into(),
            tool_call_item: Item::ToolCall {
                id: "id_1".into(),
                call_id: "call_1".into(),
                name: "go".into(),
                arguments_json: "{}".into(),
                agent: "A".into(),
            },
            tool_name: "go".into(),
            arguments_json: "{}".into(),
        };
        let hooks = NoopHooks;
        let pair = HookPair::new(&hooks, None);
        match dispatch_one(&ctx, &agent, &call, &pair).await {
            ToolDispatchOutcome::Handoff { target_agent, .. } => assert_eq!(target_agent, "B"),
            ToolDispatchOutcome::Output(_) => panic!("expected a handoff"),
        }
    }

    #[tokio::test]
    async fn dispatch_all_preserves_call_id_order() {
        let tool = LocalTool::new("echo", "Echoes input", serde_json::json!({"type": "object", "properties": {}}), Echo);
        let agent = Agent::new("A", "gpt-test").with_tool(tool);
        let ctx = RunContext::new("A");
        let calls: Vec<ToolRunFunction> = (0..3)
            .map(|i| ToolRunFunction {
                call_id: format!("call_{i}"),
                tool_call_item: Item::ToolCall {
                    id: format!("id_{i}"),
                    call_id: format!("call_{i}"),
                    name: "echo".into(),
                    arguments_json: format!(r#"{{"i":{i}}}"#),
                    agent: "A".into(),
                },
                tool_name: "echo".into(),
                arguments_json: format!(r#"{{"i":{i}}}"#),
            })
            .collect();
        let hooks = NoopHooks;
        let pair = HookPair::new(&hooks, None);
        let results = dispatch_all(&ctx, &agent, &calls, &pair).await;
        for (i, outcome) in results.iter().enumerate() {
            match outcome {
                ToolDispatchOutcome::Output(Item::ToolCallOutput { call_id, .. }) => {
                    assert_eq!(call_id, &format!("call_{i}"));
                }
                _ => panic!("expected tool output"),
            }
        }
    }
}
