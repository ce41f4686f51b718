//! Response Processor (C6): a single pass over a provider response's
//! `output`, categorizing each item into messages, tool calls, handoff
//! requests, or hosted-tool usage (§4.6). Never mutates the agent or the run.

use serde_json::Value;

use crate::agent::Agent;
use crate::error::RaafError;
use crate::handoff::resolve_handoff;
use crate::item::{Item, Role};
use crate::provider::{ProviderResponse, RawOutputItem};
use crate::tool::{find_local_tool, ToolRunFunction};

/// One handoff call extracted from a response, ready for resolution by C8.
#[derive(Debug, Clone)]
pub struct ToolRunHandoff {
    pub call_id: String,
    pub handoff_call_item: Item,
    pub tool_name: String,
    pub arguments_json: String,
}

/// The categorized output of one provider response (§3 "ProcessedResponse").
#[derive(Debug, Clone, Default)]
pub struct ProcessedResponse {
    pub new_items: Vec<Item>,
    pub handoffs: Vec<ToolRunHandoff>,
    pub functions: Vec<ToolRunFunction>,
    pub computer_actions: Vec<Value>,
    pub local_shell_calls: Vec<Value>,
    pub tools_used: Vec<String>,
}

impl ProcessedResponse {
    /// The concatenated text of every assistant message item produced this
    /// response, used as the candidate "final output" content and as the
    /// subject of output guardrails (§4.9, §4.10).
    #[must_use]
    pub fn assistant_text(&self) -> Option<String> {
        let texts: Vec<&str> = self
            .new_items
            .iter()
            .filter_map(|item| match item {
                Item::Message {
                    role: Role::Assistant,
                    content,
                    ..
                } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        }
    }

    #[must_use]
    pub fn has_tool_calls_or_handoffs(&self) -> bool {
        !self.functions.is_empty() || !self.handoffs.is_empty()
    }
}

/// Categorize `response.output` against `agent`'s tool and handoff sets (§4.6).
///
/// # Errors
/// Returns [`RaafError::ModelBehavior`] if the response names a tool that is
/// neither a known local tool nor a resolvable handoff.
pub fn process_response(agent: &Agent, response: &ProviderResponse) -> Result<ProcessedResponse, RaafError> {
    let mut processed = ProcessedResponse::default();

    for raw in &response.output {
        match raw {
            RawOutputItem::Message { id, role, content } => {
                processed.new_items.push(Item::Message {
                    id: id.clone().unwrap_or_else(Item::synthesize_id),
                    role: parse_role(role),
                    content: content.as_text(),
                    agent: agent.name().to_string(),
                });
            }
            RawOutputItem::OutputText { id, text } => {
                processed.new_items.push(Item::Message {
                    id: id.clone().unwrap_or_else(Item::synthesize_id),
                    role: Role::Assistant,
                    content: text.clone(),
                    agent: agent.name().to_string(),
                });
            }
            RawOutputItem::FunctionCall {
                id,
                call_id,
                name,
                arguments,
            } => {
                let call_id = Item::normalize_id(call_id);
                if resolve_handoff(agent, name).is_some() {
                    let item = Item::HandoffCall {
                        id: id.clone(),
                        call_id: call_id.clone(),
                        name: name.clone(),
                        arguments_json: arguments.clone(),
                        agent: agent.name().to_string(),
                    };
                    processed.handoffs.push(ToolRunHandoff {
                        call_id,
                        handoff_call_item: item.clone(),
                        tool_name: name.clone(),
                        arguments_json: arguments.clone(),
                    });
                    processed.new_items.push(item);
                } else if find_local_tool(agent, name).is_some() {
                    let item = Item::ToolCall {
                        id: id.clone(),
                        call_id: call_id.clone(),
                        name: name.clone(),
                        arguments_json: arguments.clone(),
                        agent: agent.name().to_string(),
                    };
                    processed.functions.push(ToolRunFunction {
                        call_id,
                        tool_call_item: item.clone(),
                        tool_name: name.clone(),
                        arguments_json: arguments.clone(),
                    });
                    processed.new_items.push(item);
                } else {
                    return Err(RaafError::ModelBehavior(format!(
                        "tool not found: `{name}`"
                    )));
                }
            }
            RawOutputItem::FunctionCallOutput { call_id, output } => {
                processed.new_items.push(Item::ToolCallOutput {
                    call_id: Item::normalize_id(call_id),
                    output: output.clone(),
                    agent: agent.name().to_string(),
                });
            }
            RawOutputItem::FileSearch { raw } => {
                processed.tools_used.push("file_search".to_string());
                processed.computer_actions.push(raw.clone());
            }
            RawOutputItem::WebSearch { raw } => {
                processed.tools_used.push("web_search".to_string());
                processed.computer_actions.push(raw.clone());
            }
            RawOutputItem::ComputerUse { raw } => {
                processed.tools_used.push("computer_use".to_string());
                processed.computer_actions.push(raw.clone());
            }
            RawOutputItem::LocalShell { raw } => {
                processed.tools_used.push("local_shell".to_string());
                processed.local_shell_calls.push(raw.clone());
            }
            RawOutputItem::Unknown => {
                tracing::warn!(agent = agent.name(), "unknown output item type; degrading to message");
                processed.new_items.push(Item::Message {
                    id: Item::synthesize_id(),
                    role: Role::Assistant,
                    content: String::new(),
                    agent: agent.name().to_string(),
                });
            }
        }
    }

    Ok(processed)
}

fn parse_role(role: &str) -> Role {
    match role {
        "user" => Role::User,
        "system" => Role::System,
        "tool" => Role::Tool,
        _ => Role::Assistant,
    }
}
