//! Typed conversation items and their canonical wire form (C5).
//!
//! An [`Item`] is appended to the run's item log and never mutated after
//! creation (§3, "Lifecycle"). `ToolCall` and `HandoffCall` share a wire shape
//! (`function_call`); which variant an item becomes is decided by the response
//! processor (C6) based on whether the resolved name is a handoff tool.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Conversation role, mirrored onto the wire `message` item's `role` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single conversation item. See spec §3 "Item".
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Message {
        id: String,
        role: Role,
        content: String,
        agent: String,
    },
    ToolCall {
        id: String,
        call_id: String,
        name: String,
        arguments_json: String,
        agent: String,
    },
    ToolCallOutput {
        call_id: String,
        output: String,
        agent: String,
    },
    HandoffCall {
        id: String,
        call_id: String,
        name: String,
        arguments_json: String,
        agent: String,
    },
}

impl Item {
    /// The item's own id, if it has one. `ToolCallOutput` has no provider id
    /// of its own; it is addressed by `call_id`.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Message { id, .. } | Self::ToolCall { id, .. } | Self::HandoffCall { id, .. } => {
                Some(id)
            }
            Self::ToolCallOutput { .. } => None,
        }
    }

    #[must_use]
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::ToolCall { call_id, .. }
            | Self::HandoffCall { call_id, .. }
            | Self::ToolCallOutput { call_id, .. } => Some(call_id),
            Self::Message { .. } => None,
        }
    }

    #[must_use]
    pub fn agent(&self) -> &str {
        match self {
            Self::Message { agent, .. }
            | Self::ToolCall { agent, .. }
            | Self::ToolCallOutput { agent, .. }
            | Self::HandoffCall { agent, .. } => agent,
        }
    }

    /// Generate a fresh synthetic id for an item the provider did not assign
    /// one to (§4.5: "if absent the engine synthesizes a uuid").
    #[must_use]
    pub fn synthesize_id() -> String {
        format!("item_{}", Uuid::new_v4())
    }

    /// Rewrite a provider-issued `fc_`-prefixed id to the `call_`-prefixed
    /// form expected when threading it back into a request (§3, §6).
    #[must_use]
    pub fn normalize_id(id: &str) -> String {
        id.strip_prefix("fc_")
            .map_or_else(|| id.to_string(), |rest| format!("call_{rest}"))
    }

    /// Serialize to the canonical wire form consumed by the provider (§6).
    #[must_use]
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Message { role, content, .. } => serde_json::json!({
                "type": "message",
                "role": role,
                "content": [{"type": "output_text", "text": content}],
            }),
            Self::ToolCall {
                id,
                call_id,
                name,
                arguments_json,
                ..
            } => serde_json::json!({
                "type": "function_call",
                "id": id,
                "call_id": call_id,
                "name": name,
                "arguments": arguments_json,
            }),
            Self::HandoffCall {
                id,
                call_id,
                name,
                arguments_json,
                ..
            } => serde_json::json!({
                "type": "function_call",
                "id": id,
                "call_id": call_id,
                "name": name,
                "arguments": arguments_json,
            }),
            Self::ToolCallOutput {
                call_id, output, ..
            } => serde_json::json!({
                "type": "function_call_output",
                "call_id": call_id,
                "output": output,
            }),
        }
    }
}

/// A simplified projection of an [`Item`] for [`crate::runner::RunResult::messages`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl From<&Item> for Option<ConversationMessage> {
    fn from(item: &Item) -> Self {
        match item {
            Item::Message {
                role,
                content,
                agent,
                ..
            } => Some(ConversationMessage {
                role: *role,
                content: content.clone(),
                agent: agent.clone(),
                tool_call_id: None,
            }),
            Item::ToolCallOutput {
                call_id,
                output,
                agent,
            } => Some(ConversationMessage {
                role: Role::Tool,
                content: output.clone(),
                agent: agent.clone(),
                tool_call_id: Some(call_id.clone()),
            }),
            // Tool/handoff calls themselves are not rendered as standalone
            // conversation messages; their outputs are.
            Item::ToolCall { .. } | Item::HandoffCall { .. } => None,
        }
    }
}
