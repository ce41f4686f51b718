//! Provider Interface (C4): the adapter contract the run loop calls (§4.4),
//! plus one concrete adapter implementing the items-based "Responses"
//! protocol over HTTP (§6).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::item::Item;
use crate::retry::{RetryPolicy, RetryableError};
use crate::tool::ToolDefinition;
use crate::usage::Usage;

/// One output item as returned in a provider response's `output` array
/// (§6). Unlike [`Item`], this also covers hosted-tool output kinds that
/// the engine tracks but never executes itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawOutputItem {
    Message {
        #[serde(default)]
        id: Option<String>,
        role: String,
        content: MessageContent,
    },
    #[serde(rename = "output_text")]
    OutputText {
        #[serde(default)]
        id: Option<String>,
        text: String,
    },
    FunctionCall {
        id: String,
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
    FileSearch {
        #[serde(flatten)]
        raw: Value,
    },
    WebSearch {
        #[serde(flatten)]
        raw: Value,
    },
    ComputerUse {
        #[serde(flatten)]
        raw: Value,
    },
    LocalShell {
        #[serde(flatten)]
        raw: Value,
    },
    #[serde(other)]
    Unknown,
}

/// `content` on a `message` output item may be a bare string or a list of
/// `{type, text}` parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<MessageContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

impl MessageContent {
    #[must_use]
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts.iter().map(|p| p.text.as_str()).collect::<Vec<_>>().join(""),
        }
    }
}

/// A request to the provider, in the engine's canonical item wire form (§6).
#[derive(Debug, Clone)]
pub struct ResponsesRequest {
    pub system_prompt: String,
    pub input: Vec<Item>,
    pub model: String,
    pub tools: Vec<ToolDefinition>,
    pub previous_response_id: Option<String>,
    pub model_params: Value,
}

impl ResponsesRequest {
    /// Render to the exact wire shape in §6:
    /// `{model, input: [Item...], tools?, previous_response_id?, ...model_params}`.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        let mut input: Vec<Value> = vec![serde_json::json!({
            "type": "message",
            "role": "system",
            "content": [{"type": "text", "text": self.system_prompt}],
        })];
        input.extend(self.input.iter().map(Item::to_wire));

        let mut body = serde_json::json!({
            "model": self.model,
            "input": input,
        });
        if !self.tools.is_empty() {
            body["tools"] = serde_json::to_value(&self.tools).unwrap_or(Value::Null);
        }
        if let Some(id) = &self.previous_response_id {
            body["previous_response_id"] = Value::String(id.clone());
        }
        if let Value::Object(extra) = &self.model_params {
            if let Value::Object(map) = &mut body {
                for (k, v) in extra {
                    map.insert(k.clone(), v.clone());
                }
            }
        }
        body
    }
}

/// A provider response (§4.4, §6).
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderResponse {
    pub id: String,
    pub output: Vec<RawOutputItem>,
    pub usage: Usage,
    pub model: String,
}

/// An error raised by a provider call, before retry classification.
#[derive(Debug, Clone)]
pub struct ProviderCallError {
    pub message: String,
    pub kind: Option<crate::retry::ErrorKind>,
}

impl From<ProviderCallError> for RetryableError {
    fn from(value: ProviderCallError) -> Self {
        Self {
            message: value.message,
            kind: value.kind,
        }
    }
}

/// The adapter contract the run loop calls (§4.4). One concrete
/// implementation, [`HttpResponsesProvider`], is supplied; the interface is
/// otherwise provider-pluggable.
#[async_trait]
pub trait ResponsesProvider: Send + Sync {
    async fn responses_completion(
        &self,
        request: ResponsesRequest,
    ) -> Result<ProviderResponse, ProviderCallError>;

    fn supports_function_calling(&self) -> bool {
        true
    }
}

/// Call `provider` through `retry_policy`, turning the provider's raw errors
/// into the taxonomy's [`crate::error::ProviderError`] on exhaustion.
pub async fn call_with_retry(
    provider: &dyn ResponsesProvider,
    retry_policy: &RetryPolicy,
    request: &ResponsesRequest,
) -> Result<ProviderResponse, crate::error::ProviderError> {
    retry_policy
        .execute(|| async { provider.responses_completion(request.clone()).await.map_err(Into::into) })
        .await
}

/// A concrete, HTTP-based `ResponsesProvider`, grounded in the items wire
/// shape of §6. Out of scope: vendor-specific request shaping (§1).
pub struct HttpResponsesProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpResponsesProvider {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: None,
        }
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[async_trait]
impl ResponsesProvider for HttpResponsesProvider {
    async fn responses_completion(
        &self,
        request: ResponsesRequest,
    ) -> Result<ProviderResponse, ProviderCallError> {
        let body = request.to_wire();
        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| ProviderCallError {
            message: e.to_string(),
            kind: None,
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderCallError {
                message: format!("http {status}: {text}"),
                kind: if status.as_u16() == 401 || status.as_u16() == 403 {
                    Some(crate::retry::ErrorKind::AuthenticationError)
                } else {
                    None
                },
            });
        }

        response
            .json::<ProviderResponse>()
            .await
            .map_err(|e| ProviderCallError {
                message: e.to_string(),
                kind: None,
            })
    }
}

/// Convenience alias for sharing a provider across a runner and its tests.
pub type SharedProvider = Arc<dyn ResponsesProvider>;
