//! `raaf` is the core execution runtime for a multi-agent LLM orchestration
//! framework: the run loop, response processor, step processor, provider
//! call layer with retry/backoff, guardrails, lifecycle hooks, and the
//! conversation-item accounting that sits underneath an agent-facing SDK.
//!
//! This crate does not ship a provider HTTP client beyond one reference
//! implementation, a tracing backend, a session store, or a CLI — those are
//! external collaborators that plug in through the interfaces in
//! [`provider`], [`hooks`], and [`guardrail`]. See `DESIGN.md` in the crate
//! root for how each module is grounded and which crates it depends on.

pub mod agent;
pub mod config;
pub mod context;
pub mod error;
pub mod guardrail;
pub mod handoff;
pub mod hooks;
pub mod item;
pub mod json_repair;
pub mod provider;
pub mod response_processor;
pub mod retry;
pub mod runner;
pub mod schema;
pub mod step;
pub mod tool;
pub mod usage;

pub use agent::{Agent, Handoff, Instructions, ModelSettings, ToolChoice};
pub use config::{ContextManagement, RuntimeConfig};
pub use context::RunContext;
pub use error::{HandoffError, ProviderError, RaafError};
pub use guardrail::{
    GuardrailOutput, InputGuardrail, InputGuardrailCheck, OutputGuardrail, OutputGuardrailCheck,
};
pub use hooks::{AgentHooks, RunHooks};
pub use item::{ConversationMessage, Item, Role};
pub use provider::{HttpResponsesProvider, ProviderCallError, ProviderResponse, ResponsesProvider};
pub use retry::{ErrorKind, RetryConfig, RetryPolicy};
pub use runner::{RunConfig, RunResult, Runner, ToolCallRecord};
pub use tool::{AgentTool, HostedToolKind, LocalTool, ToolHandler};
pub use usage::Usage;
