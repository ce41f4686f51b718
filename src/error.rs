//! The error taxonomy surfaced to callers of the run loop (C12).
//!
//! Only the variants of [`RaafError`] ever escape [`crate::runner::Runner::run`].
//! Tool-execution failures and handoff-resolution failures are recovered locally
//! into item-log entries; they never reach this type.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

/// Errors raised while resolving or validating a handoff (C8).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HandoffError {
    #[error("circular handoff: `{target}` already appears in chain {chain:?}")]
    Circular { target: String, chain: Vec<String> },

    #[error("handoff chain too long: {len} >= {max}")]
    ChainTooLong { len: usize, max: usize },

    #[error("no handoff target matches tool `{tool_name}`")]
    TargetNotFound { tool_name: String },

    #[error("duplicate handoff target name `{name}` on agent `{agent}`")]
    DuplicateTarget { agent: String, name: String },
}

/// Errors raised by a provider adapter or by the retry policy wrapping it (C3/C4).
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("response decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("exhausted {attempts} attempts; last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("{0}")]
    Other(String),
}

/// The taxonomy from spec §7. Exact identifiers are implementation-chosen;
/// the surfaced *shape* (which fields each carries) is normative.
#[derive(Debug, Error)]
pub enum RaafError {
    #[error("max turns exceeded: agent `{agent}` reached turn {turn} (max {max_turns})")]
    MaxTurnsExceeded {
        agent: String,
        turn: u32,
        max_turns: u32,
    },

    #[error("execution stopped at turn {turn}")]
    ExecutionStopped { turn: u32 },

    #[error("model behavior error: {0}")]
    ModelBehavior(String),

    #[error("handoff error: {0}")]
    Handoff(#[from] HandoffError),

    #[error("input guardrail `{guardrail}` triggered")]
    InputGuardrailTripwireTriggered {
        guardrail: String,
        content: String,
        metadata: Value,
    },

    #[error("output guardrail `{guardrail}` triggered")]
    OutputGuardrailTripwireTriggered {
        guardrail: String,
        content: String,
        metadata: Value,
    },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl RaafError {
    /// Best-effort metadata describing which agent/turn/tool was responsible,
    /// per §7's "user-visible behavior" requirement.
    #[must_use]
    pub fn context(&self) -> HashMap<&'static str, String> {
        let mut map = HashMap::new();
        match self {
            Self::MaxTurnsExceeded {
                agent,
                turn,
                max_turns,
            } => {
                map.insert("agent", agent.clone());
                map.insert("turn", turn.to_string());
                map.insert("max_turns", max_turns.to_string());
            }
            Self::ExecutionStopped { turn } => {
                map.insert("turn", turn.to_string());
            }
            Self::InputGuardrailTripwireTriggered { guardrail, .. }
            | Self::OutputGuardrailTripwireTriggered { guardrail, .. } => {
                map.insert("guardrail", guardrail.clone());
            }
            _ => {}
        }
        map
    }
}
