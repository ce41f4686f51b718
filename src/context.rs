//! Context Wrapper (C13): per-run mutable state (§4.13).
//!
//! Mutations are serialized by the single-threaded run loop (§5); hooks and
//! tools receive a shared, read-only view (`&RunContext`) rather than a
//! handle they can mutate directly, since only the run loop task is
//! permitted to mutate `current_agent`/`current_turn`/the item log (§5,
//! "Shared-resource policy"). This is an explicit simplification recorded in
//! `DESIGN.md`.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

/// Per-run state: accumulated messages, metadata, trace/group ids, and the
/// current agent/turn (§3 "RunContext").
#[derive(Debug, Clone)]
pub struct RunContext {
    metadata: HashMap<String, Value>,
    trace_id: String,
    group_id: Option<String>,
    current_agent: String,
    current_turn: u32,
}

impl RunContext {
    #[must_use]
    pub fn new(current_agent: impl Into<String>) -> Self {
        Self {
            metadata: HashMap::new(),
            trace_id: format!("trace_{}", Uuid::new_v4()),
            group_id: None,
            current_agent: current_agent.into(),
            current_turn: 0,
        }
    }

    #[must_use]
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    #[must_use]
    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    #[must_use]
    pub fn current_agent(&self) -> &str {
        &self.current_agent
    }

    pub fn set_current_agent(&mut self, agent: impl Into<String>) {
        self.current_agent = agent.into();
    }

    #[must_use]
    pub const fn current_turn(&self) -> u32 {
        self.current_turn
    }

    pub fn set_current_turn(&mut self, turn: u32) {
        self.current_turn = turn;
    }

    /// Reset per-run counters while keeping trace/group identity, for reuse
    /// across a fresh run against the same logical conversation.
    pub fn reset(&mut self) {
        self.current_turn = 0;
        self.metadata.clear();
    }
}
