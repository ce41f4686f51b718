//! Lifecycle hooks (§6 "Hook surface"): run-level and agent-level, dispatched
//! concurrently at each call site with run-level invoked first conceptually
//! but both awaited together (mirrors `machi::agent::hook::HookPair`).
//!
//! Hook failures must never abort a run (§6: "Hook exceptions are caught,
//! logged, and do not abort the run"). Since these hooks are infallible
//! (`async fn(...) -> ()`), an implementor that wants fallible behavior
//! should catch and log internally; this mirrors the teacher's own hook
//! trait shape, which is likewise infallible.

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::Agent;
use crate::context::RunContext;

/// Run-scoped lifecycle hooks, dispatched for every agent in the run.
#[async_trait]
pub trait RunHooks: Send + Sync {
    async fn on_agent_start(&self, _ctx: &RunContext, _agent: &Agent) {}
    async fn on_agent_end(&self, _ctx: &RunContext, _agent: &Agent, _output: &Value) {}
    async fn on_tool_start(&self, _ctx: &RunContext, _agent: &Agent, _tool_name: &str) {}
    async fn on_tool_end(
        &self,
        _ctx: &RunContext,
        _agent: &Agent,
        _tool_name: &str,
        _result: &str,
    ) {
    }
    async fn on_tool_error(
        &self,
        _ctx: &RunContext,
        _agent: &Agent,
        _tool_name: &str,
        _error: &str,
    ) {
    }
    async fn on_handoff(&self, _ctx: &RunContext, _from: &Agent, _to: &Agent) {}
}

/// Agent-scoped lifecycle hooks, attached to a single [`Agent`] and
/// dispatched alongside the run-level hooks whenever that agent is active.
#[async_trait]
pub trait AgentHooks: Send + Sync {
    async fn on_agent_start(&self, _ctx: &RunContext, _agent: &Agent) {}
    async fn on_agent_end(&self, _ctx: &RunContext, _agent: &Agent, _output: &Value) {}
    async fn on_tool_start(&self, _ctx: &RunContext, _agent: &Agent, _tool_name: &str) {}
    async fn on_tool_end(
        &self,
        _ctx: &RunContext,
        _agent: &Agent,
        _tool_name: &str,
        _result: &str,
    ) {
    }
    async fn on_tool_error(
        &self,
        _ctx: &RunContext,
        _agent: &Agent,
        _tool_name: &str,
        _error: &str,
    ) {
    }
    async fn on_handoff(&self, _ctx: &RunContext, _from: &Agent, _to: &Agent) {}
}

/// No-op run hooks, used as the default when a caller doesn't supply any.
#[derive(Debug, Default)]
pub struct NoopHooks;

#[async_trait]
impl RunHooks for NoopHooks {}

/// Dispatches a method to both the run-level hooks and, if present, the
/// current agent's hooks, concurrently (grounded in
/// `machi::agent::hook::HookPair`).
pub struct HookPair<'a> {
    pub run: &'a dyn RunHooks,
    pub agent: Option<&'a dyn AgentHooks>,
}

impl<'a> HookPair<'a> {
    #[must_use]
    pub fn new(run: &'a dyn RunHooks, agent: Option<&'a dyn AgentHooks>) -> Self {
        Self { run, agent }
    }

    pub async fn agent_start(&self, ctx: &RunContext, agent: &Agent) {
        match self.agent {
            Some(a) => {
                tokio::join!(self.run.on_agent_start(ctx, agent), a.on_agent_start(ctx, agent));
            }
            None => self.run.on_agent_start(ctx, agent).await,
        }
    }

    pub async fn agent_end(&self, ctx: &RunContext, agent: &Agent, output: &Value) {
        match self.agent {
            Some(a) => {
                tokio::join!(
                    self.run.on_agent_end(ctx, agent, output),
                    a.on_agent_end(ctx, agent, output)
                );
            }
            None => self.run.on_agent_end(ctx, agent, output).await,
        }
    }

    pub async fn tool_start(&self, ctx: &RunContext, agent: &Agent, tool_name: &str) {
        match self.agent {
            Some(a) => {
                tokio::join!(
                    self.run.on_tool_start(ctx, agent, tool_name),
                    a.on_tool_start(ctx, agent, tool_name)
                );
            }
            None => self.run.on_tool_start(ctx, agent, tool_name).await,
        }
    }

    pub async fn tool_end(&self, ctx: &RunContext, agent: &Agent, tool_name: &str, result: &str) {
        match self.agent {
            Some(a) => {
                tokio::join!(
                    self.run.on_tool_end(ctx, agent, tool_name, result),
                    a.on_tool_end(ctx, agent, tool_name, result)
                );
            }
            None => self.run.on_tool_end(ctx, agent, tool_name, result).await,
        }
    }

    pub async fn tool_error(&self, ctx: &RunContext, agent: &Agent, tool_name: &str, error: &str) {
        match self.agent {
            Some(a) => {
                tokio::join!(
                    self.run.on_tool_error(ctx, agent, tool_name, error),
                    a.on_tool_error(ctx, agent, tool_name, error)
                );
            }
            None => self.run.on_tool_error(ctx, agent, tool_name, error).await,
        }
    }

    pub async fn handoff(&self, ctx: &RunContext, from: &Agent, to: &Agent) {
        match self.agent {
            Some(a) => {
                tokio::join!(self.run.on_handoff(ctx, from, to), a.on_handoff(ctx, from, to));
            }
            None => self.run.on_handoff(ctx, from, to).await,
        }
    }
}
