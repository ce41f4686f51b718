//! Run Loop / Runner (C11): turn budget, item dedup against
//! `previous_response_id`, system prompt assembly, hook dispatch, and final
//! `RunResult` assembly (§4.11), grounded in `machi::agent::runner::Runner`/
//! `RunState`'s init-then-drive shape.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::agent::Agent;
use crate::config::ContextManagement;
use crate::context::RunContext;
use crate::error::{HandoffError, RaafError};
use crate::guardrail::run_input_guardrails;
use crate::handoff::HandoffChain;
use crate::hooks::{AgentHooks, HookPair, NoopHooks, RunHooks};
use crate::item::{ConversationMessage, Item, Role};
use crate::provider::{ResponsesProvider, ResponsesRequest};
use crate::retry::RetryPolicy;
use crate::step::{execute_step, NextStep};
use crate::tool::build_tool_definitions;
use crate::usage::Usage;
use tracing::Instrument;

/// Hard cap on newly generated items appended to one request (§4.11 step 3).
const MAX_GENERATED_ITEMS: usize = 50;
/// Hard cap on total items sent in one request (§4.11 step 3).
const MAX_TOTAL_ITEMS: usize = 100;

/// Fixed system-context prefix prepended for agents with handoffs, unless
/// their instructions already include it (§6 "Standard prompt prefix").
pub const STANDARD_MULTI_AGENT_PREFIX: &str = "You are part of a multi-agent system designed to make agent \
coordination and execution easy. Agents uses two primary abstraction: **Agents** and **Handoffs**. An agent \
encompasses instructions and tools and can hand off a conversation to another agent when appropriate. Handoffs \
are achieved by calling a handoff function, generally named `transfer_to_<agent_name>`. Transfers between \
agents are handled seamlessly in the background; do not mention or draw attention to these transfers in your \
conversation with the user.";

/// Run-level configuration: hooks, stop-checker, and the retry policy (§4.11,
/// §5 "Cancellation"). Agent-level hooks are a single run-wide override since
/// [`Agent`] carries no embedded hook handle of its own (recorded in
/// `DESIGN.md`).
pub struct RunConfig<'a> {
    pub hooks: &'a dyn RunHooks,
    pub agent_hooks: Option<&'a dyn AgentHooks>,
    pub retry_policy: &'a RetryPolicy,
    pub stop_checker: Option<&'a (dyn Fn() -> bool + Send + Sync)>,
    pub group_id: Option<String>,
    pub context_management: ContextManagement,
}

impl<'a> RunConfig<'a> {
    #[must_use]
    pub fn new(retry_policy: &'a RetryPolicy) -> Self {
        static DEFAULT_HOOKS: NoopHooks = NoopHooks;
        Self {
            hooks: &DEFAULT_HOOKS,
            agent_hooks: None,
            retry_policy,
            stop_checker: None,
            group_id: None,
            context_management: ContextManagement::default(),
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: &'a dyn RunHooks) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn with_agent_hooks(mut self, hooks: &'a dyn AgentHooks) -> Self {
        self.agent_hooks = Some(hooks);
        self
    }

    #[must_use]
    pub fn with_stop_checker(mut self, checker: &'a (dyn Fn() -> bool + Send + Sync)) -> Self {
        self.stop_checker = Some(checker);
        self
    }

    #[must_use]
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    #[must_use]
    pub fn with_context_management(mut self, context_management: ContextManagement) -> Self {
        self.context_management = context_management;
        self
    }
}

/// A structured per-tool-call outcome, independent of the conversation
/// projection (§3 "RunResult").
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub agent: String,
    pub output: String,
    pub timestamp_unix_ms: u128,
}

/// The terminal result of a run (§3 "RunResult").
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunResult {
    pub messages: Vec<ConversationMessage>,
    pub last_agent: String,
    pub turns: u32,
    pub usage: Usage,
    pub tool_results: Vec<ToolCallRecord>,
    pub metadata: HashMap<String, Value>,
}

/// Stateless execution engine; all per-run state lives on the stack of
/// [`Runner::run`] (mirrors `machi::agent::runner::Runner` owning no state).
#[derive(Debug, Clone, Copy)]
pub struct Runner;

impl Runner {
    /// Drive `agent` through the run loop against `input` until a terminal
    /// state (§4.11).
    ///
    /// # Errors
    /// Returns [`RaafError::MaxTurnsExceeded`], [`RaafError::ExecutionStopped`],
    /// a guardrail tripwire, or any error propagated from the step processor.
    pub async fn run(
        agent: Arc<Agent>,
        input: impl Into<String>,
        provider: &dyn ResponsesProvider,
        config: &RunConfig<'_>,
    ) -> Result<RunResult, RaafError> {
        let span = tracing::info_span!(
            "run",
            agent.name = %agent.name(),
            agent.model = %agent.model(),
            agent.max_turns = agent.max_turns(),
            run.turns = tracing::field::Empty,
            error = tracing::field::Empty,
        );
        Self::run_inner(agent, input, provider, config).instrument(span).await
    }

    async fn run_inner(
        agent: Arc<Agent>,
        input: impl Into<String>,
        provider: &dyn ResponsesProvider,
        config: &RunConfig<'_>,
    ) -> Result<RunResult, RaafError> {
        agent.validate()?;

        let mut ctx = RunContext::new(agent.name());
        if let Some(group_id) = &config.group_id {
            ctx = ctx.with_group_id(group_id.clone());
        }

        let input_text = input.into();
        run_input_guardrails(agent.input_guardrails(), &ctx, &agent, &input_text).await?;

        let mut item_log = vec![Item::Message {
            id: Item::synthesize_id(),
            role: Role::User,
            content: input_text,
            agent: agent.name().to_string(),
        }];

        let mut current_agent = agent;
        let mut handoff_chain = HandoffChain::new(current_agent.name());
        let mut previous_response_id: Option<String> = None;
        let mut turns: u32 = 1;
        let mut usage = Usage::default();
        let mut tool_results = Vec::new();

        ctx.set_current_turn(turns);

        loop {
            if let Some(stop_checker) = config.stop_checker {
                if stop_checker() {
                    tracing::Span::current().record("error", tracing::field::display("execution stopped"));
                    return Err(RaafError::ExecutionStopped { turn: turns });
                }
            }

            tracing::debug!(agent = current_agent.name(), turn = turns, "starting turn");
            let hooks = HookPair::new(config.hooks, config.agent_hooks);
            hooks.agent_start(&ctx, &current_agent).await;

            let tools = build_tool_definitions(&current_agent)?;
            let system_prompt = build_system_prompt(&ctx, &current_agent, tools.len());
            let current_input =
                build_current_input(previous_response_id.as_deref(), &item_log, config.context_management);

            let request = ResponsesRequest {
                system_prompt,
                input: current_input,
                model: current_agent.model().to_string(),
                tools,
                previous_response_id: previous_response_id.clone(),
                model_params: current_agent.model_settings().to_params(),
            };

            let step_result = execute_step(
                &ctx,
                &current_agent,
                provider,
                config.retry_policy,
                request,
                &mut handoff_chain,
                config.stop_checker,
                &hooks,
            )
            .await?;

            usage += step_result.model_response.usage;
            previous_response_id = Some(step_result.model_response.id.clone());

            record_tool_results(&step_result.new_step_items, &mut tool_results);
            item_log.extend(step_result.pre_step_items);
            item_log.extend(step_result.new_step_items);

            match step_result.next_step {
                NextStep::FinalOutput(payload) => {
                    hooks.agent_end(&ctx, &current_agent, &payload).await;
                    break;
                }
                NextStep::Handoff(target_name) => {
                    let target = current_agent
                        .handoffs()
                        .iter()
                        .find(|h| h.target().name() == target_name)
                        .map(crate::agent::Handoff::target_arc)
                        .ok_or_else(|| {
                            RaafError::Handoff(HandoffError::TargetNotFound {
                                tool_name: target_name.clone(),
                            })
                        })?;

                    target.invoke_on_handoff(&ctx, &Value::Null);
                    hooks.handoff(&ctx, &current_agent, &target).await;

                    ctx.set_current_agent(target.name());
                    current_agent = target;
                    // Policy decision (§4.11 step 6, §9 Open Question): turns
                    // are never incremented on a pure-handoff turn.
                }
                NextStep::RunAgain => {
                    turns += 1;
                    if turns > current_agent.max_turns() {
                        let err = RaafError::MaxTurnsExceeded {
                            agent: current_agent.name().to_string(),
                            turn: turns,
                            max_turns: current_agent.max_turns(),
                        };
                        tracing::error!(agent = current_agent.name(), turn = turns, "max turns exceeded");
                        tracing::Span::current().record("error", tracing::field::display(&err));
                        return Err(err);
                    }
                    ctx.set_current_turn(turns);
                }
                NextStep::Cancelled => {
                    // Cancellation items for the unstarted tools were already
                    // appended to `item_log` above (§5 "Cancellation").
                    return Err(RaafError::ExecutionStopped { turn: turns });
                }
            }
        }

        tracing::Span::current().record("run.turns", turns);

        let messages: Vec<ConversationMessage> = item_log
            .iter()
            .filter_map(|item| Option::<ConversationMessage>::from(item))
            .collect();

        Ok(RunResult {
            messages,
            last_agent: current_agent.name().to_string(),
            turns,
            usage,
            tool_results,
            metadata: ctx.metadata().clone(),
        })
    }
}

/// Build the system prompt: agent identity, instructions, and a note of the
/// available tool count, with the standard multi-agent prefix prepended when
/// the agent has handoffs and its instructions don't already carry it (§4.11
/// step 4, §6).
fn build_system_prompt(ctx: &RunContext, agent: &Agent, tool_count: usize) -> String {
    let mut parts = vec![format!("You are {}.", agent.name())];
    let instructions = agent.instructions().render(ctx);
    if !instructions.is_empty() {
        parts.push(instructions.clone());
    }
    if tool_count > 0 {
        parts.push(format!("You have {tool_count} tool(s) available."));
    }
    let mut prompt = parts.join("\n\n");
    if !agent.handoffs().is_empty() && !prompt.contains("multi-agent system") {
        prompt = format!("{STANDARD_MULTI_AGENT_PREFIX}\n\n{prompt}");
    }
    prompt
}

/// Build the deduplicated request input from the accumulated item log
/// (§4.11 step 3): when `previous_response_id` is set, skip provider-retained
/// `function_call`/`message` items but always resend `function_call_output`;
/// always skip items whose id repeats within this request; cap at 50
/// generated items and 100 items total, halved when `context_management` is
/// [`ContextManagement::Trimmed`] (§6).
fn build_current_input(
    previous_response_id: Option<&str>,
    item_log: &[Item],
    context_management: ContextManagement,
) -> Vec<Item> {
    let (max_generated_items, max_total_items) =
        context_management.item_caps(MAX_GENERATED_ITEMS, MAX_TOTAL_ITEMS);
    let mut seen_ids = HashSet::new();
    let mut out = Vec::new();
    let mut generated = 0usize;

    for item in item_log {
        if previous_response_id.is_some()
            && matches!(item, Item::ToolCall { .. } | Item::HandoffCall { .. } | Item::Message { .. })
        {
            continue;
        }
        if let Some(id) = item.id() {
            if !seen_ids.insert(id.to_string()) {
                continue;
            }
        }
        if out.len() >= max_total_items {
            tracing::warn!(total = item_log.len(), cap = max_total_items, "truncating request input");
            break;
        }
        generated += 1;
        if generated > max_generated_items {
            tracing::warn!(cap = max_generated_items, "truncating generated items in request input");
            break;
        }
        out.push(item.clone());
    }
    out
}

fn record_tool_results(items: &[Item], out: &mut Vec<ToolCallRecord>) {
    let timestamp_unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    for item in items {
        if let Item::ToolCallOutput { call_id, output, agent } = item {
            out.push(ToolCallRecord {
                call_id: call_id.clone(),
                agent: agent.clone(),
                output: output.clone(),
                timestamp_unix_ms,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MessageContent, ProviderCallError, ProviderResponse, RawOutputItem};
    use std::sync::Mutex;

    struct SequenceProvider(Mutex<std::collections::VecDeque<ProviderResponse>>);

    impl SequenceProvider {
        fn new(responses: Vec<ProviderResponse>) -> Self {
            Self(Mutex::new(responses.into()))
        }
    }

    #[async_trait::async_trait]
    impl ResponsesProvider for SequenceProvider {
        async fn responses_completion(
            &self,
            _request: ResponsesRequest,
        ) -> Result<ProviderResponse, ProviderCallError> {
            self.0
                .lock()
                .expect("mutex poisoned")
                .pop_front()
                .ok_or_else(|| ProviderCallError {
                    message: "no more responses".into(),
                    kind: None,
                })
        }
    }

    fn message_response(id: &str, text: &str) -> ProviderResponse {
        ProviderResponse {
            id: id.to_string(),
            output: vec![RawOutputItem::Message {
                id: None,
                role: "assistant".into(),
                content: MessageContent::Text(text.to_string()),
            }],
            usage: Usage::new(5, 5),
            model: "gpt-test".into(),
        }
    }

    fn tool_call_response(id: &str, call_id: &str, name: &str, arguments: &str) -> ProviderResponse {
        ProviderResponse {
            id: id.to_string(),
            output: vec![RawOutputItem::FunctionCall {
                id: call_id.to_string(),
                call_id: call_id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
            usage: Usage::new(10, 10),
            model: "gpt-test".into(),
        }
    }

    #[tokio::test]
    async fn single_turn_final_output() {
        let agent = Arc::new(Agent::new("A", "gpt-test"));
        let provider = SequenceProvider::new(vec![message_response("resp_1", "Hello")]);
        let retry = RetryPolicy::new(crate::retry::RetryConfig::default());
        let config = RunConfig::new(&retry);
        let result = Runner::run(agent, "Hi", &provider, &config).await.unwrap();
        assert_eq!(result.turns, 1);
        assert_eq!(result.last_agent, "A");
        assert!(result.usage.total_tokens >= 1);
        assert_eq!(result.messages.last().unwrap().content, "Hello");
    }

    #[tokio::test]
    async fn one_tool_call_then_answer() {
        struct Add;
        #[async_trait::async_trait]
        impl crate::tool::ToolHandler for Add {
            async fn call(&self, _ctx: &RunContext, arguments: Value) -> Result<Value, String> {
                let a = arguments["a"].as_i64().unwrap_or(0);
                let b = arguments["b"].as_i64().unwrap_or(0);
                Ok(Value::String((a + b).to_string()))
            }
        }
        let tool = crate::tool::LocalTool::new(
            "add",
            "Adds two numbers",
            serde_json::json!({"type": "object", "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}}}),
            Add,
        );
        let agent = Arc::new(Agent::new("A", "gpt-test").with_tool(tool));
        let provider = SequenceProvider::new(vec![
            tool_call_response("resp_1", "call_1", "add", r#"{"a":2,"b":3}"#),
            message_response("resp_2", "5"),
        ]);
        let retry = RetryPolicy::new(crate::retry::RetryConfig::default());
        let config = RunConfig::new(&retry);
        let result = Runner::run(agent, "add 2 and 3", &provider, &config).await.unwrap();
        assert_eq!(result.turns, 2);
        assert_eq!(result.tool_results.len(), 1);
        assert_eq!(result.tool_results[0].output, "5");
    }

    #[tokio::test]
    async fn tool_call_then_answer_completes_within_max_turns_two() {
        let agent = Arc::new(Agent::new("A", "gpt-test").with_max_turns(2).with_tool(
            crate::tool::LocalTool::new("noop", "does nothing", serde_json::json!({"type": "object", "properties": {}}), NoopTool),
        ));
        let provider = SequenceProvider::new(vec![
            tool_call_response("resp_1", "call_1", "noop", "{}"),
            message_response("resp_2", "done"),
        ]);
        let retry = RetryPolicy::new(crate::retry::RetryConfig::default());
        let config = RunConfig::new(&retry);
        let result = Runner::run(agent, "go", &provider, &config).await.unwrap();
        assert_eq!(result.turns, 2);
        assert_eq!(result.messages.last().unwrap().content, "done");
    }

    #[tokio::test]
    async fn max_turns_exceeded_at_turn_two() {
        let agent = Arc::new(Agent::new("A", "gpt-test").with_max_turns(1).with_tool(
            crate::tool::LocalTool::new("noop", "does nothing", serde_json::json!({"type": "object", "properties": {}}), NoopTool),
        ));
        let provider = SequenceProvider::new(vec![tool_call_response("resp_1", "call_1", "noop", "{}")]);
        let retry = RetryPolicy::new(crate::retry::RetryConfig::default());
        let config = RunConfig::new(&retry);
        let err = Runner::run(agent, "go", &provider, &config).await.unwrap_err();
        assert!(matches!(err, RaafError::MaxTurnsExceeded { turn: 2, max_turns: 1, .. }));
    }

    struct NoopTool;
    #[async_trait::async_trait]
    impl crate::tool::ToolHandler for NoopTool {
        async fn call(&self, _ctx: &RunContext, _arguments: Value) -> Result<Value, String> {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn handoff_switches_agent_and_keeps_chain() {
        let b = Arc::new(Agent::new("B", "gpt-test"));
        let a = Arc::new(Agent::new("A", "gpt-test").with_handoff(crate::agent::Handoff::new(Arc::clone(&b))));
        let provider = SequenceProvider::new(vec![
            tool_call_response("resp_1", "call_1", "transfer_to_b", "{}"),
            message_response("resp_2", "done"),
        ]);
        let retry = RetryPolicy::new(crate::retry::RetryConfig::default());
        let config = RunConfig::new(&retry);
        let result = Runner::run(a, "start", &provider, &config).await.unwrap();
        assert_eq!(result.last_agent, "B");
        assert_eq!(result.messages.last().unwrap().content, "done");
    }

    #[tokio::test]
    async fn dedup_with_previous_response_id_keeps_only_tool_output() {
        let log = vec![
            Item::Message {
                id: "item_1".into(),
                role: Role::User,
                content: "hi".into(),
                agent: "A".into(),
            },
            Item::ToolCall {
                id: "fc_123".into(),
                call_id: "call_123".into(),
                name: "add".into(),
                arguments_json: "{}".into(),
                agent: "A".into(),
            },
            Item::ToolCallOutput {
                call_id: "call_123".into(),
                output: "5".into(),
                agent: "A".into(),
            },
        ];
        let current_input = build_current_input(Some("resp_1"), &log, ContextManagement::Full);
        assert_eq!(current_input.len(), 1);
        assert!(matches!(current_input[0], Item::ToolCallOutput { .. }));
    }

    #[test]
    fn dedup_without_previous_response_id_keeps_everything_once() {
        let log = vec![
            Item::Message {
                id: "item_1".into(),
                role: Role::User,
                content: "hi".into(),
                agent: "A".into(),
            },
            Item::Message {
                id: "item_1".into(),
                role: Role::User,
                content: "hi (repeat id)".into(),
                agent: "A".into(),
            },
        ];
        let current_input = build_current_input(None, &log, ContextManagement::Full);
        assert_eq!(current_input.len(), 1);
    }

    #[test]
    fn trimmed_context_management_halves_the_generated_item_cap() {
        let log: Vec<Item> = (0..40)
            .map(|i| Item::Message {
                id: format!("item_{i}"),
                role: Role::User,
                content: format!("msg {i}"),
                agent: "A".into(),
            })
            .collect();
        let full = build_current_input(None, &log, ContextManagement::Full);
        let trimmed = build_current_input(None, &log, ContextManagement::Trimmed);
        assert_eq!(full.len(), 40);
        assert_eq!(trimmed.len(), MAX_GENERATED_ITEMS / 2);
    }
}
