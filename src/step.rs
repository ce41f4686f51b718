//! Step Processor (C10): executes one atomic step — provider call, output
//! guardrails, response categorization, handoff validation, and concurrent
//! local tool execution — and decides the next step (§4.10).

use convert_case::{Case, Casing};
use serde_json::Value;

use crate::agent::Agent;
use crate::context::RunContext;
use crate::error::RaafError;
use crate::guardrail::run_output_guardrails;
use crate::handoff::{resolve_handoff, HandoffChain};
use crate::hooks::HookPair;
use crate::item::{Item, Role};
use crate::json_repair;
use crate::provider::{ProviderResponse, ResponsesProvider, ResponsesRequest};
use crate::response_processor::{process_response, ProcessedResponse, ToolRunHandoff};
use crate::retry::RetryPolicy;
use crate::tool::{dispatch_all, ToolDispatchOutcome};

/// What the run loop should do after this step (§3 "StepResult").
#[derive(Debug, Clone)]
pub enum NextStep {
    RunAgain,
    Handoff(String),
    FinalOutput(Value),
    /// `stop_checker` tripped before this step's local tool calls started
    /// (§5 "Cancellation"); the run loop appends the carried cancellation
    /// items, then raises `ExecutionStopped`.
    Cancelled,
}

/// The result of one atomic step (§3 "StepResult").
#[derive(Debug, Clone)]
pub struct StepResult {
    pub original_input: Vec<Item>,
    pub model_response: ProviderResponse,
    pub pre_step_items: Vec<Item>,
    pub new_step_items: Vec<Item>,
    pub next_step: NextStep,
    /// True when `agent.reset_tool_choice()` is set and at least one local
    /// tool ran this step; the runner clears its per-run `tool_choice`
    /// shadow in response (§4.10 step 6, §5 "per-run shadow").
    pub should_reset_tool_choice: bool,
}

/// A pending handoff attempt, from either a synthetic `transfer_to_*` tool
/// call (detected before dispatch) or a local tool's handoff sentinel
/// (detected after dispatch) — both routed through the same single-handoff
/// and cycle validation (§3 "Tool", §4.7, §4.8).
struct PendingHandoff {
    call_id: String,
    target_name: String,
}

/// Execute one step for `agent` against `request` (§4.10). Tool-call output
/// items are restored to `call_id` order after dispatch regardless of which
/// call finished first (§5 "Ordering guarantees").
///
/// # Errors
/// Propagates provider/retry failures as [`RaafError::Provider`] and
/// malformed-response failures as [`RaafError::ModelBehavior`]; guardrail
/// trips surface as the matching tripwire variant. Returns
/// [`RaafError::ExecutionStopped`] if `stop_checker` trips immediately
/// before this step's local tool calls would have started (§5
/// "Cancellation").
pub async fn execute_step(
    ctx: &RunContext,
    agent: &Agent,
    provider: &dyn ResponsesProvider,
    retry_policy: &RetryPolicy,
    request: ResponsesRequest,
    handoff_chain: &mut HandoffChain,
    stop_checker: Option<&(dyn Fn() -> bool + Send + Sync)>,
    hooks: &HookPair<'_>,
) -> Result<StepResult, RaafError> {
    let original_input = request.input.clone();

    let model_response = crate::provider::call_with_retry(provider, retry_policy, &request).await?;

    let mut processed = process_response(agent, &model_response)?;

    if let Some(text) = processed.assistant_text() {
        if let Some(filtered) = run_output_guardrails(agent.output_guardrails(), ctx, agent, &text).await? {
            replace_last_assistant_content(&mut processed.new_items, &filtered);
        }
    }

    let should_reset_tool_choice = agent.reset_tool_choice() && !processed.functions.is_empty();

    if !processed.functions.is_empty() && stop_checker.is_some_and(|checker| checker()) {
        tracing::info!(agent = agent.name(), turn = ctx.current_turn(), "stop_checker tripped before tool dispatch");
        let cancellation_items: Vec<Item> = processed
            .functions
            .iter()
            .map(|call| Item::ToolCallOutput {
                call_id: call.call_id.clone(),
                output: "error: execution stopped before this tool ran".to_string(),
                agent: agent.name().to_string(),
            })
            .collect();
        let mut new_step_items = processed.new_items.clone();
        new_step_items.extend(cancellation_items);
        return Ok(StepResult {
            original_input,
            model_response,
            pre_step_items: Vec::new(),
            new_step_items,
            next_step: NextStep::Cancelled,
            should_reset_tool_choice,
        });
    }

    let (mut tool_output_items, runtime_handoffs) = execute_functions(ctx, agent, &processed, hooks).await;
    tool_output_items.sort_by(|a, b| a.call_id().cmp(&b.call_id()));

    let mut pending = Vec::new();
    let mut error_items = Vec::new();

    for transfer in &processed.handoffs {
        if let Some(resolved) = resolve_transfer(agent, transfer) {
            pending.push(resolved);
        }
    }
    for (call_id, target_agent) in runtime_handoffs {
        match agent.handoffs().iter().find(|h| h.target().name() == target_agent) {
            Some(handoff) => pending.push(PendingHandoff {
                call_id,
                target_name: handoff.target().name().to_string(),
            }),
            None => error_items.push(error_message_item(
                agent,
                &format!("Error: no handoff target matches `{target_agent}`"),
            )),
        }
    }

    let mut next_step = NextStep::RunAgain;

    if pending.len() >= 2 {
        tracing::warn!(
            agent = agent.name(),
            count = pending.len(),
            "multiple handoffs in one response; rejecting all"
        );
        error_items.push(error_message_item(
            agent,
            "Error: Multiple agent handoffs detected in a single response. Only one handoff per turn is allowed.",
        ));
    } else if let Some(handoff) = pending.first() {
        match handoff_chain.push(handoff.target_name.clone()) {
            Ok(()) => next_step = NextStep::Handoff(handoff.target_name.clone()),
            Err(err) => {
                tracing::warn!(agent = agent.name(), error = %err, "handoff rejected");
                error_items.push(error_message_item(agent, &format!("Error: {err}")));
            }
        }
    }

    let mut new_step_items = processed.new_items.clone();
    new_step_items.extend(tool_output_items);
    new_step_items.extend(error_items.iter().cloned());

    if matches!(next_step, NextStep::RunAgain) && !processed.has_tool_calls_or_handoffs() {
        let final_text = processed.assistant_text().unwrap_or_default();
        next_step = NextStep::FinalOutput(apply_json_auto_parse(agent, &final_text));
    }

    Ok(StepResult {
        original_input,
        model_response,
        pre_step_items: Vec::new(),
        new_step_items,
        next_step,
        should_reset_tool_choice,
    })
}

fn resolve_transfer(agent: &Agent, transfer: &ToolRunHandoff) -> Option<PendingHandoff> {
    resolve_handoff(agent, &transfer.tool_name).map(|handoff| PendingHandoff {
        call_id: transfer.call_id.clone(),
        target_name: handoff.target().name().to_string(),
    })
}

/// Dispatch every local function call concurrently, splitting the results
/// into normal tool-output items and handoff-sentinel attempts (§4.7).
async fn execute_functions(
    ctx: &RunContext,
    agent: &Agent,
    processed: &ProcessedResponse,
    hooks: &HookPair<'_>,
) -> (Vec<Item>, Vec<(String, String)>) {
    if processed.functions.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let mut outputs = Vec::new();
    let mut handoffs = Vec::new();
    for outcome in dispatch_all(ctx, agent, &processed.functions, hooks).await {
        match outcome {
            ToolDispatchOutcome::Output(item) => outputs.push(item),
            ToolDispatchOutcome::Handoff { target_agent, call_id, .. } => {
                handoffs.push((call_id, target_agent));
            }
        }
    }
    (outputs, handoffs)
}

fn error_message_item(agent: &Agent, text: &str) -> Item {
    Item::Message {
        id: Item::synthesize_id(),
        role: Role::Assistant,
        content: text.to_string(),
        agent: agent.name().to_string(),
    }
}

fn replace_last_assistant_content(items: &mut [Item], replacement: &str) {
    if let Some(Item::Message {
        role: Role::Assistant,
        content,
        ..
    }) = items.iter_mut().rev().find(|item| matches!(item, Item::Message { role: Role::Assistant, .. }))
    {
        *content = replacement.to_string();
    }
}

/// §4.12: attempt JSON auto-parse of the final assistant content when the
/// agent declares a `response_format` or the content looks like JSON.
fn apply_json_auto_parse(agent: &Agent, text: &str) -> Value {
    let looks_like_json = text.trim_start().starts_with('{') || text.trim_start().starts_with("```json");
    if agent.response_format().is_none() && !looks_like_json {
        return Value::String(text.to_string());
    }
    match json_repair::repair(text) {
        Some(Value::Object(map)) => Value::Object(normalize_top_level_keys(map)),
        Some(other) => other,
        None => Value::String(text.to_string()),
    }
}

fn normalize_top_level_keys(map: serde_json::Map<String, Value>) -> serde_json::Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| {
            let normalized = if key.contains(' ') { key.to_case(Case::Snake) } else { key };
            (normalized, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MessageContent, RawOutputItem};
    use crate::usage::Usage;

    #[test]
    fn json_auto_parse_handles_plain_text() {
        let agent = Agent::new("A", "gpt-test");
        assert_eq!(apply_json_auto_parse(&agent, "hello"), Value::String("hello".into()));
    }

    #[test]
    fn json_auto_parse_parses_object_and_normalizes_spaced_keys() {
        let agent = Agent::new("A", "gpt-test");
        let parsed = apply_json_auto_parse(&agent, r#"{"Market Name": "NYC", "count": 3}"#);
        assert_eq!(parsed["market_name"], Value::String("NYC".into()));
        assert_eq!(parsed["count"], Value::from(3));
    }

    #[test]
    fn json_auto_parse_uses_response_format_hint_on_non_json_looking_text() {
        let agent = Agent::new("A", "gpt-test").with_response_format(serde_json::json!({"type": "object"}));
        let parsed = apply_json_auto_parse(&agent, r#"{"a": 1}"#);
        assert_eq!(parsed["a"], Value::from(1));
    }

    fn mk_response(output: Vec<RawOutputItem>) -> ProviderResponse {
        ProviderResponse {
            id: "resp_1".into(),
            output,
            usage: Usage::new(1, 1),
            model: "gpt-test".into(),
        }
    }

    struct StaticProvider(ProviderResponse);

    #[async_trait::async_trait]
    impl ResponsesProvider for StaticProvider {
        async fn responses_completion(
            &self,
            _request: ResponsesRequest,
        ) -> Result<ProviderResponse, crate::provider::ProviderCallError> {
            Ok(self.0.clone())
        }
    }

    fn default_request() -> ResponsesRequest {
        ResponsesRequest {
            system_prompt: String::new(),
            input: vec![],
            model: "gpt-test".into(),
            tools: vec![],
            previous_response_id: None,
            model_params: Value::Null,
        }
    }

    #[tokio::test]
    async fn final_output_when_no_tool_calls_or_handoffs() {
        let agent = Agent::new("A", "gpt-test");
        let provider = StaticProvider(mk_response(vec![RawOutputItem::Message {
            id: Some("m1".into()),
            role: "assistant".into(),
            content: MessageContent::Text("Hello".into()),
        }]));
        let retry = RetryPolicy::new(crate::retry::RetryConfig::default());
        let mut chain = HandoffChain::new("A");
        let ctx = RunContext::new("A");
        let hooks_impl = crate::hooks::NoopHooks;
        let hooks = HookPair::new(&hooks_impl, None);
        let result = execute_step(&ctx, &agent, &provider, &retry, default_request(), &mut chain, None, &hooks)
            .await
            .unwrap();
        assert!(matches!(result.next_step, NextStep::FinalOutput(Value::String(ref s)) if s == "Hello"));
    }

    #[tokio::test]
    async fn successful_handoff_sets_next_step() {
        let target = std::sync::Arc::new(Agent::new("B", "gpt-test"));
        let agent = Agent::new("A", "gpt-test").with_handoff(crate::agent::Handoff::new(target));
        let provider = StaticProvider(mk_response(vec![RawOutputItem::FunctionCall {
            id: "fc_1".into(),
            call_id: "fc_1".into(),
            name: "transfer_to_b".into(),
            arguments: "{}".into(),
        }]));
        let retry = RetryPolicy::new(crate::retry::RetryConfig::default());
        let mut chain = HandoffChain::new("A");
        let ctx = RunContext::new("A");
        let hooks_impl = crate::hooks::NoopHooks;
        let hooks = HookPair::new(&hooks_impl, None);
        let result = execute_step(&ctx, &agent, &provider, &retry, default_request(), &mut chain, None, &hooks)
            .await
            .unwrap();
        assert!(matches!(result.next_step, NextStep::Handoff(ref name) if name == "B"));
        assert_eq!(chain.agents(), ["A", "B"]);
    }

    #[tokio::test]
    async fn two_handoffs_in_one_response_are_rejected() {
        let b = std::sync::Arc::new(Agent::new("B", "gpt-test"));
        let c = std::sync::Arc::new(Agent::new("C", "gpt-test"));
        let agent = Agent::new("A", "gpt-test")
            .with_handoff(crate::agent::Handoff::new(b))
            .with_handoff(crate::agent::Handoff::new(c));
        let provider = StaticProvider(mk_response(vec![
            RawOutputItem::FunctionCall {
                id: "fc_1".into(),
                call_id: "fc_1".into(),
                name: "transfer_to_b".into(),
                arguments: "{}".into(),
            },
            RawOutputItem::FunctionCall {
                id: "fc_2".into(),
                call_id: "fc_2".into(),
                name: "transfer_to_c".into(),
                arguments: "{}".into(),
            },
        ]));
        let retry = RetryPolicy::new(crate::retry::RetryConfig::default());
        let mut chain = HandoffChain::new("A");
        let ctx = RunContext::new("A");
        let hooks_impl = crate::hooks::NoopHooks;
        let hooks = HookPair::new(&hooks_impl, None);
        let result = execute_step(&ctx, &agent, &provider, &retry, default_request(), &mut chain, None, &hooks)
            .await
            .unwrap();
        assert!(matches!(result.next_step, NextStep::RunAgain));
        assert_eq!(chain.agents(), ["A"]);
        assert!(result
            .new_step_items
            .iter()
            .any(|item| matches!(item, Item::Message { content, .. } if content.contains("Multiple agent handoffs"))));
    }
}
