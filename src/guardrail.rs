//! Guardrails (C9): input/output validator chains (§4.9), grounded in
//! `machi::guardrail`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;

use crate::agent::Agent;
use crate::context::RunContext;
use crate::error::RaafError;

/// The result of a single guardrail check.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailOutput {
    pub tripwire_triggered: bool,
    pub output_info: Value,
}

impl GuardrailOutput {
    #[must_use]
    pub fn pass() -> Self {
        Self {
            tripwire_triggered: false,
            output_info: Value::Null,
        }
    }

    #[must_use]
    pub fn pass_with_info(output_info: Value) -> Self {
        Self {
            tripwire_triggered: false,
            output_info,
        }
    }

    #[must_use]
    pub fn trip(output_info: Value) -> Self {
        Self {
            tripwire_triggered: true,
            output_info,
        }
    }

    /// A filtered replacement for the checked output, if the guardrail chose
    /// to rewrite rather than block it (§4.9).
    #[must_use]
    pub fn filtered_output(&self) -> Option<String> {
        self.output_info
            .get("filtered_output")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// An input guardrail, run against the most recent user input before the
/// first model call of each turn.
#[async_trait]
pub trait InputGuardrailCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(
        &self,
        ctx: &RunContext,
        agent: &Agent,
        input: &str,
    ) -> Result<GuardrailOutput, RaafError>;
}

pub type InputGuardrail = Arc<dyn InputGuardrailCheck>;

/// An output guardrail, run against the assistant content of each response.
#[async_trait]
pub trait OutputGuardrailCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(
        &self,
        ctx: &RunContext,
        agent: &Agent,
        output: &str,
    ) -> Result<GuardrailOutput, RaafError>;
}

pub type OutputGuardrail = Arc<dyn OutputGuardrailCheck>;

/// Run input guardrails sequentially; raise on the first trip (§4.9).
///
/// # Errors
/// Returns [`RaafError::InputGuardrailTripwireTriggered`] on the first trip.
pub async fn run_input_guardrails(
    guardrails: &[InputGuardrail],
    ctx: &RunContext,
    agent: &Agent,
    input: &str,
) -> Result<(), RaafError> {
    for guardrail in guardrails {
        let result = guardrail.check(ctx, agent, input).await?;
        if result.tripwire_triggered {
            return Err(RaafError::InputGuardrailTripwireTriggered {
                guardrail: guardrail.name().to_string(),
                content: input.to_string(),
                metadata: result.output_info,
            });
        }
    }
    Ok(())
}

/// Run output guardrails concurrently; raise on the first trip found after
/// all have completed, otherwise return the last filtered replacement, if
/// any (§4.9).
///
/// # Errors
/// Returns [`RaafError::OutputGuardrailTripwireTriggered`] if any guardrail trips.
pub async fn run_output_guardrails(
    guardrails: &[OutputGuardrail],
    ctx: &RunContext,
    agent: &Agent,
    output: &str,
) -> Result<Option<String>, RaafError> {
    let checks = guardrails
        .iter()
        .map(|g| async move { (g.name().to_string(), g.check(ctx, agent, output).await) });
    let results = join_all(checks).await;

    let mut filtered = None;
    for (name, result) in results {
        let output_result = result?;
        if output_result.tripwire_triggered {
            return Err(RaafError::OutputGuardrailTripwireTriggered {
                guardrail: name,
                content: output.to_string(),
                metadata: output_result.output_info,
            });
        }
        if let Some(replacement) = output_result.filtered_output() {
            filtered = Some(replacement);
        }
    }
    Ok(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;

    struct AlwaysPass;
    #[async_trait]
    impl InputGuardrailCheck for AlwaysPass {
        fn name(&self) -> &str {
            "always_pass"
        }
        async fn check(&self, _: &RunContext, _: &Agent, _: &str) -> Result<GuardrailOutput, RaafError> {
            Ok(GuardrailOutput::pass())
        }
    }

    struct AlwaysTrip;
    #[async_trait]
    impl InputGuardrailCheck for AlwaysTrip {
        fn name(&self) -> &str {
            "always_trip"
        }
        async fn check(&self, _: &RunContext, _: &Agent, _: &str) -> Result<GuardrailOutput, RaafError> {
            Ok(GuardrailOutput::trip(serde_json::json!({"reason": "nope"})))
        }
    }

    struct OutputFilter;
    #[async_trait]
    impl OutputGuardrailCheck for OutputFilter {
        fn name(&self) -> &str {
            "filter"
        }
        async fn check(&self, _: &RunContext, _: &Agent, _: &str) -> Result<GuardrailOutput, RaafError> {
            Ok(GuardrailOutput::pass_with_info(
                serde_json::json!({"filtered_output": "redacted"}),
            ))
        }
    }

    #[tokio::test]
    async fn input_guardrails_pass_through() {
        let ctx = RunContext::new("A");
        let agent = Agent::new("A", "gpt-test");
        let guardrails: Vec<InputGuardrail> = vec![Arc::new(AlwaysPass)];
        assert!(run_input_guardrails(&guardrails, &ctx, &agent, "hi").await.is_ok());
    }

    #[tokio::test]
    async fn input_guardrail_trip_raises_with_metadata() {
        let ctx = RunContext::new("A");
        let agent = Agent::new("A", "gpt-test");
        let guardrails: Vec<InputGuardrail> = vec![Arc::new(AlwaysPass), Arc::new(AlwaysTrip)];
        let err = run_input_guardrails(&guardrails, &ctx, &agent, "hi").await.unwrap_err();
        assert!(matches!(err, RaafError::InputGuardrailTripwireTriggered { .. }));
    }

    #[tokio::test]
    async fn output_guardrails_can_filter_without_tripping() {
        let ctx = RunContext::new("A");
        let agent = Agent::new("A", "gpt-test");
        let guardrails: Vec<OutputGuardrail> = vec![Arc::new(OutputFilter)];
        let filtered = run_output_guardrails(&guardrails, &ctx, &agent, "secret")
            .await
            .unwrap();
        assert_eq!(filtered.as_deref(), Some("redacted"));
    }
}
