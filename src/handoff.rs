//! Handoff Resolver (C8): target lookup, cycle detection, and the bounded
//! handoff chain (§4.8).
//!
//! Handoffs are tool-based only; text or JSON content is never parsed for
//! handoff intent (§4.8 "Detection", §9 "a conformant re-implementation must
//! treat all handoffs as tool-based only").

use std::collections::HashMap;
use std::sync::LazyLock;

use convert_case::{Case, Casing};

use crate::agent::{Agent, Handoff};
use crate::error::HandoffError;

/// Chain length at or beyond which a handoff is rejected (§4.8, §8 invariant 2).
pub const MAX_CHAIN_LEN: usize = 5;

/// A small table of known compound words that don't round-trip cleanly
/// through naive underscore-splitting (§4.8 step 5, §9 "a heuristic").
static COMPOUND_WORDS: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    HashMap::from([
        ("faq", "FAQ"),
        ("faqagent", "FAQAgent"),
        ("targetagent", "TargetAgent"),
        ("billingagent", "BillingAgent"),
    ])
});

/// Strip the `transfer_to_` prefix from a synthetic handoff tool name, if present.
#[must_use]
pub fn strip_transfer_prefix(tool_name: &str) -> &str {
    tool_name.strip_prefix("transfer_to_").unwrap_or(tool_name)
}

fn is_pascal_case(s: &str) -> bool {
    s.chars().next().is_some_and(char::is_uppercase) && !s.contains('_') && !s.contains(' ')
}

/// Infer a candidate agent name from a handoff tool's suffix (§4.8 steps 3-6).
#[must_use]
pub fn infer_target_name(suffix: &str) -> String {
    if is_pascal_case(suffix) {
        return suffix.to_string();
    }
    if suffix.contains('_') {
        return suffix
            .split('_')
            .map(|part| {
                let mut chars = part.chars();
                chars.next().map_or_else(String::new, |first| {
                    first.to_uppercase().collect::<String>() + chars.as_str()
                })
            })
            .collect::<Vec<_>>()
            .join("");
    }
    if let Some(known) = COMPOUND_WORDS.get(suffix.to_lowercase().as_str()) {
        return (*known).to_string();
    }
    suffix.to_case(Case::Pascal)
}

/// Match `candidate` against `available` agent names: direct match first,
/// then substring-match in either direction (§4.8 "matcher").
#[must_use]
pub fn match_target_name<'a>(candidate: &str, available: &[&'a str]) -> Option<&'a str> {
    if let Some(exact) = available.iter().find(|name| **name == candidate) {
        return Some(*exact);
    }
    available
        .iter()
        .find(|name| name.contains(candidate) || candidate.contains(**name))
        .copied()
}

/// Resolve a `transfer_to_<suffix>` tool name to a handoff on `agent`
/// (§4.8 "Target lookup"). Tries an exact match against each handoff's own
/// tool name first (the common case, since handoff tool names are generated
/// deterministically), then falls back to the suffix-inference heuristic.
#[must_use]
pub fn resolve_handoff<'a>(agent: &'a Agent, tool_name: &str) -> Option<&'a Handoff> {
    if let Some(handoff) = agent.handoffs().iter().find(|h| h.tool_name() == tool_name) {
        return Some(handoff);
    }

    let suffix = strip_transfer_prefix(tool_name);
    let candidate = infer_target_name(suffix);
    let available: Vec<&str> = agent.handoffs().iter().map(|h| h.target().name()).collect();
    let matched = match_target_name(&candidate, &available)?;
    agent.handoffs().iter().find(|h| h.target().name() == matched)
}

/// The in-progress handoff chain for a run, starting with the initial agent
/// (§4.8 "Cycle and chain").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffChain {
    agents: Vec<String>,
}

impl HandoffChain {
    #[must_use]
    pub fn new(initial_agent: impl Into<String>) -> Self {
        Self {
            agents: vec![initial_agent.into()],
        }
    }

    #[must_use]
    pub fn agents(&self) -> &[String] {
        &self.agents
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Validate and, on success, append `target` to the chain (§4.8
    /// "Cycle and chain", §8 invariant 2: no repeats, length ≤ 5).
    ///
    /// # Errors
    /// Returns [`HandoffError::Circular`] if `target` already appears in the
    /// chain, or [`HandoffError::ChainTooLong`] if the chain has already
    /// reached [`MAX_CHAIN_LEN`].
    pub fn push(&mut self, target: impl Into<String>) -> Result<(), HandoffError> {
        let target = target.into();
        if self.agents.contains(&target) {
            return Err(HandoffError::Circular {
                target,
                chain: self.agents.clone(),
            });
        }
        if self.agents.len() >= MAX_CHAIN_LEN {
            return Err(HandoffError::ChainTooLong {
                len: self.agents.len(),
                max: MAX_CHAIN_LEN,
            });
        }
        self.agents.push(target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn infers_pascal_case_suffix_directly() {
        assert_eq!(infer_target_name("BillingAgent"), "BillingAgent");
    }

    #[test]
    fn infers_from_underscored_suffix() {
        assert_eq!(infer_target_name("billing_agent"), "BillingAgent");
    }

    #[test]
    fn infers_from_compound_word_table() {
        assert_eq!(infer_target_name("faqagent"), "FAQAgent");
    }

    #[test]
    fn match_prefers_exact_over_substring() {
        let available = ["Billing", "BillingAgent"];
        assert_eq!(match_target_name("Billing", &available), Some("Billing"));
    }

    #[test]
    fn match_falls_back_to_substring() {
        let available = ["BillingAgent"];
        assert_eq!(match_target_name("Billing", &available), Some("BillingAgent"));
    }

    #[test]
    fn resolve_handoff_matches_exact_tool_name() {
        let target = Arc::new(Agent::new("Billing", "gpt-test"));
        let agent = Agent::new("A", "gpt-test").with_handoff(Handoff::new(target));
        let resolved = resolve_handoff(&agent, "transfer_to_billing").expect("resolves");
        assert_eq!(resolved.target().name(), "Billing");
    }

    #[test]
    fn chain_rejects_repeat() {
        let mut chain = HandoffChain::new("A");
        chain.push("B").unwrap();
        assert!(matches!(chain.push("A"), Err(HandoffError::Circular { .. })));
    }

    #[test]
    fn chain_rejects_beyond_max_len() {
        let mut chain = HandoffChain::new("A");
        for name in ["B", "C", "D", "E"] {
            chain.push(name).unwrap();
        }
        assert_eq!(chain.len(), MAX_CHAIN_LEN);
        assert!(matches!(chain.push("F"), Err(HandoffError::ChainTooLong { .. })));
    }
}
