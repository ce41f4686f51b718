//! JSON Repair (C2): best-effort recovery of JSON embedded in free text (§4.2).
//!
//! Never raises; callers that care about the reason repair failed should log
//! at the call site (the repair function itself only returns `None`).

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("valid regex"));
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("valid regex"));
static SINGLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'([^'\\]*(?:\\.[^'\\]*)*)'").expect("valid regex"));
static BARE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*:)").expect("valid regex"));
static QUOTED_SCALAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#":\s*"(true|false|null|-?\d+(?:\.\d+)?)""#).expect("valid regex")
});
static BRACE_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}|\[.*\]").expect("valid regex"));

/// Attempt to parse JSON out of arbitrary text, trying increasingly invasive
/// repair strategies in order. Returns `None` if nothing worked.
#[must_use]
pub fn repair(text: &str) -> Option<Value> {
    // 1. direct parse
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }

    // 2. strip markdown code fences
    let unfenced = CODE_FENCE
        .captures(text)
        .and_then(|c| c.get(1))
        .map_or_else(|| text.to_string(), |m| m.as_str().to_string());
    if unfenced != text {
        if let Ok(value) = serde_json::from_str::<Value>(&unfenced) {
            return Some(value);
        }
    }

    let mut candidate = unfenced;

    // 3. remove trailing commas before `}`/`]`
    candidate = TRAILING_COMMA.replace_all(&candidate, "$1").into_owned();
    if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
        return Some(value);
    }

    // 4. replace single-quoted keys/strings with double-quoted
    let double_quoted = SINGLE_QUOTED
        .replace_all(&candidate, |caps: &regex::Captures<'_>| {
            format!("\"{}\"", &caps[1])
        })
        .into_owned();
    candidate = double_quoted;
    if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
        return Some(value);
    }

    // 5. quote bare keys
    candidate = BARE_KEY
        .replace_all(&candidate, "$1\"$2\"$3")
        .into_owned();
    if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
        return Some(value);
    }

    // 6. un-quote numeric/boolean/null strings
    candidate = QUOTED_SCALAR.replace_all(&candidate, ": $1").into_owned();
    if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
        return Some(value);
    }

    // 7. extract the longest `{...}` or `[...]` substring and retry
    if let Some(m) = BRACE_SPAN.find(&candidate) {
        if let Ok(value) = serde_json::from_str::<Value>(m.as_str()) {
            return Some(value);
        }
    }

    None
}
