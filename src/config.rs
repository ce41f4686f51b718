//! Ambient environment configuration (§6 "Configuration via environment"),
//! grounded in the `FromEnv`-style pattern in `machi::providers::common`
//! (`from_env()` constructors), but returning `Result` instead of panicking:
//! these are user-facing runtime knobs, not required provider credentials.

use crate::retry::RetryConfig;

/// Whether tracing spans/events are emitted at all, read from
/// `RAAF_DISABLE_TRACING` (§6). Components still call into `tracing`
/// unconditionally; a subscriber observing this flag decides whether to
/// record anything, matching how `tracing`'s own filtering works.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracingConfig {
    pub enabled: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// How much prior conversation context the runner threads back into each
/// request, read from `RAAF_CONTEXT_MANAGEMENT` (§6). `Full` always resends
/// everything not excluded by dedup (§4.11 step 3); `Trimmed` additionally
/// applies the runner's item caps more aggressively by halving them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextManagement {
    #[default]
    Full,
    Trimmed,
}

impl ContextManagement {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "full" => Some(Self::Full),
            "trimmed" => Some(Self::Trimmed),
            _ => None,
        }
    }

    /// The `(max_generated_items, max_total_items)` caps the runner applies
    /// when building a request's input (§4.11 step 3). `Trimmed` halves both.
    #[must_use]
    pub const fn item_caps(self, max_generated_items: usize, max_total_items: usize) -> (usize, usize) {
        match self {
            Self::Full => (max_generated_items, max_total_items),
            Self::Trimmed => (max_generated_items / 2, max_total_items / 2),
        }
    }
}

/// An environment value was present but could not be parsed into the
/// expected shape (§6).
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid value for `{key}`: {value:?}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

/// Typed view over the `RAAF_*` runtime environment variables (§6), combining
/// the retry overrides already read by [`RetryConfig::from_env`] with the
/// tracing and context-management toggles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeConfig {
    pub tracing: TracingConfig,
    pub context_management: ContextManagement,
    pub retry: RetryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::default(),
            context_management: ContextManagement::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Read `RAAF_DISABLE_TRACING`, `RAAF_CONTEXT_MANAGEMENT`, and the
    /// `RAAF_PROVIDER_RETRY_*` family (§6) into a typed config.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if `RAAF_CONTEXT_MANAGEMENT` is set to a value
    /// that isn't `full` or `trimmed` (case-insensitive). Unset or unparsable
    /// retry overrides silently fall back to their spec defaults, matching
    /// [`RetryConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let tracing = TracingConfig {
            enabled: !env_bool("RAAF_DISABLE_TRACING"),
        };

        let context_management = match std::env::var("RAAF_CONTEXT_MANAGEMENT") {
            Ok(raw) => ContextManagement::parse(&raw).ok_or(ConfigError {
                key: "RAAF_CONTEXT_MANAGEMENT",
                value: raw,
            })?,
            Err(_) => ContextManagement::default(),
        };

        Ok(Self {
            tracing,
            context_management,
            retry: RetryConfig::from_env(),
        })
    }
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}
