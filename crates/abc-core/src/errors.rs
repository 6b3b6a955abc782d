//! Structured error types shared across the ABC-SMC crates.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured payload attached to every [`AbcError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine readable error code.
    pub code: String,
    /// Human readable diagnostic message.
    pub message: String,
    /// Contextual key value pairs (generation, model index, sizes, etc.).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Optional hint that may help the caller resolve the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorInfo {
    /// Creates a new error payload with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            hint: None,
        }
    }

    /// Adds a context entry to the payload.
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Sets a human readable hint for remediation.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Canonical error type for the ABC-SMC engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum AbcError {
    /// Construction-time configuration mismatches.
    #[error("config error: {0}")]
    Config(ErrorInfo),
    /// Failures raised by simulators or summary statistic reducers.
    #[error("model error: {0}")]
    Model(ErrorInfo),
    /// Distance and stochastic kernel evaluation errors.
    #[error("distance error: {0}")]
    Distance(ErrorInfo),
    /// Transition kernel fitting and sampling errors.
    #[error("transition error: {0}")]
    Transition(ErrorInfo),
    /// Execution engine errors.
    #[error("sampler error: {0}")]
    Sampler(ErrorInfo),
    /// Persistence errors raised by a history store.
    #[error("storage error: {0}")]
    Storage(ErrorInfo),
    /// A generation-indexed value was requested before it was computed.
    #[error("lookup error: {0}")]
    Lookup(ErrorInfo),
    /// Population invariant violations.
    #[error("population error: {0}")]
    Population(ErrorInfo),
    /// Serialization and schema errors.
    #[error("serde error: {0}")]
    Serde(ErrorInfo),
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)?;
        if !self.context.is_empty() {
            write!(f, " | context: [")?;
            for (idx, (key, value)) in self.context.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            write!(f, "]")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " | hint: {hint}")?;
        }
        Ok(())
    }
}

impl AbcError {
    /// Returns a reference to the payload describing the error.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            AbcError::Config(info)
            | AbcError::Model(info)
            | AbcError::Distance(info)
            | AbcError::Transition(info)
            | AbcError::Sampler(info)
            | AbcError::Storage(info)
            | AbcError::Lookup(info)
            | AbcError::Population(info)
            | AbcError::Serde(info) => info,
        }
    }

    /// Whether the error only signals a value missing for some generation.
    pub fn is_lookup(&self) -> bool {
        matches!(self, AbcError::Lookup(_))
    }

    /// Builds the lookup error raised for an un-computed generation.
    pub fn missing_generation(what: &str, t: usize) -> Self {
        AbcError::Lookup(
            ErrorInfo::new(
                "missing-generation",
                format!("{what} has no value for generation {t}"),
            )
            .with_context("t", t),
        )
    }
}
