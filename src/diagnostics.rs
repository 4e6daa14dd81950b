//! Structured diagnostics and the aggregator that collects them.
//!
//! Diagnostics accompany every protocol response, independent of whether the
//! call succeeded. They never mutate state; they only report. The aggregator
//! preserves insertion order and severity so callers can attribute each
//! problem to the step that produced it.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// An error that prevents the operation from completing.
    Error,
    /// A warning that doesn't prevent the operation but should be addressed.
    Warning,
}

/// A single structured diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The severity of the diagnostic.
    pub severity: Severity,
    /// A short summary of the issue.
    pub summary: String,
    /// A detailed description of the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The attribute path where the issue occurred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Diagnostic {
    /// Create an error diagnostic.
    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Create a warning diagnostic.
    pub fn warning(summary: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Add detail to this diagnostic.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Set the attribute path for this diagnostic.
    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    /// Whether this diagnostic is an error.
    pub fn is_error(&self) -> bool {
        matches!(self.severity, Severity::Error)
    }
}

/// An ordered collection of diagnostics gathered across protocol steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one diagnostic, preserving order.
    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.0.push(diagnostic);
    }

    /// Append all diagnostics from another source, preserving order.
    pub fn extend(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        self.0.extend(diagnostics);
    }

    /// Whether any collected diagnostic is an error.
    pub fn has_errors(&self) -> bool {
        self.0.iter().any(Diagnostic::is_error)
    }

    /// Whether nothing has been collected.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of collected diagnostics.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over the collected diagnostics in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.0.iter()
    }

    /// Consume the collection, yielding the ordered diagnostics.
    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.0
    }
}

impl From<Vec<Diagnostic>> for Diagnostics {
    fn from(diagnostics: Vec<Diagnostic>) -> Self {
        Self(diagnostics)
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<ProtocolError> for Diagnostic {
    /// Convert an error into its most specific diagnostic form, attaching
    /// the attribute path when the fault traces to one configuration field.
    fn from(err: ProtocolError) -> Self {
        match &err {
            ProtocolError::StateUpgradeFailed { from, to, .. } => Diagnostic::error(err.to_string())
                .with_detail(format!("The {} -> {} transformation step failed", from, to)),
            ProtocolError::UnsupportedSchemaVersion { .. } => Diagnostic::error(err.to_string())
                .with_detail("The stored state is newer than the connected provider; upgrade the provider"),
            ProtocolError::TransientBusy(_) => Diagnostic::error(err.to_string())
                .with_detail("Another operation is in flight for this instance; retry with backoff"),
            _ => Diagnostic::error(err.to_string()),
        }
    }
}

impl From<ProtocolError> for Diagnostics {
    fn from(err: ProtocolError) -> Self {
        Self(vec![Diagnostic::from(err)])
    }
}
