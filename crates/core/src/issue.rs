//! The normalised issue model shared by both engines.

use fhir::SourcePosition;
use std::fmt;

/// Normalised issue severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Severity {
    Fatal,
    Error,
    Warning,
    Information,
}

impl Severity {
    /// Normalise a native severity in any casing.
    ///
    /// Unknown values map to [`Severity::Information`] so an unexpected engine vocabulary can
    /// never inflate the error count.
    pub fn normalize(native: &str) -> Self {
        match native.trim().to_ascii_lowercase().as_str() {
            "fatal" => Severity::Fatal,
            "error" => Severity::Error,
            "warning" => Severity::Warning,
            _ => Severity::Information,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Fatal => "fatal",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Information => "information",
        }
    }

    /// Fatal and error issues both count as errors.
    pub fn is_error(self) -> bool {
        matches!(self, Severity::Fatal | Severity::Error)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalised diagnostic. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Issue {
    severity: Severity,
    message: String,
    location: String,
    position: Option<SourcePosition>,
}

impl Issue {
    pub fn new(
        severity: Severity,
        message: impl Into<String>,
        location: impl Into<String>,
        position: Option<SourcePosition>,
    ) -> Self {
        Self {
            severity,
            message: message.into(),
            location: location.into(),
            position,
        }
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Engine-native location, several locations joined with `" via "`.
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn position(&self) -> Option<SourcePosition> {
        self.position
    }

    /// Resolved line, 0 when unknown.
    pub fn line(&self) -> u32 {
        self.position.map_or(0, |position| position.line)
    }

    /// Resolved column, 0 when unknown.
    pub fn column(&self) -> u32 {
        self.position.map_or(0, |position| position.column)
    }
}

/// Number of fatal and error issues.
pub fn error_count(issues: &[Issue]) -> usize {
    issues
        .iter()
        .filter(|issue| issue.severity().is_error())
        .count()
}

pub fn warning_count(issues: &[Issue]) -> usize {
    issues
        .iter()
        .filter(|issue| issue.severity() == Severity::Warning)
        .count()
}
