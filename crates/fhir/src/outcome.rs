//! `OperationOutcome` wire model.
//!
//! Both validation engines report their findings as a FHIR `OperationOutcome`. Only the parts
//! the validator core reads are modelled here; unknown fields are ignored on input so newer
//! engine builds do not break parsing.
//!
//! Some engine builds annotate issues with the position they found the problem at:
//!
//! ```json
//! {
//!   "severity": "error",
//!   "code": "structure",
//!   "diagnostics": "Unknown element 'foo'",
//!   "location": ["Patient.foo"],
//!   "extension": [
//!     { "url": "http://hl7.org/fhir/StructureDefinition/operationoutcome-issue-line", "valueInteger": 4 },
//!     { "url": "http://hl7.org/fhir/StructureDefinition/operationoutcome-issue-col", "valueInteger": 3 }
//!   ]
//! }
//! ```

use crate::element::SourcePosition;
use crate::{FhirError, FhirResult};
use serde::{Deserialize, Serialize};

/// Extension carrying the 1-based line an engine reported for an issue.
pub const ISSUE_LINE_EXTENSION: &str =
    "http://hl7.org/fhir/StructureDefinition/operationoutcome-issue-line";

/// Extension carrying the 1-based column an engine reported for an issue.
pub const ISSUE_COLUMN_EXTENSION: &str =
    "http://hl7.org/fhir/StructureDefinition/operationoutcome-issue-col";

const OPERATION_OUTCOME: &str = "OperationOutcome";

/// An engine's validation result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issue: Vec<OutcomeIssue>,
}

/// One `OperationOutcome.issue` entry, as the engine reported it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeIssue {
    /// Native severity text; normalised by the consumer.
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<CodeableConcept>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub location: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expression: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeableConcept {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_integer: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
}

/// Aggregate severity counts of an outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub fatal: usize,
    pub error: usize,
    pub warning: usize,
    pub information: usize,
}

impl OperationOutcome {
    pub fn new(issue: Vec<OutcomeIssue>) -> Self {
        Self {
            resource_type: OPERATION_OUTCOME.to_string(),
            issue,
        }
    }

    /// An outcome holding a single synthetic issue.
    pub fn single(issue: OutcomeIssue) -> Self {
        Self::new(vec![issue])
    }

    /// Turn raw process output into one `error`/`processing` issue per non-empty line.
    ///
    /// Used when an engine failed to produce an outcome of its own.
    pub fn from_output_lines(output: &str) -> Self {
        let issue = output
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .map(|line| OutcomeIssue {
                severity: "error".into(),
                code: "processing".into(),
                details: Some(CodeableConcept {
                    text: Some(line.to_string()),
                }),
                ..OutcomeIssue::default()
            })
            .collect();
        Self::new(issue)
    }

    /// Parse an `OperationOutcome` from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::Translation`] naming the failing path when the JSON does not match
    /// the model, or [`FhirError::InvalidInput`] if the resource is not an `OperationOutcome`.
    pub fn parse(text: &str) -> FhirResult<Self> {
        let deserializer = &mut serde_json::Deserializer::from_str(text);
        let outcome: OperationOutcome =
            serde_path_to_error::deserialize(deserializer).map_err(|err| {
                let path = err.path().to_string();
                let inner = err.into_inner();
                if path == "." {
                    FhirError::Translation(inner.to_string())
                } else {
                    FhirError::Translation(format!("{path}: {inner}"))
                }
            })?;

        if outcome.resource_type != OPERATION_OUTCOME {
            return Err(FhirError::InvalidInput(format!(
                "expected an OperationOutcome but found '{}'",
                outcome.resource_type
            )));
        }

        Ok(outcome)
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for issue in &self.issue {
            match issue.severity.trim().to_ascii_lowercase().as_str() {
                "fatal" => counts.fatal += 1,
                "error" => counts.error += 1,
                "warning" => counts.warning += 1,
                _ => counts.information += 1,
            }
        }
        counts
    }
}

impl Default for OperationOutcome {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl OutcomeIssue {
    /// A synthetic issue carrying its message in `diagnostics`.
    pub fn new(
        severity: impl Into<String>,
        code: impl Into<String>,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self {
            severity: severity.into(),
            code: code.into(),
            diagnostics: Some(diagnostics.into()),
            ..Self::default()
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location.push(location.into());
        self
    }

    /// Attach engine-reported line/column extensions.
    pub fn with_position(mut self, position: SourcePosition) -> Self {
        self.extension.push(Extension {
            url: ISSUE_LINE_EXTENSION.into(),
            value_integer: Some(i64::from(position.line)),
            ..Extension::default()
        });
        self.extension.push(Extension {
            url: ISSUE_COLUMN_EXTENSION.into(),
            value_integer: Some(i64::from(position.column)),
            ..Extension::default()
        });
        self
    }

    /// Position reported by the engine through the line/column extensions.
    ///
    /// A line is required; a missing column is treated as column 1. Non-positive values are
    /// ignored.
    pub fn reported_position(&self) -> Option<SourcePosition> {
        let line = self.extension_integer(ISSUE_LINE_EXTENSION)?;
        let column = self.extension_integer(ISSUE_COLUMN_EXTENSION).unwrap_or(1);
        Some(SourcePosition::new(line, column))
    }

    fn extension_integer(&self, url: &str) -> Option<u32> {
        self.extension
            .iter()
            .find(|extension| extension.url == url)
            .and_then(|extension| {
                extension.value_integer.or_else(|| {
                    extension
                        .value_string
                        .as_deref()
                        .and_then(|value| value.trim().parse().ok())
                })
            })
            .and_then(|value| u32::try_from(value).ok())
            .filter(|value| *value > 0)
    }
}
