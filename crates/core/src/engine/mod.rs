//! Engine adapters.
//!
//! Each validation engine sits behind [`ValidationEngine`]: given a [`ValidationRequest`] and the
//! run's cancellation token it returns an [`EngineOutcome`]. Adapters convert every failure
//! they understand into a synthetic issue inside a completed report; only cancellation (and
//! panics, surfaced as [`EngineOutcome::Faulted`]) escape as something other than a report.

pub mod conformance;
pub mod external;
pub mod managed;

use crate::profile::ProfileSource;
use crate::terminology::TerminologySetting;
use crate::CoreError;
use async_trait::async_trait;
use fhir::{FhirVersion, OperationOutcome, OutcomeIssue, ResourceFormat};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use conformance::StructuralValidator;
pub use external::ExternalEngine;
pub use managed::{ManagedEngine, ManagedValidator, ValidatorSettings};

/// The two engines a run validates with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Managed,
    External,
}

impl EngineKind {
    pub const ALL: [EngineKind; 2] = [EngineKind::Managed, EngineKind::External];
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Managed => f.write_str("Managed"),
            EngineKind::External => f.write_str("Java"),
        }
    }
}

/// Everything an engine needs for one run, snapshotted at run start.
#[derive(Clone, Debug)]
pub struct ValidationRequest {
    pub text: Arc<str>,
    pub format: ResourceFormat,
    pub fhir_version: FhirVersion,
    pub profiles: Arc<ProfileSource>,
    pub scope_directory: Option<PathBuf>,
    pub terminology: TerminologySetting,
}

/// A completed engine result.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineReport {
    pub outcome: OperationOutcome,
    /// The engine failed to produce an outcome and raw process output was used instead.
    pub crashed: bool,
}

impl EngineReport {
    pub fn new(outcome: OperationOutcome) -> Self {
        Self {
            outcome,
            crashed: false,
        }
    }

    pub fn crashed(outcome: OperationOutcome) -> Self {
        Self {
            outcome,
            crashed: true,
        }
    }

    /// A report holding a single `error`/`exception` issue.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(OperationOutcome::single(OutcomeIssue::new(
            "error",
            "exception",
            message,
        )))
    }

    /// A failure report whose message embeds the error category (`"<category>: <message>"`).
    pub fn from_error(err: &CoreError) -> Self {
        Self::failure(format!("{}: {}", err.category(), err))
    }
}

/// Tri-state result of one engine invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineOutcome {
    Completed(EngineReport),
    /// The run was canceled; nothing should be recorded.
    Canceled,
    /// The engine failed in a way it could not turn into a report.
    Faulted(String),
}

#[async_trait]
pub trait ValidationEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Validate the request's document.
    ///
    /// Implementations must return [`EngineOutcome::Canceled`] rather than a result when
    /// `cancel` has fired by the time their work completes.
    async fn validate(
        &self,
        request: Arc<ValidationRequest>,
        cancel: CancellationToken,
    ) -> EngineOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reports_embed_the_error_category() {
        let report = EngineReport::from_error(&CoreError::UnrecognizedFormat);
        assert!(!report.crashed);
        assert_eq!(report.outcome.issue.len(), 1);
        assert_eq!(
            report.outcome.issue[0].diagnostics.as_deref(),
            Some("FormatError: this resource format isn't recognized")
        );
        assert_eq!(report.outcome.issue[0].code, "exception");
    }
}
