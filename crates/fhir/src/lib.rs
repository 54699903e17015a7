//! FHIR wire/boundary support for the Hammer validator.
//!
//! This crate provides the **document-facing** pieces the validation core builds on:
//! - resource format probing and the target specification version
//! - a navigable element tree that remembers where each element sits in the source text
//! - a lenient JSON reader and an XML reader producing that tree
//! - evaluation of location expressions (the simple FHIRPath-like paths engines report)
//! - the `OperationOutcome` wire model engines return
//!
//! This crate does no orchestration, spawns nothing and performs no I/O beyond what
//! callers hand it as text. Engine lifecycle belongs in `hammer-core`.

pub mod element;
pub mod format;
pub mod json;
pub mod outcome;
pub mod path;
pub mod version;
pub mod xml;

// Re-export the types most callers need
pub use element::{ElementNode, SourcePosition};
pub use format::ResourceFormat;
pub use outcome::{
    CodeableConcept, Extension, OperationOutcome, OutcomeCounts, OutcomeIssue,
    ISSUE_COLUMN_EXTENSION, ISSUE_LINE_EXTENSION,
};
pub use path::LocationPath;
pub use version::FhirVersion;

/// Errors returned by the `fhir` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum FhirError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid JSON at line {line}, column {column}: {message}")]
    InvalidJson {
        line: u32,
        column: u32,
        message: String,
    },

    #[error("invalid XML at line {line}, column {column}: {message}")]
    InvalidXml {
        line: u32,
        column: u32,
        message: String,
    },

    #[error("invalid location expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("translation error: {0}")]
    Translation(String),
}

/// Type alias for Results that can fail with a [`FhirError`].
pub type FhirResult<T> = Result<T, FhirError>;

/// Parse resource text into an element tree using the reader matching `format`.
///
/// # Errors
///
/// Returns [`FhirError::InvalidInput`] for [`ResourceFormat::Unknown`], otherwise whatever the
/// format-specific reader reports for text it cannot recover from.
pub fn parse_resource(text: &str, format: ResourceFormat) -> FhirResult<ElementNode> {
    match format {
        ResourceFormat::Json => json::parse(text),
        ResourceFormat::Xml => xml::parse(text),
        ResourceFormat::Unknown => Err(FhirError::InvalidInput(
            "this resource format isn't recognized".into(),
        )),
    }
}
