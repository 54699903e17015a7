//! # Hammer Core
//!
//! Validation orchestration for the Hammer FHIR validator.
//!
//! This crate runs one resource through two independent validation engines and merges their
//! results into a single normalised issue list:
//! - the **managed** engine, an in-process structural validator on the blocking pool
//! - the **external** engine, the Java validator CLI run as a child process
//!
//! Supporting pieces live alongside: profile sources (core archive plus a scope directory),
//! the terminology chain, the subprocess registry used for cancellation, and the mapping of
//! engine locations back to line/column positions in the source text.
//!
//! **No presentation concerns**: rendering issues for people belongs in the `hammer` binary.

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod issue;
pub mod normalize;
pub mod orchestrator;
pub mod position;
pub mod profile;
pub mod subprocess;
pub mod terminology;

pub use config::CoreConfig;
pub use engine::{EngineKind, EngineOutcome, EngineReport, ValidationEngine, ValidationRequest};
pub use error::{CoreError, CoreResult};
pub use issue::{Issue, Severity};
pub use orchestrator::{
    EnginePhase, EngineSnapshot, Orchestrator, RunId, ValidationEvent, ValidationSettings,
    ValidationSnapshot,
};
pub use subprocess::SubprocessRegistry;
pub use terminology::TerminologySetting;
