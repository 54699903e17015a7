//! Managed (in-process) engine adapter.
//!
//! The validator itself is a blocking, non-preemptible computation, so it runs on the blocking
//! pool. Cancellation is honoured only once it returns: a canceled run's result is discarded.

use super::{EngineKind, EngineOutcome, EngineReport, ValidationEngine, ValidationRequest};
use crate::profile::ProfileSource;
use crate::terminology::{terminology_chain, TerminologyService};
use crate::{CoreError, CoreResult};
use async_trait::async_trait;
use fhir::{ElementNode, FhirVersion, OperationOutcome, ResourceFormat};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Settings handed to a [`ManagedValidator`] for one run.
pub struct ValidatorSettings {
    pub profiles: Arc<ProfileSource>,
    pub terminology: Arc<dyn TerminologyService>,
    /// Derive element lists from differentials when a definition has no snapshot.
    pub generate_snapshot: bool,
    /// Enforce structural rules that do not depend on profiles.
    pub validate_schema: bool,
}

/// An in-process validator implementation for one FHIR version.
pub trait ManagedValidator: Send + Sync {
    fn fhir_version(&self) -> FhirVersion;

    fn validate(
        &self,
        resource: &ElementNode,
        settings: &ValidatorSettings,
    ) -> CoreResult<OperationOutcome>;
}

/// Adapter selecting a [`ManagedValidator`] by the run's target version.
pub struct ManagedEngine {
    validators: Vec<Arc<dyn ManagedValidator>>,
}

impl ManagedEngine {
    pub fn new(validators: Vec<Arc<dyn ManagedValidator>>) -> Self {
        Self { validators }
    }

    /// The engine with the bundled structural validator for every supported version.
    pub fn bundled() -> Self {
        Self::new(
            FhirVersion::ALL
                .iter()
                .map(|version| {
                    Arc::new(super::StructuralValidator::new(*version)) as Arc<dyn ManagedValidator>
                })
                .collect(),
        )
    }

    fn validator_for(&self, version: FhirVersion) -> Option<Arc<dyn ManagedValidator>> {
        self.validators
            .iter()
            .find(|validator| validator.fhir_version() == version)
            .cloned()
    }
}

#[async_trait]
impl ValidationEngine for ManagedEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Managed
    }

    async fn validate(
        &self,
        request: Arc<ValidationRequest>,
        cancel: CancellationToken,
    ) -> EngineOutcome {
        let Some(validator) = self.validator_for(request.fhir_version) else {
            return EngineOutcome::Completed(EngineReport::from_error(&CoreError::Validator(
                format!("no in-process validator available for FHIR {}", request.fhir_version),
            )));
        };

        tracing::info!("beginning managed validation ({})", request.fhir_version);
        let started = Instant::now();
        let task = tokio::task::spawn_blocking(move || run_validator(validator.as_ref(), &request));

        let result = match task.await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!("managed validation task failed: {}", err);
                return EngineOutcome::Faulted(err.to_string());
            }
        };

        if cancel.is_cancelled() {
            tracing::debug!("discarding managed result of a canceled run");
            return EngineOutcome::Canceled;
        }
        tracing::info!(
            "managed validation performed in {}ms",
            started.elapsed().as_millis()
        );

        match result {
            Ok(outcome) => EngineOutcome::Completed(EngineReport::new(outcome)),
            Err(err) => {
                tracing::error!("managed validation failed: {}", err);
                EngineOutcome::Completed(EngineReport::from_error(&err))
            }
        }
    }
}

/// Parse, build the terminology chain and validate. Runs on a blocking thread.
fn run_validator(
    validator: &dyn ManagedValidator,
    request: &ValidationRequest,
) -> CoreResult<OperationOutcome> {
    if request.format == ResourceFormat::Unknown {
        return Err(CoreError::UnrecognizedFormat);
    }
    let resource = fhir::parse_resource(&request.text, request.format)?;
    let terminology = terminology_chain(Arc::clone(&request.profiles), &request.terminology)?;

    let settings = ValidatorSettings {
        profiles: Arc::clone(&request.profiles),
        terminology: Arc::new(terminology),
        generate_snapshot: true,
        validate_schema: true,
    };
    validator.validate(&resource, &settings)
}
