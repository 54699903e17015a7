//! Terminology checking for coded values.
//!
//! The in-process engine validates codes through a chain:
//!
//! ```text
//! FallbackTerminologyService
//! ├── LocalTerminologyService      CodeSystems from the profile source
//! └── ExternalTerminologyService   $validate-code on a remote server (optional)
//! ```
//!
//! The remote link exists only when the configured endpoint is a real URL; the disable
//! sentinels (`n/a`, `off`, `none`, `don't check with any server`) give a local-only chain.

use crate::constants::{
    TERMINOLOGY_DISABLED_ARGUMENT, TERMINOLOGY_DISABLED_SENTINELS, TERMINOLOGY_TIMEOUT,
};
use crate::profile::ProfileSource;
use crate::{CoreError, CoreResult};
use fhir::{ElementNode, FhirVersion};
use std::sync::Arc;

/// How coded values are checked beyond the local definitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminologySetting {
    LocalOnly,
    Remote(String),
}

impl TerminologySetting {
    /// Interpret a configured endpoint string. Sentinels and blank values mean local-only.
    pub fn parse(endpoint: &str) -> Self {
        let trimmed = endpoint.trim();
        let disabled = trimmed.is_empty()
            || TERMINOLOGY_DISABLED_SENTINELS
                .iter()
                .any(|sentinel| sentinel.eq_ignore_ascii_case(trimmed));
        if disabled {
            TerminologySetting::LocalOnly
        } else {
            TerminologySetting::Remote(trimmed.to_string())
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        match self {
            TerminologySetting::LocalOnly => None,
            TerminologySetting::Remote(url) => Some(url),
        }
    }

    /// Value for the external validator's `-tx` argument.
    pub fn validator_argument(&self) -> &str {
        self.endpoint().unwrap_or(TERMINOLOGY_DISABLED_ARGUMENT)
    }
}

/// Point an endpoint ending in a release suffix (`r3`, `r4`) at `version`'s release.
///
/// Endpoints without a suffix are returned unchanged.
pub fn retarget_endpoint(endpoint: &str, version: FhirVersion) -> String {
    let suffix_start = endpoint.len().saturating_sub(2);
    match endpoint.get(suffix_start..) {
        Some(suffix) if suffix.eq_ignore_ascii_case("r3") || suffix.eq_ignore_ascii_case("r4") => {
            format!("{}{}", &endpoint[..suffix_start], version.terminology_suffix())
        }
        _ => endpoint.to_string(),
    }
}

/// Result of checking one code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodeValidation {
    Valid,
    Invalid(String),
    /// The service has no authoritative answer for this code system.
    Unknown,
}

pub trait TerminologyService: Send + Sync {
    /// Check that `code` is defined by the code system `system`.
    fn validate_code(
        &self,
        system: &str,
        code: &str,
        display: Option<&str>,
    ) -> CoreResult<CodeValidation>;
}

/// Answers from CodeSystem resources available through the profile source.
pub struct LocalTerminologyService {
    profiles: Arc<ProfileSource>,
}

impl LocalTerminologyService {
    pub fn new(profiles: Arc<ProfileSource>) -> Self {
        Self { profiles }
    }
}

impl TerminologyService for LocalTerminologyService {
    fn validate_code(
        &self,
        system: &str,
        code: &str,
        _display: Option<&str>,
    ) -> CoreResult<CodeValidation> {
        let Some(code_system) = self.profiles.resolve(system) else {
            return Ok(CodeValidation::Unknown);
        };
        if code_system.resource_type() != Some("CodeSystem") {
            return Ok(CodeValidation::Unknown);
        }

        if defines_code(&code_system, code) {
            return Ok(CodeValidation::Valid);
        }

        // Only a complete code system can rule a code out
        if code_system.child_value("content") == Some("complete") {
            Ok(CodeValidation::Invalid(format!(
                "Code '{code}' is not defined in code system '{system}'"
            )))
        } else {
            Ok(CodeValidation::Unknown)
        }
    }
}

fn defines_code(code_system: &ElementNode, code: &str) -> bool {
    code_system
        .children_named("concept")
        .flat_map(ElementNode::descendants)
        .filter(|node| node.name() == "concept")
        .any(|concept| concept.child_value("code") == Some(code))
}

/// Calls `CodeSystem/$validate-code` on a remote terminology server.
pub struct ExternalTerminologyService {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl ExternalTerminologyService {
    /// Build a client for `endpoint`.
    ///
    /// Must not be called from within an async context; the in-process engine builds its
    /// chain on a blocking worker thread.
    pub fn new(endpoint: impl Into<String>) -> CoreResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(TERMINOLOGY_TIMEOUT)
            .build()?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl TerminologyService for ExternalTerminologyService {
    fn validate_code(
        &self,
        system: &str,
        code: &str,
        display: Option<&str>,
    ) -> CoreResult<CodeValidation> {
        let mut query = vec![("url", system), ("code", code)];
        if let Some(display) = display {
            query.push(("display", display));
        }

        let response = self
            .client
            .get(format!("{}/CodeSystem/$validate-code", self.endpoint))
            .header(reqwest::header::ACCEPT, "application/fhir+json")
            .query(&query)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::TerminologyResponse(format!(
                "HTTP {status} from {}",
                self.endpoint
            )));
        }

        let parameters: serde_json::Value = response.json()?;
        parse_validate_code_response(&parameters)
    }
}

/// Read `result` and `message` out of a `$validate-code` Parameters resource.
fn parse_validate_code_response(parameters: &serde_json::Value) -> CoreResult<CodeValidation> {
    let parameter = |name: &str| {
        parameters
            .get("parameter")
            .and_then(serde_json::Value::as_array)
            .and_then(|items| {
                items
                    .iter()
                    .find(|item| item.get("name").and_then(serde_json::Value::as_str) == Some(name))
            })
    };

    let result = parameter("result")
        .and_then(|item| item.get("valueBoolean"))
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(|| {
            CoreError::TerminologyResponse("response has no boolean 'result' parameter".into())
        })?;

    if result {
        return Ok(CodeValidation::Valid);
    }

    let message = parameter("message")
        .and_then(|item| item.get("valueString"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("code is not valid according to the terminology server")
        .to_string();
    Ok(CodeValidation::Invalid(message))
}

/// Local first; the remote service is only asked when the local one has no answer.
pub struct FallbackTerminologyService {
    local: LocalTerminologyService,
    remote: Option<ExternalTerminologyService>,
}

impl FallbackTerminologyService {
    pub fn new(local: LocalTerminologyService, remote: Option<ExternalTerminologyService>) -> Self {
        Self { local, remote }
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }
}

impl TerminologyService for FallbackTerminologyService {
    fn validate_code(
        &self,
        system: &str,
        code: &str,
        display: Option<&str>,
    ) -> CoreResult<CodeValidation> {
        match self.local.validate_code(system, code, display)? {
            CodeValidation::Unknown => match &self.remote {
                Some(remote) => remote.validate_code(system, code, display),
                None => Ok(CodeValidation::Unknown),
            },
            answer => Ok(answer),
        }
    }
}

/// Build the terminology chain for one run.
///
/// # Errors
///
/// Returns [`CoreError::Terminology`] if the HTTP client for a remote endpoint cannot be built.
pub fn terminology_chain(
    profiles: Arc<ProfileSource>,
    setting: &TerminologySetting,
) -> CoreResult<FallbackTerminologyService> {
    let local = LocalTerminologyService::new(profiles);
    let remote = setting
        .endpoint()
        .map(ExternalTerminologyService::new)
        .transpose()?;
    match &remote {
        Some(remote) => tracing::debug!("terminology falls back to {}", remote.endpoint()),
        None => tracing::debug!("terminology checked against local code systems only"),
    }
    Ok(FallbackTerminologyService::new(local, remote))
}
