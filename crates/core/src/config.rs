//! Core runtime configuration.
//!
//! This module defines configuration that should be resolved once at process startup and then
//! passed into the orchestrator. The intent is to avoid reading process-wide environment
//! variables while a validation run is in flight, which can lead to inconsistent behaviour in
//! multi-threaded runtimes and test harnesses.

use crate::constants::{DEFAULT_JAVA_RUNTIME, DEFAULT_TERMINOLOGY_SERVICE, VALIDATOR_JAR_FILENAME};
use crate::{CoreError, CoreResult};
use fhir::FhirVersion;
use std::path::{Path, PathBuf};

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    app_dir: PathBuf,
    java_runtime: PathBuf,
    validator_jar: PathBuf,
    fhir_version: FhirVersion,
    terminology_service: String,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] if the Java runtime is empty.
    pub fn new(
        app_dir: PathBuf,
        java_runtime: PathBuf,
        validator_jar: PathBuf,
        fhir_version: FhirVersion,
        terminology_service: String,
    ) -> CoreResult<Self> {
        if java_runtime.as_os_str().is_empty() {
            return Err(CoreError::InvalidInput(
                "java runtime cannot be empty".into(),
            ));
        }

        Ok(Self {
            app_dir,
            java_runtime,
            validator_jar,
            fhir_version,
            terminology_service: terminology_service.trim().to_string(),
        })
    }

    /// Directory holding the validator jar and the bundled core archives.
    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    pub fn java_runtime(&self) -> &Path {
        &self.java_runtime
    }

    pub fn validator_jar(&self) -> &Path {
        &self.validator_jar
    }

    pub fn fhir_version(&self) -> FhirVersion {
        self.fhir_version
    }

    pub fn terminology_service(&self) -> &str {
        &self.terminology_service
    }

    /// Path of the bundled core specification archive for `version`.
    pub fn core_archive(&self, version: FhirVersion) -> PathBuf {
        self.app_dir.join(version.core_archive_name())
    }
}

/// Resolve the application directory without reading environment variables.
///
/// If `override_dir` is provided it must be an existing directory. Otherwise this is the
/// directory containing the running executable.
pub fn resolve_app_dir(override_dir: Option<PathBuf>) -> CoreResult<PathBuf> {
    if let Some(app_dir) = override_dir {
        if app_dir.is_dir() {
            return Ok(app_dir);
        }
        return Err(CoreError::InvalidInput(format!(
            "HAMMER_APP_DIR override is not a directory: {}",
            app_dir.display()
        )));
    }

    let executable = std::env::current_exe().map_err(CoreError::FileRead)?;
    executable
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            CoreError::InvalidInput("could not determine the application directory".into())
        })
}

/// Parse the target FHIR version from an optional string value.
///
/// If `value` is `None` or empty/whitespace, returns STU3.
pub fn fhir_version_from_env_value(value: Option<String>) -> CoreResult<FhirVersion> {
    let value = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let parsed = value.map(|v| v.parse::<FhirVersion>()).transpose()?;

    Ok(parsed.unwrap_or_default())
}

/// Resolve the Java runtime from an optional value, defaulting to `java` on the `PATH`.
pub fn java_runtime_from_env_value(value: Option<String>) -> PathBuf {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_JAVA_RUNTIME))
}

/// Resolve the validator jar, defaulting to the jar shipped in the application directory.
pub fn validator_jar_from_env_value(value: Option<String>, app_dir: &Path) -> PathBuf {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| app_dir.join(VALIDATOR_JAR_FILENAME))
}

/// Resolve the terminology endpoint, defaulting to the public STU3 server.
///
/// Whitespace-only values fall back to the default; sentinel values are kept as given.
pub fn terminology_service_from_env_value(value: Option<String>) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_TERMINOLOGY_SERVICE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fhir_version_defaults_to_stu3() {
        assert_eq!(
            fhir_version_from_env_value(None).expect("default"),
            FhirVersion::Stu3
        );
        assert_eq!(
            fhir_version_from_env_value(Some("  ".into())).expect("blank"),
            FhirVersion::Stu3
        );
        assert_eq!(
            fhir_version_from_env_value(Some("r4".into())).expect("r4"),
            FhirVersion::R4
        );
        assert!(fhir_version_from_env_value(Some("DSTU2".into())).is_err());
    }

    #[test]
    fn validator_jar_defaults_into_app_dir() {
        let app_dir = Path::new("/opt/hammer");
        assert_eq!(
            validator_jar_from_env_value(None, app_dir),
            app_dir.join(VALIDATOR_JAR_FILENAME)
        );
        assert_eq!(
            validator_jar_from_env_value(Some("/tmp/v.jar".into()), app_dir),
            PathBuf::from("/tmp/v.jar")
        );
    }

    #[test]
    fn terminology_defaults_but_keeps_sentinels() {
        assert_eq!(
            terminology_service_from_env_value(None),
            DEFAULT_TERMINOLOGY_SERVICE
        );
        assert_eq!(
            terminology_service_from_env_value(Some(" n/a ".into())),
            "n/a"
        );
    }

    #[test]
    fn app_dir_override_must_exist() {
        let temp = TempDir::new().expect("create temp dir");
        let resolved =
            resolve_app_dir(Some(temp.path().to_path_buf())).expect("existing dir accepted");
        assert_eq!(resolved, temp.path());

        let missing = temp.path().join("missing");
        assert!(resolve_app_dir(Some(missing)).is_err());
    }

    #[test]
    fn config_rejects_empty_runtime_and_locates_archives() {
        let result = CoreConfig::new(
            PathBuf::from("/opt/hammer"),
            PathBuf::new(),
            PathBuf::from("/opt/hammer/v.jar"),
            FhirVersion::R4,
            DEFAULT_TERMINOLOGY_SERVICE.into(),
        );
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));

        let config = CoreConfig::new(
            PathBuf::from("/opt/hammer"),
            PathBuf::from("java"),
            PathBuf::from("/opt/hammer/v.jar"),
            FhirVersion::R4,
            DEFAULT_TERMINOLOGY_SERVICE.into(),
        )
        .expect("valid config");
        assert_eq!(
            config.core_archive(FhirVersion::Stu3),
            PathBuf::from("/opt/hammer/specification_Fhir3_0.zip")
        );
    }
}
