//! Constants used throughout the Hammer core crate.
//!
//! File names, defaults and fixed user-facing text live here so the engines, the normaliser
//! and the host agree on them.

use std::time::Duration;

/// File name of the external validator inside the application directory.
pub const VALIDATOR_JAR_FILENAME: &str = "org.hl7.fhir.validator.jar";

/// Runtime used to launch the external validator when none is configured.
pub const DEFAULT_JAVA_RUNTIME: &str = "java";

/// Terminology endpoint used when none is configured.
pub const DEFAULT_TERMINOLOGY_SERVICE: &str = "https://tx.fhir.org/r3";

/// Endpoint values (compared case-insensitively) that mean "local-only terminology checking".
pub const TERMINOLOGY_DISABLED_SENTINELS: [&str; 4] =
    ["don't check with any server", "n/a", "off", "none"];

/// Value passed to the external validator's `-tx` argument to disable remote terminology.
pub const TERMINOLOGY_DISABLED_ARGUMENT: &str = "n/a";

/// Request timeout for remote terminology lookups.
pub const TERMINOLOGY_TIMEOUT: Duration = Duration::from_secs(30);

/// Message shown when the external validator's runtime cannot be launched.
pub const JAVA_NOT_FOUND_MESSAGE: &str = "Java could not be found. Is your Java installed and working correctly? See https://www.java.com/en/download/help/version_manual.xml";

/// Issue text used when an engine reported neither details nor diagnostics.
pub const NO_DETAILS_PLACEHOLDER: &str = "(no details)";

/// Separator used when an issue reports several locations.
pub const LOCATION_SEPARATOR: &str = " via ";

/// Location marker engines use for the resource root.
pub const DOCUMENT_LOCATION_MARKER: &str = "(document)";

/// Canonical URL prefix of the core structure definitions.
pub const CORE_STRUCTURE_DEFINITION_BASE: &str = "http://hl7.org/fhir/StructureDefinition/";

/// Capacity of the validation event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;
