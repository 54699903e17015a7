//! Target FHIR specification versions.

use crate::FhirError;
use std::fmt;
use std::str::FromStr;

/// FHIR release a resource is validated against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FhirVersion {
    #[default]
    Stu3,
    R4,
}

impl FhirVersion {
    pub const ALL: [FhirVersion; 2] = [FhirVersion::Stu3, FhirVersion::R4];

    /// Value passed to the external validator's `-version` argument.
    pub fn validator_argument(self) -> &'static str {
        match self {
            FhirVersion::Stu3 => "3.0",
            FhirVersion::R4 => "4.0",
        }
    }

    /// Suffix terminology servers conventionally use for this release (`r3`, `r4`).
    pub fn terminology_suffix(self) -> &'static str {
        match self {
            FhirVersion::Stu3 => "r3",
            FhirVersion::R4 => "r4",
        }
    }

    /// File name of the bundled core specification archive for this release.
    pub fn core_archive_name(self) -> &'static str {
        match self {
            FhirVersion::Stu3 => "specification_Fhir3_0.zip",
            FhirVersion::R4 => "specification_Fhir4_0.zip",
        }
    }
}

impl fmt::Display for FhirVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FhirVersion::Stu3 => f.write_str("STU3"),
            FhirVersion::R4 => f.write_str("R4"),
        }
    }
}

impl FromStr for FhirVersion {
    type Err = FhirError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STU3" | "R3" | "3.0" => Ok(FhirVersion::Stu3),
            "R4" | "4.0" => Ok(FhirVersion::R4),
            other => Err(FhirError::InvalidInput(format!(
                "unsupported FHIR version '{other}' (expected STU3 or R4)"
            ))),
        }
    }
}
