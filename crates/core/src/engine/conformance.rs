//! Bundled structural validator used by the managed engine.
//!
//! Checks performed, in document order:
//! - the resource type resolves to a core `StructureDefinition`
//! - every top-level element is declared by that definition
//! - every `meta.profile` resolves through the profile source
//! - every `coding` with both `system` and `code` is accepted by the terminology chain
//! - (schema) every element carries a value or children
//!
//! Locations are FHIRPath-style paths with an index on repeated elements
//! (`Patient.name[1].given`), which the normaliser resolves back to source positions.

use super::managed::{ManagedValidator, ValidatorSettings};
use crate::terminology::CodeValidation;
use crate::CoreResult;
use fhir::{ElementNode, FhirVersion, OperationOutcome, OutcomeIssue};
use std::collections::{HashMap, HashSet};

/// Elements every resource may carry, whether or not a differential lists them.
const BASE_RESOURCE_ELEMENTS: [&str; 8] = [
    "id",
    "meta",
    "implicitRules",
    "language",
    "text",
    "contained",
    "extension",
    "modifierExtension",
];

pub struct StructuralValidator {
    version: FhirVersion,
}

impl StructuralValidator {
    pub fn new(version: FhirVersion) -> Self {
        Self { version }
    }
}

impl ManagedValidator for StructuralValidator {
    fn fhir_version(&self) -> FhirVersion {
        self.version
    }

    fn validate(
        &self,
        resource: &ElementNode,
        settings: &ValidatorSettings,
    ) -> CoreResult<OperationOutcome> {
        let type_name = resource.resource_type().unwrap_or(resource.name());
        let mut issues = Vec::new();

        match settings.profiles.structure_definition_for_type(type_name) {
            Some(definition) => {
                let declared = DeclaredElements::from_definition(
                    &definition,
                    type_name,
                    settings.generate_snapshot,
                );
                check_declared_elements(resource, type_name, &declared, &mut issues);
            }
            None => issues.push(
                OutcomeIssue::new(
                    "error",
                    "structure",
                    format!(
                        "Unknown resource type '{type_name}' for FHIR {}: no StructureDefinition found",
                        self.version
                    ),
                )
                .with_location(type_name),
            ),
        }

        check_profiles(resource, type_name, settings, &mut issues);

        walk(resource, type_name, &mut |node: &ElementNode, path: &str| {
            if node.name() == "coding" {
                check_coding(node, path, settings, &mut issues);
            }
            if settings.validate_schema && node.value().is_none() && node.children().is_empty() {
                issues.push(
                    OutcomeIssue::new(
                        "error",
                        "invariant",
                        "All FHIR elements must have a @value or children",
                    )
                    .with_location(path),
                );
            }
        });

        Ok(OperationOutcome::new(issues))
    }
}

/// Top-level element names declared by a StructureDefinition.
struct DeclaredElements {
    names: HashSet<String>,
    /// Choice elements (`deceased[x]`) stored without the suffix.
    choices: Vec<String>,
}

impl DeclaredElements {
    fn from_definition(definition: &ElementNode, type_name: &str, generate_snapshot: bool) -> Self {
        let mut paths = element_paths(definition, "snapshot");
        if paths.is_empty() && generate_snapshot {
            paths = element_paths(definition, "differential");
        }

        let prefix = format!("{type_name}.");
        let mut names: HashSet<String> = BASE_RESOURCE_ELEMENTS
            .iter()
            .map(|name| name.to_string())
            .collect();
        let mut choices = Vec::new();

        for path in paths {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            if rest.contains('.') {
                continue;
            }
            match rest.strip_suffix("[x]") {
                Some(choice) => choices.push(choice.to_string()),
                None => {
                    names.insert(rest.to_string());
                }
            }
        }

        Self { names, choices }
    }

    fn declares(&self, name: &str) -> bool {
        self.names.contains(name)
            || self.choices.iter().any(|choice| {
                name.strip_prefix(choice.as_str())
                    .and_then(|suffix| suffix.chars().next())
                    .is_some_and(|ch| ch.is_ascii_uppercase())
            })
    }
}

fn element_paths(definition: &ElementNode, section: &str) -> Vec<String> {
    definition
        .child(section)
        .map(|section| {
            section
                .children_named("element")
                .filter_map(|element| element.child_value("path"))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn check_declared_elements(
    resource: &ElementNode,
    type_name: &str,
    declared: &DeclaredElements,
    issues: &mut Vec<OutcomeIssue>,
) {
    let mut reported = HashSet::new();
    for child in resource.children() {
        if declared.declares(child.name()) || !reported.insert(child.name()) {
            continue;
        }
        issues.push(
            OutcomeIssue::new(
                "error",
                "structure",
                format!(
                    "Encountered unknown element '{}' in {type_name}",
                    child.name()
                ),
            )
            .with_location(format!("{type_name}.{}", child.name())),
        );
    }
}

fn check_profiles(
    resource: &ElementNode,
    type_name: &str,
    settings: &ValidatorSettings,
    issues: &mut Vec<OutcomeIssue>,
) {
    let Some(meta) = resource.child("meta") else {
        return;
    };
    for (index, profile) in meta.children_named("profile").enumerate() {
        let Some(url) = profile.value() else {
            continue;
        };
        if settings.profiles.resolve(url).is_none() {
            issues.push(
                OutcomeIssue::new(
                    "error",
                    "not-found",
                    format!("Unable to resolve reference to profile '{url}'"),
                )
                .with_location(format!("{type_name}.meta.profile[{index}]")),
            );
        }
    }
}

fn check_coding(
    coding: &ElementNode,
    path: &str,
    settings: &ValidatorSettings,
    issues: &mut Vec<OutcomeIssue>,
) {
    let (Some(system), Some(code)) = (coding.child_value("system"), coding.child_value("code"))
    else {
        return;
    };
    let display = coding.child_value("display");

    match settings.terminology.validate_code(system, code, display) {
        Ok(CodeValidation::Valid) | Ok(CodeValidation::Unknown) => {}
        Ok(CodeValidation::Invalid(message)) => issues.push(
            OutcomeIssue::new("error", "code-invalid", message)
                .with_location(format!("{path}.code")),
        ),
        Err(err) => issues.push(
            OutcomeIssue::new(
                "warning",
                "not-supported",
                format!("Unable to validate code '{code}' from system '{system}': {err}"),
            )
            .with_location(path),
        ),
    }
}

/// Visit every descendant of `node` (not `node` itself) with its indexed path.
///
/// Narrative XHTML is skipped.
fn walk(node: &ElementNode, path: &str, visit: &mut dyn FnMut(&ElementNode, &str)) {
    let mut totals: HashMap<&str, usize> = HashMap::new();
    for child in node.children() {
        *totals.entry(child.name()).or_default() += 1;
    }

    let mut seen: HashMap<&str, usize> = HashMap::new();
    for child in node.children() {
        let index = seen.entry(child.name()).or_default();
        let child_path = if totals.get(child.name()).copied().unwrap_or(0) > 1 {
            format!("{path}.{}[{index}]", child.name())
        } else {
            format!("{path}.{}", child.name())
        };
        *index += 1;

        if child.name() == "div" {
            continue;
        }
        visit(child, &child_path);
        walk(child, &child_path, visit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::tests::core_source;
    use crate::terminology::{terminology_chain, TerminologySetting};
    use fhir::{parse_resource, ResourceFormat};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn validate(temp: &TempDir, text: &str) -> OperationOutcome {
        let profiles = core_source(temp);
        let terminology =
            terminology_chain(Arc::clone(&profiles), &TerminologySetting::LocalOnly)
                .expect("local chain");
        let settings = ValidatorSettings {
            profiles,
            terminology: Arc::new(terminology),
            generate_snapshot: true,
            validate_schema: true,
        };
        let resource = parse_resource(text, ResourceFormat::detect(text)).expect("parse resource");
        StructuralValidator::new(FhirVersion::Stu3)
            .validate(&resource, &settings)
            .expect("validate")
    }

    fn locations(outcome: &OperationOutcome) -> Vec<&str> {
        outcome
            .issue
            .iter()
            .flat_map(|issue| issue.location.iter().map(String::as_str))
            .collect()
    }

    #[test]
    fn valid_patient_has_no_issues() {
        let temp = TempDir::new().expect("create temp dir");
        let outcome = validate(
            &temp,
            r#"{
  "resourceType": "Patient",
  "id": "example",
  "active": true,
  "deceasedBoolean": false,
  "name": [ { "family": "Chalmers" }, { "family": "Windsor" } ],
  "gender": "male"
}"#,
        );
        assert!(outcome.issue.is_empty(), "{:?}", outcome.issue);
    }

    #[test]
    fn unknown_resource_types_are_errors() {
        let temp = TempDir::new().expect("create temp dir");
        let outcome = validate(&temp, r#"{ "resourceType": "Spaceship", "id": "x" }"#);
        assert_eq!(outcome.issue.len(), 1);
        assert_eq!(outcome.issue[0].severity, "error");
        assert_eq!(locations(&outcome), vec!["Spaceship"]);
    }

    #[test]
    fn undeclared_elements_are_reported_once() {
        let temp = TempDir::new().expect("create temp dir");
        let outcome = validate(
            &temp,
            r#"<Patient xmlns="http://hl7.org/fhir">
  <colour value="blue"/>
  <colour value="green"/>
  <active value="true"/>
</Patient>"#,
        );
        assert_eq!(locations(&outcome), vec!["Patient.colour"]);
    }

    #[test]
    fn unresolvable_profiles_are_reported_with_index() {
        let temp = TempDir::new().expect("create temp dir");
        let outcome = validate(
            &temp,
            r#"{
  "resourceType": "Patient",
  "meta": { "profile": [
    "http://hl7.org/fhir/StructureDefinition/Patient",
    "http://example.org/StructureDefinition/missing"
  ] }
}"#,
        );
        assert_eq!(locations(&outcome), vec!["Patient.meta.profile[1]"]);
        assert_eq!(outcome.issue[0].code, "not-found");
    }

    #[test]
    fn codings_are_checked_against_local_code_systems() {
        let temp = TempDir::new().expect("create temp dir");
        let outcome = validate(
            &temp,
            r#"{
  "resourceType": "Patient",
  "maritalStatus": { "coding": [
    { "system": "http://hl7.org/fhir/administrative-gender", "code": "female" },
    { "system": "http://hl7.org/fhir/administrative-gender", "code": "mail" },
    { "system": "http://snomed.info/sct", "code": "12345" }
  ] }
}"#,
        );
        assert_eq!(
            locations(&outcome),
            vec!["Patient.maritalStatus.coding[1].code"]
        );
        assert_eq!(outcome.issue[0].code, "code-invalid");
    }

    #[test]
    fn empty_elements_violate_the_schema() {
        let temp = TempDir::new().expect("create temp dir");
        let outcome = validate(
            &temp,
            r#"{ "resourceType": "Patient", "name": [ {} ], "text": { "div": "<div>x</div>" } }"#,
        );
        assert_eq!(locations(&outcome), vec!["Patient.name"]);
        assert_eq!(outcome.issue[0].code, "invariant");
    }
}
