//! Profile source resolution.
//!
//! Definitions (StructureDefinitions, CodeSystems, ValueSets) are looked up by canonical URL
//! from two places:
//! - the bundled core specification archive for the target FHIR version
//! - an optional user scope directory, searched recursively
//!
//! The directory wins over the archive for the same URL. Both are indexed lazily on first
//! lookup and then cached for the lifetime of the source. A combined [`ProfileSource`] is never
//! mutated: changing the scope directory or version builds a new one, and each validation run
//! holds its own `Arc` snapshot.

use crate::config::CoreConfig;
use crate::constants::CORE_STRUCTURE_DEFINITION_BASE;
use crate::{CoreError, CoreResult};
use fhir::{ElementNode, FhirVersion, ResourceFormat};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

/// Canonical URL to definition resource.
#[derive(Debug, Default)]
struct DefinitionIndex {
    by_url: HashMap<String, Arc<ElementNode>>,
}

impl DefinitionIndex {
    /// Index a parsed resource; bundles are indexed per entry resource.
    fn insert_resource(&mut self, resource: ElementNode) {
        if resource.resource_type() == Some("Bundle") {
            for entry in resource.children_named("entry") {
                if let Some(inner) = entry.child("resource") {
                    self.insert_definition(inner.clone());
                }
            }
        } else {
            self.insert_definition(resource);
        }
    }

    fn insert_definition(&mut self, resource: ElementNode) {
        let Some(url) = resource.child_value("url").map(canonical_key) else {
            return;
        };
        let url = url.to_string();
        self.by_url.entry(url).or_insert_with(|| Arc::new(resource));
    }

    /// Parse definition text and index it; unparseable files are skipped.
    fn insert_text(&mut self, name: &str, text: &str) {
        let format = ResourceFormat::detect(text);
        match fhir::parse_resource(text, format) {
            Ok(resource) => self.insert_resource(resource),
            Err(err) => tracing::debug!("skipping definition file {}: {}", name, err),
        }
    }

    fn get(&self, canonical: &str) -> Option<Arc<ElementNode>> {
        self.by_url.get(canonical_key(canonical)).cloned()
    }

    fn len(&self) -> usize {
        self.by_url.len()
    }
}

/// Canonical references may pin a version (`url|4.0.1`); lookups ignore it.
fn canonical_key(canonical: &str) -> &str {
    canonical
        .split_once('|')
        .map_or(canonical, |(url, _)| url)
        .trim()
}

fn is_definition_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".json") || lower.ends_with(".xml")
}

/// The bundled core specification, read from a zip archive on first lookup.
#[derive(Debug)]
pub struct ArchiveSource {
    path: PathBuf,
    index: OnceLock<DefinitionIndex>,
}

impl ArchiveSource {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            index: OnceLock::new(),
        }
    }

    pub fn resolve(&self, canonical: &str) -> Option<Arc<ElementNode>> {
        self.index().get(canonical)
    }

    fn index(&self) -> &DefinitionIndex {
        self.index.get_or_init(|| match load_archive(&self.path) {
            Ok(index) => {
                tracing::info!(
                    "loaded {} core definitions from {}",
                    index.len(),
                    self.path.display()
                );
                index
            }
            Err(err) => {
                tracing::warn!(
                    "core specification archive {} unavailable: {}",
                    self.path.display(),
                    err
                );
                DefinitionIndex::default()
            }
        })
    }
}

fn load_archive(path: &Path) -> CoreResult<DefinitionIndex> {
    let file = std::fs::File::open(path).map_err(CoreError::FileRead)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut index = DefinitionIndex::default();

    for position in 0..archive.len() {
        let mut entry = archive.by_index(position)?;
        if !entry.is_file() || !is_definition_file(entry.name()) {
            continue;
        }
        let name = entry.name().to_string();
        let mut text = String::new();
        if let Err(err) = entry.read_to_string(&mut text) {
            tracing::debug!("skipping archive entry {}: {}", name, err);
            continue;
        }
        index.insert_text(&name, &text);
    }

    Ok(index)
}

/// A user scope directory, scanned recursively on first lookup.
#[derive(Debug)]
pub struct DirectorySource {
    root: PathBuf,
    index: OnceLock<DefinitionIndex>,
}

impl DirectorySource {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            index: OnceLock::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, canonical: &str) -> Option<Arc<ElementNode>> {
        self.index().get(canonical)
    }

    fn index(&self) -> &DefinitionIndex {
        self.index.get_or_init(|| {
            let mut index = DefinitionIndex::default();
            if let Err(err) = scan_directory(&self.root, &mut index) {
                tracing::warn!(
                    "failed to scan scope directory {}: {}",
                    self.root.display(),
                    err
                );
            }
            tracing::debug!(
                "indexed {} definitions from {}",
                index.len(),
                self.root.display()
            );
            index
        })
    }
}

fn scan_directory(path: &Path, index: &mut DefinitionIndex) -> CoreResult<()> {
    for entry in std::fs::read_dir(path).map_err(CoreError::FileRead)? {
        let entry = entry.map_err(CoreError::FileRead)?;
        let entry_path = entry.path();
        let file_type = entry.file_type().map_err(CoreError::FileRead)?;

        if file_type.is_dir() {
            scan_directory(&entry_path, index)?;
            continue;
        }

        let name = entry_path.display().to_string();
        if !file_type.is_file() || !is_definition_file(&name) {
            continue;
        }
        match std::fs::read_to_string(&entry_path) {
            Ok(text) => index.insert_text(&name, &text),
            Err(err) => tracing::debug!("skipping {}: {}", name, err),
        }
    }

    Ok(())
}

/// Core archive plus optional scope directory, as seen by one validation run.
#[derive(Debug)]
pub struct ProfileSource {
    fhir_version: FhirVersion,
    core: Arc<ArchiveSource>,
    directory: Option<Arc<DirectorySource>>,
}

impl ProfileSource {
    pub fn new(
        fhir_version: FhirVersion,
        core: Arc<ArchiveSource>,
        directory: Option<Arc<DirectorySource>>,
    ) -> Self {
        Self {
            fhir_version,
            core,
            directory,
        }
    }

    pub fn fhir_version(&self) -> FhirVersion {
        self.fhir_version
    }

    pub fn scope_directory(&self) -> Option<&Path> {
        self.directory.as_deref().map(DirectorySource::root)
    }

    /// Resolve a canonical URL, preferring the scope directory over the core archive.
    pub fn resolve(&self, canonical: &str) -> Option<Arc<ElementNode>> {
        self.directory
            .as_ref()
            .and_then(|directory| directory.resolve(canonical))
            .or_else(|| self.core.resolve(canonical))
    }

    /// The core StructureDefinition describing a resource or data type.
    pub fn structure_definition_for_type(&self, type_name: &str) -> Option<Arc<ElementNode>> {
        self.resolve(&format!("{CORE_STRUCTURE_DEFINITION_BASE}{type_name}"))
    }
}

/// Owner of the core archives and the current combined source.
///
/// Core archives are created once per version and shared by every combined source built from
/// them, so their lazily loaded indexes survive scope directory and version changes.
#[derive(Debug)]
pub struct ProfileSources {
    cores: HashMap<FhirVersion, Arc<ArchiveSource>>,
    current: RwLock<Arc<ProfileSource>>,
}

impl ProfileSources {
    pub fn new(config: &CoreConfig) -> Self {
        let cores: HashMap<FhirVersion, Arc<ArchiveSource>> = FhirVersion::ALL
            .iter()
            .map(|version| {
                (
                    *version,
                    Arc::new(ArchiveSource::new(config.core_archive(*version))),
                )
            })
            .collect();
        let initial = Self::combine(&cores, config.fhir_version(), None);

        Self {
            cores,
            current: RwLock::new(Arc::new(initial)),
        }
    }

    fn combine(
        cores: &HashMap<FhirVersion, Arc<ArchiveSource>>,
        version: FhirVersion,
        scope_directory: Option<&Path>,
    ) -> ProfileSource {
        let core = cores
            .get(&version)
            .cloned()
            .unwrap_or_else(|| Arc::new(ArchiveSource::new(PathBuf::from(version.core_archive_name()))));
        let directory =
            scope_directory.map(|dir| Arc::new(DirectorySource::new(dir.to_path_buf())));
        ProfileSource::new(version, core, directory)
    }

    /// Replace the combined source for a new version and/or scope directory.
    pub fn rebuild(
        &self,
        version: FhirVersion,
        scope_directory: Option<&Path>,
    ) -> Arc<ProfileSource> {
        let rebuilt = Arc::new(Self::combine(&self.cores, version, scope_directory));
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = Arc::clone(&rebuilt);
        rebuilt
    }

    /// The combined source a run should hold on to.
    pub fn snapshot(&self) -> Arc<ProfileSource> {
        let current = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&current)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    pub(crate) const PATIENT_DEFINITION: &str = r#"{
  "resourceType": "StructureDefinition",
  "url": "http://hl7.org/fhir/StructureDefinition/Patient",
  "name": "Patient",
  "type": "Patient",
  "snapshot": {
    "element": [
      { "path": "Patient" },
      { "path": "Patient.id" },
      { "path": "Patient.meta" },
      { "path": "Patient.text" },
      { "path": "Patient.identifier" },
      { "path": "Patient.active" },
      { "path": "Patient.name" },
      { "path": "Patient.gender" },
      { "path": "Patient.deceased[x]" },
      { "path": "Patient.maritalStatus" }
    ]
  }
}"#;

    pub(crate) const GENDER_CODES: &str = r#"{
  "resourceType": "CodeSystem",
  "url": "http://hl7.org/fhir/administrative-gender",
  "content": "complete",
  "concept": [
    { "code": "male" },
    { "code": "female" },
    { "code": "other", "concept": [ { "code": "unknown" } ] }
  ]
}"#;

    /// Write a core archive with the given `(name, contents)` entries.
    pub(crate) fn write_archive(path: &Path, entries: &[(&str, &str)]) {
        let file = std::fs::File::create(path).expect("create archive");
        let mut writer = zip::ZipWriter::new(file);
        for (name, contents) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .expect("start archive entry");
            writer
                .write_all(contents.as_bytes())
                .expect("write archive entry");
        }
        writer.finish().expect("finish archive");
    }

    /// A combined source over a temp core archive holding the Patient and gender definitions.
    pub(crate) fn core_source(temp: &TempDir) -> Arc<ProfileSource> {
        let archive = temp.path().join("core.zip");
        write_archive(
            &archive,
            &[
                ("StructureDefinition-Patient.json", PATIENT_DEFINITION),
                ("CodeSystem-administrative-gender.json", GENDER_CODES),
            ],
        );
        Arc::new(ProfileSource::new(
            FhirVersion::Stu3,
            Arc::new(ArchiveSource::new(archive)),
            None,
        ))
    }

    #[test]
    fn archive_definitions_resolve_by_canonical_url() {
        let temp = TempDir::new().expect("create temp dir");
        let source = core_source(&temp);

        let patient = source
            .structure_definition_for_type("Patient")
            .expect("Patient definition");
        assert_eq!(patient.child_value("name"), Some("Patient"));
        assert!(source
            .resolve("http://hl7.org/fhir/administrative-gender|4.0.1")
            .is_some());
        assert!(source.resolve("http://example.org/unknown").is_none());
    }

    #[test]
    fn bundles_are_indexed_per_entry() {
        let temp = TempDir::new().expect("create temp dir");
        let archive = temp.path().join("core.zip");
        let bundle = r#"<Bundle xmlns="http://hl7.org/fhir">
  <entry><resource><CodeSystem><url value="http://example.org/a"/></CodeSystem></resource></entry>
  <entry><resource><CodeSystem><url value="http://example.org/b"/></CodeSystem></resource></entry>
</Bundle>"#;
        write_archive(&archive, &[("profiles-resources.xml", bundle)]);
        let core = ArchiveSource::new(archive);

        assert!(core.resolve("http://example.org/a").is_some());
        let b = core.resolve("http://example.org/b").expect("second entry");
        assert_eq!(b.resource_type(), Some("CodeSystem"));
    }

    #[test]
    fn missing_archive_resolves_nothing() {
        let temp = TempDir::new().expect("create temp dir");
        let core = ArchiveSource::new(temp.path().join("absent.zip"));
        assert!(core.resolve("http://hl7.org/fhir/StructureDefinition/Patient").is_none());
    }

    #[test]
    fn scope_directory_overrides_core_and_is_scanned_recursively() {
        let temp = TempDir::new().expect("create temp dir");
        let archive = temp.path().join("core.zip");
        write_archive(
            &archive,
            &[("StructureDefinition-Patient.json", PATIENT_DEFINITION)],
        );

        let scope = temp.path().join("scope");
        let nested = scope.join("nested");
        std::fs::create_dir_all(&nested).expect("create scope dirs");
        std::fs::write(
            nested.join("patient.json"),
            r#"{ "resourceType": "StructureDefinition",
                 "url": "http://hl7.org/fhir/StructureDefinition/Patient",
                 "name": "LocalPatient" }"#,
        )
        .expect("write override");
        std::fs::write(scope.join("broken.json"), "{ not json").expect("write broken file");
        std::fs::write(scope.join("notes.txt"), "ignored").expect("write text file");

        let source = ProfileSource::new(
            FhirVersion::R4,
            Arc::new(ArchiveSource::new(archive)),
            Some(Arc::new(DirectorySource::new(scope.clone()))),
        );

        let patient = source
            .structure_definition_for_type("Patient")
            .expect("Patient definition");
        assert_eq!(patient.child_value("name"), Some("LocalPatient"));
        assert_eq!(source.scope_directory(), Some(scope.as_path()));
    }

    #[test]
    fn rebuild_swaps_the_snapshot_without_touching_held_ones() {
        let temp = TempDir::new().expect("create temp dir");
        let config = CoreConfig::new(
            temp.path().to_path_buf(),
            PathBuf::from("java"),
            temp.path().join("validator.jar"),
            FhirVersion::Stu3,
            "n/a".into(),
        )
        .expect("config");
        let sources = ProfileSources::new(&config);

        let held = sources.snapshot();
        assert_eq!(held.fhir_version(), FhirVersion::Stu3);

        sources.rebuild(FhirVersion::R4, Some(temp.path()));
        assert_eq!(held.fhir_version(), FhirVersion::Stu3);
        assert!(held.scope_directory().is_none());

        let current = sources.snapshot();
        assert_eq!(current.fhir_version(), FhirVersion::R4);
        assert_eq!(current.scope_directory(), Some(temp.path()));
    }
}
