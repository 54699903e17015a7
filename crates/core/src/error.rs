#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("no resource has been loaded")]
    NoDocumentLoaded,
    #[error("validation must be started from within a tokio runtime")]
    NoRuntime,
    #[error("this resource format isn't recognized")]
    UnrecognizedFormat,

    #[error("{0}")]
    Document(#[from] fhir::FhirError),
    #[error("{0}")]
    Validator(String),

    #[error("failed to create temporary file: {0}")]
    TempFile(std::io::Error),
    #[error("failed to read validator output: {0}")]
    OutputRead(std::io::Error),
    #[error("failed to read definitions: {0}")]
    FileRead(std::io::Error),
    #[error("failed to launch validator: {0}")]
    Launch(std::io::Error),

    #[error("failed to read specification archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("terminology server request failed: {0}")]
    Terminology(#[from] reqwest::Error),
    #[error("terminology server returned an unexpected response: {0}")]
    TerminologyResponse(String),
}

impl CoreError {
    /// Short category name embedded in synthetic issue messages (`"<category>: <message>"`).
    pub fn category(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "InvalidInput",
            CoreError::NoDocumentLoaded => "NoDocumentLoaded",
            CoreError::NoRuntime => "NoRuntime",
            CoreError::UnrecognizedFormat => "FormatError",
            CoreError::Document(fhir::FhirError::InvalidJson { .. })
            | CoreError::Document(fhir::FhirError::InvalidXml { .. }) => "FormatError",
            CoreError::Document(_) => "DocumentError",
            CoreError::Validator(_) => "ValidatorError",
            CoreError::TempFile(_)
            | CoreError::OutputRead(_)
            | CoreError::FileRead(_)
            | CoreError::Launch(_) => "IoError",
            CoreError::Archive(_) => "ArchiveError",
            CoreError::Terminology(_) | CoreError::TerminologyResponse(_) => "TerminologyError",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
