//! Resource serialisation format detection.

use std::fmt;

/// Serialisation format of a loaded resource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResourceFormat {
    Xml,
    Json,
    #[default]
    Unknown,
}

impl ResourceFormat {
    /// Classify raw resource text by its first significant character.
    ///
    /// Leading whitespace and a UTF-8 byte order mark are skipped. Text starting with `<` is
    /// XML, text starting with `{` is JSON, anything else (including empty text) is unknown.
    pub fn detect(text: &str) -> Self {
        let trimmed = text.trim_start_matches('\u{feff}').trim_start();
        match trimmed.chars().next() {
            Some('<') => ResourceFormat::Xml,
            Some('{') => ResourceFormat::Json,
            _ => ResourceFormat::Unknown,
        }
    }

    /// File extension used when the resource is written out for another process.
    ///
    /// Unknown content is written with an `xml` extension, matching what the external
    /// validator receives for anything that is not JSON.
    pub fn file_extension(self) -> &'static str {
        match self {
            ResourceFormat::Json => "json",
            ResourceFormat::Xml | ResourceFormat::Unknown => "xml",
        }
    }
}

impl fmt::Display for ResourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResourceFormat::Xml => "xml",
            ResourceFormat::Json => "json",
            ResourceFormat::Unknown => "unknown",
        };
        f.write_str(label)
    }
}
