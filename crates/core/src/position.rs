//! Position resolution: map an engine's location text back to a line/column in the document.
//!
//! Resolution order for one native issue:
//! 1. line/column extensions the engine attached itself
//! 2. the first reported location (or expression), sanitised and evaluated against the parsed
//!    document; the first match's source position wins
//!
//! Anything that cannot be resolved leaves the position empty. That is a normal outcome, not an
//! error.

use crate::constants::DOCUMENT_LOCATION_MARKER;
use fhir::{ElementNode, LocationPath, OutcomeIssue, SourcePosition};

/// Reduce a raw engine location to an evaluable path.
///
/// The document marker maps to the root element name. Engines append parenthesised position
/// annotations (`Patient.name[0] (line 4, col 3)`); everything from the first `(` onwards is
/// discarded. Returns `None` when nothing usable remains.
pub fn sanitize_location(raw: &str, root_name: &str) -> Option<String> {
    if raw.trim() == DOCUMENT_LOCATION_MARKER {
        return Some(root_name.to_string());
    }

    raw.split('(')
        .find(|part| !part.is_empty())
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
}

/// Resolve the source position of a native issue.
///
/// `document` is the parsed resource, or `None` when the text could not be parsed (in which
/// case only engine-reported positions can be used).
pub fn resolve_position(
    issue: &OutcomeIssue,
    document: Option<&ElementNode>,
) -> Option<SourcePosition> {
    if let Some(position) = issue.reported_position() {
        return Some(position);
    }

    let document = document?;
    let raw = issue.location.first().or_else(|| issue.expression.first())?;
    let location = sanitize_location(raw, document.name())?;

    let path = match LocationPath::parse(&location) {
        Ok(path) => path,
        Err(err) => {
            tracing::debug!("unresolvable location '{}': {}", raw, err);
            return None;
        }
    };

    let position = path.select(document).first().map(|node| node.position());
    if position.is_none() {
        tracing::debug!("location '{}' matched no element", location);
    }
    position
}
