//! Location expressions: the navigational subset of FHIRPath engines report issues against.
//!
//! Supported grammar:
//!
//! ```text
//! path    := segment ("." segment)*
//! segment := identifier ("[" index "]")?
//! ```
//!
//! Identifiers may be back-tick delimited. Evaluation follows FHIRPath collection
//! semantics for this subset: each segment selects the named children of every element
//! selected so far, and an index picks one element out of that whole collection.
//!
//! Function calls, operators and whitespace inside a path are rejected as invalid
//! expressions; callers treat that as "cannot resolve", never as a hard failure.

use crate::element::ElementNode;
use crate::{FhirError, FhirResult};
use std::fmt;
use std::str::FromStr;

/// One `name[index]` step of a location expression.
#[derive(Clone, Debug, PartialEq, Eq)]
struct PathSegment {
    name: String,
    index: Option<usize>,
}

/// A parsed location expression such as `Patient.name[0].given[1]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocationPath {
    segments: Vec<PathSegment>,
}

impl LocationPath {
    /// Parse a location expression.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidExpression`] if the text is empty or uses anything beyond
    /// dotted, optionally indexed, identifiers.
    pub fn parse(expression: &str) -> FhirResult<Self> {
        let invalid = |reason: &str| FhirError::InvalidExpression {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        let mut chars = expression.char_indices().peekable();

        loop {
            let mut name = String::new();
            if chars.peek().map(|(_, ch)| *ch) == Some('`') {
                chars.next();
                loop {
                    match chars.next() {
                        Some((_, '`')) => break,
                        Some((_, ch)) => name.push(ch),
                        None => return Err(invalid("unterminated delimited identifier")),
                    }
                }
            } else {
                while let Some((_, ch)) = chars.peek().copied() {
                    if ch.is_alphanumeric() || ch == '_' {
                        name.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
            }

            if name.is_empty() {
                return Err(invalid("expected an element name"));
            }

            let mut index = None;
            if chars.peek().map(|(_, ch)| *ch) == Some('[') {
                chars.next();
                let mut digits = String::new();
                while let Some((_, ch)) = chars.peek().copied() {
                    if ch.is_ascii_digit() {
                        digits.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if chars.next().map(|(_, ch)| ch) != Some(']') || digits.is_empty() {
                    return Err(invalid("index must be a non-negative integer in brackets"));
                }
                index = Some(
                    digits
                        .parse::<usize>()
                        .map_err(|_| invalid("index is out of range"))?,
                );
            }

            segments.push(PathSegment { name, index });

            match chars.next() {
                None => break,
                Some((_, '.')) => continue,
                Some((_, ch)) => return Err(invalid(&format!("unexpected character '{ch}'"))),
            }
        }

        Ok(Self { segments })
    }

    /// Evaluate this path against a resource, returning matches in document order.
    ///
    /// A leading segment equal to the root's name (or resource type) anchors at the root;
    /// otherwise evaluation starts from the root's children, as FHIRPath does for paths that
    /// omit the type. A segment with no exact child match falls back to choice-type children
    /// (`value` matches `valueQuantity`).
    pub fn select<'a>(&self, root: &'a ElementNode) -> Vec<&'a ElementNode> {
        let mut segments = self.segments.iter();
        let mut current: Vec<&'a ElementNode> = vec![root];

        if let Some(first) = self.segments.first() {
            let anchors_at_root = first.name == root.name()
                || root.resource_type() == Some(first.name.as_str());
            if anchors_at_root {
                segments.next();
                current = apply_index(current, first.index);
            }
        }

        for segment in segments {
            if current.is_empty() {
                break;
            }
            let mut selected: Vec<&'a ElementNode> = current
                .iter()
                .flat_map(|node| {
                    node.children()
                        .iter()
                        .filter(|child| child.name() == segment.name)
                })
                .collect();
            if selected.is_empty() {
                selected = current
                    .iter()
                    .flat_map(|node| node.children().iter())
                    .filter(|child| is_choice_of(child.name(), &segment.name))
                    .collect();
            }
            current = apply_index(selected, segment.index);
        }

        current
    }
}

fn apply_index(nodes: Vec<&ElementNode>, index: Option<usize>) -> Vec<&ElementNode> {
    match index {
        None => nodes,
        Some(index) => nodes.get(index).copied().into_iter().collect(),
    }
}

/// Type names a choice element (`value[x]`) can be suffixed with.
const CHOICE_TYPE_SUFFIXES: [&str; 54] = [
    "Base64Binary",
    "Boolean",
    "Canonical",
    "Code",
    "Date",
    "DateTime",
    "Decimal",
    "Id",
    "Instant",
    "Integer",
    "Integer64",
    "Markdown",
    "Oid",
    "PositiveInt",
    "String",
    "Time",
    "UnsignedInt",
    "Uri",
    "Url",
    "Uuid",
    "Address",
    "Age",
    "Annotation",
    "Attachment",
    "CodeableConcept",
    "CodeableReference",
    "Coding",
    "ContactPoint",
    "Count",
    "Distance",
    "Duration",
    "HumanName",
    "Identifier",
    "Money",
    "Period",
    "Quantity",
    "Range",
    "Ratio",
    "RatioRange",
    "Reference",
    "SampledData",
    "Signature",
    "Timing",
    "ContactDetail",
    "Contributor",
    "DataRequirement",
    "Expression",
    "ParameterDefinition",
    "RelatedArtifact",
    "TriggerDefinition",
    "UsageContext",
    "Dosage",
    "Meta",
    "Extension",
];

/// `valueQuantity` is a typed variant of the choice element `value`; `codeFilter` is not.
fn is_choice_of(candidate: &str, choice: &str) -> bool {
    candidate
        .strip_prefix(choice)
        .is_some_and(|suffix| CHOICE_TYPE_SUFFIXES.contains(&suffix))
}

impl FromStr for LocationPath {
    type Err = FhirError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LocationPath::parse(s)
    }
}

impl fmt::Display for LocationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, segment) in self.segments.iter().enumerate() {
            if position > 0 {
                f.write_str(".")?;
            }
            f.write_str(&segment.name)?;
            if let Some(index) = segment.index {
                write!(f, "[{index}]")?;
            }
        }
        Ok(())
    }
}
