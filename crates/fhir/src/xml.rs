//! XML reader producing an [`ElementNode`] tree with source positions.
//!
//! FHIR XML keeps primitive values in a `value` attribute and wraps contained resources in
//! an extra element named after their type:
//!
//! ```xml
//! <Bundle xmlns="http://hl7.org/fhir">
//!   <entry>
//!     <resource>
//!       <Patient>
//!         <active value="true"/>
//!       </Patient>
//!     </resource>
//!   </entry>
//! </Bundle>
//! ```
//!
//! The reader folds that wrapper away (`resource` adopts the `Patient` children and records
//! the type) so that location expressions written against the JSON shape
//! (`Bundle.entry[0].resource.active`) resolve against either serialisation. Attributes
//! other than `value` and namespace declarations become valued children positioned at their
//! element. An element's position is the `<` that opens its start tag.
//!
//! Parsing is permissive: mismatched end tags are tolerated and text content outside the
//! narrative is ignored.

use crate::element::{ElementNode, LineIndex};
use crate::{FhirError, FhirResult};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Parse FHIR XML text into an element tree.
///
/// # Errors
///
/// Returns [`FhirError::InvalidXml`] with the failing line/column for malformed markup the
/// reader cannot recover from, or when the document contains no root element.
pub fn parse(text: &str) -> FhirResult<ElementNode> {
    let lines = LineIndex::new(text);
    let mut reader = Reader::from_str(text);
    {
        let config = reader.config_mut();
        config.trim_text(true);
        config.check_end_names = false;
    }

    let mut stack: Vec<ElementNode> = Vec::new();
    let mut root: Option<ElementNode> = None;

    loop {
        let before = reader.buffer_position() as usize;
        let event = reader.read_event().map_err(|err| {
            let position = lines.position(reader.error_position() as usize);
            FhirError::InvalidXml {
                line: position.line,
                column: position.column,
                message: err.to_string(),
            }
        })?;

        match event {
            Event::Start(start) => {
                let offset = tag_offset(text, before);
                let node = start_element(&start, &lines, offset)?;
                stack.push(node);
            }
            Event::Empty(start) => {
                let offset = tag_offset(text, before);
                let node = start_element(&start, &lines, offset)?;
                close_element(node, &mut stack, &mut root);
            }
            Event::End(_) => {
                if let Some(node) = stack.pop() {
                    close_element(node, &mut stack, &mut root);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    // Unclosed elements at end of input are folded into their parents
    while let Some(node) = stack.pop() {
        close_element(node, &mut stack, &mut root);
    }

    root.ok_or_else(|| FhirError::InvalidXml {
        line: 1,
        column: 1,
        message: "document has no root element".into(),
    })
}

/// Byte offset of the `<` opening the tag read after `before`.
fn tag_offset(text: &str, before: usize) -> usize {
    text.get(before..)
        .and_then(|rest| rest.find('<'))
        .map(|relative| before + relative)
        .unwrap_or(before)
}

fn start_element(
    start: &BytesStart<'_>,
    lines: &LineIndex<'_>,
    offset: usize,
) -> FhirResult<ElementNode> {
    let position = lines.position(offset);
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut node = ElementNode::new(name, position);

    for attribute in start.attributes() {
        let attribute = attribute.map_err(|err| FhirError::InvalidXml {
            line: position.line,
            column: position.column,
            message: err.to_string(),
        })?;
        let key = attribute.key;
        if key.as_ref() == b"xmlns" || key.prefix().is_some() {
            continue;
        }
        let key = String::from_utf8_lossy(key.local_name().as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|err| FhirError::InvalidXml {
                line: position.line,
                column: position.column,
                message: err.to_string(),
            })?
            .into_owned();

        if key == "value" {
            node.set_value(value);
        } else {
            node.push_child(ElementNode::with_value(key, value, position));
        }
    }

    Ok(node)
}

fn close_element(
    mut node: ElementNode,
    stack: &mut Vec<ElementNode>,
    root: &mut Option<ElementNode>,
) {
    match stack.last_mut() {
        Some(parent) => {
            if is_resource_name(node.name()) && parent_wraps_resource(parent) {
                let resource_type = node.name().to_string();
                parent.set_resource_type(resource_type);
                let children = node.take_children();
                parent.extend_children(children);
            } else {
                parent.push_child(node);
            }
        }
        None => {
            if root.is_none() {
                let resource_type = node.name().to_string();
                node.set_resource_type(resource_type);
                *root = Some(node);
            }
        }
    }
}

/// Resource elements are the only FHIR XML elements whose names start upper-case.
fn is_resource_name(name: &str) -> bool {
    name.chars().next().is_some_and(|ch| ch.is_ascii_uppercase())
}

/// A wrapper holds exactly one resource and nothing else of its own.
fn parent_wraps_resource(parent: &ElementNode) -> bool {
    parent.resource_type().is_none() && parent.value().is_none() && parent.children().is_empty()
}
