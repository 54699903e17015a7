//! Lenient JSON reader producing an [`ElementNode`] tree with source positions.
//!
//! The reader accepts what a permissive FHIR JSON parser accepts: `//` and `/* */`
//! comments, and trailing commas in objects and arrays. Positions are recorded as it reads,
//! so every element in the tree can be traced back to the line and column it came from.
//!
//! Mapping rules:
//! - the root object's `resourceType` names the root element
//! - nested objects carrying `resourceType` (contained resources, bundle entries) keep their
//!   property name and record the type separately
//! - arrays become repeated same-named children
//! - `_name` companion properties and `null` values are not navigable and are dropped
//!
//! A property's position is its key's opening quote; an array item's position is the first
//! character of the item.

use crate::element::{ElementNode, LineIndex};
use crate::{FhirError, FhirResult};

const RESOURCE_TYPE_KEY: &str = "resourceType";

/// Parse FHIR JSON text into an element tree.
///
/// # Errors
///
/// Returns [`FhirError::InvalidJson`] with the failing line/column when the text is not
/// recoverable JSON, or when the top-level value is not an object with a `resourceType`.
pub fn parse(text: &str) -> FhirResult<ElementNode> {
    let mut reader = JsonReader::new(text);
    reader.skip_trivia()?;
    let root = reader.read_value()?;
    reader.skip_trivia()?;
    if reader.peek().is_some() {
        return Err(reader.error_at(reader.offset, "unexpected content after the resource"));
    }

    let JsonValue::Object(members) = root.value else {
        return Err(reader.error_at(root.start, "a resource must be a JSON object"));
    };

    let resource_type = members
        .iter()
        .find(|member| member.key == RESOURCE_TYPE_KEY)
        .and_then(|member| match &member.value.value {
            JsonValue::Primitive(value) => Some(value.clone()),
            _ => None,
        })
        .ok_or_else(|| reader.error_at(root.start, "resource has no resourceType property"))?;

    let position = reader.lines.position(root.start);
    let mut node = object_to_node(&resource_type, position, members, &reader.lines);
    node.set_name(resource_type);
    Ok(node)
}

#[derive(Debug)]
enum JsonValue {
    Object(Vec<Member>),
    Array(Vec<Spanned>),
    Primitive(String),
    Null,
}

#[derive(Debug)]
struct Spanned {
    value: JsonValue,
    start: usize,
}

#[derive(Debug)]
struct Member {
    key: String,
    key_start: usize,
    value: Spanned,
}

fn object_to_node(
    name: &str,
    position: crate::SourcePosition,
    members: Vec<Member>,
    lines: &LineIndex<'_>,
) -> ElementNode {
    let mut node = ElementNode::new(name, position);

    for member in members {
        if member.key == RESOURCE_TYPE_KEY {
            if let JsonValue::Primitive(resource_type) = member.value.value {
                node.set_resource_type(resource_type);
            }
            continue;
        }
        if member.key.starts_with('_') {
            continue;
        }

        match member.value.value {
            JsonValue::Array(items) => {
                for item in items {
                    let item_position = lines.position(item.start);
                    if let Some(child) = value_to_node(&member.key, item_position, item.value, lines)
                    {
                        node.push_child(child);
                    }
                }
            }
            value => {
                let key_position = lines.position(member.key_start);
                if let Some(child) = value_to_node(&member.key, key_position, value, lines) {
                    node.push_child(child);
                }
            }
        }
    }

    node
}

fn value_to_node(
    name: &str,
    position: crate::SourcePosition,
    value: JsonValue,
    lines: &LineIndex<'_>,
) -> Option<ElementNode> {
    match value {
        JsonValue::Object(members) => Some(object_to_node(name, position, members, lines)),
        JsonValue::Primitive(text) => Some(ElementNode::with_value(name, text, position)),
        // Nested arrays have no FHIR meaning
        JsonValue::Array(_) | JsonValue::Null => None,
    }
}

struct JsonReader<'a> {
    text: &'a str,
    offset: usize,
    lines: LineIndex<'a>,
}

impl<'a> JsonReader<'a> {
    fn new(text: &'a str) -> Self {
        let offset = if text.starts_with('\u{feff}') { 3 } else { 0 };
        Self {
            text,
            offset,
            lines: LineIndex::new(text),
        }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.offset..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.offset += ch.len_utf8();
        Some(ch)
    }

    fn rest(&self) -> &'a str {
        &self.text[self.offset..]
    }

    fn error_at(&self, offset: usize, message: impl Into<String>) -> FhirError {
        let position = self.lines.position(offset);
        FhirError::InvalidJson {
            line: position.line,
            column: position.column,
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: char) -> FhirResult<()> {
        match self.peek() {
            Some(ch) if ch == expected => {
                self.bump();
                Ok(())
            }
            Some(ch) => Err(self.error_at(
                self.offset,
                format!("expected '{expected}' but found '{ch}'"),
            )),
            None => Err(self.error_at(
                self.offset,
                format!("expected '{expected}' but reached the end of input"),
            )),
        }
    }

    /// Skip whitespace and comments.
    fn skip_trivia(&mut self) -> FhirResult<()> {
        loop {
            let rest = self.rest();
            let trimmed = rest.trim_start();
            self.offset += rest.len() - trimmed.len();

            if trimmed.starts_with("//") {
                let end = trimmed.find('\n').unwrap_or(trimmed.len());
                self.offset += end;
            } else if trimmed.starts_with("/*") {
                let comment_start = self.offset;
                match trimmed[2..].find("*/") {
                    Some(end) => self.offset += end + 4,
                    None => return Err(self.error_at(comment_start, "unterminated comment")),
                }
            } else {
                return Ok(());
            }
        }
    }

    fn read_value(&mut self) -> FhirResult<Spanned> {
        self.skip_trivia()?;
        let start = self.offset;
        let value = match self.peek() {
            Some('{') => self.read_object()?,
            Some('[') => self.read_array()?,
            Some('"') => JsonValue::Primitive(self.read_string()?),
            Some('t') => self.read_literal("true", JsonValue::Primitive("true".into()))?,
            Some('f') => self.read_literal("false", JsonValue::Primitive("false".into()))?,
            Some('n') => self.read_literal("null", JsonValue::Null)?,
            Some(ch) if ch == '-' || ch.is_ascii_digit() => self.read_number(),
            Some(ch) => return Err(self.error_at(start, format!("unexpected character '{ch}'"))),
            None => return Err(self.error_at(start, "unexpected end of input")),
        };
        Ok(Spanned { value, start })
    }

    fn read_object(&mut self) -> FhirResult<JsonValue> {
        self.expect('{')?;
        let mut members = Vec::new();

        loop {
            self.skip_trivia()?;
            if self.peek() == Some('}') {
                self.bump();
                break;
            }

            let key_start = self.offset;
            if self.peek() != Some('"') {
                return Err(self.error_at(key_start, "expected a quoted property name"));
            }
            let key = self.read_string()?;
            self.skip_trivia()?;
            self.expect(':')?;
            let value = self.read_value()?;
            members.push(Member {
                key,
                key_start,
                value,
            });

            self.skip_trivia()?;
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some('}') => {
                    self.bump();
                    break;
                }
                _ => return Err(self.error_at(self.offset, "expected ',' or '}' in object")),
            }
        }

        Ok(JsonValue::Object(members))
    }

    fn read_array(&mut self) -> FhirResult<JsonValue> {
        self.expect('[')?;
        let mut items = Vec::new();

        loop {
            self.skip_trivia()?;
            if self.peek() == Some(']') {
                self.bump();
                break;
            }

            items.push(self.read_value()?);

            self.skip_trivia()?;
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(']') => {
                    self.bump();
                    break;
                }
                _ => return Err(self.error_at(self.offset, "expected ',' or ']' in array")),
            }
        }

        Ok(JsonValue::Array(items))
    }

    fn read_string(&mut self) -> FhirResult<String> {
        let start = self.offset;
        self.expect('"')?;
        let mut value = String::new();

        loop {
            match self.bump() {
                Some('"') => return Ok(value),
                Some('\\') => {
                    let escape_start = self.offset - 1;
                    match self.bump() {
                        Some('"') => value.push('"'),
                        Some('\\') => value.push('\\'),
                        Some('/') => value.push('/'),
                        Some('b') => value.push('\u{0008}'),
                        Some('f') => value.push('\u{000c}'),
                        Some('n') => value.push('\n'),
                        Some('r') => value.push('\r'),
                        Some('t') => value.push('\t'),
                        Some('u') => value.push(self.read_unicode_escape(escape_start)?),
                        _ => return Err(self.error_at(escape_start, "invalid escape sequence")),
                    }
                }
                Some(ch) => value.push(ch),
                None => return Err(self.error_at(start, "unterminated string")),
            }
        }
    }

    fn read_hex4(&mut self, escape_start: usize) -> FhirResult<u32> {
        let digits = self.rest().get(..4).unwrap_or_default();
        let code = u32::from_str_radix(digits, 16)
            .map_err(|_| self.error_at(escape_start, "invalid unicode escape"))?;
        self.offset += 4;
        Ok(code)
    }

    fn read_unicode_escape(&mut self, escape_start: usize) -> FhirResult<char> {
        let high = self.read_hex4(escape_start)?;
        if (0xD800..0xDC00).contains(&high) && self.rest().starts_with("\\u") {
            let checkpoint = self.offset;
            self.offset += 2;
            let low = self.read_hex4(escape_start)?;
            if (0xDC00..0xE000).contains(&low) {
                let combined = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                return Ok(char::from_u32(combined).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            self.offset = checkpoint;
        }
        Ok(char::from_u32(high).unwrap_or(char::REPLACEMENT_CHARACTER))
    }

    fn read_literal(&mut self, literal: &str, value: JsonValue) -> FhirResult<JsonValue> {
        if self.rest().starts_with(literal) {
            self.offset += literal.len();
            Ok(value)
        } else {
            Err(self.error_at(self.offset, format!("expected '{literal}'")))
        }
    }

    fn read_number(&mut self) -> JsonValue {
        let rest = self.rest();
        let len = rest
            .find(|ch: char| !(ch.is_ascii_digit() || matches!(ch, '-' | '+' | '.' | 'e' | 'E')))
            .unwrap_or(rest.len());
        self.offset += len;
        JsonValue::Primitive(rest[..len].to_string())
    }
}
