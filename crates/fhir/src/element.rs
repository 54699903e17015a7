//! Navigable element tree with source positions.
//!
//! Both readers (`json`, `xml`) produce the same shape so location expressions can be
//! evaluated without caring which serialisation the resource arrived in:
//!
//! ```text
//! Patient                 (root, resource_type = Some("Patient"))
//! ├── id = "example"
//! ├── name
//! │   ├── family = "Chalmers"
//! │   ├── given = "Peter"
//! │   └── given = "James"
//! └── gender = "male"
//! ```
//!
//! Repeating elements appear as repeated same-named children, in document order.

use std::fmt;

/// A 1-based line/column pair in the original serialised text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourcePosition {
    pub line: u32,
    pub column: u32,
}

impl SourcePosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// One element of a parsed resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElementNode {
    name: String,
    resource_type: Option<String>,
    value: Option<String>,
    position: SourcePosition,
    children: Vec<ElementNode>,
}

impl ElementNode {
    pub fn new(name: impl Into<String>, position: SourcePosition) -> Self {
        Self {
            name: name.into(),
            resource_type: None,
            value: None,
            position,
            children: Vec::new(),
        }
    }

    pub fn with_value(
        name: impl Into<String>,
        value: impl Into<String>,
        position: SourcePosition,
    ) -> Self {
        let mut node = Self::new(name, position);
        node.value = Some(value.into());
        node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resource type when this element is itself a resource (root, contained, bundle entry).
    pub fn resource_type(&self) -> Option<&str> {
        self.resource_type.as_deref()
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn position(&self) -> SourcePosition {
        self.position
    }

    pub fn children(&self) -> &[ElementNode] {
        &self.children
    }

    /// Children with the given name, in document order.
    pub fn children_named<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a ElementNode> + 'n
    where
        'a: 'n,
    {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// First child with the given name.
    pub fn child(&self, name: &str) -> Option<&ElementNode> {
        self.children.iter().find(|child| child.name == name)
    }

    /// Primitive value of the first child with the given name.
    pub fn child_value(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(ElementNode::value)
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub(crate) fn set_value(&mut self, value: impl Into<String>) {
        self.value = Some(value.into());
    }

    pub(crate) fn set_resource_type(&mut self, resource_type: impl Into<String>) {
        self.resource_type = Some(resource_type.into());
    }

    pub(crate) fn push_child(&mut self, child: ElementNode) {
        self.children.push(child);
    }

    pub(crate) fn take_children(&mut self) -> Vec<ElementNode> {
        std::mem::take(&mut self.children)
    }

    pub(crate) fn extend_children(&mut self, children: Vec<ElementNode>) {
        self.children.extend(children);
    }

    /// Depth-first walk over this element and every descendant.
    pub fn descendants(&self) -> Descendants<'_> {
        Descendants { stack: vec![self] }
    }
}

/// Pre-order iterator returned by [`ElementNode::descendants`].
pub struct Descendants<'a> {
    stack: Vec<&'a ElementNode>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a ElementNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// Maps byte offsets in a text to 1-based line/column positions.
///
/// Columns count characters, not bytes, so multi-byte text lines up with what an editor shows.
pub(crate) struct LineIndex<'a> {
    text: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    pub(crate) fn new(text: &'a str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            text.bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(index, _)| index + 1),
        );
        Self { text, line_starts }
    }

    pub(crate) fn position(&self, offset: usize) -> SourcePosition {
        let offset = offset.min(self.text.len());
        let line_index = match self.line_starts.binary_search(&offset) {
            Ok(index) => index,
            Err(index) => index.saturating_sub(1),
        };
        let line_start = self.line_starts[line_index];
        let column = self
            .text
            .get(line_start..offset)
            .map(|prefix| {
                // A leading byte-order mark is not a visible column
                let prefix = if line_start == 0 {
                    prefix.strip_prefix('\u{feff}').unwrap_or(prefix)
                } else {
                    prefix
                };
                prefix.chars().count()
            })
            .unwrap_or(offset - line_start);

        SourcePosition::new(line_index as u32 + 1, column as u32 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_index_maps_offsets_to_one_based_positions() {
        let text = "ab\ncdé\nf";
        let index = LineIndex::new(text);
        assert_eq!(index.position(0), SourcePosition::new(1, 1));
        assert_eq!(index.position(1), SourcePosition::new(1, 2));
        assert_eq!(index.position(3), SourcePosition::new(2, 1));
        // 'é' is two bytes; 'f' sits at byte 8 on line 3
        assert_eq!(index.position(8), SourcePosition::new(3, 1));
        assert_eq!(index.position(99), SourcePosition::new(3, 2));
    }

    #[test]
    fn line_index_skips_a_leading_byte_order_mark() {
        let text = "\u{feff}{\n}";
        let index = LineIndex::new(text);
        assert_eq!(index.position(3), SourcePosition::new(1, 1));
        assert_eq!(index.position(5), SourcePosition::new(2, 1));
    }

    #[test]
    fn descendants_walk_in_document_order() {
        let mut root = ElementNode::new("Patient", SourcePosition::new(1, 1));
        let mut name = ElementNode::new("name", SourcePosition::new(2, 3));
        name.push_child(ElementNode::with_value(
            "given",
            "Peter",
            SourcePosition::new(3, 5),
        ));
        root.push_child(name);
        root.push_child(ElementNode::with_value(
            "gender",
            "male",
            SourcePosition::new(5, 3),
        ));

        let names: Vec<&str> = root.descendants().map(ElementNode::name).collect();
        assert_eq!(names, vec!["Patient", "name", "given", "gender"]);
        assert_eq!(root.child_value("gender"), Some("male"));
    }
}
