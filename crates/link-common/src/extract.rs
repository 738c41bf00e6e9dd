/// Text extraction over document trees.
///
/// `leaves` walks every `Text` leaf in reading order, including text wrapped in links.
/// `extract_text` concatenates the leaves with no separator and records where each leaf
/// landed in the flattened string, so a match found in the flat text can be mapped back to
/// a (leaf, local offset) pair for injection. Offsets are UTF-8 byte offsets.
use crate::document::{DocumentNode, Text};

/// Child indices from the root down to a node.
pub type NodePath = Vec<usize>;

/// Structural context of a text leaf.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeafContext {
    pub in_link: bool,
    pub in_heading: bool,
}

#[derive(Debug, Clone)]
pub struct Leaf<'a> {
    pub path: NodePath,
    pub text: &'a Text,
    pub context: LeafContext,
}

/// Lazy depth-first iterator over text leaves. A clone continues from the same position;
/// call `leaves` again for a fresh pass.
#[derive(Debug, Clone)]
pub struct Leaves<'a> {
    stack: Vec<(&'a DocumentNode, NodePath, LeafContext)>,
}

pub fn leaves(node: &DocumentNode) -> Leaves<'_> {
    Leaves {
        stack: vec![(node, Vec::new(), LeafContext::default())],
    }
}

impl<'a> Iterator for Leaves<'a> {
    type Item = Leaf<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((node, path, context)) = self.stack.pop() {
            let context = match node {
                DocumentNode::Text(text) => {
                    return Some(Leaf {
                        path,
                        text,
                        context,
                    });
                }
                DocumentNode::Link(_) => LeafContext {
                    in_link: true,
                    ..context
                },
                DocumentNode::Heading(_) => LeafContext {
                    in_heading: true,
                    ..context
                },
                DocumentNode::Root(_)
                | DocumentNode::Paragraph(_)
                | DocumentNode::List(_)
                | DocumentNode::ListItem(_)
                | DocumentNode::Quote(_) => context,
                DocumentNode::LineBreak(_) | DocumentNode::Upload(_) | DocumentNode::Opaque(_) => {
                    continue;
                }
            };

            if let Some(children) = node.children() {
                for (index, child) in children.iter().enumerate().rev() {
                    let mut child_path = path.clone();
                    child_path.push(index);
                    self.stack.push((child, child_path, context));
                }
            }
        }
        None
    }
}

/// Where one leaf sits in the flattened text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafSpan {
    pub path: NodePath,
    pub start: usize,
    pub end: usize,
    pub context: LeafContext,
}

#[derive(Debug, Clone, Default)]
pub struct FlatText {
    pub text: String,
    pub spans: Vec<LeafSpan>,
}

impl FlatText {
    /// The leaf that fully contains `start..end`, if any. Empty leaves never match.
    pub fn leaf_containing(&self, start: usize, end: usize) -> Option<&LeafSpan> {
        if start >= end {
            return None;
        }
        // Leaves are sorted by start; find the last non-empty leaf starting at or before `start`.
        let idx = self.spans.partition_point(|leaf| leaf.start <= start);
        self.spans[..idx]
            .iter()
            .rev()
            .find(|leaf| leaf.end > leaf.start)
            .filter(|leaf| start < leaf.end && end <= leaf.end)
    }

    /// Index of the leaf span whose path equals `path`.
    pub fn position_of(&self, path: &[usize]) -> Option<usize> {
        self.spans.iter().position(|leaf| leaf.path == path)
    }
}

/// Flatten all text leaves under `node`.
pub fn extract_text(node: &DocumentNode) -> FlatText {
    let mut flat = FlatText::default();
    for leaf in leaves(node) {
        let start = flat.text.len();
        flat.text.push_str(&leaf.text.text);
        flat.spans.push(LeafSpan {
            path: leaf.path,
            start,
            end: flat.text.len(),
            context: leaf.context,
        });
    }
    flat
}

/// Readable plain text: block-level nodes are separated by a space and whitespace runs
/// collapse to one space. Used for summaries, hashing and statistics, not for offsets.
pub fn plain_text(node: &DocumentNode) -> String {
    let mut out = String::new();
    collect_plain(node, &mut out);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collect_plain(node: &DocumentNode, out: &mut String) {
    match node {
        DocumentNode::Text(text) => out.push_str(&text.text),
        DocumentNode::LineBreak(_) => out.push(' '),
        DocumentNode::Root(e) | DocumentNode::List(e) => {
            for child in &e.children {
                collect_plain(child, out);
            }
        }
        DocumentNode::Link(link) => {
            for child in &link.children {
                collect_plain(child, out);
            }
        }
        DocumentNode::Paragraph(e)
        | DocumentNode::Heading(e)
        | DocumentNode::ListItem(e)
        | DocumentNode::Quote(e) => {
            for child in &e.children {
                collect_plain(child, out);
            }
            out.push(' ');
        }
        DocumentNode::Upload(_) | DocumentNode::Opaque(_) => {}
    }
}
