/// Link injection and removal.
///
/// Spans are byte ranges into the flattened text produced by `extract::extract_text`. A span
/// is injected by splitting the text leaf that contains it into up to three pieces (before,
/// link, after), each keeping the leaf's formatting. Leaves are rewritten in reverse document
/// order so that paths of leaves not yet processed stay valid.
///
/// The flattened text of the result always equals the flattened text of the input.
use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::document::{DocumentNode, Link, LinkTarget};
use crate::error::CommonError;
use crate::extract::{extract_text, LeafSpan};
use crate::matcher::MatchSpan;

/// A matched span and the target it should link to.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpan {
    pub span: MatchSpan,
    pub target: LinkTarget,
}

#[derive(Debug, Clone)]
pub struct InjectOptions {
    /// Allow several links to the same target within one document.
    pub allow_duplicate_targets: bool,
    pub max_links: Option<usize>,
    pub link_in_headings: bool,
}

impl Default for InjectOptions {
    fn default() -> Self {
        Self {
            allow_duplicate_targets: false,
            max_links: None,
            link_in_headings: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppliedLink {
    pub target: LinkTarget,
    pub anchor_text: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Overlap,
    SelfLink,
    DuplicateTarget,
    LimitReached,
    InvalidRange,
    MalformedTarget,
    CrossesLeaf,
    InsideLink,
    InsideHeading,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedSpan {
    pub span: MatchSpan,
    pub reason: SkipReason,
}

#[derive(Debug, Clone)]
pub struct Injection {
    pub document: DocumentNode,
    pub applied: Vec<AppliedLink>,
    pub skipped: Vec<SkippedSpan>,
}

/// Wrap each accepted span in a link node.
///
/// Spans are considered by start position (longer first on ties). A span is skipped when it
/// is out of range or does not match the text, has a malformed target, links to
/// `source_id`, overlaps an accepted span, crosses a leaf boundary, sits inside an existing
/// link (or a heading, unless allowed), targets something already linked, or exceeds
/// `max_links`. Targets already linked in the input count as used.
pub fn inject_links(
    root: &DocumentNode,
    source_id: Option<&str>,
    mut spans: Vec<LinkSpan>,
    options: &InjectOptions,
) -> Result<Injection, CommonError> {
    if !root.is_root() {
        return Err(CommonError::MalformedNode(format!(
            "cannot inject into a {:?} node",
            root.kind()
        )));
    }

    let flat = extract_text(root);
    let mut used_targets = if options.allow_duplicate_targets {
        HashSet::new()
    } else {
        link_targets(root)
    };

    spans.sort_by(|a, b| {
        a.span
            .start
            .cmp(&b.span.start)
            .then_with(|| b.span.len().cmp(&a.span.len()))
    });

    let mut skipped = Vec::new();
    // Leaf index in `flat.spans` → spans accepted in that leaf, in order.
    let mut by_leaf: BTreeMap<usize, Vec<LinkSpan>> = BTreeMap::new();
    let mut accepted_count = 0usize;
    let mut accepted_end = 0usize;

    for link_span in spans {
        let span = &link_span.span;
        let reason = 'check: {
            let in_range = span.start < span.end
                && flat.text.get(span.start..span.end) == Some(span.phrase.as_str());
            if !in_range {
                break 'check Some(SkipReason::InvalidRange);
            }
            if link_span.target.validate().is_err() {
                break 'check Some(SkipReason::MalformedTarget);
            }
            if matches!(&link_span.target, LinkTarget::Article(id) if Some(id.as_str()) == source_id) {
                break 'check Some(SkipReason::SelfLink);
            }
            if accepted_count > 0 && span.start < accepted_end {
                break 'check Some(SkipReason::Overlap);
            }
            let Some(leaf) = flat.leaf_containing(span.start, span.end) else {
                break 'check Some(SkipReason::CrossesLeaf);
            };
            if leaf.context.in_link {
                break 'check Some(SkipReason::InsideLink);
            }
            if leaf.context.in_heading && !options.link_in_headings {
                break 'check Some(SkipReason::InsideHeading);
            }
            if used_targets.contains(&link_span.target) {
                break 'check Some(SkipReason::DuplicateTarget);
            }
            if options.max_links.is_some_and(|max| accepted_count >= max) {
                break 'check Some(SkipReason::LimitReached);
            }
            None
        };

        if let Some(reason) = reason {
            debug!(phrase = %span.phrase, start = span.start, ?reason, "span skipped");
            skipped.push(SkippedSpan {
                span: span.clone(),
                reason,
            });
            continue;
        }

        let Some(leaf) = flat.leaf_containing(span.start, span.end) else {
            continue;
        };
        let Some(leaf_index) = flat.position_of(&leaf.path) else {
            continue;
        };
        if !options.allow_duplicate_targets {
            used_targets.insert(link_span.target.clone());
        }
        accepted_count += 1;
        accepted_end = span.end;
        by_leaf.entry(leaf_index).or_default().push(link_span);
    }

    let mut document = root.clone();
    let mut applied = Vec::new();
    for (leaf_index, leaf_spans) in by_leaf.into_iter().rev() {
        let leaf = &flat.spans[leaf_index];
        match split_leaf(&mut document, leaf, &leaf_spans) {
            Ok(()) => applied.extend(leaf_spans.into_iter().map(|s| AppliedLink {
                anchor_text: s.span.phrase,
                start: s.span.start,
                end: s.span.end,
                target: s.target,
            })),
            Err(e) => {
                warn!(path = ?leaf.path, error = %e, "could not rewrite text leaf");
                skipped.extend(leaf_spans.into_iter().map(|s| SkippedSpan {
                    span: s.span,
                    reason: SkipReason::InvalidRange,
                }));
            }
        }
    }
    applied.sort_by_key(|a| a.start);

    Ok(Injection {
        document,
        applied,
        skipped,
    })
}

/// Replace the text leaf at `leaf.path` with alternating text and link pieces.
fn split_leaf(document: &mut DocumentNode, leaf: &LeafSpan, spans: &[LinkSpan]) -> Result<(), CommonError> {
    let Some((&index, parent_path)) = leaf.path.split_last() else {
        return Err(CommonError::MalformedNode("text leaf has no parent".to_string()));
    };
    let text = match document.node_at(&leaf.path) {
        Some(DocumentNode::Text(text)) => text.clone(),
        other => {
            return Err(CommonError::MalformedNode(format!(
                "expected text at {:?}, found {:?}",
                leaf.path,
                other.map(DocumentNode::kind)
            )))
        }
    };

    let mut pieces = Vec::with_capacity(spans.len() * 2 + 1);
    let mut cursor = 0usize;
    for link_span in spans {
        let start = link_span.span.start - leaf.start;
        let end = link_span.span.end - leaf.start;
        let (Some(before), Some(anchor)) = (text.text.get(cursor..start), text.text.get(start..end)) else {
            return Err(CommonError::InvalidSpan {
                start: link_span.span.start,
                end: link_span.span.end,
                reason: "span does not fall on character boundaries of its leaf".to_string(),
            });
        };
        if !before.is_empty() {
            pieces.push(DocumentNode::Text(text.with_text(before)));
        }
        pieces.push(DocumentNode::Link(Link::new(
            &link_span.target,
            vec![DocumentNode::Text(text.with_text(anchor))],
        )));
        cursor = end;
    }
    let rest = &text.text[cursor..];
    if !rest.is_empty() {
        pieces.push(DocumentNode::Text(text.with_text(rest)));
    }

    let children = document
        .children_at_mut(parent_path)
        .ok_or_else(|| CommonError::MalformedNode(format!("no parent at {parent_path:?}")))?;
    if index >= children.len() {
        return Err(CommonError::MalformedNode(format!("no child {index} at {parent_path:?}")));
    }
    children.splice(index..=index, pieces);
    Ok(())
}

/// Targets of all links in the tree that carry usable target metadata.
pub fn link_targets(root: &DocumentNode) -> HashSet<LinkTarget> {
    let mut targets = HashSet::new();
    root.visit(&mut |node| {
        if let DocumentNode::Link(link) = node {
            if let Some(target) = link.target() {
                targets.insert(target);
            }
        }
    });
    targets
}

/// Which links `remove_links` unwraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFilter {
    Internal,
    External,
    Sponsored,
    All,
}

impl LinkFilter {
    fn matches(self, link: &Link) -> bool {
        match (self, link.target()) {
            (LinkFilter::All, _) => true,
            (LinkFilter::Internal, Some(LinkTarget::Article(_))) => true,
            (LinkFilter::External, Some(LinkTarget::External { .. })) => true,
            (LinkFilter::Sponsored, Some(LinkTarget::External { sponsored, .. })) => sponsored,
            _ => false,
        }
    }
}

/// Replace matching links with their children and merge the adjacent text nodes this
/// leaves behind. Returns the new tree and the number of links removed.
pub fn remove_links(root: &DocumentNode, filter: LinkFilter) -> (DocumentNode, usize) {
    let mut document = root.clone();
    let removed = match document.children_mut() {
        Some(children) => unwrap_links(children, filter),
        None => 0,
    };
    (document, removed)
}

fn unwrap_links(children: &mut Vec<DocumentNode>, filter: LinkFilter) -> usize {
    let mut removed = 0;
    let mut unwrapped_here = false;
    let mut out = Vec::with_capacity(children.len());

    for mut child in std::mem::take(children) {
        if let Some(grandchildren) = child.children_mut() {
            removed += unwrap_links(grandchildren, filter);
        }
        match child {
            DocumentNode::Link(link) if filter.matches(&link) => {
                removed += 1;
                unwrapped_here = true;
                out.extend(link.children);
            }
            other => out.push(other),
        }
    }

    if unwrapped_here {
        out = merge_adjacent_text(out);
    }
    *children = out;
    removed
}

fn merge_adjacent_text(nodes: Vec<DocumentNode>) -> Vec<DocumentNode> {
    let mut merged: Vec<DocumentNode> = Vec::with_capacity(nodes.len());
    for node in nodes {
        if let (Some(DocumentNode::Text(prev)), DocumentNode::Text(next)) = (merged.last_mut(), &node) {
            if prev.same_format(next) {
                prev.text.push_str(&next.text);
                continue;
            }
        }
        merged.push(node);
    }
    merged
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkCounts {
    pub internal: usize,
    pub external: usize,
    pub sponsored: usize,
}

pub fn count_links(root: &DocumentNode) -> LinkCounts {
    let mut counts = LinkCounts::default();
    root.visit(&mut |node| {
        if let DocumentNode::Link(link) = node {
            match link.target() {
                Some(LinkTarget::Article(_)) => counts.internal += 1,
                Some(LinkTarget::External { sponsored, .. }) => {
                    counts.external += 1;
                    if sponsored {
                        counts.sponsored += 1;
                    }
                }
                None => {}
            }
        }
    });
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article(id: &str) -> LinkTarget {
        LinkTarget::Article(id.to_string())
    }

    fn span(text: &str, phrase: &str, target: LinkTarget) -> LinkSpan {
        let start = text.find(phrase).unwrap();
        LinkSpan {
            span: MatchSpan {
                start,
                end: start + phrase.len(),
                phrase: phrase.to_string(),
                confidence: 1.0,
            },
            target,
        }
    }

    fn doc(paragraph: &str) -> DocumentNode {
        DocumentNode::root(vec![DocumentNode::paragraph(vec![DocumentNode::text(paragraph)])])
    }

    #[test]
    fn injects_link_at_start_of_paragraph() {
        let root = doc("Golf clubs are great.");
        let spans = vec![span("Golf clubs are great.", "Golf", article("12"))];
        let result = inject_links(&root, Some("1"), spans, &InjectOptions::default()).unwrap();

        assert_eq!(result.applied.len(), 1);
        assert_eq!(result.applied[0].start, 0);
        assert_eq!(result.applied[0].end, 4);

        let paragraph = result.document.node_at(&[0]).unwrap().children().unwrap();
        assert_eq!(paragraph.len(), 2);
        let DocumentNode::Link(link) = &paragraph[0] else {
            panic!("expected a link first, got {}", paragraph[0].kind());
        };
        assert_eq!(link.target(), Some(article("12")));
        assert_eq!(link.children, vec![DocumentNode::text("Golf")]);
        assert_eq!(paragraph[1], DocumentNode::text(" clubs are great."));
        assert_eq!(extract_text(&result.document).text, "Golf clubs are great.");
    }

    #[test]
    fn no_spans_leave_document_unchanged() {
        let root = doc("スイングの基本");
        let result = inject_links(&root, None, Vec::new(), &InjectOptions::default()).unwrap();
        assert_eq!(result.document, root);
        assert!(result.applied.is_empty());
    }

    #[test]
    fn overlapping_spans_first_wins() {
        let text = "ドライバーショットの練習";
        let root = doc(text);
        let spans = vec![
            span(text, "ショット", article("3")),
            span(text, "ドライバーショット", article("2")),
        ];
        let result = inject_links(&root, None, spans, &InjectOptions::default()).unwrap();
        assert_eq!(result.applied.len(), 1);
        assert_eq!(result.applied[0].anchor_text, "ドライバーショット");
        assert_eq!(result.skipped[0].reason, SkipReason::Overlap);
        assert_eq!(extract_text(&result.document).text, text);
    }

    #[test]
    fn several_links_in_one_leaf_keep_formatting() {
        let text = "グリップとスタンスを確認";
        let mut leaf = crate::document::Text::new(text);
        leaf.format = 2;
        let root = DocumentNode::root(vec![DocumentNode::paragraph(vec![DocumentNode::Text(leaf)])]);
        let spans = vec![
            span(text, "スタンス", article("5")),
            span(text, "グリップ", article("4")),
        ];
        let result = inject_links(&root, None, spans, &InjectOptions::default()).unwrap();
        assert_eq!(result.applied.len(), 2);

        let paragraph = result.document.node_at(&[0]).unwrap().children().unwrap();
        let kinds: Vec<&str> = paragraph.iter().map(DocumentNode::kind).collect();
        assert_eq!(kinds, vec!["link", "text", "link", "text"]);
        let DocumentNode::Text(piece) = &paragraph[1] else {
            panic!("expected text");
        };
        assert_eq!(piece.format, 2);
        assert_eq!(extract_text(&result.document).text, text);
    }

    #[test]
    fn self_links_and_malformed_targets_are_skipped() {
        let text = "パターの選び方";
        let root = doc(text);
        let spans = vec![
            span(text, "パター", article("7")),
            span(text, "選び方", LinkTarget::External { url: " ".to_string(), sponsored: true }),
        ];
        let result = inject_links(&root, Some("7"), spans, &InjectOptions::default()).unwrap();
        assert!(result.applied.is_empty());
        let reasons: Vec<SkipReason> = result.skipped.iter().map(|s| s.reason).collect();
        assert_eq!(reasons, vec![SkipReason::SelfLink, SkipReason::MalformedTarget]);
        assert_eq!(result.document, root);
    }

    #[test]
    fn existing_links_block_duplicates_and_nesting() {
        let root = DocumentNode::root(vec![DocumentNode::paragraph(vec![
            DocumentNode::link(&article("9"), vec![DocumentNode::text("バンカー")]),
            DocumentNode::text("からのバンカーショット"),
        ])]);
        let flat = extract_text(&root).text;
        let inside = span(&flat, "バンカー", article("8"));
        let duplicate = span(&flat, "ショット", article("9"));

        let result = inject_links(&root, None, vec![inside, duplicate], &InjectOptions::default()).unwrap();
        let reasons: Vec<SkipReason> = result.skipped.iter().map(|s| s.reason).collect();
        assert_eq!(reasons, vec![SkipReason::InsideLink, SkipReason::DuplicateTarget]);
    }

    #[test]
    fn spans_across_leaves_or_out_of_range_are_skipped() {
        let root = DocumentNode::root(vec![
            DocumentNode::heading("h2", vec![DocumentNode::text("アイアン")]),
            DocumentNode::paragraph(vec![DocumentNode::text("ゴルフ"), DocumentNode::text("クラブ")]),
        ]);
        let flat = extract_text(&root).text;
        let heading = span(&flat, "アイアン", article("1"));
        let straddling = span(&flat, "ゴルフクラブ", article("2"));
        let bogus = LinkSpan {
            span: MatchSpan {
                start: 0,
                end: 1000,
                phrase: "x".to_string(),
                confidence: 0.0,
            },
            target: article("3"),
        };
        let result =
            inject_links(&root, None, vec![heading, straddling, bogus], &InjectOptions::default()).unwrap();
        assert!(result.applied.is_empty());
        let mut reasons: Vec<SkipReason> = result.skipped.iter().map(|s| s.reason).collect();
        reasons.sort_by_key(|r| format!("{r:?}"));
        assert_eq!(
            reasons,
            vec![SkipReason::CrossesLeaf, SkipReason::InsideHeading, SkipReason::InvalidRange]
        );
    }

    #[test]
    fn link_limit_is_enforced() {
        let text = "ティーとボールとグリーン";
        let root = doc(text);
        let spans = vec![
            span(text, "ティー", article("1")),
            span(text, "ボール", article("2")),
            span(text, "グリーン", article("3")),
        ];
        let options = InjectOptions {
            max_links: Some(2),
            ..InjectOptions::default()
        };
        let result = inject_links(&root, None, spans, &options).unwrap();
        assert_eq!(result.applied.len(), 2);
        assert_eq!(result.skipped[0].reason, SkipReason::LimitReached);
        assert_eq!(count_links(&result.document).internal, 2);
    }

    #[test]
    fn removing_links_restores_plain_text() {
        let text = "ゴルフ場とスコア";
        let root = doc(text);
        let spans = vec![
            span(text, "スコア", article("1")),
            span(
                text,
                "ゴルフ場",
                LinkTarget::External {
                    url: "https://example.com/p".to_string(),
                    sponsored: true,
                },
            ),
        ];
        let linked = inject_links(&root, None, spans, &InjectOptions::default()).unwrap().document;
        let counts = count_links(&linked);
        assert_eq!((counts.internal, counts.external, counts.sponsored), (1, 1, 1));

        let (internal_removed, n) = remove_links(&linked, LinkFilter::Internal);
        assert_eq!(n, 1);
        assert_eq!(count_links(&internal_removed).external, 1);

        let (cleaned, n) = remove_links(&linked, LinkFilter::All);
        assert_eq!(n, 2);
        assert_eq!(cleaned, root);
    }
}
