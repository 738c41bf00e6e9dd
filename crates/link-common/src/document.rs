/// Article body model.
///
/// Bodies are stored by the CMS as Lexical editor state: `{"root": {"type": "root", ...}}`.
/// `DocumentNode` is a closed tagged union over the node kinds the pipeline understands.
/// Anything else (blocks, horizontal rules, autolinks, malformed nodes) becomes `Opaque`
/// and is written back verbatim without being descended into.
///
/// Every typed node keeps the attributes it does not model in `attrs`, so that a
/// parse/serialize cycle does not lose `version`, `direction`, `indent`, `style` and friends.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::CommonError;

/// Unmodelled JSON attributes of a node.
pub type Attrs = Map<String, Value>;

/// Relation name of the article collection in internal link fields.
pub const ARTICLE_RELATION: &str = "posts";

/// `rel` attribute written on affiliate product links.
pub const SPONSORED_REL: &str = "nofollow sponsored";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum DocumentNode {
    Root(Element),
    Paragraph(Element),
    Heading(Element),
    List(Element),
    ListItem(Element),
    Quote(Element),
    Link(Link),
    Text(Text),
    LineBreak(Attrs),
    Upload(Upload),
    Opaque(Value),
}

/// A container node: an ordered child list plus its attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Element {
    #[serde(default)]
    pub children: Vec<DocumentNode>,
    #[serde(flatten)]
    pub attrs: Attrs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Text {
    pub text: String,
    /// Lexical format bit flags (bold, italic, ...).
    #[serde(default)]
    pub format: u32,
    #[serde(flatten)]
    pub attrs: Attrs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    #[serde(default)]
    pub children: Vec<DocumentNode>,
    #[serde(default)]
    pub fields: LinkFields,
    #[serde(flatten)]
    pub attrs: Attrs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkFields {
    #[serde(rename = "linkType", default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<DocRef>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(rename = "newTab", default)]
    pub new_tab: bool,
    #[serde(flatten)]
    pub attrs: Attrs,
}

/// Relationship reference of an internal link. `value` is an id (number or string)
/// or, when the CMS populated the relation, the whole referenced document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocRef {
    pub value: Value,
    #[serde(rename = "relationTo")]
    pub relation_to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "relationTo", default, skip_serializing_if = "Option::is_none")]
    pub relation_to: Option<String>,
    #[serde(flatten)]
    pub attrs: Attrs,
}

/// Where a link points.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkTarget {
    /// Another article, by CMS id.
    Article(String),
    /// An external URL. Affiliate product links are `sponsored`.
    External { url: String, sponsored: bool },
}

impl LinkTarget {
    /// Reject targets that would produce a link node without usable target metadata.
    pub fn validate(&self) -> Result<(), CommonError> {
        match self {
            LinkTarget::Article(id) if id.trim().is_empty() => Err(CommonError::MalformedNode(
                "internal link target has an empty article id".to_string(),
            )),
            LinkTarget::External { url, .. } if url.trim().is_empty() => Err(
                CommonError::MalformedNode("external link target has an empty url".to_string()),
            ),
            _ => Ok(()),
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, LinkTarget::External { .. })
    }
}

impl Text {
    /// A plain text node with the attributes Lexical writes for new text.
    pub fn new(text: impl Into<String>) -> Self {
        let mut attrs = Attrs::new();
        attrs.insert("detail".to_string(), Value::from(0));
        attrs.insert("mode".to_string(), Value::from("normal"));
        attrs.insert("style".to_string(), Value::from(""));
        attrs.insert("version".to_string(), Value::from(1));
        Self {
            text: text.into(),
            format: 0,
            attrs,
        }
    }

    /// Copy of this node carrying different text but the same formatting.
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: self.format,
            attrs: self.attrs.clone(),
        }
    }

    /// Whether two text nodes render identically apart from their content.
    pub fn same_format(&self, other: &Text) -> bool {
        self.format == other.format && self.attrs == other.attrs
    }
}

impl Link {
    /// Build a link node for `target` wrapping `children`.
    pub fn new(target: &LinkTarget, children: Vec<DocumentNode>) -> Self {
        let fields = match target {
            LinkTarget::Article(id) => LinkFields {
                link_type: Some("internal".to_string()),
                doc: Some(DocRef {
                    value: id_value(id),
                    relation_to: ARTICLE_RELATION.to_string(),
                }),
                url: None,
                new_tab: false,
                attrs: Attrs::new(),
            },
            LinkTarget::External { url, sponsored } => {
                let mut attrs = Attrs::new();
                if *sponsored {
                    attrs.insert("rel".to_string(), Value::from(SPONSORED_REL));
                }
                LinkFields {
                    link_type: Some("custom".to_string()),
                    doc: None,
                    url: Some(url.clone()),
                    new_tab: *sponsored,
                    attrs,
                }
            }
        };

        let mut attrs = Attrs::new();
        attrs.insert("direction".to_string(), Value::Null);
        attrs.insert("format".to_string(), Value::from(""));
        attrs.insert("indent".to_string(), Value::from(0));
        attrs.insert("version".to_string(), Value::from(2));

        Self {
            children,
            fields,
            attrs,
        }
    }

    /// Resolve the link target from its fields. `None` when the link carries neither a
    /// document reference nor a url.
    pub fn target(&self) -> Option<LinkTarget> {
        if let Some(doc) = &self.fields.doc {
            return id_string(&doc.value).map(LinkTarget::Article);
        }
        let url = self.fields.url.as_deref().filter(|u| !u.trim().is_empty())?;
        let sponsored = self
            .fields
            .attrs
            .get("rel")
            .and_then(Value::as_str)
            .is_some_and(|rel| rel.contains("sponsored"));
        Some(LinkTarget::External {
            url: url.to_string(),
            sponsored,
        })
    }

    pub fn is_external(&self) -> bool {
        self.target().is_some_and(|t| t.is_external())
    }
}

impl Upload {
    /// Media id of the uploaded file, if the relation is present.
    pub fn media_id(&self) -> Option<String> {
        id_string(&self.value)
    }
}

impl DocumentNode {
    pub fn root(children: Vec<DocumentNode>) -> Self {
        DocumentNode::Root(Element {
            children,
            attrs: Attrs::new(),
        })
    }

    pub fn paragraph(children: Vec<DocumentNode>) -> Self {
        DocumentNode::Paragraph(Element {
            children,
            attrs: Attrs::new(),
        })
    }

    pub fn heading(tag: &str, children: Vec<DocumentNode>) -> Self {
        let mut attrs = Attrs::new();
        attrs.insert("tag".to_string(), Value::from(tag));
        DocumentNode::Heading(Element { children, attrs })
    }

    pub fn text(text: impl Into<String>) -> Self {
        DocumentNode::Text(Text::new(text))
    }

    pub fn link(target: &LinkTarget, children: Vec<DocumentNode>) -> Self {
        DocumentNode::Link(Link::new(target, children))
    }

    /// Lexical `type` string of this node.
    pub fn kind(&self) -> &str {
        match self {
            DocumentNode::Root(_) => "root",
            DocumentNode::Paragraph(_) => "paragraph",
            DocumentNode::Heading(_) => "heading",
            DocumentNode::List(_) => "list",
            DocumentNode::ListItem(_) => "listitem",
            DocumentNode::Quote(_) => "quote",
            DocumentNode::Link(_) => "link",
            DocumentNode::Text(_) => "text",
            DocumentNode::LineBreak(_) => "linebreak",
            DocumentNode::Upload(_) => "upload",
            DocumentNode::Opaque(value) => value.get("type").and_then(Value::as_str).unwrap_or(""),
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, DocumentNode::Root(_))
    }

    pub fn children(&self) -> Option<&[DocumentNode]> {
        match self {
            DocumentNode::Root(e)
            | DocumentNode::Paragraph(e)
            | DocumentNode::Heading(e)
            | DocumentNode::List(e)
            | DocumentNode::ListItem(e)
            | DocumentNode::Quote(e) => Some(&e.children),
            DocumentNode::Link(link) => Some(&link.children),
            DocumentNode::Text(_)
            | DocumentNode::LineBreak(_)
            | DocumentNode::Upload(_)
            | DocumentNode::Opaque(_) => None,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<DocumentNode>> {
        match self {
            DocumentNode::Root(e)
            | DocumentNode::Paragraph(e)
            | DocumentNode::Heading(e)
            | DocumentNode::List(e)
            | DocumentNode::ListItem(e)
            | DocumentNode::Quote(e) => Some(&mut e.children),
            DocumentNode::Link(link) => Some(&mut link.children),
            DocumentNode::Text(_)
            | DocumentNode::LineBreak(_)
            | DocumentNode::Upload(_)
            | DocumentNode::Opaque(_) => None,
        }
    }

    /// Node reached by following child indices from this node.
    pub fn node_at(&self, path: &[usize]) -> Option<&DocumentNode> {
        path.iter()
            .try_fold(self, |node, &index| node.children()?.get(index))
    }

    /// Child list of the node at `path`.
    pub fn children_at_mut(&mut self, path: &[usize]) -> Option<&mut Vec<DocumentNode>> {
        let mut node = self;
        for &index in path {
            node = node.children_mut()?.get_mut(index)?;
        }
        node.children_mut()
    }

    /// Pre-order traversal over this node and all descendants.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a DocumentNode)) {
        f(self);
        if let Some(children) = self.children() {
            for child in children {
                child.visit(f);
            }
        }
    }
}

impl From<Value> for DocumentNode {
    fn from(value: Value) -> Self {
        let parsed = match value.get("type").and_then(Value::as_str) {
            Some("root") => parse_body(&value).map(DocumentNode::Root),
            Some("paragraph") => parse_body(&value).map(DocumentNode::Paragraph),
            Some("heading") => parse_body(&value).map(DocumentNode::Heading),
            Some("list") => parse_body(&value).map(DocumentNode::List),
            Some("listitem") => parse_body(&value).map(DocumentNode::ListItem),
            Some("quote") => parse_body(&value).map(DocumentNode::Quote),
            Some("link") => parse_body(&value).map(DocumentNode::Link),
            Some("text") => parse_body(&value).map(DocumentNode::Text),
            Some("linebreak") => parse_body(&value).map(DocumentNode::LineBreak),
            Some("upload") => parse_body(&value).map(DocumentNode::Upload),
            _ => None,
        };
        parsed.unwrap_or(DocumentNode::Opaque(value))
    }
}

impl From<DocumentNode> for Value {
    fn from(node: DocumentNode) -> Self {
        let kind = node.kind().to_string();
        let body = match node {
            DocumentNode::Root(e)
            | DocumentNode::Paragraph(e)
            | DocumentNode::Heading(e)
            | DocumentNode::List(e)
            | DocumentNode::ListItem(e)
            | DocumentNode::Quote(e) => serde_json::to_value(e),
            DocumentNode::Link(link) => serde_json::to_value(link),
            DocumentNode::Text(text) => serde_json::to_value(text),
            DocumentNode::LineBreak(attrs) => Ok(Value::Object(attrs)),
            DocumentNode::Upload(upload) => serde_json::to_value(upload),
            DocumentNode::Opaque(value) => return value,
        };
        let mut map = match body {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        map.insert("type".to_string(), Value::String(kind));
        Value::Object(map)
    }
}

/// Deserialize a node body with its `type` tag removed, so the tag is not captured
/// by the flattened attribute map.
fn parse_body<T: DeserializeOwned>(value: &Value) -> Option<T> {
    let mut map = value.as_object()?.clone();
    map.remove("type");
    serde_json::from_value(Value::Object(map))
        .inspect_err(|e| debug!(error = %e, "node does not match its declared type, keeping it opaque"))
        .ok()
}

/// Render a CMS id for a relationship value: numeric ids stay numeric.
fn id_value(id: &str) -> Value {
    id.parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::from(id))
}

/// Read an id out of a relationship value (number, string, or populated document).
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("id").and_then(id_string),
        _ => None,
    }
}

/// Lexical editor state wrapper: `{"root": <root node>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditorState {
    pub root: DocumentNode,
}

impl EditorState {
    /// Parse editor state JSON, requiring the top-level node to be a root.
    pub fn from_json(json: &str) -> Result<Self, CommonError> {
        let state: EditorState = serde_json::from_str(json)?;
        if !state.root.is_root() {
            return Err(CommonError::MalformedNode(format!(
                "editor state root has type {:?}",
                state.root.kind()
            )));
        }
        Ok(state)
    }
}

/// Serde adapter storing a root `DocumentNode` as Lexical editor state.
pub mod editor_state {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::DocumentNode;

    #[derive(Serialize)]
    struct StateRef<'a> {
        root: &'a DocumentNode,
    }

    #[derive(Deserialize)]
    struct State {
        root: DocumentNode,
    }

    pub fn serialize<S: Serializer>(root: &DocumentNode, serializer: S) -> Result<S::Ok, S::Error> {
        StateRef { root }.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DocumentNode, D::Error> {
        let state = State::deserialize(deserializer)?;
        if !state.root.is_root() {
            return Err(serde::de::Error::custom(format!(
                "expected a root node, found {:?}",
                state.root.kind()
            )));
        }
        Ok(state.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_state() -> Value {
        json!({
            "root": {
                "type": "root",
                "direction": "ltr",
                "format": "",
                "indent": 0,
                "version": 1,
                "children": [
                    {
                        "type": "heading",
                        "tag": "h2",
                        "version": 1,
                        "children": [{"type": "text", "text": "Title", "format": 1, "version": 1}]
                    },
                    {
                        "type": "paragraph",
                        "version": 1,
                        "children": [
                            {"type": "text", "text": "See ", "format": 0, "mode": "normal", "version": 1},
                            {
                                "type": "link",
                                "version": 2,
                                "fields": {"linkType": "internal", "doc": {"value": 42, "relationTo": "posts"}, "newTab": false, "url": null},
                                "children": [{"type": "text", "text": "this", "format": 0, "version": 1}]
                            },
                            {"type": "linebreak", "version": 1}
                        ]
                    },
                    {"type": "upload", "value": 7, "relationTo": "media", "version": 1},
                    {"type": "horizontalrule", "version": 1}
                ]
            }
        })
    }

    #[test]
    fn parse_known_and_unknown_kinds() {
        let state: EditorState = serde_json::from_value(sample_state()).unwrap();
        let children = state.root.children().unwrap();
        assert_eq!(children.len(), 4);
        assert_eq!(children[0].kind(), "heading");
        assert!(matches!(children[2], DocumentNode::Upload(_)));
        assert!(matches!(children[3], DocumentNode::Opaque(_)));
        assert_eq!(children[3].kind(), "horizontalrule");

        let DocumentNode::Upload(upload) = &children[2] else {
            panic!("expected upload");
        };
        assert_eq!(upload.media_id().as_deref(), Some("7"));
    }

    #[test]
    fn serialization_is_lossless() {
        let original = sample_state();
        let state: EditorState = serde_json::from_value(original.clone()).unwrap();
        let back = serde_json::to_value(&state).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn link_target_resolution() {
        let state: EditorState = serde_json::from_value(sample_state()).unwrap();
        let link = state.root.node_at(&[1, 1]).unwrap();
        let DocumentNode::Link(link) = link else {
            panic!("expected link, got {}", link.kind());
        };
        assert_eq!(link.target(), Some(LinkTarget::Article("42".to_string())));
        assert!(!link.is_external());
    }

    #[test]
    fn new_links_round_trip_their_target() {
        let internal = LinkTarget::Article("15".to_string());
        let link = Link::new(&internal, vec![DocumentNode::text("x")]);
        assert_eq!(link.target(), Some(internal));
        assert_eq!(link.fields.doc.as_ref().unwrap().value, json!(15));

        let product = LinkTarget::External {
            url: "https://example.com/item".to_string(),
            sponsored: true,
        };
        let link = Link::new(&product, vec![DocumentNode::text("x")]);
        assert_eq!(link.target(), Some(product));
        assert!(link.fields.new_tab);
    }

    #[test]
    fn malformed_known_node_becomes_opaque() {
        // A text node without its `text` field cannot be typed.
        let node: DocumentNode = serde_json::from_value(json!({"type": "text", "format": 0})).unwrap();
        assert!(matches!(node, DocumentNode::Opaque(_)));
    }

    #[test]
    fn link_without_target_metadata() {
        let node: DocumentNode = serde_json::from_value(json!({
            "type": "link",
            "fields": {"linkType": "internal"},
            "children": []
        }))
        .unwrap();
        let DocumentNode::Link(link) = node else {
            panic!("expected link");
        };
        assert_eq!(link.target(), None);
        assert!(LinkTarget::Article(String::new()).validate().is_err());
    }

    #[test]
    fn editor_state_requires_root() {
        let err = EditorState::from_json(r#"{"root": {"type": "paragraph", "children": []}}"#);
        assert!(matches!(err, Err(CommonError::MalformedNode(_))));
    }

    #[test]
    fn children_at_mut_follows_paths() {
        let mut root = DocumentNode::root(vec![DocumentNode::paragraph(vec![DocumentNode::text("a")])]);
        root.children_at_mut(&[0]).unwrap().push(DocumentNode::text("b"));
        assert_eq!(root.node_at(&[0]).unwrap().children().unwrap().len(), 2);
        assert!(root.children_at_mut(&[0, 0]).is_none());
    }
}
