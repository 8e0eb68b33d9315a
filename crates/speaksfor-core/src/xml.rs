//! Minimal read-only XML tree and constrained accessors.
//!
//! Credential documents are small, so the whole document is loaded into an
//! owned element tree. Element names are matched by local name (namespace
//! prefixes are ignored). Documents with a DOCTYPE are rejected outright.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{SpeaksForError, SpeaksForResult};

/// Maximum element nesting accepted when loading a document.
pub const MAX_DEPTH: usize = 64;

/// A node in the element tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An XML element with its attributes and children in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Local name (prefix stripped).
    pub name: String,
    /// Attributes as (qualified name, unescaped value).
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> SpeaksForResult<Self> {
        let name = utf8(start.local_name().as_ref())?.to_string();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| xml_error(&name, e))?;
            let key = utf8(attr.key.as_ref())?.to_string();
            let value = attr
                .unescape_value()
                .map_err(|e| xml_error(&name, e))?
                .into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            children: Vec::new(),
        })
    }

    /// Value of the first text child, if any.
    pub fn first_text_value(&self) -> Option<&str> {
        self.children.iter().find_map(|child| match child {
            Node::Text(text) => Some(text.as_str()),
            Node::Element(_) => None,
        })
    }

    /// Direct child elements.
    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|child| match child {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First direct child element with the given name.
    pub fn first_child_named(&self, name: &str) -> Option<&Element> {
        self.child_elements().find(|e| e.name == name)
    }

    /// All descendant elements with the given name, in document order.
    /// The element itself is not included.
    pub fn descendants_named<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut found = Vec::new();
        collect_named(self, name, &mut found);
        found
    }

    /// Attribute value by qualified name.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

fn collect_named<'a>(element: &'a Element, name: &str, found: &mut Vec<&'a Element>) {
    for child in &element.children {
        if let Node::Element(e) = child {
            if e.name == name {
                found.push(e);
            }
            collect_named(e, name, found);
        }
    }
}

/// Require that exactly one element matched.
///
/// `what` names the element for the failure message.
pub fn exactly_one<'a>(found: Vec<&'a Element>, what: &str) -> SpeaksForResult<&'a Element> {
    match found.as_slice() {
        [single] => Ok(*single),
        [] => Err(SpeaksForError::malformed(format!("no {what} element"))),
        many => Err(SpeaksForError::malformed(format!(
            "expected exactly one {what} element, found {}",
            many.len()
        ))),
    }
}

/// Require exactly one direct child named `name`.
pub fn exactly_one_child<'a>(parent: &'a Element, name: &str) -> SpeaksForResult<&'a Element> {
    let found = parent.child_elements().filter(|e| e.name == name).collect();
    exactly_one(found, name)
}

/// Require exactly one descendant named `name`.
pub fn exactly_one_descendant<'a>(
    parent: &'a Element,
    name: &str,
) -> SpeaksForResult<&'a Element> {
    exactly_one(parent.descendants_named(name), name)
}

/// Text value of an element, failing when it has none.
pub fn required_text<'a>(element: &'a Element) -> SpeaksForResult<&'a str> {
    element
        .first_text_value()
        .ok_or_else(|| SpeaksForError::malformed(format!("empty {} element", element.name)))
}

/// Parse a document and return its root element.
pub fn parse_document(bytes: &[u8]) -> SpeaksForResult<Element> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| SpeaksForError::malformed(format!("document is not UTF-8: {e}")))?;

    let mut reader = Reader::from_str(text);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| SpeaksForError::malformed(format!("XML parse error: {e}")))?;

        match event {
            Event::Start(start) => {
                if root.is_some() {
                    return Err(SpeaksForError::malformed("multiple root elements"));
                }
                if stack.len() >= MAX_DEPTH {
                    return Err(SpeaksForError::malformed("document nested too deeply"));
                }
                stack.push(Element::from_start(&start)?);
            }
            Event::Empty(start) => {
                let element = Element::from_start(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| SpeaksForError::malformed("unbalanced end tag"))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                let value = text
                    .unescape()
                    .map_err(|e| SpeaksForError::malformed(format!("bad text content: {e}")))?;
                push_text(&mut stack, &value)?;
            }
            Event::CData(cdata) => {
                let value = utf8(&cdata)?;
                push_text(&mut stack, value)?;
            }
            Event::DocType(_) => {
                return Err(SpeaksForError::malformed("DOCTYPE is not allowed"));
            }
            Event::Eof => break,
            // Declarations, comments, processing instructions
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(SpeaksForError::malformed("unexpected end of document"));
    }
    root.ok_or_else(|| SpeaksForError::malformed("empty document"))
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> SpeaksForResult<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None if root.is_none() => *root = Some(element),
        None => return Err(SpeaksForError::malformed("multiple root elements")),
    }
    Ok(())
}

fn push_text(stack: &mut [Element], value: &str) -> SpeaksForResult<()> {
    match stack.last_mut() {
        Some(parent) => {
            // Merge with a preceding text node so entity boundaries don't split values.
            if let Some(Node::Text(prev)) = parent.children.last_mut() {
                prev.push_str(value);
            } else {
                parent.children.push(Node::Text(value.to_string()));
            }
            Ok(())
        }
        None if value.trim().is_empty() => Ok(()),
        None => Err(SpeaksForError::malformed("text outside root element")),
    }
}

fn utf8(bytes: &[u8]) -> SpeaksForResult<&str> {
    std::str::from_utf8(bytes)
        .map_err(|e| SpeaksForError::malformed(format!("invalid UTF-8 in document: {e}")))
}

fn xml_error(element: &str, err: impl std::fmt::Display) -> SpeaksForError {
    SpeaksForError::malformed(format!("bad attribute on {element}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    const DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<signed-credential>
  <credential xml:id="ref0">
    <type>abac</type>
    <head><ABACprincipal><keyid>aa</keyid></ABACprincipal><role>r</role></head>
  </credential>
  <ds:Signature xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:X509Certificate>AB&#13;
CD</ds:X509Certificate></ds:Signature>
</signed-credential>"#;

    #[test]
    fn test_parse_and_navigate() {
        let root = parse_document(DOC.as_bytes()).unwrap();
        assert_eq!(root.name, "signed-credential");

        let credential = root.first_child_named("credential").unwrap();
        assert_eq!(credential.attribute("xml:id"), Some("ref0"));

        let cred_type = credential.first_child_named("type").unwrap();
        assert_eq!(cred_type.first_text_value(), Some("abac"));

        let keyid = exactly_one_descendant(&root, "keyid").unwrap();
        assert_eq!(required_text(keyid).unwrap(), "aa");
    }

    #[test]
    fn test_prefixed_names_match_local_name() {
        let root = parse_document(DOC.as_bytes()).unwrap();
        let cert = exactly_one_descendant(&root, "X509Certificate").unwrap();
        assert_eq!(cert.first_text_value(), Some("AB\r\nCD"));
    }

    #[test]
    fn test_first_text_value_skips_elements() {
        let root = parse_document(b"<a><b/>text<c/>more</a>").unwrap();
        assert_eq!(root.first_text_value(), Some("text"));
        let empty = parse_document(b"<a><b/></a>").unwrap();
        assert_eq!(empty.first_text_value(), None);
    }

    #[test]
    fn test_exactly_one_rejects_duplicates() {
        let root = parse_document(b"<r><head/><x><head/></x></r>").unwrap();
        let err = exactly_one_descendant(&root, "head").unwrap_err();
        assert_eq!(err.kind(), FailureKind::MalformedCredential);
        assert!(err.to_string().contains("found 2"));

        let err = exactly_one_descendant(&root, "tail").unwrap_err();
        assert!(err.to_string().contains("no tail element"));
    }

    #[test]
    fn test_exactly_one_child_ignores_grandchildren() {
        let root = parse_document(b"<r><x><type>t</type></x><type>u</type></r>").unwrap();
        let t = exactly_one_child(&root, "type").unwrap();
        assert_eq!(t.first_text_value(), Some("u"));
    }

    #[test]
    fn test_required_text_on_empty_element() {
        let root = parse_document(b"<r><keyid/></r>").unwrap();
        let keyid = exactly_one_child(&root, "keyid").unwrap();
        assert!(required_text(keyid).is_err());
    }

    #[test]
    fn test_doctype_rejected() {
        let doc = br#"<?xml version="1.0"?><!DOCTYPE r [<!ENTITY x "y">]><r>&x;</r>"#;
        let err = parse_document(doc).unwrap_err();
        assert_eq!(err.kind(), FailureKind::MalformedCredential);
    }

    #[test]
    fn test_structural_errors() {
        assert!(parse_document(b"").is_err());
        assert!(parse_document(b"<a><b></a>").is_err());
        assert!(parse_document(b"<a></a><b></b>").is_err());
        assert!(parse_document(b"<a>").is_err());
        assert!(parse_document(b"junk<a/>").is_err());
        assert!(parse_document(&[0x3c, 0x61, 0xff, 0x3e]).is_err());
    }

    #[test]
    fn test_depth_limit() {
        let open = "<a>".repeat(MAX_DEPTH + 1);
        let close = "</a>".repeat(MAX_DEPTH + 1);
        let doc = format!("{open}{close}");
        assert!(parse_document(doc.as_bytes()).is_err());
    }
}
