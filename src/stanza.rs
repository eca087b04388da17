//! Decoded stanza tree and routing classification.

use std::fmt;
use std::ops::Deref;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Error, FramingError, Result};

/// A node inside an element: a child element or a run of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An XML element with ordered attributes and children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Value of the attribute `name`, if present.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Child elements in document order.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First direct child element called `name`.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    /// All direct child elements called `name`.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.elements().filter(move |e| e.name == name)
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Text of the first direct child called `name`.
    pub fn child_text(&self, name: &str) -> Option<String> {
        self.child(name).map(Element::text)
    }

    /// Depth-first search for the first descendant called `name` (self excluded).
    pub fn find(&self, name: &str) -> Option<&Element> {
        for child in self.elements() {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.find(name) {
                return Some(found);
            }
        }
        None
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.name)?;
        for (key, value) in &self.attrs {
            write!(f, " {}=\"{}\"", key, escape(value.as_str()))?;
        }
        if self.children.is_empty() {
            return f.write_str("/>");
        }
        f.write_str(">")?;
        for child in &self.children {
            match child {
                Node::Element(e) => write!(f, "{}", e)?,
                Node::Text(t) => write!(f, "{}", escape(t.as_str()))?,
            }
        }
        write!(f, "</{}>", self.name)
    }
}

/// Routing category of a top-level stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StanzaKind {
    /// `<k>` stream-open response.
    Handshake,
    Iq {
        iq_type: Option<String>,
        /// `xmlns` of the first child element.
        namespace: Option<String>,
    },
    Message {
        message_type: Option<String>,
    },
    /// `<stc>` carrying `<stp type="ca">`.
    Captcha,
    /// `<stc>` carrying `<stp type="bn">`.
    TempBan,
    /// Any other `<stc>`.
    Stc,
    Ack,
    Pong,
    Unknown(String),
}

/// A complete, decoded top-level stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    root: Element,
}

impl Stanza {
    pub fn new(root: Element) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn into_root(self) -> Element {
        self.root
    }

    /// The `id` attribute used for request correlation.
    pub fn id(&self) -> Option<&str> {
        self.root.attr("id")
    }

    pub fn kind(&self) -> StanzaKind {
        let root = &self.root;
        match root.name.as_str() {
            "k" => StanzaKind::Handshake,
            "iq" => StanzaKind::Iq {
                iq_type: root.attr("type").map(str::to_owned),
                namespace: root
                    .elements()
                    .next()
                    .and_then(|e| e.attr("xmlns"))
                    .map(str::to_owned),
            },
            "message" => StanzaKind::Message {
                message_type: root.attr("type").map(str::to_owned),
            },
            "stc" => match root.child("stp").and_then(|stp| stp.attr("type")) {
                Some("ca") => StanzaKind::Captcha,
                Some("bn") => StanzaKind::TempBan,
                _ => StanzaKind::Stc,
            },
            "ack" => StanzaKind::Ack,
            "pong" => StanzaKind::Pong,
            other => StanzaKind::Unknown(other.to_owned()),
        }
    }
}

impl Deref for Stanza {
    type Target = Element;

    fn deref(&self) -> &Element {
        &self.root
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.fmt(f)
    }
}

/// Decode one framed stanza into an element tree.
///
/// Only the predefined XML entities are expanded; anything else is an
/// [`Error::Encoding`]. A root start tag that is never closed (the accepted
/// `<k ok="1">` handshake) decodes as an element without children.
pub fn decode(bytes: &[u8]) -> Result<Stanza> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(false);
    // End names are matched against the stack below; quick-xml's own
    // tracking would reject the unterminated handshake root.
    reader.config_mut().check_end_names = false;

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(start_element(&e)?),
            Ok(Event::Empty(e)) => {
                let element = start_element(&e)?;
                close_element(&mut stack, &mut root, element)?;
            }
            Ok(Event::End(e)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| Error::MalformedResponse("unmatched end tag".into()))?;
                if element.name.as_bytes() != e.name().as_ref() {
                    return Err(Error::MalformedResponse(format!(
                        "</{}> closes <{}>",
                        String::from_utf8_lossy(e.name().as_ref()),
                        element.name
                    )));
                }
                close_element(&mut stack, &mut root, element)?;
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map_err(|e| Error::Encoding(e.to_string()))?;
                push_text(&mut stack, &text);
            }
            Ok(Event::CData(e)) => {
                let text = std::str::from_utf8(&e)
                    .map_err(|e| Error::Encoding(format!("CDATA is not UTF-8: {}", e)))?;
                push_text(&mut stack, text);
            }
            Ok(Event::DocType(_)) => return Err(FramingError::DtdForbidden.into()),
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) => {}
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::MalformedResponse(e.to_string())),
        }
    }

    if let Some(root) = root {
        return Ok(Stanza::new(root));
    }
    // Unterminated root: accept it only when nothing was opened inside it.
    match (stack.pop(), stack.is_empty()) {
        (Some(mut open_root), true) => {
            open_root.children.clear();
            Ok(Stanza::new(open_root))
        }
        (Some(_), false) => Err(Error::MalformedResponse("truncated stanza".into())),
        (None, _) => Err(Error::MalformedResponse("no element in stanza".into())),
    }
}

fn start_element(e: &BytesStart<'_>) -> Result<Element> {
    let name = std::str::from_utf8(e.name().as_ref())
        .map_err(|err| Error::Encoding(format!("element name is not UTF-8: {}", err)))?
        .to_owned();

    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| Error::MalformedResponse(err.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|err| Error::Encoding(format!("attribute name is not UTF-8: {}", err)))?
            .to_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| Error::Encoding(err.to_string()))?
            .into_owned();
        attrs.push((key, value));
    }

    Ok(Element {
        name,
        attrs,
        children: Vec::new(),
    })
}

fn close_element(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None if root.is_none() => *root = Some(element),
        None => {
            return Err(Error::MalformedResponse(
                "more than one top-level element".into(),
            ))
        }
    }
    Ok(())
}

fn push_text(stack: &mut [Element], text: &str) {
    let Some(parent) = stack.last_mut() else {
        return;
    };
    if text.is_empty() {
        return;
    }
    match parent.children.last_mut() {
        Some(Node::Text(existing)) => existing.push_str(text),
        _ => parent.children.push(Node::Text(text.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_nested_message() {
        let stanza = decode(
            b"<message type=\"chat\" to=\"me@talk.kik.com\" from=\"you@talk.kik.com/CAN1\" id=\"m1\"><body>hi &amp; bye</body><kik push=\"true\" timestamp=\"1500\"/></message>",
        )
        .unwrap();

        assert_eq!(stanza.name, "message");
        assert_eq!(stanza.id(), Some("m1"));
        assert_eq!(stanza.attr("from"), Some("you@talk.kik.com/CAN1"));
        assert_eq!(stanza.child_text("body").as_deref(), Some("hi & bye"));
        assert_eq!(stanza.child("kik").and_then(|k| k.attr("timestamp")), Some("1500"));
        assert_eq!(
            stanza.kind(),
            StanzaKind::Message {
                message_type: Some("chat".into())
            }
        );
    }

    #[test]
    fn test_decode_unterminated_handshake() {
        let stanza = decode(b"<k ok=\"1\" ts=\"1500000000000\">").unwrap();
        assert_eq!(stanza.kind(), StanzaKind::Handshake);
        assert_eq!(stanza.attr("ok"), Some("1"));
        assert!(stanza.children.is_empty());
    }

    #[test]
    fn test_decode_truncated_nested_rejected() {
        assert!(matches!(
            decode(b"<message><body>hi"),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_unknown_entity_is_encoding_error() {
        assert!(matches!(
            decode(b"<message><body>&bogus;</body></message>"),
            Err(Error::Encoding(_))
        ));
    }

    #[test]
    fn test_escaped_attribute_value() {
        let stanza = decode(b"<ack id=\"a&quot;b&lt;\"/>").unwrap();
        assert_eq!(stanza.id(), Some("a\"b<"));
        assert_eq!(stanza.kind(), StanzaKind::Ack);
    }

    #[test]
    fn test_classify_iq_namespace() {
        let stanza = decode(
            b"<iq type=\"result\" id=\"r1\"><query xmlns=\"jabber:iq:roster\"><item jid=\"a@talk.kik.com\"/></query></iq>",
        )
        .unwrap();
        assert_eq!(
            stanza.kind(),
            StanzaKind::Iq {
                iq_type: Some("result".into()),
                namespace: Some("jabber:iq:roster".into()),
            }
        );
    }

    #[test]
    fn test_classify_stc() {
        let captcha = decode(b"<stc id=\"s1\"><stp type=\"ca\">https://captcha</stp></stc>").unwrap();
        assert_eq!(captcha.kind(), StanzaKind::Captcha);

        let ban = decode(b"<stc id=\"s2\"><stp type=\"bn\"/></stc>").unwrap();
        assert_eq!(ban.kind(), StanzaKind::TempBan);

        let other = decode(b"<stc id=\"s3\"><stp type=\"xx\"/></stc>").unwrap();
        assert_eq!(other.kind(), StanzaKind::Stc);
    }

    #[test]
    fn test_unknown_kind_decodes() {
        let stanza = decode(b"<xiphias-frame a=\"b\"/>").unwrap();
        assert_eq!(stanza.kind(), StanzaKind::Unknown("xiphias-frame".into()));
    }

    #[test]
    fn test_find_descendant_and_children_named() {
        let stanza = decode(
            b"<message type=\"receipt\"><receipt type=\"read\"><msgid id=\"1\"/><msgid id=\"2\"/></receipt></message>",
        )
        .unwrap();
        let receipt = stanza.child("receipt").unwrap();
        let ids: Vec<_> = receipt
            .children_named("msgid")
            .filter_map(|m| m.attr("id"))
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(stanza.find("msgid").and_then(|m| m.attr("id")), Some("1"));
        assert!(stanza.find("body").is_none());
    }

    #[test]
    fn test_cdata_becomes_text() {
        let stanza = decode(b"<message><body><![CDATA[<b>raw</b>]]></body></message>").unwrap();
        assert_eq!(stanza.child_text("body").as_deref(), Some("<b>raw</b>"));
    }

    #[test]
    fn test_display_escapes() {
        let mut element = Element::new("body");
        element.attrs.push(("x".into(), "a\"b".into()));
        element.children.push(Node::Text("1 < 2".into()));
        assert_eq!(element.to_string(), "<body x=\"a&quot;b\">1 &lt; 2</body>");
    }

    #[test]
    fn test_doctype_rejected() {
        assert!(matches!(
            decode(b"<!DOCTYPE x><x/>"),
            Err(Error::Framing(FramingError::DtdForbidden))
        ));
    }
}
