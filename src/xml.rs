// MIT License - Copyright (c) 2026 Peter Wright
// BlueBOLT CV2 client

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{BlueBoltError, Result};

/// Minimal owned element tree for CV2 responses.
///
/// Responses are a few hundred bytes, so a full tree is simpler than
/// streaming and lets lookups search anywhere below the root, the way the
/// card nests fields differently across firmware revisions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    /// Parse a complete document into its root element.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => stack.push(element_from(&e)?),
                Ok(Event::Empty(e)) => {
                    let element = element_from(&e)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| BlueBoltError::parse("unbalanced closing tag"))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| BlueBoltError::parse(format!("bad text: {e}")))?;
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&text);
                    }
                }
                Ok(Event::CData(c)) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(BlueBoltError::parse(format!("XML error: {e}"))),
            }
        }

        if let Some(open) = stack.last() {
            return Err(BlueBoltError::parse(format!("unclosed <{}>", open.name)));
        }
        root.ok_or_else(|| BlueBoltError::parse("empty document"))
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First element named `name`, searching self then descendants depth-first.
    pub fn find(&self, name: &str) -> Option<&XmlElement> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(name))
    }

    /// Every element named `name` at any depth, in document order.
    pub fn find_all<'a>(&'a self, name: &str) -> Vec<&'a XmlElement> {
        let mut found = Vec::new();
        self.collect(name, &mut found);
        found
    }

    fn collect<'a>(&'a self, name: &str, found: &mut Vec<&'a XmlElement>) {
        if self.name == name {
            found.push(self);
        }
        for child in &self.children {
            child.collect(name, found);
        }
    }

    /// Trimmed text of the first element named `name`.
    pub fn find_text(&self, name: &str) -> Option<&str> {
        self.find(name).map(|e| e.text.trim())
    }
}

fn element_from(start: &BytesStart<'_>) -> Result<XmlElement> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| BlueBoltError::parse(format!("bad attribute on <{name}>: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| BlueBoltError::parse(format!("bad attribute value on <{name}>: {e}")))?
            .into_owned();
        attrs.push((key, value));
    }
    Ok(XmlElement {
        name,
        attrs,
        text: String::new(),
        children: Vec::new(),
    })
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
        Ok(())
    } else if root.is_none() {
        *root = Some(element);
        Ok(())
    } else {
        Err(BlueBoltError::parse("multiple root elements"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested() {
        let doc = XmlElement::parse(
            r#"<?xml version="1.0" ?><device class="cv2" id="abc"><kids class="km4315"><k>77</k></kids></device>"#,
        )
        .unwrap();
        assert_eq!(doc.name, "device");
        assert_eq!(doc.attr("class"), Some("cv2"));
        let kids = doc.find("kids").unwrap();
        assert_eq!(kids.attr("class"), Some("km4315"));
        assert_eq!(kids.find_text("k"), Some("77"));
    }

    #[test]
    fn test_find_all_in_order() {
        let doc = XmlElement::parse(
            "<device><outlets><outlet id=\"1\">1</outlet><outlet id=\"2\">0</outlet></outlets><outlet id=\"3\">1</outlet></device>",
        )
        .unwrap();
        let ids: Vec<_> = doc
            .find_all("outlet")
            .iter()
            .filter_map(|o| o.attr("id"))
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_empty_elements_and_entities() {
        let doc = XmlElement::parse("<device><ack xid=\"a&amp;b\"/><name>A &lt; B</name></device>").unwrap();
        assert_eq!(doc.find("ack").unwrap().attr("xid"), Some("a&b"));
        assert_eq!(doc.find_text("name"), Some("A < B"));
    }

    #[test]
    fn test_malformed_documents() {
        assert!(XmlElement::parse("").is_err());
        assert!(XmlElement::parse("<device><voltage>1</device>").is_err());
        assert!(XmlElement::parse("<device>").is_err());
        assert!(XmlElement::parse("<a/><b/>").is_err());
        assert!(XmlElement::parse("not xml at all").is_err());
    }
}
