//! XML rendering and parsing of IBB elements

use super::payload::{Close, Data, IbbPayload, Open};
use ibb_common::{protocol::NS, Carrier, IbbError, Result, SessionId};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashMap;
use std::io::Cursor;

/// Qualified name of a stanza payload element
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementName {
    pub namespace: String,
    pub local: String,
}

impl ElementName {
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local: local.into(),
        }
    }
}

impl std::fmt::Display for ElementName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}}}{}", self.namespace, self.local)
    }
}

fn write_err(err: impl std::fmt::Display) -> IbbError {
    IbbError::protocol(format!("xml write failed: {}", err))
}

fn read_err(err: impl std::fmt::Display) -> IbbError {
    IbbError::malformed(format!("xml: {}", err))
}

impl IbbPayload {
    /// Render the element, namespace included
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        let mut start = BytesStart::new(self.name());
        start.push_attribute(("xmlns", NS));
        start.push_attribute(("sid", self.sid().as_str()));

        match self {
            IbbPayload::Open(open) => {
                let block_size = open.block_size.to_string();
                start.push_attribute(("block-size", block_size.as_str()));
                start.push_attribute(("stanza", open.stanza.as_str()));
                writer.write_event(Event::Empty(start)).map_err(write_err)?;
            }
            IbbPayload::Data(data) => {
                let seq = data.seq.to_string();
                start.push_attribute(("seq", seq.as_str()));
                writer.write_event(Event::Start(start)).map_err(write_err)?;
                writer
                    .write_event(Event::Text(BytesText::new(&data.data)))
                    .map_err(write_err)?;
                writer
                    .write_event(Event::End(BytesEnd::new("data")))
                    .map_err(write_err)?;
            }
            IbbPayload::Close(_) => {
                writer.write_event(Event::Empty(start)).map_err(write_err)?;
            }
        }

        String::from_utf8(writer.into_inner().into_inner()).map_err(write_err)
    }

    /// Parse exactly one IBB element
    pub fn from_xml(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut root: Option<(String, HashMap<String, String>)> = None;
        let mut ended = false;
        let mut body = String::new();

        loop {
            match reader.read_event().map_err(read_err)? {
                Event::Start(start) => {
                    if root.is_some() {
                        return Err(IbbError::protocol("unexpected child element"));
                    }
                    root = Some(read_start(&start)?);
                }
                Event::Empty(start) => {
                    if root.is_some() {
                        return Err(IbbError::protocol("unexpected child element"));
                    }
                    root = Some(read_start(&start)?);
                    ended = true;
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(read_err)?;
                    if root.is_some() && !ended {
                        body.push_str(&text);
                    } else if !text.trim().is_empty() {
                        return Err(IbbError::malformed("text outside of element"));
                    }
                }
                Event::CData(cdata) => {
                    if root.is_none() || ended {
                        return Err(IbbError::malformed("text outside of element"));
                    }
                    body.push_str(std::str::from_utf8(&cdata).map_err(read_err)?);
                }
                Event::End(_) => ended = true,
                Event::Eof => break,
                _ => {}
            }
        }

        let (qname, mut attrs) = root.ok_or_else(|| IbbError::malformed("empty document"))?;
        let name = qualify(&qname, &attrs);
        if name.namespace != NS {
            return Err(IbbError::protocol(format!("<{}/> is not in the IBB namespace", qname)));
        }
        let sid = SessionId::new(take_attr(&mut attrs, "sid")?)?;

        match name.local.as_str() {
            "open" => {
                let block_size = take_attr(&mut attrs, "block-size")?
                    .parse::<u16>()
                    .map_err(|e| IbbError::protocol(format!("invalid block-size: {}", e)))?;
                let stanza = match attrs.remove("stanza") {
                    Some(value) => value.parse::<Carrier>()?,
                    None => Carrier::Iq,
                };
                Ok(IbbPayload::Open(Open {
                    sid,
                    block_size,
                    stanza,
                }))
            }
            "data" => {
                let seq = take_attr(&mut attrs, "seq")?
                    .parse::<u16>()
                    .map_err(|e| IbbError::protocol(format!("invalid seq: {}", e)))?;
                Ok(IbbPayload::Data(Data {
                    sid,
                    seq,
                    data: body,
                }))
            }
            "close" => Ok(IbbPayload::Close(Close { sid })),
            other => Err(IbbError::protocol(format!("unknown element <{}/>", other))),
        }
    }
}

/// Qualified name of the first element in a document
pub fn element_name(xml: &str) -> Result<ElementName> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event().map_err(read_err)? {
            Event::Start(start) | Event::Empty(start) => {
                let (qname, attrs) = read_start(&start)?;
                return Ok(qualify(&qname, &attrs));
            }
            Event::Eof => return Err(IbbError::malformed("empty document")),
            _ => {}
        }
    }
}

/// Resolve a possibly prefixed element name against its own declarations
fn qualify(qname: &str, attrs: &HashMap<String, String>) -> ElementName {
    let (ns_attr, local) = match qname.split_once(':') {
        Some((prefix, local)) => (format!("xmlns:{}", prefix), local),
        None => ("xmlns".to_string(), qname),
    };
    let namespace = attrs.get(&ns_attr).cloned().unwrap_or_default();
    ElementName::new(namespace, local)
}

fn read_start(start: &BytesStart<'_>) -> Result<(String, HashMap<String, String>)> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(read_err)?
        .to_string();

    let mut attrs = HashMap::new();
    for attr in start.attributes() {
        let attr = attr.map_err(read_err)?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(read_err)?
            .to_string();
        let value = attr.unescape_value().map_err(read_err)?.into_owned();
        attrs.insert(key, value);
    }

    Ok((name, attrs))
}

fn take_attr(attrs: &mut HashMap<String, String>, key: &str) -> Result<String> {
    attrs
        .remove(key)
        .ok_or_else(|| IbbError::protocol(format!("missing {} attribute", key)))
}
