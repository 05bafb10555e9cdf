//! Minimal SOAP XML tree
//!
//! Responses are parsed into a small element tree and converted to JSON:
//! managed object references become `{kind, id}`, `ArrayOf*` types become
//! arrays and `xsd:` scalars become typed JSON values.

use crate::error::{Error, Result};
use crate::inventory::model::reference::vsphere_kind;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

/// A parsed element
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    /// Local name
    pub name: String,
    /// `xsi:type` without prefix
    pub xsi_type: Option<String>,
    /// Unprefixed `type` attribute carried by managed object references
    pub mor_type: Option<String>,
    /// All attributes by local name
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

fn local_name(raw: &[u8]) -> String {
    let s = String::from_utf8_lossy(raw);
    match s.rfind(':') {
        Some(pos) => s[pos + 1..].to_string(),
        None => s.to_string(),
    }
}

fn start_element(e: &BytesStart<'_>) -> Result<Element> {
    let mut el = Element {
        name: local_name(e.name().as_ref()),
        ..Default::default()
    };
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr.unescape_value()?.to_string();
        if key == "type" {
            el.mor_type = Some(value.clone());
        } else if key.ends_with(":type") {
            el.xsi_type = Some(local_name(value.as_bytes()));
        }
        el.attrs.push((local_name(key.as_bytes()), value));
    }
    Ok(el)
}

/// Parse a document into a synthetic root element.
pub fn parse(xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = vec![Element::default()];
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => stack.push(start_element(e)?),
            Event::Empty(ref e) => {
                let el = start_element(e)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(el);
                }
            }
            Event::Text(ref e) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&e.unescape()?);
                }
            }
            Event::CData(ref e) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(e));
                }
            }
            Event::End(_) => {
                let el = stack
                    .pop()
                    .ok_or_else(|| Error::Internal("unbalanced XML".into()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(el),
                    None => return Err(Error::Internal("unbalanced XML".into())),
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    if stack.len() != 1 {
        return Err(Error::Internal("truncated XML document".into()));
    }
    Ok(stack.pop().unwrap_or_default())
}

impl Element {
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of a direct child.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// First descendant with the given name, depth first.
    pub fn descendant(&self, name: &str) -> Option<&Element> {
        for c in &self.children {
            if c.name == name {
                return Some(c);
            }
            if let Some(found) = c.descendant(name) {
                return Some(found);
            }
        }
        None
    }

    /// Managed object reference as `(raw type, id)`.
    pub fn mor(&self) -> Option<(&str, &str)> {
        self.mor_type.as_deref().map(|t| (t, self.text.as_str()))
    }

    /// Convert to JSON.
    pub fn to_value(&self) -> Value {
        let xsi = self.xsi_type.as_deref().unwrap_or("");
        if xsi.starts_with("ArrayOf") {
            return Value::Array(self.children.iter().map(Element::to_value).collect());
        }
        if let Some(raw) = &self.mor_type {
            if self.children.is_empty() {
                return serde_json::json!({ "kind": vsphere_kind(raw), "id": self.text });
            }
        }
        if self.children.is_empty() {
            return scalar(xsi, &self.text);
        }

        let mut map = Map::new();
        if !xsi.is_empty() {
            map.insert("_type".into(), Value::String(xsi.to_string()));
        }
        for c in &self.children {
            let v = c.to_value();
            match map.get_mut(&c.name) {
                Some(Value::Array(items)) => items.push(v),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, v]);
                }
                None => {
                    map.insert(c.name.clone(), v);
                }
            }
        }
        Value::Object(map)
    }
}

fn scalar(xsi: &str, text: &str) -> Value {
    match xsi {
        "boolean" => text.parse::<bool>().map(Value::Bool).unwrap_or(Value::Null),
        "int" | "long" | "short" | "byte" => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        "double" | "float" => text
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        _ => Value::String(text.to_string()),
    }
}

/// Escape text for inclusion in a request body.
pub fn escape(s: &str) -> String {
    quick_xml::escape::escape(s).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_change_set_values() {
        let doc = r#"<?xml version="1.0"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"
  xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
<soapenv:Body><r>
  <val xsi:type="xsd:boolean">true</val>
  <val xsi:type="xsd:long">42</val>
  <val xsi:type="xsd:string">a &amp; b</val>
  <val xsi:type="ManagedObjectReference" type="HostSystem">host-9</val>
  <val xsi:type="ArrayOfManagedObjectReference">
    <ManagedObjectReference type="VirtualMachine">vm-1</ManagedObjectReference>
    <ManagedObjectReference type="VirtualMachine">vm-2</ManagedObjectReference>
  </val>
</r></soapenv:Body></soapenv:Envelope>"#;
        let root = parse(doc).unwrap();
        let r = root.descendant("r").unwrap();
        let vals: Vec<Value> = r.children_named("val").map(Element::to_value).collect();
        assert_eq!(vals[0], json!(true));
        assert_eq!(vals[1], json!(42));
        assert_eq!(vals[2], json!("a & b"));
        assert_eq!(vals[3], json!({"kind": "Host", "id": "host-9"}));
        assert_eq!(
            vals[4],
            json!([{"kind": "VM", "id": "vm-1"}, {"kind": "VM", "id": "vm-2"}])
        );
    }

    #[test]
    fn test_complex_value_keeps_type_and_repeats() {
        let doc = r#"<val xmlns:xsi="x" xsi:type="ArrayOfVirtualDevice">
<VirtualDevice xsi:type="VirtualDisk"><key>2000</key>
<backing xsi:type="VirtualDiskFlatVer2BackingInfo"><fileName>[ds] a.vmdk</fileName>
<datastore type="Datastore">datastore-1</datastore></backing>
<capacityInBytes>1024</capacityInBytes></VirtualDevice>
<VirtualDevice xsi:type="VirtualE1000"><key>4000</key><macAddress>aa</macAddress></VirtualDevice>
</val>"#;
        let root = parse(doc).unwrap();
        let v = root.child("val").unwrap().to_value();
        assert_eq!(v[0]["_type"], "VirtualDisk");
        assert_eq!(v[0]["backing"]["datastore"], json!({"kind": "Datastore", "id": "datastore-1"}));
        assert_eq!(v[0]["capacityInBytes"], "1024");
        assert_eq!(v[1]["macAddress"], "aa");
    }

    #[test]
    fn test_truncated_document_is_error() {
        assert!(parse("<a><b>").is_err());
    }
}
