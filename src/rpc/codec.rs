//! XML-RPC document codec.
//!
//! Requests and responses are rendered as compact documents. Decoding first
//! builds a small element tree from `quick_xml` events, then walks it into
//! [`RpcValue`]s so the shape checks stay next to the protocol rules.

use super::{MethodResponse, RpcError, RpcFault, RpcValue};
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::collections::BTreeMap;
use std::fmt::Write;

const XML_DECL: &str = "<?xml version=\"1.0\"?>";

/// Fails only for values XML-RPC cannot carry (non-finite doubles).
pub fn encode_request(method: &str, params: &[RpcValue]) -> Result<String, RpcError> {
    let mut out = String::with_capacity(128);
    out.push_str(XML_DECL);
    out.push_str("<methodCall><methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        write_value(&mut out, param)?;
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    Ok(out)
}

pub fn encode_response(value: Option<&RpcValue>) -> Result<String, RpcError> {
    let mut out = String::with_capacity(128);
    out.push_str(XML_DECL);
    out.push_str("<methodResponse><params>");
    if let Some(value) = value {
        out.push_str("<param>");
        write_value(&mut out, value)?;
        out.push_str("</param>");
    }
    out.push_str("</params></methodResponse>");
    Ok(out)
}

pub fn encode_fault(fault: &RpcFault) -> Result<String, RpcError> {
    let mut members = BTreeMap::new();
    if let Some(code) = fault.code {
        members.insert("faultCode".to_string(), RpcValue::Int(code));
    }
    members.insert("faultString".to_string(), RpcValue::Str(fault.message.clone()));

    let mut out = String::with_capacity(192);
    out.push_str(XML_DECL);
    out.push_str("<methodResponse><fault>");
    write_value(&mut out, &RpcValue::Struct(members))?;
    out.push_str("</fault></methodResponse>");
    Ok(out)
}

fn write_value(out: &mut String, value: &RpcValue) -> Result<(), RpcError> {
    out.push_str("<value>");
    match value {
        RpcValue::Int(n) => {
            let _ = write!(out, "<int>{}</int>", n);
        }
        RpcValue::Double(d) if !d.is_finite() => {
            return Err(RpcError::Protocol(format!("cannot encode non-finite double {}", d)));
        }
        RpcValue::Double(d) => {
            let _ = write!(out, "<double>{}</double>", d);
        }
        RpcValue::Bool(b) => {
            out.push_str(if *b { "<boolean>1</boolean>" } else { "<boolean>0</boolean>" });
        }
        RpcValue::Str(s) => {
            out.push_str("<string>");
            out.push_str(&escape(s.as_str()));
            out.push_str("</string>");
        }
        RpcValue::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                write_value(out, item)?;
            }
            out.push_str("</data></array>");
        }
        RpcValue::Struct(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                out.push_str("<member><name>");
                out.push_str(&escape(name.as_str()));
                out.push_str("</name>");
                write_value(out, member)?;
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
    Ok(())
}

/// Decodes a `methodResponse` document.
pub fn decode_response(xml: &str) -> Result<MethodResponse, RpcError> {
    let root = parse_tree(xml)?;
    if root.name != "methodResponse" {
        return Err(RpcError::Protocol(format!(
            "expected <methodResponse>, found <{}>",
            root.name
        )));
    }

    if let Some(fault) = root.child("fault") {
        let value_node = fault
            .child("value")
            .ok_or_else(|| RpcError::Protocol("<fault> without <value>".into()))?;
        return decode_fault(&decode_value(value_node)?).map(MethodResponse::Fault);
    }

    let value = root
        .child("params")
        .and_then(|params| params.child("param"))
        .and_then(|param| param.child("value"))
        .map(decode_value)
        .transpose()?;
    Ok(MethodResponse::Success(value))
}

/// Decodes a `methodCall` document into its method name and parameters.
pub fn decode_request(xml: &str) -> Result<(String, Vec<RpcValue>), RpcError> {
    let root = parse_tree(xml)?;
    if root.name != "methodCall" {
        return Err(RpcError::Protocol(format!(
            "expected <methodCall>, found <{}>",
            root.name
        )));
    }
    let method = root
        .child("methodName")
        .map(|n| n.text.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| RpcError::Protocol("missing <methodName>".into()))?;

    let mut params = Vec::new();
    if let Some(list) = root.child("params") {
        for param in list.children_named("param") {
            let value = param
                .child("value")
                .ok_or_else(|| RpcError::Protocol("<param> without <value>".into()))?;
            params.push(decode_value(value)?);
        }
    }
    Ok((method, params))
}

fn decode_fault(value: &RpcValue) -> Result<RpcFault, RpcError> {
    let RpcValue::Struct(members) = value else {
        return Err(RpcError::Protocol(format!(
            "fault value is a {}, expected struct",
            value.type_name()
        )));
    };
    let message = members
        .get("faultString")
        .and_then(RpcValue::as_str)
        .ok_or_else(|| RpcError::Protocol("fault without faultString".into()))?;
    let code = members
        .get("faultCode")
        .and_then(RpcValue::as_int)
        .and_then(|c| i32::try_from(c).ok());
    Ok(RpcFault::new(code, message))
}

fn decode_value(node: &Node) -> Result<RpcValue, RpcError> {
    let Some(typed) = node.children.first() else {
        // No type tag: the raw text is a string.
        return Ok(RpcValue::Str(node.text.clone()));
    };

    let text = typed.text.trim();
    match typed.name.as_str() {
        "int" | "i4" | "i8" => text
            .parse::<i32>()
            .map(RpcValue::Int)
            .map_err(|_| RpcError::Protocol(format!("invalid <{}> value '{}'", typed.name, text))),
        "double" => text
            .parse::<f64>()
            .map(RpcValue::Double)
            .map_err(|_| RpcError::Protocol(format!("invalid <double> value '{}'", text))),
        "boolean" => match text {
            "1" | "true" => Ok(RpcValue::Bool(true)),
            "0" | "false" => Ok(RpcValue::Bool(false)),
            other => Err(RpcError::Protocol(format!("invalid <boolean> value '{}'", other))),
        },
        "string" => Ok(RpcValue::Str(typed.text.clone())),
        "dateTime.iso8601" | "base64" => Ok(RpcValue::Str(text.to_string())),
        "array" => {
            let mut items = Vec::new();
            if let Some(data) = typed.child("data") {
                for item in data.children_named("value") {
                    items.push(decode_value(item)?);
                }
            }
            Ok(RpcValue::Array(items))
        }
        "struct" => {
            let mut members = BTreeMap::new();
            for member in typed.children_named("member") {
                let name = member
                    .child("name")
                    .map(|n| n.text.clone())
                    .ok_or_else(|| RpcError::Protocol("<member> without <name>".into()))?;
                let value = member
                    .child("value")
                    .ok_or_else(|| RpcError::Protocol(format!("member '{}' without <value>", name)))?;
                members.insert(name, decode_value(value)?);
            }
            Ok(RpcValue::Struct(members))
        }
        other => Err(RpcError::Protocol(format!("unsupported value type <{}>", other))),
    }
}

#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn new(name: &[u8]) -> Self {
        Self {
            name: String::from_utf8_lossy(name).into_owned(),
            ..Default::default()
        }
    }

    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }
}

fn parse_tree(xml: &str) -> Result<Node, RpcError> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => stack.push(Node::new(e.local_name().as_ref())),
            Event::Empty(e) => attach(&mut stack, &mut root, Node::new(e.local_name().as_ref()))?,
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| RpcError::Protocol("unbalanced closing tag".into()))?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Text(e) => {
                let text = e.unescape()?;
                match stack.last_mut() {
                    Some(top) => top.text.push_str(&text),
                    None if text.trim().is_empty() => {}
                    None => {
                        return Err(RpcError::Protocol("text outside of the root element".into()))
                    }
                }
            }
            Event::CData(e) => {
                let raw = e.into_inner();
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&raw));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(RpcError::Protocol("document ended inside an element".into()));
    }
    root.ok_or_else(|| RpcError::Protocol("empty document".into()))
}

fn attach(stack: &mut [Node], root: &mut Option<Node>, node: Node) -> Result<(), RpcError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
        return Ok(());
    }
    if root.is_some() {
        return Err(RpcError::Protocol("more than one root element".into()));
    }
    *root = Some(node);
    Ok(())
}
