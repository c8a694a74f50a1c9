//! XML-RPC value model shared by the codec, the transport and the daemon client.

pub mod codec;
pub mod transport;

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Standard "method not found" code from the XML-RPC fault code conventions.
const FAULT_CODE_METHOD_NOT_FOUND: i32 = -32601;
/// Fault code Twisted's XML-RPC resource answers with for unknown procedures.
const FAULT_CODE_TWISTED_NOT_FOUND: i32 = 8001;

#[derive(Debug, Clone, PartialEq)]
pub enum RpcValue {
    Int(i32),
    Double(f64),
    Bool(bool),
    Str(String),
    Array(Vec<RpcValue>),
    Struct(BTreeMap<String, RpcValue>),
}

impl RpcValue {
    /// Integer view of the value. Legacy daemons sometimes answer counts as
    /// digit-only strings, those are accepted too.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RpcValue::Int(n) => Some(i64::from(*n)),
            RpcValue::Str(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                s.parse().ok()
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RpcValue::Double(d) => Some(*d),
            RpcValue::Int(n) => Some(f64::from(*n)),
            RpcValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean view: the daemon answers either `<boolean>` or `0`/`1` integers.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RpcValue::Bool(b) => Some(*b),
            other => other.as_int().map(|n| n != 0),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RpcValue]> {
        match self {
            RpcValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RpcValue::Int(_) => "int",
            RpcValue::Double(_) => "double",
            RpcValue::Bool(_) => "boolean",
            RpcValue::Str(_) => "string",
            RpcValue::Array(_) => "array",
            RpcValue::Struct(_) => "struct",
        }
    }
}

impl From<i32> for RpcValue {
    fn from(v: i32) -> Self {
        RpcValue::Int(v)
    }
}

impl From<f64> for RpcValue {
    fn from(v: f64) -> Self {
        RpcValue::Double(v)
    }
}

impl From<bool> for RpcValue {
    fn from(v: bool) -> Self {
        RpcValue::Bool(v)
    }
}

impl From<&str> for RpcValue {
    fn from(v: &str) -> Self {
        RpcValue::Str(v.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(v: String) -> Self {
        RpcValue::Str(v)
    }
}

impl<T: Into<RpcValue>> From<Vec<T>> for RpcValue {
    fn from(v: Vec<T>) -> Self {
        RpcValue::Array(v.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The daemon does not know the requested method name.
    MethodNotFound,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcFault {
    pub code: Option<i32>,
    pub message: String,
    pub kind: FaultKind,
}

impl RpcFault {
    pub fn new(code: Option<i32>, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = classify_fault(code, &message);
        Self { code, message, kind }
    }

    pub fn is_method_not_found(&self) -> bool {
        self.kind == FaultKind::MethodNotFound
    }
}

impl fmt::Display for RpcFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} | {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

fn classify_fault(code: Option<i32>, message: &str) -> FaultKind {
    if matches!(
        code,
        Some(FAULT_CODE_METHOD_NOT_FOUND) | Some(FAULT_CODE_TWISTED_NOT_FOUND)
    ) {
        return FaultKind::MethodNotFound;
    }
    let lower = message.to_ascii_lowercase();
    if lower.contains("procedure") && lower.contains("not found") {
        FaultKind::MethodNotFound
    } else {
        FaultKind::Other
    }
}

/// A decoded `methodResponse`: either a (possibly absent) value or a fault.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodResponse {
    Success(Option<RpcValue>),
    Fault(RpcFault),
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Daemon unreachable: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("XML-RPC fault: {0}")]
    Fault(RpcFault),

    #[error("No remote method available among: {0}")]
    MethodUnavailable(String),
}

impl From<quick_xml::Error> for RpcError {
    fn from(e: quick_xml::Error) -> Self {
        RpcError::Protocol(format!("malformed document: {}", e))
    }
}
