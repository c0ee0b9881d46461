//! Call headers, call types and remote call errors
// (c) 2026 The muxrpc authors

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/////////////////////////////////////////////////////////////////////////////////////////////
// CALL TYPE & CAPABILITIES

/// The semantics of a logical call
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CallType {
    /// A single request, answered by a single response
    #[default]
    Async,
    /// Treated exactly like `Async` on the wire
    Sync,
    /// The callee streams many responses
    Source,
    /// The caller streams many requests
    Sink,
    /// Both sides stream
    Duplex,
}

impl CallType {
    /// Does this call type use the `Stream` flag?
    #[must_use]
    pub const fn is_stream(self) -> bool {
        matches!(self, CallType::Source | CallType::Sink | CallType::Duplex)
    }

    /// The `(inbound, outbound)` capability pair this call type grants one side of the call
    #[must_use]
    pub const fn capabilities(self, role: Role) -> (Capability, Capability) {
        use Capability::{Many, Nil, Once};
        match (self, role) {
            (CallType::Async | CallType::Sync, Role::Caller) => (Once, Nil),
            (CallType::Async | CallType::Sync, Role::Callee) => (Nil, Once),
            (CallType::Source, Role::Caller) | (CallType::Sink, Role::Callee) => (Many, Nil),
            (CallType::Source, Role::Callee) | (CallType::Sink, Role::Caller) => (Nil, Many),
            (CallType::Duplex, _) => (Many, Many),
        }
    }
}

/// Which side of a call we are
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    /// We opened the call
    Caller,
    /// The peer opened the call
    Callee,
}

/// How many times one direction of a stream may be used
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Capability {
    /// The direction is not usable at all
    #[strum(serialize = "none")]
    Nil,
    /// Exactly one successful operation
    Once,
    /// Repeatable until the stream is closed
    Many,
}

impl Capability {
    /// Can this direction be used at all?
    #[must_use]
    pub const fn allowed(self) -> bool {
        !matches!(self, Capability::Nil)
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
// METHOD

/// A dotted method path, e.g. `blobs.get`
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(from = "MethodRepr", into = "Vec<String>")]
#[display("{}", _0.join("."))]
pub struct Method(Vec<String>);

/// On the wire a method is usually an array of path components, but a bare string is
/// accepted as a single component.
#[derive(Deserialize)]
#[serde(untagged)]
enum MethodRepr {
    String(String),
    Vec(Vec<String>),
}

impl From<MethodRepr> for Method {
    fn from(value: MethodRepr) -> Self {
        match value {
            MethodRepr::String(s) => Method(vec![s]),
            MethodRepr::Vec(v) => Method(v),
        }
    }
}

impl From<Method> for Vec<String> {
    fn from(value: Method) -> Self {
        value.0
    }
}

impl Method {
    /// Constructor from path components
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Method(parts.into_iter().map(Into::into).collect())
    }

    /// Path components
    #[must_use]
    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Number of path components
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Is this the empty path?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Does `self` begin with every component of `prefix`?
    #[must_use]
    pub fn has_prefix(&self, prefix: &Method) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl From<&str> for Method {
    /// Splits a dotted path
    fn from(value: &str) -> Self {
        if value.is_empty() {
            return Method::default();
        }
        Method::new(value.split('.'))
    }
}

impl From<&[&str]> for Method {
    fn from(value: &[&str]) -> Self {
        Method::new(value.iter().copied())
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
// CALL HEADER

/// The JSON body of the first packet of every call
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallHeader {
    /// Method being called
    pub name: Method,
    /// Call arguments (always a JSON array once normalised)
    #[serde(default)]
    pub args: Option<Box<RawValue>>,
    /// Call type; absent means async
    #[serde(rename = "type", default)]
    pub call_type: CallType,
}

impl CallHeader {
    /// Constructor. The arguments are normalised with [`normalize_args`].
    pub fn new(
        name: Method,
        call_type: CallType,
        args: Option<&RawValue>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            name,
            args: Some(normalize_args(args)?),
            call_type,
        })
    }

    /// The normalised arguments
    pub fn args(&self) -> Result<Box<RawValue>, serde_json::Error> {
        normalize_args(self.args.as_deref())
    }
}

/// Brings call arguments into array form.
///
/// Missing or `null` arguments become `[]`; any other non-array value is wrapped in a
/// one-element array. Arrays are kept byte for byte.
pub fn normalize_args(args: Option<&RawValue>) -> Result<Box<RawValue>, serde_json::Error> {
    let text = args.map_or("null", |a| a.get().trim());
    if text.starts_with('[') {
        return RawValue::from_string(text.to_owned());
    }
    if text == "null" {
        return RawValue::from_string("[]".to_owned());
    }
    RawValue::from_string(format!("[{text}]"))
}

/////////////////////////////////////////////////////////////////////////////////////////////
// CALL ERROR

/// An error reported by the remote end of a call, as carried in an `EndErr` frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct CallError {
    /// Error class name
    #[serde(default)]
    pub name: String,
    /// Human readable message
    #[serde(default)]
    pub message: String,
    /// Stack trace or other detail, if the sender supplied any
    #[serde(default)]
    pub stack: String,
}

impl CallError {
    /// The class name we use for errors originating here
    pub const DEFAULT_NAME: &'static str = "Error";

    /// Constructor for an error with the default class name and no stack
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_owned(),
            message: message.into(),
            stack: String::new(),
        }
    }

    /// The standard rejection for a call nobody handles
    #[must_use]
    pub fn no_such_method(method: &Method) -> Self {
        Self::new(format!("no such method: {method}"))
    }

    /// Converts an application error into a call error.
    ///
    /// If the error already wraps a `CallError`, perhaps one relayed from another call,
    /// it is passed through unchanged.
    #[must_use]
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(ce) = err.downcast_ref::<CallError>() {
            return ce.clone();
        }
        if let Some(ce) = err
            .downcast_ref::<crate::Error>()
            .and_then(crate::Error::as_call_error)
        {
            return ce.clone();
        }
        Self::new(format!("{err:#}"))
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
