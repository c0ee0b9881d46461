//! Packets, flags and bodies
// (c) 2026 The muxrpc authors

use std::fmt::Display;

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

/////////////////////////////////////////////////////////////////////////////////////////////
// FLAGS

bitflags! {
    /// The flag byte at the start of every frame.
    ///
    /// Only the low nibble is defined; see the [module documentation](super) for the layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct Flags: u8 {
        /// More frames belong to this logical call after this one
        const STREAM = 0b0000_1000;
        /// This frame terminates the logical call
        const END_ERR = 0b0000_0100;
        /// Body is JSON
        const JSON = 0b0000_0010;
        /// Body is a UTF-8 string
        const STRING = 0b0000_0001;
    }
}

impl Flags {
    /// Checks the invariants a well-formed flag byte must satisfy.
    ///
    /// Reserved bits must be clear, and JSON and String are mutually exclusive.
    #[must_use]
    pub fn is_valid(self) -> bool {
        Flags::from_bits(self.bits()).is_some() && !self.contains(Flags::JSON | Flags::STRING)
    }

    /// The body encoding selected by these flags, if it is a valid one
    #[must_use]
    pub fn encoding(self) -> Option<Encoding> {
        match (self.contains(Flags::JSON), self.contains(Flags::STRING)) {
            (false, false) => Some(Encoding::Binary),
            (false, true) => Some(Encoding::String),
            (true, false) => Some(Encoding::Json),
            (true, true) => None,
        }
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
// BODY

/// The three body encodings a frame can announce
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Encoding {
    /// Raw bytes (neither JSON nor String flag set)
    Binary,
    /// UTF-8 text
    String,
    /// JSON document
    Json,
}

impl Encoding {
    /// The flag bits for this encoding
    #[must_use]
    pub const fn flags(self) -> Flags {
        match self {
            Encoding::Binary => Flags::empty(),
            Encoding::String => Flags::STRING,
            Encoding::Json => Flags::JSON,
        }
    }
}

/// A frame body, tagged with the encoding its flags announced.
///
/// JSON bodies keep the exact bytes received; they are only parsed when asked for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    /// Opaque bytes
    Binary(Bytes),
    /// UTF-8 text
    String(String),
    /// JSON document (unparsed)
    Json(Bytes),
}

impl Body {
    /// The literal body of a successful `EndErr` frame
    pub const TRUE: &'static [u8] = b"true";

    /// Serializes `value` into a JSON body
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Body::Json(serde_json::to_vec(value)?.into()))
    }

    /// Wraps pre-encoded JSON. The bytes are not checked.
    #[must_use]
    pub fn raw_json(bytes: impl Into<Bytes>) -> Self {
        Body::Json(bytes.into())
    }

    /// The success marker carried by a clean `EndErr` frame
    #[must_use]
    pub fn end_ok() -> Self {
        Body::Json(Bytes::from_static(Self::TRUE))
    }

    /// Which encoding this body uses
    #[must_use]
    pub fn encoding(&self) -> Encoding {
        match self {
            Body::Binary(_) => Encoding::Binary,
            Body::String(_) => Encoding::String,
            Body::Json(_) => Encoding::Json,
        }
    }

    /// The bytes that go on the wire
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Binary(b) | Body::Json(b) => &b[..],
            Body::String(s) => s.as_bytes(),
        }
    }

    /// Length on the wire
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Is the body empty?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Is this the literal success marker (`true`)?
    #[must_use]
    pub fn is_true(&self) -> bool {
        self.as_bytes() == Self::TRUE
    }

    /// Parses the body as JSON.
    ///
    /// String bodies are offered to the deserializer as a JSON string, so that a
    /// method returning plain text can be read as `String`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Body::Json(b) => serde_json::from_slice(b),
            Body::String(s) => T::deserialize(serde_json::Value::String(s.clone())),
            Body::Binary(b) => serde_json::from_slice(b),
        }
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::String(value)
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::String(value.to_owned())
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::Binary(value.into())
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Body::Binary(value)
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Body::Json(value.to_string().into_bytes().into())
    }
}

impl Display for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Body::String(s) => write!(f, "{s:?}"),
            Body::Json(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
// PACKET

/// One frame on the wire.
///
/// The encoding flags are not stored separately; they always follow from [`Packet::body`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Stream identifier. Sign tells who opened the call; see [`Packer`](crate::Packer).
    pub id: i32,
    /// More frames follow for this call
    pub stream: bool,
    /// This frame terminates the call
    pub end_err: bool,
    /// Payload
    pub body: Body,
}

impl Packet {
    /// Constructor for an ordinary data frame
    #[must_use]
    pub fn data(id: i32, stream: bool, body: Body) -> Self {
        Self {
            id,
            stream,
            end_err: false,
            body,
        }
    }

    /// Constructor for a clean end frame
    #[must_use]
    pub fn end_ok(id: i32, stream: bool) -> Self {
        Self {
            id,
            stream,
            end_err: true,
            body: Body::end_ok(),
        }
    }

    /// The complete flag byte for this packet
    #[must_use]
    pub fn flags(&self) -> Flags {
        let mut flags = self.body.encoding().flags();
        flags.set(Flags::STREAM, self.stream);
        flags.set(Flags::END_ERR, self.end_err);
        flags
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Packet(id={}, {:?}, {} bytes)",
            self.id,
            self.flags(),
            self.body.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use assertables::assert_contains;
    use pretty_assertions::assert_eq;

    use super::{Body, Encoding, Flags, Packet};
    use rstest::rstest;

    #[rstest]
    #[case(0x00, true)]
    #[case(0x08, true)]
    #[case(0x0e, true)]
    #[case(0x0d, true)]
    #[case(0x03, false)]
    #[case(0x0f, false)]
    #[case(0x10, false)]
    #[case(0x80, false)]
    fn flag_validity(#[case] bits: u8, #[case] valid: bool) {
        assert_eq!(Flags::from_bits_retain(bits).is_valid(), valid);
    }

    #[test]
    fn packet_flags_follow_body() {
        let p = Packet::data(3, true, Body::from("hello"));
        assert_eq!(p.flags(), Flags::STREAM | Flags::STRING);
        let p = Packet::end_ok(-3, false);
        assert_eq!(p.flags(), Flags::END_ERR | Flags::JSON);
        let p = Packet::data(1, false, Body::from(vec![1u8, 2]));
        assert_eq!(p.flags(), Flags::empty());
        assert_eq!(p.flags().encoding(), Some(Encoding::Binary));
    }

    #[test]
    fn reserved_bits_survive_until_checked() {
        let f = Flags::from_bits_retain(0x88);
        assert!(f.contains(Flags::STREAM));
        assert_eq!(f.bits(), 0x88);
        assert!(!f.is_valid());
        assert_eq!(f.encoding(), Some(Encoding::Binary));
    }

    #[test]
    fn body_decoding() {
        let b = Body::json(&serde_json::json!({"a": 1})).unwrap();
        let v: serde_json::Value = b.decode().unwrap();
        assert_eq!(v["a"], 1);

        let s: String = Body::from("plain").decode().unwrap();
        assert_eq!(s, "plain");

        assert!(Body::end_ok().is_true());
        assert!(Body::from("true").decode::<bool>().is_err());
    }

    #[test]
    fn debug_names() {
        let s = format!("{:?}", Flags::STREAM | Flags::JSON);
        assert_contains!(s, "STREAM");
        assert_contains!(s, "JSON");
    }
}
