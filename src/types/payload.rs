//! Self-describing request/reply payloads.
//!
//! A [`Payload`] carries either an in-process value or its msgpack encoding
//! tagged with the Rust type name. In-process values are only serialized when
//! they actually cross a process boundary, so the local dispatch path never
//! pays for encoding.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

use super::errors::{Error, Result};

/// Encoded payload as it appears inside an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePayload {
    pub type_name: String,
    pub data: Vec<u8>,
}

/// Type-erased message that can still be encoded on demand.
trait ErasedMessage: Send {
    fn type_name(&self) -> &'static str;
    fn encode(&self) -> Result<Vec<u8>>;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T> ErasedMessage for T
where
    T: Serialize + Send + 'static,
{
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

enum Repr {
    Local(Box<dyn ErasedMessage>),
    Wire(WirePayload),
}

/// Opaque, typed request or reply body.
pub struct Payload {
    repr: Repr,
}

impl Payload {
    /// Wrap an in-process value.
    pub fn new<T>(value: T) -> Self
    where
        T: Serialize + Send + 'static,
    {
        Self {
            repr: Repr::Local(Box::new(value)),
        }
    }

    /// Empty body for methods without a meaningful reply.
    pub fn unit() -> Self {
        Self::new(())
    }

    pub fn from_wire(wire: WirePayload) -> Self {
        Self {
            repr: Repr::Wire(wire),
        }
    }

    /// Type name of the carried value.
    pub fn type_name(&self) -> &str {
        match &self.repr {
            Repr::Local(value) => value.type_name(),
            Repr::Wire(wire) => &wire.type_name,
        }
    }

    /// Whether the value never left this process.
    pub fn is_local(&self) -> bool {
        matches!(self.repr, Repr::Local(_))
    }

    /// Recover the concrete value.
    ///
    /// An in-process value of exactly `T` is moved out without encoding. Any
    /// other value goes through msgpack, so a structurally compatible type
    /// decodes the same way locally as it would after a network hop.
    pub fn decode<T>(self) -> Result<T>
    where
        T: DeserializeOwned + 'static,
    {
        let expected = std::any::type_name::<T>();
        match self.repr {
            Repr::Local(value) if value.type_name() == expected => value
                .into_any()
                .downcast::<T>()
                .map(|boxed| *boxed)
                .map_err(|_| Error::server(format!("payload downcast to {} failed", expected))),
            Repr::Local(value) => {
                let data = value.encode()?;
                decode_bytes(&data, value.type_name(), expected)
            }
            Repr::Wire(wire) => decode_bytes(&wire.data, &wire.type_name, expected),
        }
    }

    /// Encode for transmission.
    pub fn into_wire(self) -> Result<WirePayload> {
        match self.repr {
            Repr::Local(value) => Ok(WirePayload {
                type_name: value.type_name().to_string(),
                data: value.encode()?,
            }),
            Repr::Wire(wire) => Ok(wire),
        }
    }
}

fn decode_bytes<T: DeserializeOwned>(data: &[u8], actual: &str, expected: &str) -> Result<T> {
    rmp_serde::from_slice(data).map_err(|e| {
        Error::server(format!(
            "cannot decode payload of type {} as {}: {}",
            actual, expected, e
        ))
    })
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Payload");
        s.field("type_name", &self.type_name());
        match &self.repr {
            Repr::Local(_) => s.field("repr", &"local"),
            Repr::Wire(wire) => s.field("bytes", &wire.data.len()),
        };
        s.finish()
    }
}
