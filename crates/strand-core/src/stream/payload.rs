//! Call arguments and results.
//!
//! A [`Payload`] is built at the call site: plain JSON goes in `Scalar`,
//! live streams go in `Readable` (the peer reads what we produce) or
//! `Writable` (the peer writes into our sink). `List` and `Map` nest them.

use super::readable::ReadableStream;
use super::writable::WritableStream;
use crate::error::{Result, RpcError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub enum Payload {
    /// Plain JSON. An object with exactly the keys `streamId`, `readable`
    /// and `writable` is reserved for stream handles and cannot be sent.
    Scalar(Value),
    List(Vec<Payload>),
    Map(BTreeMap<String, Payload>),
    Readable(ReadableStream),
    Writable(WritableStream),
}

impl Payload {
    pub fn null() -> Self {
        Payload::Scalar(Value::Null)
    }

    /// Serialize any value into a scalar payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Payload::Scalar(serde_json::to_value(value)?))
    }

    pub fn list(items: impl IntoIterator<Item = Payload>) -> Self {
        Payload::List(items.into_iter().collect())
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Payload)>) -> Self {
        Payload::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Payload::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(Value::as_str)
    }

    /// True if a stream appears anywhere in this payload.
    pub fn has_streams(&self) -> bool {
        match self {
            Payload::Scalar(_) => false,
            Payload::List(items) => items.iter().any(Payload::has_streams),
            Payload::Map(entries) => entries.values().any(Payload::has_streams),
            Payload::Readable(_) | Payload::Writable(_) => true,
        }
    }

    /// Convert to plain JSON. Fails if the payload carries a stream.
    pub fn into_value(self) -> Result<Value> {
        match self {
            Payload::Scalar(value) => Ok(value),
            Payload::List(items) => items
                .into_iter()
                .map(Payload::into_value)
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Payload::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| v.into_value().map(|v| (k, v)))
                .collect::<Result<serde_json::Map<_, _>>>()
                .map(Value::Object),
            Payload::Readable(_) | Payload::Writable(_) => Err(RpcError::StreamingUnsupported),
        }
    }

    /// Deserialize a stream-free payload.
    pub fn parse<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_value(self.into_value()?)?)
    }

    pub fn into_readable(self) -> Option<ReadableStream> {
        match self {
            Payload::Readable(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn into_writable(self) -> Option<WritableStream> {
        match self {
            Payload::Writable(stream) => Some(stream),
            _ => None,
        }
    }

    /// Remove a map entry, for handlers receiving an options object.
    pub fn take(&mut self, key: &str) -> Option<Payload> {
        match self {
            Payload::Map(entries) => entries.remove(key),
            Payload::Scalar(Value::Object(obj)) => obj.remove(key).map(Payload::Scalar),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Scalar(value) => write!(f, "{}", value),
            Payload::List(items) => f.debug_list().entries(items).finish(),
            Payload::Map(entries) => f.debug_map().entries(entries).finish(),
            Payload::Readable(_) => write!(f, "<readable>"),
            Payload::Writable(_) => write!(f, "<writable>"),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::null()
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Scalar(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Scalar(Value::String(value.to_string()))
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Scalar(Value::String(value))
    }
}

impl From<ReadableStream> for Payload {
    fn from(stream: ReadableStream) -> Self {
        Payload::Readable(stream)
    }
}

impl From<WritableStream> for Payload {
    fn from(stream: WritableStream) -> Self {
        Payload::Writable(stream)
    }
}
