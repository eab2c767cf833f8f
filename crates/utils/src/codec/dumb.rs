/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The "dumb" codec: every record payload starts with a one-byte type tag
//! so heterogeneous values round-trip through the same slot. Wrapped
//! variants (`z` deflate, `e` AES) recursively contain another tagged
//! payload; the AES envelope is peeled by the store layer before payloads
//! reach this module.

use super::{Deserialize, Serialize};
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use std::{borrow::Cow, collections::BTreeMap, io::Read, io::Write};

pub const TAG_NULL: u8 = b'-';
pub const TAG_TRUE: u8 = b'y';
pub const TAG_FALSE: u8 = b'n';
pub const TAG_INT: u8 = b'd';
pub const TAG_FLOAT: u8 = b'f';
pub const TAG_BYTES: u8 = b'b';
pub const TAG_TEXT: u8 = b'u';
pub const TAG_JSON: u8 = b'j';
pub const TAG_SET: u8 = b's';
pub const TAG_TUPLE: u8 = b't';
pub const TAG_DEFLATE: u8 = b'z';
pub const TAG_ENCRYPTED: u8 = b'e';

/// A tagged-sum stand-in for the source's runtime type dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Text(String),
    List(Vec<Value>),
    Set(Vec<Value>),
    Tuple(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(int) => Some(*int),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn to_json(&self) -> trc::Result<serde_json::Value> {
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(int) => serde_json::Value::from(*int),
            Value::Float(float) => serde_json::Number::from_f64(*float)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(text) => serde_json::Value::String(text.clone()),
            Value::List(items) | Value::Set(items) | Value::Tuple(items) => {
                serde_json::Value::Array(
                    items
                        .iter()
                        .map(|item| item.to_json())
                        .collect::<trc::Result<_>>()?,
                )
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(key, value)| value.to_json().map(|value| (key.clone(), value)))
                    .collect::<trc::Result<_>>()?,
            ),
            Value::Bytes(_) => {
                // Raw bytes cannot be nested inside a JSON container; the
                // encoder fails loudly rather than guessing an encoding.
                return Err(trc::StoreEvent::UnexpectedError
                    .caused_by(trc::location!())
                    .details("bytes value inside a JSON container"));
            }
        })
    }

    fn from_json(value: serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    Value::Int(int)
                } else {
                    Value::Float(number.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(text) => Value::Text(text),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from_json(value)))
                    .collect(),
            ),
        }
    }
}

impl Serialize for Value {
    fn serialize(&self) -> trc::Result<Vec<u8>> {
        Ok(match self {
            Value::Null => vec![TAG_NULL],
            Value::Bool(true) => vec![TAG_TRUE],
            Value::Bool(false) => vec![TAG_FALSE],
            Value::Int(int) => {
                let mut buf = vec![TAG_INT];
                buf.extend_from_slice(int.to_string().as_bytes());
                buf
            }
            Value::Float(float) => {
                let mut buf = vec![TAG_FLOAT];
                buf.extend_from_slice(float.to_string().as_bytes());
                buf
            }
            Value::Bytes(bytes) => {
                let mut buf = Vec::with_capacity(bytes.len() + 1);
                buf.push(TAG_BYTES);
                buf.extend_from_slice(bytes);
                buf
            }
            Value::Text(text) => {
                let mut buf = Vec::with_capacity(text.len() + 1);
                buf.push(TAG_TEXT);
                buf.extend_from_slice(text.as_bytes());
                buf
            }
            Value::List(_) | Value::Map(_) => json_payload(TAG_JSON, self)?,
            Value::Set(_) => json_payload(TAG_SET, self)?,
            Value::Tuple(_) => json_payload(TAG_TUPLE, self)?,
        })
    }
}

impl Deserialize for Value {
    fn deserialize(bytes: &[u8]) -> trc::Result<Self> {
        let (tag, body) = split_tag(bytes)?;
        Ok(match tag {
            TAG_NULL if body.is_empty() => Value::Null,
            TAG_TRUE if body.is_empty() => Value::Bool(true),
            TAG_FALSE if body.is_empty() => Value::Bool(false),
            TAG_INT => Value::Int(parse_ascii(body)?),
            TAG_FLOAT => Value::Float(parse_ascii(body)?),
            TAG_BYTES => Value::Bytes(body.to_vec()),
            TAG_TEXT => Value::Text(parse_utf8(body)?.into_owned()),
            TAG_JSON => Value::from_json(parse_json(body)?),
            TAG_SET => match Value::from_json(parse_json(body)?) {
                Value::List(items) => Value::Set(items),
                _ => return Err(tag_mismatch(tag)),
            },
            TAG_TUPLE => match Value::from_json(parse_json(body)?) {
                Value::List(items) => Value::Tuple(items),
                _ => return Err(tag_mismatch(tag)),
            },
            TAG_DEFLATE => Value::deserialize(&inflate(bytes)?)?,
            _ => return Err(tag_mismatch(tag)),
        })
    }
}

fn json_payload(tag: u8, value: &Value) -> trc::Result<Vec<u8>> {
    let json = value.to_json()?;
    let mut buf = vec![tag];
    serde_json::to_writer(&mut buf, &json).map_err(|err| {
        trc::StoreEvent::UnexpectedError
            .caused_by(trc::location!())
            .reason(err)
    })?;
    Ok(buf)
}

fn split_tag(bytes: &[u8]) -> trc::Result<(u8, &[u8])> {
    bytes
        .split_first()
        .map(|(tag, body)| (*tag, body))
        .ok_or_else(|| {
            trc::StoreEvent::DataCorruption
                .caused_by(trc::location!())
                .details("empty payload")
        })
}

fn tag_mismatch(tag: u8) -> trc::Error {
    let err = trc::StoreEvent::DataCorruption.caused_by(trc::location!());
    if tag == TAG_ENCRYPTED {
        err.details("encrypted payload reached the codec")
    } else {
        err.details("unexpected payload tag").ctx(
            trc::Key::Found,
            (tag as char).to_string(),
        )
    }
}

fn parse_utf8(body: &[u8]) -> trc::Result<Cow<'_, str>> {
    std::str::from_utf8(body).map(Cow::Borrowed).map_err(|err| {
        trc::StoreEvent::DataCorruption
            .caused_by(trc::location!())
            .reason(err)
    })
}

fn parse_ascii<T: std::str::FromStr>(body: &[u8]) -> trc::Result<T>
where
    T::Err: std::fmt::Display,
{
    parse_utf8(body)?.parse().map_err(|err| {
        trc::StoreEvent::DataCorruption
            .caused_by(trc::location!())
            .reason(err)
    })
}

fn parse_json(body: &[u8]) -> trc::Result<serde_json::Value> {
    serde_json::from_slice(body).map_err(|err| {
        trc::StoreEvent::DataCorruption
            .caused_by(trc::location!())
            .reason(err)
    })
}

/// Wraps an encoded payload in a `z` deflate envelope.
pub fn deflate(payload: &[u8]) -> trc::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(vec![TAG_DEFLATE], Compression::default());
    encoder.write_all(payload).and_then(|_| encoder.finish()).map_err(|err| {
        trc::StoreEvent::UnexpectedError
            .caused_by(trc::location!())
            .reason(err)
    })
}

/// Unwraps a `z` deflate envelope into the inner tagged payload.
pub fn inflate(bytes: &[u8]) -> trc::Result<Vec<u8>> {
    let (tag, body) = split_tag(bytes)?;
    if tag != TAG_DEFLATE {
        return Err(tag_mismatch(tag));
    }
    let mut payload = Vec::with_capacity(body.len() * 2);
    ZlibDecoder::new(body)
        .read_to_end(&mut payload)
        .map_err(|err| {
            trc::StoreEvent::DecompressError
                .caused_by(trc::location!())
                .reason(err)
        })?;
    Ok(payload)
}

/// Applies the deflate wrapper when the payload reaches the threshold and
/// compression actually helps. A threshold of zero disables compression.
pub fn maybe_compress(encoded: Vec<u8>, threshold: usize) -> Vec<u8> {
    if threshold > 0 && encoded.len() >= threshold {
        if let Ok(compressed) = deflate(&encoded) {
            if compressed.len() < encoded.len() {
                return compressed;
            }
        }
    }
    encoded
}

/// Peels a deflate wrapper if present, leaving other payloads untouched.
pub fn unwrap_compressed(bytes: &[u8]) -> trc::Result<Cow<'_, [u8]>> {
    if bytes.first() == Some(&TAG_DEFLATE) {
        inflate(bytes).map(Cow::Owned)
    } else {
        Ok(Cow::Borrowed(bytes))
    }
}

impl Serialize for String {
    fn serialize(&self) -> trc::Result<Vec<u8>> {
        self.as_str().serialize()
    }
}

impl Serialize for &str {
    fn serialize(&self) -> trc::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len() + 1);
        buf.push(TAG_TEXT);
        buf.extend_from_slice(self.as_bytes());
        Ok(buf)
    }
}

impl Deserialize for String {
    fn deserialize(bytes: &[u8]) -> trc::Result<Self> {
        match Value::deserialize(bytes)? {
            Value::Text(text) => Ok(text),
            _ => Err(tag_mismatch(bytes[0])),
        }
    }
}

impl Serialize for Vec<u8> {
    fn serialize(&self) -> trc::Result<Vec<u8>> {
        Value::Bytes(self.clone()).serialize()
    }
}

impl Serialize for &[u8] {
    fn serialize(&self) -> trc::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len() + 1);
        buf.push(TAG_BYTES);
        buf.extend_from_slice(self);
        Ok(buf)
    }
}

impl Deserialize for Vec<u8> {
    fn deserialize(bytes: &[u8]) -> trc::Result<Self> {
        match Value::deserialize(bytes)? {
            Value::Bytes(bytes) => Ok(bytes),
            _ => Err(tag_mismatch(bytes[0])),
        }
    }
}

impl Serialize for i64 {
    fn serialize(&self) -> trc::Result<Vec<u8>> {
        Value::Int(*self).serialize()
    }
}

impl Deserialize for i64 {
    fn deserialize(bytes: &[u8]) -> trc::Result<Self> {
        match Value::deserialize(bytes)? {
            Value::Int(int) => Ok(int),
            _ => Err(tag_mismatch(bytes[0])),
        }
    }
}

impl Serialize for u32 {
    fn serialize(&self) -> trc::Result<Vec<u8>> {
        Value::Int(*self as i64).serialize()
    }
}

impl Deserialize for u32 {
    fn deserialize(bytes: &[u8]) -> trc::Result<Self> {
        i64::deserialize(bytes).and_then(|int| {
            u32::try_from(int).map_err(|err| {
                trc::StoreEvent::DataCorruption
                    .caused_by(trc::location!())
                    .reason(err)
            })
        })
    }
}

impl Serialize for bool {
    fn serialize(&self) -> trc::Result<Vec<u8>> {
        Value::Bool(*self).serialize()
    }
}

impl Deserialize for bool {
    fn deserialize(bytes: &[u8]) -> trc::Result<Self> {
        match Value::deserialize(bytes)? {
            Value::Bool(b) => Ok(b),
            _ => Err(tag_mismatch(bytes[0])),
        }
    }
}
