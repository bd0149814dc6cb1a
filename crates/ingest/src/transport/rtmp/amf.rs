//! The AMF0 subset used by RTMP commands.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{IngestError, IngestResult};

const NUMBER: u8 = 0x00;
const BOOLEAN: u8 = 0x01;
const STRING: u8 = 0x02;
const OBJECT: u8 = 0x03;
const NULL: u8 = 0x05;
const UNDEFINED: u8 = 0x06;
const ECMA_ARRAY: u8 = 0x08;
const OBJECT_END: u8 = 0x09;
const STRICT_ARRAY: u8 = 0x0a;
const LONG_STRING: u8 = 0x0c;

#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0Value)>),
    Array(Vec<Amf0Value>),
    Null,
    Undefined,
}

impl Amf0Value {
    pub fn object<'a>(properties: impl IntoIterator<Item = (&'a str, Amf0Value)>) -> Self {
        Self::Object(
            properties
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Amf0Value> {
        match self {
            Self::Object(properties) => properties.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

pub fn encode(values: &[Amf0Value]) -> Bytes {
    let mut buf = BytesMut::new();
    for value in values {
        encode_value(&mut buf, value);
    }
    buf.freeze()
}

fn encode_key(buf: &mut BytesMut, key: &str) {
    buf.put_u16(key.len() as u16);
    buf.put_slice(key.as_bytes());
}

fn encode_value(buf: &mut BytesMut, value: &Amf0Value) {
    match value {
        Amf0Value::Number(n) => {
            buf.put_u8(NUMBER);
            buf.put_f64(*n);
        }
        Amf0Value::Boolean(b) => {
            buf.put_u8(BOOLEAN);
            buf.put_u8(*b as u8);
        }
        Amf0Value::String(s) if s.len() > u16::MAX as usize => {
            buf.put_u8(LONG_STRING);
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Amf0Value::String(s) => {
            buf.put_u8(STRING);
            encode_key(buf, s);
        }
        Amf0Value::Object(properties) => {
            buf.put_u8(OBJECT);
            for (key, value) in properties {
                encode_key(buf, key);
                encode_value(buf, value);
            }
            encode_key(buf, "");
            buf.put_u8(OBJECT_END);
        }
        Amf0Value::Array(items) => {
            buf.put_u8(STRICT_ARRAY);
            buf.put_u32(items.len() as u32);
            for item in items {
                encode_value(buf, item);
            }
        }
        Amf0Value::Null => buf.put_u8(NULL),
        Amf0Value::Undefined => buf.put_u8(UNDEFINED),
    }
}

fn truncated() -> IngestError {
    IngestError::Stream("truncated AMF0 value".into())
}

fn ensure(data: &Bytes, len: usize) -> IngestResult<()> {
    if data.remaining() < len {
        Err(truncated())
    } else {
        Ok(())
    }
}

fn decode_string(data: &mut Bytes, len: usize) -> IngestResult<String> {
    ensure(data, len)?;
    let raw = data.split_to(len);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn decode_key(data: &mut Bytes) -> IngestResult<String> {
    ensure(data, 2)?;
    let len = data.get_u16() as usize;
    decode_string(data, len)
}

fn decode_properties(data: &mut Bytes) -> IngestResult<Vec<(String, Amf0Value)>> {
    let mut properties = Vec::new();
    loop {
        let key = decode_key(data)?;
        ensure(data, 1)?;
        if key.is_empty() && data[0] == OBJECT_END {
            data.advance(1);
            return Ok(properties);
        }
        let value = decode_value(data)?;
        properties.push((key, value));
    }
}

fn decode_value(data: &mut Bytes) -> IngestResult<Amf0Value> {
    ensure(data, 1)?;
    let value = match data.get_u8() {
        NUMBER => {
            ensure(data, 8)?;
            Amf0Value::Number(data.get_f64())
        }
        BOOLEAN => {
            ensure(data, 1)?;
            Amf0Value::Boolean(data.get_u8() != 0)
        }
        STRING => Amf0Value::String(decode_key(data)?),
        LONG_STRING => {
            ensure(data, 4)?;
            let len = data.get_u32() as usize;
            Amf0Value::String(decode_string(data, len)?)
        }
        OBJECT => Amf0Value::Object(decode_properties(data)?),
        ECMA_ARRAY => {
            ensure(data, 4)?;
            // the count is advisory, the end marker terminates
            data.advance(4);
            Amf0Value::Object(decode_properties(data)?)
        }
        STRICT_ARRAY => {
            ensure(data, 4)?;
            let count = data.get_u32();
            let mut items = Vec::new();
            for _ in 0..count {
                items.push(decode_value(data)?);
            }
            Amf0Value::Array(items)
        }
        NULL => Amf0Value::Null,
        UNDEFINED => Amf0Value::Undefined,
        marker => {
            return Err(IngestError::Stream(format!(
                "unsupported AMF0 marker {marker:#04x}"
            )))
        }
    };
    Ok(value)
}

pub fn decode(mut data: Bytes) -> IngestResult<Vec<Amf0Value>> {
    let mut values = Vec::new();
    while data.has_remaining() {
        values.push(decode_value(&mut data)?);
    }
    Ok(values)
}
