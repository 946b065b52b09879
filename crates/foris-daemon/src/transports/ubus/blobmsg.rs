//! Blobmsg: named, typed attributes on top of the blob codec.
//!
//! A blobmsg entry is an extended blob attribute whose id is the value
//! type and whose payload starts with a name header:
//!
//! ```text
//! +-------------+--------------+-----+-------------------+
//! | namelen(16) | name ... NUL | pad | value data        |
//! +-------------+--------------+-----+-------------------+
//! ```
//!
//! The name header (2 bytes + name + NUL) pads to a 4-byte boundary.
//! Integers ride big-endian; booleans are `INT8`, tables and arrays nest
//! recursively. This module maps blobmsg tables to and from
//! `serde_json::Value` objects — the rest of the daemon only ever sees
//! envelopes.

use serde_json::{json, Map, Value};
use thiserror::Error;

use super::blob::{align4, BlobAttr, BlobError};

pub const BLOBMSG_TYPE_UNSPEC: u8 = 0;
pub const BLOBMSG_TYPE_ARRAY: u8 = 1;
pub const BLOBMSG_TYPE_TABLE: u8 = 2;
pub const BLOBMSG_TYPE_STRING: u8 = 3;
pub const BLOBMSG_TYPE_INT64: u8 = 4;
pub const BLOBMSG_TYPE_INT32: u8 = 5;
pub const BLOBMSG_TYPE_INT16: u8 = 6;
pub const BLOBMSG_TYPE_INT8: u8 = 7;
pub const BLOBMSG_TYPE_DOUBLE: u8 = 8;

/// Blobmsg decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlobmsgError {
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("blobmsg entry has a malformed name header")]
    MalformedName,
    #[error("blobmsg value of type {type_id} has wrong size {size}")]
    WrongSize { type_id: u8, size: usize },
    #[error("blobmsg value is not valid UTF-8")]
    NotUtf8,
}

fn name_header(name: &str) -> Vec<u8> {
    let name_bytes = name.as_bytes();
    let header_len = align4(2 + name_bytes.len() + 1);
    let mut header = Vec::with_capacity(header_len);
    header.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
    header.extend_from_slice(name_bytes);
    header.resize(header_len, 0);
    header
}

fn value_bytes(value: &Value) -> (u8, Vec<u8>) {
    match value {
        Value::Null => (BLOBMSG_TYPE_UNSPEC, Vec::new()),
        Value::Bool(flag) => (BLOBMSG_TYPE_INT8, vec![u8::from(*flag)]),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                if let Ok(small) = i32::try_from(int) {
                    (BLOBMSG_TYPE_INT32, small.to_be_bytes().to_vec())
                } else {
                    (BLOBMSG_TYPE_INT64, int.to_be_bytes().to_vec())
                }
            } else {
                let double = number.as_f64().unwrap_or(0.0);
                (BLOBMSG_TYPE_DOUBLE, double.to_bits().to_be_bytes().to_vec())
            }
        }
        Value::String(text) => {
            let mut bytes = text.as_bytes().to_vec();
            bytes.push(0);
            (BLOBMSG_TYPE_STRING, bytes)
        }
        Value::Array(items) => {
            let mut payload = Vec::new();
            for item in items {
                encode_entry("", item, &mut payload);
            }
            (BLOBMSG_TYPE_ARRAY, payload)
        }
        Value::Object(map) => (BLOBMSG_TYPE_TABLE, encode_table(map)),
    }
}

/// Append one named entry to `out`.
pub fn encode_entry(name: &str, value: &Value, out: &mut Vec<u8>) {
    let (type_id, data) = value_bytes(value);
    let mut payload = name_header(name);
    payload.extend_from_slice(&data);
    BlobAttr::extended(type_id, payload).encode_into(out);
}

/// Encode a JSON object as a blobmsg table payload.
#[must_use]
pub fn encode_table(map: &Map<String, Value>) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in map {
        encode_entry(name, value, &mut out);
    }
    out
}

fn split_name(payload: &[u8]) -> Result<(String, &[u8]), BlobmsgError> {
    if payload.len() < 2 {
        return Err(BlobmsgError::MalformedName);
    }
    let name_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let header_len = align4(2 + name_len + 1);
    if payload.len() < header_len {
        return Err(BlobmsgError::MalformedName);
    }
    let name = std::str::from_utf8(&payload[2..2 + name_len])
        .map_err(|_| BlobmsgError::NotUtf8)?
        .to_string();
    Ok((name, &payload[header_len..]))
}

fn decode_value(type_id: u8, data: &[u8]) -> Result<Value, BlobmsgError> {
    let wrong = |size| BlobmsgError::WrongSize { type_id, size };
    match type_id {
        BLOBMSG_TYPE_UNSPEC => Ok(Value::Null),
        BLOBMSG_TYPE_INT8 => match data {
            [byte] => Ok(json!(*byte != 0)),
            _ => Err(wrong(data.len())),
        },
        BLOBMSG_TYPE_INT16 => {
            let bytes: [u8; 2] = data.try_into().map_err(|_| wrong(data.len()))?;
            Ok(json!(i16::from_be_bytes(bytes)))
        }
        BLOBMSG_TYPE_INT32 => {
            let bytes: [u8; 4] = data.try_into().map_err(|_| wrong(data.len()))?;
            Ok(json!(i32::from_be_bytes(bytes)))
        }
        BLOBMSG_TYPE_INT64 => {
            let bytes: [u8; 8] = data.try_into().map_err(|_| wrong(data.len()))?;
            Ok(json!(i64::from_be_bytes(bytes)))
        }
        BLOBMSG_TYPE_DOUBLE => {
            let bytes: [u8; 8] = data.try_into().map_err(|_| wrong(data.len()))?;
            Ok(json!(f64::from_bits(u64::from_be_bytes(bytes))))
        }
        BLOBMSG_TYPE_STRING => {
            let trimmed = data.strip_suffix(&[0]).unwrap_or(data);
            Ok(json!(std::str::from_utf8(trimmed)
                .map_err(|_| BlobmsgError::NotUtf8)?))
        }
        BLOBMSG_TYPE_ARRAY => {
            let mut items = Vec::new();
            for attr in BlobAttr::decode_all(data)? {
                let (_, value_data) = split_name(&attr.payload)?;
                items.push(decode_value(attr.id, value_data)?);
            }
            Ok(Value::Array(items))
        }
        BLOBMSG_TYPE_TABLE => Ok(Value::Object(decode_table(data)?)),
        other => Err(BlobmsgError::WrongSize {
            type_id: other,
            size: data.len(),
        }),
    }
}

/// Decode a blobmsg table payload into a JSON object.
pub fn decode_table(data: &[u8]) -> Result<Map<String, Value>, BlobmsgError> {
    let mut map = Map::new();
    for attr in BlobAttr::decode_all(data)? {
        let (name, value_data) = split_name(&attr.payload)?;
        map.insert(name, decode_value(attr.id, value_data)?);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_round_trips_nested_json() {
        let original = json!({
            "module": "dns",
            "action": "update_settings",
            "kind": "request",
            "data": {
                "forwarding_enabled": false,
                "dnssec_enabled": true,
                "port": 11884,
                "big": 5_000_000_000_i64,
                "names": ["one", "two"],
            }
        });
        let encoded = encode_table(original.as_object().unwrap());
        let decoded = decode_table(&encoded).unwrap();
        assert_eq!(Value::Object(decoded), original);
    }

    #[test]
    fn booleans_ride_as_int8() {
        let mut out = Vec::new();
        encode_entry("enabled", &json!(true), &mut out);
        let attrs = BlobAttr::decode_all(&out).unwrap();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].id, BLOBMSG_TYPE_INT8);
        assert!(attrs[0].extended);
        let (name, data) = split_name(&attrs[0].payload).unwrap();
        assert_eq!(name, "enabled");
        assert_eq!(data, [1]);
    }

    #[test]
    fn strings_are_nul_terminated() {
        let mut out = Vec::new();
        encode_entry("lang", &json!("cs"), &mut out);
        let attrs = BlobAttr::decode_all(&out).unwrap();
        let (_, data) = split_name(&attrs[0].payload).unwrap();
        assert_eq!(data, b"cs\0");
    }

    #[test]
    fn malformed_name_header_is_rejected() {
        // Claims an 80-byte name inside a 4-byte payload.
        let mut out = Vec::new();
        BlobAttr::extended(BLOBMSG_TYPE_STRING, vec![0, 80, b'x', 0]).encode_into(&mut out);
        assert!(matches!(
            decode_table(&out),
            Err(BlobmsgError::MalformedName)
        ));
    }
}
