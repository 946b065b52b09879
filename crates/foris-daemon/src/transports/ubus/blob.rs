//! Blob attribute codec for the system RPC bus.
//!
//! A blob attribute is a 4-byte big-endian `id_len` word followed by the
//! payload, padded to a 4-byte boundary:
//!
//! ```text
//! +-+-------+------------------------+----------------+-----+
//! |E| id(7) | len(24, incl. header)  | payload        | pad |
//! +-+-------+------------------------+----------------+-----+
//! ```
//!
//! The `E` bit marks extended attributes (blobmsg entries carrying a
//! name header). Lengths are validated before any allocation.

use thiserror::Error;

/// Extended-attribute marker bit.
pub const BLOB_ATTR_EXTENDED: u32 = 0x8000_0000;
const ID_MASK: u32 = 0x7f00_0000;
const ID_SHIFT: u32 = 24;
const LEN_MASK: u32 = 0x00ff_ffff;

/// Attribute header size.
pub const BLOB_HDR_LEN: usize = 4;

/// Round `len` up to the 4-byte boundary.
#[must_use]
pub const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Blob decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlobError {
    #[error("truncated blob attribute (declared {declared} bytes, {available} available)")]
    Truncated { declared: usize, available: usize },
    #[error("blob attribute shorter than its header")]
    Malformed,
}

/// One TLV attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobAttr {
    pub id: u8,
    pub extended: bool,
    pub payload: Vec<u8>,
}

impl BlobAttr {
    #[must_use]
    pub fn new(id: u8, payload: Vec<u8>) -> Self {
        Self {
            id,
            extended: false,
            payload,
        }
    }

    #[must_use]
    pub fn extended(id: u8, payload: Vec<u8>) -> Self {
        Self {
            id,
            extended: true,
            payload,
        }
    }

    /// Size on the wire including padding.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        align4(BLOB_HDR_LEN + self.payload.len())
    }

    /// Append the encoded attribute to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let len = (BLOB_HDR_LEN + self.payload.len()) as u32;
        let mut id_len = (u32::from(self.id) << ID_SHIFT) & ID_MASK | (len & LEN_MASK);
        if self.extended {
            id_len |= BLOB_ATTR_EXTENDED;
        }
        out.extend_from_slice(&id_len.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out.resize(out.len() + self.encoded_len() - BLOB_HDR_LEN - self.payload.len(), 0);
    }

    /// Decode a back-to-back attribute sequence.
    pub fn decode_all(mut data: &[u8]) -> Result<Vec<Self>, BlobError> {
        let mut attrs = Vec::new();
        while !data.is_empty() {
            if data.len() < BLOB_HDR_LEN {
                return Err(BlobError::Malformed);
            }
            let id_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            let declared = (id_len & LEN_MASK) as usize;
            if declared < BLOB_HDR_LEN {
                return Err(BlobError::Malformed);
            }
            if declared > data.len() {
                return Err(BlobError::Truncated {
                    declared,
                    available: data.len(),
                });
            }
            attrs.push(Self {
                id: ((id_len & ID_MASK) >> ID_SHIFT) as u8,
                extended: id_len & BLOB_ATTR_EXTENDED != 0,
                payload: data[BLOB_HDR_LEN..declared].to_vec(),
            });
            let consumed = align4(declared).min(data.len());
            data = &data[consumed..];
        }
        Ok(attrs)
    }
}

/// Encode a sequence of attributes back to back.
#[must_use]
pub fn encode_all(attrs: &[BlobAttr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(attrs.iter().map(BlobAttr::encoded_len).sum());
    for attr in attrs {
        attr.encode_into(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_padding() {
        let attrs = vec![
            BlobAttr::new(3, b"abc".to_vec()),
            BlobAttr::extended(7, b"x".to_vec()),
            BlobAttr::new(1, Vec::new()),
        ];
        let encoded = encode_all(&attrs);
        // Every attribute lands on a 4-byte boundary.
        assert_eq!(encoded.len() % 4, 0);
        let decoded = BlobAttr::decode_all(&encoded).unwrap();
        assert_eq!(decoded, attrs);
    }

    #[test]
    fn header_word_layout() {
        let mut out = Vec::new();
        BlobAttr::extended(2, vec![0xAA]).encode_into(&mut out);
        let id_len = u32::from_be_bytes([out[0], out[1], out[2], out[3]]);
        assert_ne!(id_len & BLOB_ATTR_EXTENDED, 0);
        assert_eq!((id_len & ID_MASK) >> ID_SHIFT, 2);
        // Length covers the 4-byte header plus one payload byte.
        assert_eq!(id_len & LEN_MASK, 5);
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let mut out = Vec::new();
        BlobAttr::new(4, b"long payload".to_vec()).encode_into(&mut out);
        assert!(matches!(
            BlobAttr::decode_all(&out[..6]),
            Err(BlobError::Truncated { .. })
        ));
        assert_eq!(BlobAttr::decode_all(&out[..2]), Err(BlobError::Malformed));
    }
}
