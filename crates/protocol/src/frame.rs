//! Frame - the self-delimiting unit of transmission

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Type tag of an opaque binary frame
pub const TAG_BINARY: u8 = 0x04;

/// Type tag of a JSON control frame
pub const TAG_STRUCTURED: u8 = 0x13;

/// Largest payload expressible with three length octets
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FFFF;

/// Longest possible header: tag, length-octet count, three length octets
pub const MAX_HEADER_LEN: usize = 2 + MAX_LEN_OCTETS;

const LONG_FORM: u8 = 0x80;
const MAX_LEN_OCTETS: usize = 3;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Unknown frame type tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("Unsupported length octet count: {0}")]
    BadLengthOctets(u8),

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Expected {expected:?} frame, got {actual:?}")]
    UnexpectedKind {
        expected: FrameKind,
        actual: FrameKind,
    },

    #[error("Malformed structured payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Frame kind, carried by the type tag in byte 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Opaque bytes passed through untouched
    Binary,
    /// UTF-8 JSON text of one control message
    Structured,
}

impl FrameKind {
    pub fn tag(self) -> u8 {
        match self {
            FrameKind::Binary => TAG_BINARY,
            FrameKind::Structured => TAG_STRUCTURED,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, FrameError> {
        match tag {
            TAG_BINARY => Ok(FrameKind::Binary),
            TAG_STRUCTURED => Ok(FrameKind::Structured),
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

/// One decoded (or about to be encoded) frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    payload: Bytes,
}

impl Frame {
    /// Create a BINARY frame
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Binary,
            payload: payload.into(),
        }
    }

    /// Create a STRUCTURED frame from any serializable control message
    pub fn structured<T: Serialize>(message: &T) -> Result<Self, FrameError> {
        let text = serde_json::to_vec(message)?;
        Ok(Self {
            kind: FrameKind::Structured,
            payload: Bytes::from(text),
        })
    }

    /// Reassemble a frame from a decoded kind and payload
    pub fn from_parts(kind: FrameKind, payload: Bytes) -> Self {
        Self { kind, payload }
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn is_binary(&self) -> bool {
        self.kind == FrameKind::Binary
    }

    pub fn is_structured(&self) -> bool {
        self.kind == FrameKind::Structured
    }

    /// Parse the payload of a STRUCTURED frame.
    ///
    /// A parse failure says nothing about the framing state: the frame itself
    /// was well delimited, only its content is bad.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        if self.kind != FrameKind::Structured {
            return Err(FrameError::UnexpectedKind {
                expected: FrameKind::Structured,
                actual: self.kind,
            });
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: FrameKind,
    /// Bytes taken by the tag and the length field
    pub header_len: usize,
    pub payload_len: usize,
}

impl Header {
    /// Parse a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` while more bytes are needed. The type tag is
    /// checked as soon as byte 0 is available.
    pub fn parse(buf: &[u8]) -> Result<Option<Header>, FrameError> {
        let Some(&tag) = buf.first() else {
            return Ok(None);
        };
        let kind = FrameKind::from_tag(tag)?;

        let Some(&first) = buf.get(1) else {
            return Ok(None);
        };

        if first & LONG_FORM == 0 {
            return Ok(Some(Header {
                kind,
                header_len: 2,
                payload_len: first as usize,
            }));
        }

        let octets = first & !LONG_FORM;
        if octets == 0 || octets as usize > MAX_LEN_OCTETS {
            return Err(FrameError::BadLengthOctets(octets));
        }

        let header_len = 2 + octets as usize;
        if buf.len() < header_len {
            return Ok(None);
        }

        let payload_len = buf[2..header_len]
            .iter()
            .fold(0usize, |len, octet| (len << 8) | *octet as usize);

        Ok(Some(Header {
            kind,
            header_len,
            payload_len,
        }))
    }

    /// Header plus payload, without any trailing digest
    pub fn frame_len(&self) -> usize {
        self.header_len + self.payload_len
    }
}

/// Append the header for a payload of `len` bytes, using the shortest form
pub fn put_header(dst: &mut BytesMut, kind: FrameKind, len: usize) -> Result<(), FrameError> {
    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_LEN,
        });
    }

    dst.put_u8(kind.tag());
    if len < LONG_FORM as usize {
        dst.put_u8(len as u8);
    } else if len <= 0xFF {
        dst.put_u8(LONG_FORM | 1);
        dst.put_u8(len as u8);
    } else if len <= 0xFFFF {
        dst.put_u8(LONG_FORM | 2);
        dst.put_u16(len as u16);
    } else {
        dst.put_u8(LONG_FORM | 3);
        dst.put_uint(len as u64, 3);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_for(len: usize) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_header(&mut buf, FrameKind::Binary, len).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_short_form_header() {
        assert_eq!(header_for(0), vec![0x04, 0x00]);
        assert_eq!(header_for(127), vec![0x04, 0x7F]);
    }

    #[test]
    fn test_long_form_boundaries() {
        assert_eq!(header_for(128), vec![0x04, 0x81, 0x80]);
        assert_eq!(header_for(255), vec![0x04, 0x81, 0xFF]);
        assert_eq!(header_for(256), vec![0x04, 0x82, 0x01, 0x00]);
        assert_eq!(header_for(65535), vec![0x04, 0x82, 0xFF, 0xFF]);
        assert_eq!(header_for(65536), vec![0x04, 0x83, 0x01, 0x00, 0x00]);
        assert_eq!(header_for(MAX_PAYLOAD_LEN), vec![0x04, 0x83, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_header_too_large() {
        let mut buf = BytesMut::new();
        let err = put_header(&mut buf, FrameKind::Binary, MAX_PAYLOAD_LEN + 1).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_needs_more() {
        assert_eq!(Header::parse(&[]).unwrap(), None);
        assert_eq!(Header::parse(&[0x13]).unwrap(), None);
        assert_eq!(Header::parse(&[0x13, 0x82, 0x01]).unwrap(), None);
    }

    #[test]
    fn test_parse_long_form() {
        let header = Header::parse(&[0x13, 0x82, 0x01, 0x00, 0xAA]).unwrap().unwrap();
        assert_eq!(header.kind, FrameKind::Structured);
        assert_eq!(header.header_len, 4);
        assert_eq!(header.payload_len, 256);
        assert_eq!(header.frame_len(), 260);
    }

    #[test]
    fn test_parse_rejects_unknown_tag() {
        assert!(matches!(
            Header::parse(&[0x05]),
            Err(FrameError::UnknownTag(0x05))
        ));
    }

    #[test]
    fn test_parse_rejects_bad_octet_count() {
        assert!(matches!(
            Header::parse(&[0x04, 0x80]),
            Err(FrameError::BadLengthOctets(0))
        ));
        assert!(matches!(
            Header::parse(&[0x04, 0x84, 0, 0, 0, 1]),
            Err(FrameError::BadLengthOctets(4))
        ));
    }

    #[test]
    fn test_structured_parse() {
        let frame = Frame::structured(&serde_json::json!({"op": "READY"})).unwrap();
        assert!(frame.is_structured());
        let value: serde_json::Value = frame.parse().unwrap();
        assert_eq!(value["op"], "READY");
    }

    #[test]
    fn test_binary_frame_is_not_parsed() {
        let frame = Frame::binary(&b"hello"[..]);
        let err = frame.parse::<serde_json::Value>().unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedKind { .. }));
    }

    #[test]
    fn test_malformed_structured() {
        let frame = Frame::from_parts(FrameKind::Structured, Bytes::from_static(b"{not json"));
        assert!(matches!(
            frame.parse::<serde_json::Value>(),
            Err(FrameError::Malformed(_))
        ));
    }
}
