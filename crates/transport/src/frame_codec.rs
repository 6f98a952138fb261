//! Frame codec for encoding/decoding agent frames on a byte stream
//!
//! `FrameCodec` implements tokio-util's `Decoder`/`Encoder`, so a
//! `Framed<Connection, FrameCodec>` is the usual way to drive a connection.
//! Used directly, `try_decode` is the "try to take one frame out of the
//! accumulated bytes" operation: it returns `Ok(None)` until a whole frame
//! (header, payload and, when authenticated, the trailing digest) is buffered.

use bytes::{Buf, BytesMut};
use sigbox_crypto::{ChainedMac, DIGEST_LEN, MacError, StreamKey};
use sigbox_protocol::{Frame, FrameError, Header, MAX_HEADER_LEN, put_header};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("Stream authentication failed: {0}")]
    Auth(#[from] MacError),

    #[error("Stream already failed, refusing to resynchronize")]
    Poisoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame codec, optionally authenticating the stream with a chained MAC
pub struct FrameCodec {
    outbound: Option<ChainedMac>,
    inbound: Option<ChainedMac>,
    poisoned: bool,
}

impl FrameCodec {
    /// Create a codec without stream authentication
    pub fn new() -> Self {
        Self {
            outbound: None,
            inbound: None,
            poisoned: false,
        }
    }

    /// Create a codec authenticating both directions with `key`
    pub fn authenticated(key: &StreamKey) -> Result<Self, CodecError> {
        Ok(Self {
            outbound: Some(ChainedMac::new(key)?),
            inbound: Some(ChainedMac::new(key)?),
            poisoned: false,
        })
    }

    /// Authenticated if a key is given, plain otherwise
    pub fn with_key(key: Option<&StreamKey>) -> Result<Self, CodecError> {
        match key {
            Some(key) => Self::authenticated(key),
            None => Ok(Self::new()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.inbound.is_some()
    }

    fn trailer_len(&self) -> usize {
        if self.is_authenticated() { DIGEST_LEN } else { 0 }
    }

    /// Take the next complete frame out of `buf`, if there is one.
    ///
    /// Any error is final: the codec refuses to decode anything afterwards,
    /// since skipping ahead could hide tampering.
    pub fn try_decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if self.poisoned {
            return Err(CodecError::Poisoned);
        }
        let result = self.decode_next(buf);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn decode_next(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        let Some(header) = Header::parse(buf)? else {
            buf.reserve(MAX_HEADER_LEN);
            return Ok(None);
        };

        let frame_len = header.frame_len();
        let total = frame_len + self.trailer_len();
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        let mut raw = buf.split_to(total);
        if let Some(mac) = self.inbound.as_mut() {
            let digest = raw.split_off(frame_len);
            mac.update(&raw);
            mac.verify(&digest)?;
        }
        raw.advance(header.header_len);

        trace!(kind = ?header.kind, len = header.payload_len, "Decoded frame");
        Ok(Some(Frame::from_parts(header.kind, raw.freeze())))
    }

    /// Append the wire bytes of `frame` to `dst`, including the digest
    pub fn encode_frame(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let start = dst.len();
        dst.reserve(MAX_HEADER_LEN + frame.len() + self.trailer_len());
        put_header(dst, frame.kind(), frame.len())?;
        dst.extend_from_slice(frame.payload());

        if let Some(mac) = self.outbound.as_mut() {
            mac.update(&dst[start..]);
            let digest = mac.seal();
            dst.extend_from_slice(&digest);
        }

        trace!(kind = ?frame.kind(), len = frame.len(), "Encoded frame");
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        self.try_decode(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.encode_frame(&item, dst)
    }
}
