use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Frame, HEADER_LEN, MAX_FRAME_SIZE};
use crate::messages::ControlMessage;

/// Errors that can occur during encoding/decoding
///
/// Every decode error is fatal to the connection it occurred on.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Invalid frame length: {0}")]
    InvalidLength(i32),

    #[error("Connection closed mid-frame: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed, typed frame codec
///
/// Wire format (little-endian):
/// ```text
/// +----------------+----------------+------------------+
/// | Length (i32)   | Type (i32)     | Payload          |
/// | payload bytes  | see FrameKind  | (Length bytes)   |
/// +----------------+----------------+------------------+
/// ```
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }

    /// Parse the declared payload length out of a buffered header
    fn declared_len(src: &BytesMut) -> Result<usize, CodecError> {
        let length = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if length < 0 {
            return Err(CodecError::InvalidLength(length));
        }

        let length = length as usize;
        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }
        Ok(length)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Validated before reserving anything for the payload
        let length = Self::declared_len(src)?;

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let kind = i32::from_le_bytes([src[4], src[5], src[6], src[7]]);
        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();

        Ok(Some(Frame {
            kind: kind.into(),
            payload,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.is_empty() {
            return Ok(None);
        }

        let expected = if buf.len() < HEADER_LEN {
            HEADER_LEN
        } else {
            HEADER_LEN + Self::declared_len(buf)?
        };
        Err(CodecError::ShortRead {
            expected,
            actual: buf.len(),
        })
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        dst.reserve(HEADER_LEN + length);
        dst.put_i32_le(length as i32);
        dst.put_i32_le(item.kind.into());
        dst.put_slice(&item.payload);

        Ok(())
    }
}

/// Encodes a control message, writing a tagged message's two frames back to
/// back into `dst`. Nothing is written if either frame is invalid.
impl Encoder<ControlMessage> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (tag, frame) = item.into_frames();
        if frame.payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(frame.payload.len()));
        }

        if let Some(tag) = tag {
            dst.reserve(tag.encoded_len() + frame.encoded_len());
            self.encode(tag, dst)?;
        }
        self.encode(frame, dst)
    }
}
