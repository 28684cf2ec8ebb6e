use bytes::{Buf, BufMut, BytesMut};

use crate::network::ByteAccumulator;
use crate::{AppError, AppResult};

/// Protocol tag opening every frame. 0x58 is the historical magic byte.
pub const MAGIC_CODE: [u8; 4] = *b"XNET";
/// magic code + payload length
pub const HEADER_SIZE: usize = 8;
/// i32 length in front of the type tag and the body
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Fixed header in front of every frame, big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub code: [u8; 4],
    /// bytes following the header
    pub payload_length: i32,
}

impl FrameHeader {
    pub fn new(payload_length: i32) -> Self {
        FrameHeader {
            code: MAGIC_CODE,
            payload_length,
        }
    }

    /// Unpack a header from the first `HEADER_SIZE` bytes of `src`.
    pub fn decode(src: &[u8]) -> Option<FrameHeader> {
        if src.len() < HEADER_SIZE {
            return None;
        }
        let mut src = &src[..HEADER_SIZE];
        let mut code = [0u8; 4];
        src.copy_to_slice(&mut code);
        let payload_length = src.get_i32();
        Some(FrameHeader {
            code,
            payload_length,
        })
    }

    pub fn encode_into(&self, dst: &mut [u8]) {
        dst[..4].copy_from_slice(&self.code);
        dst[4..HEADER_SIZE].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    pub fn has_valid_code(&self) -> bool {
        self.code == MAGIC_CODE
    }
}

/// One decoded protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub type_tag: String,
    pub body: String,
}

impl Frame {
    pub fn new(type_tag: impl Into<String>, body: impl Into<String>) -> Self {
        Frame {
            type_tag: type_tag.into(),
            body: body.into(),
        }
    }

    pub fn payload_length(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.type_tag.len() + LENGTH_PREFIX_SIZE + self.body.len()
    }

    /// Total bytes this frame occupies on the wire.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload_length()
    }
}

/// Encodes frames and extracts them from a session's accumulator.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    /// 0 means no limit besides i32::MAX
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec { max_frame_size: 0 }
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        FrameCodec { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn check_payload_size(&self, payload_length: usize) -> AppResult<()> {
        if payload_length > i32::MAX as usize
            || (self.max_frame_size != 0 && payload_length > self.max_frame_size)
        {
            return Err(AppError::MalformedProtocol(format!(
                "frame of length {} is too large",
                payload_length
            )));
        }
        Ok(())
    }

    /// Pull one complete frame out of `accumulator`.
    ///
    /// Returns `Ok(None)` while the frame is still partial and leaves the
    /// accumulator untouched in that case. An `Err` means the stream can not be
    /// resynchronized and the connection has to be closed.
    pub fn try_extract_frame(&self, accumulator: &mut ByteAccumulator) -> AppResult<Option<Frame>> {
        let header = match FrameHeader::decode(accumulator.unread()) {
            Some(header) => header,
            None => return Ok(None),
        };
        if !header.has_valid_code() {
            return Err(AppError::MalformedProtocol(format!(
                "magic code mismatch: {:02x?}",
                header.code
            )));
        }
        if header.payload_length < 0 {
            return Err(AppError::MalformedProtocol(format!(
                "frame size {} less than 0",
                header.payload_length
            )));
        }
        let payload_length = header.payload_length as usize;
        self.check_payload_size(payload_length)?;

        if accumulator.len() < HEADER_SIZE + payload_length {
            return Ok(None);
        }

        accumulator.consume(HEADER_SIZE);
        let frame = Self::decode_payload(&accumulator.unread()[..payload_length])?;
        accumulator.consume(payload_length);
        Ok(Some(frame))
    }

    /// Decode the type tag and body making up a whole payload.
    pub fn decode_payload(mut payload: &[u8]) -> AppResult<Frame> {
        let type_tag = read_string(&mut payload, "type tag")?;
        let body = read_string(&mut payload, "body")?;
        if payload.has_remaining() {
            return Err(AppError::MalformedProtocol(format!(
                "{} trailing bytes after frame body",
                payload.remaining()
            )));
        }
        Ok(Frame { type_tag, body })
    }

    /// Append a complete frame to `dst`, returning the bytes written.
    ///
    /// Header space is reserved first and backfilled once the payload length
    /// is known.
    pub fn encode_frame(&self, type_tag: &str, body: &str, dst: &mut BytesMut) -> AppResult<usize> {
        let start = dst.len();
        dst.reserve(HEADER_SIZE + 2 * LENGTH_PREFIX_SIZE + type_tag.len() + body.len());
        dst.put_bytes(0, HEADER_SIZE);
        let written = write_string(dst, type_tag)
            .and_then(|_| write_string(dst, body))
            .and_then(|_| {
                let payload_length = dst.len() - start - HEADER_SIZE;
                self.check_payload_size(payload_length).map(|_| payload_length)
            });
        // a failed encode leaves `dst` as it was
        let payload_length = match written {
            Ok(payload_length) => payload_length,
            Err(e) => {
                dst.truncate(start);
                return Err(e);
            }
        };
        FrameHeader::new(payload_length as i32).encode_into(&mut dst[start..start + HEADER_SIZE]);
        Ok(HEADER_SIZE + payload_length)
    }

    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> AppResult<usize> {
        self.encode_frame(&frame.type_tag, &frame.body, dst)
    }
}

fn read_string(buffer: &mut &[u8], what: &str) -> AppResult<String> {
    if buffer.remaining() < LENGTH_PREFIX_SIZE {
        return Err(AppError::MalformedProtocol(format!(
            "can not read {} length, insufficient data",
            what
        )));
    }
    let length = buffer.get_i32();
    if length < 0 {
        return Err(AppError::MalformedProtocol(format!(
            "{} length {} is negative",
            what, length
        )));
    }
    let length = length as usize;
    if buffer.remaining() < length {
        return Err(AppError::MalformedProtocol(format!(
            "{} length {} overruns payload of {} bytes",
            what,
            length,
            buffer.remaining()
        )));
    }
    let value = std::str::from_utf8(&buffer[..length])
        .map_err(|e| AppError::MalformedProtocol(format!("{} is not utf-8: {}", what, e)))?
        .to_string();
    buffer.advance(length);
    Ok(value)
}

fn write_string(dst: &mut BytesMut, value: &str) -> AppResult<()> {
    let length = i32::try_from(value.len()).map_err(|_| {
        AppError::MalformedProtocol(format!("string of length {} is too large", value.len()))
    })?;
    dst.put_i32(length);
    dst.put_slice(value.as_bytes());
    Ok(())
}
