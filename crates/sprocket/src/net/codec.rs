use std::io::{self, Read};

use bytes::{Buf, BufMut, BytesMut};

use super::message::Message;
use super::protocol::{
    HEADER_SIZE, MAX_MESSAGE_LENGTH, MESSAGE_KIND_UNSET, MESSAGE_LEN_UNSET, MessageHeader,
    MessageKind, PROTOCOL_MAGIC,
};

const READ_CHUNK: usize = 4096;
const MAX_BUFFERED: usize = 16 * MAX_MESSAGE_LENGTH;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("bad protocol magic {0:#010x}")]
    BadMagic(u32),
    #[error("invalid message length {0}")]
    BadLength(u32),
    #[error("invalid endpoint id {0}")]
    InvalidEndpoint(i32),
    #[error("unknown message kind {0:#010x}")]
    UnknownKind(u32),
    #[error("{kind} payload is {actual} bytes, expected {expected}")]
    PayloadLength {
        kind: MessageKind,
        expected: usize,
        actual: usize,
    },
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: i64 },
    #[error("header field `{0}` was never set")]
    UnsetField(&'static str),
    #[error("header does not describe its {0} payload")]
    HeaderMismatch(MessageKind),
}

impl CodecError {
    /// Whether the byte stream can no longer be trusted to be frame aligned.
    pub fn is_desync(&self) -> bool {
        matches!(self, CodecError::BadMagic(_) | CodecError::BadLength(_))
    }
}

/// Checks that `buf` starts with a complete, well-formed frame and returns its header.
pub fn validate(buf: &[u8]) -> Result<MessageHeader, CodecError> {
    let header = peek_header(buf)?;
    let len = header.message_len as usize;
    if len > buf.len() {
        return Err(CodecError::Truncated {
            needed: len,
            available: buf.len(),
        });
    }
    Ok(header)
}

fn peek_header(buf: &[u8]) -> Result<MessageHeader, CodecError> {
    if buf.len() < HEADER_SIZE {
        return Err(CodecError::Truncated {
            needed: HEADER_SIZE,
            available: buf.len(),
        });
    }
    let mut cursor = &buf[..HEADER_SIZE];
    let magic = cursor.get_u32();
    if magic != PROTOCOL_MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let message_len = cursor.get_u32();
    let len = message_len as usize;
    if !(HEADER_SIZE..=MAX_MESSAGE_LENGTH).contains(&len) {
        return Err(CodecError::BadLength(message_len));
    }
    MessageHeader::read(&mut &buf[..HEADER_SIZE])
}

/// One decoded wire message. Owns its contents.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: MessageHeader,
    pub message: Message,
}

impl Frame {
    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Fills in `what` and `message_len` from the message body.
    pub fn stamp(header: &mut MessageHeader, message: &Message) {
        let kind = message.kind();
        header.what = kind.tag();
        header.message_len = (HEADER_SIZE + Message::payload_len(kind)) as u32;
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<(), CodecError> {
        if self.header.what == MESSAGE_KIND_UNSET {
            return Err(CodecError::UnsetField("what"));
        }
        if self.header.message_len == MESSAGE_LEN_UNSET {
            return Err(CodecError::UnsetField("message_len"));
        }
        let kind = self.message.kind();
        let payload_len = Message::payload_len(kind);
        if self.header.what != kind.tag()
            || self.header.message_len as usize != HEADER_SIZE + payload_len
        {
            return Err(CodecError::HeaderMismatch(kind));
        }

        out.reserve(HEADER_SIZE + payload_len);
        self.header.write(out);
        self.message.write_payload(out);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<BytesMut, CodecError> {
        let mut out = BytesMut::new();
        self.encode(&mut out)?;
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let header = validate(buf)?;
        let kind = header.kind().ok_or(CodecError::UnknownKind(header.what))?;
        let payload = &buf[HEADER_SIZE..header.message_len as usize];
        let message = Message::decode(kind, payload)?;
        Ok(Self { header, message })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes: usize,
    pub closed: bool,
}

/// Accumulates stream bytes across polls until whole frames are available.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_MESSAGE_LENGTH),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Reads everything the non-blocking source has right now.
    pub fn fill<R: Read>(&mut self, src: &mut R) -> io::Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();
        let mut chunk = [0u8; READ_CHUNK];

        while self.buf.len() < MAX_BUFFERED {
            match src.read(&mut chunk) {
                Ok(0) => {
                    outcome.closed = true;
                    break;
                }
                Ok(n) => {
                    self.buf.put_slice(&chunk[..n]);
                    outcome.bytes += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(outcome)
    }

    /// Next complete frame, if any. A framing error that loses alignment
    /// discards everything buffered; any other error discards one frame.
    pub fn next_frame(&mut self) -> Option<Result<Frame, CodecError>> {
        let header = match peek_header(&self.buf) {
            Ok(header) => header,
            Err(CodecError::Truncated { .. }) => return None,
            Err(e) if e.is_desync() => {
                self.buf.clear();
                return Some(Err(e));
            }
            Err(e) => {
                // Magic and length were fine, so the frame can still be skipped.
                let len = declared_len(&self.buf);
                if self.buf.len() < len {
                    return None;
                }
                self.buf.advance(len);
                return Some(Err(e));
            }
        };

        let len = header.message_len as usize;
        if self.buf.len() < len {
            return None;
        }

        let frame = self.buf.split_to(len).freeze();
        Some(Frame::decode(&frame))
    }
}

fn declared_len(buf: &[u8]) -> usize {
    u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize
}
