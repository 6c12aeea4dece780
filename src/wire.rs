//! Binary frame format shared by the producer transport and the collector.
//!
//! A frame is self-delimiting, so frames can be streamed back to back over
//! TCP without any outer length prefix:
//!
//! ```text
//! 0x03 version            record tag + format version
//! varint len, bytes       source (UTF-8)
//! varint len, bytes       message (UTF-8)
//! 0x02 ordinal            level
//! 0x01 i64 secs, u32 ns   created_at (big-endian, UTC)
//! 0x00 | 0x01 ...         processed_at, absent or an instant
//! ```

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{CodecError, FrameError};
use crate::record::{Level, LogRecord};

pub const TAG_NONE: u8 = 0x00;
pub const TAG_INSTANT: u8 = 0x01;
pub const TAG_LEVEL: u8 = 0x02;
pub const TAG_RECORD: u8 = 0x03;

pub const FRAME_VERSION: u8 = 1;

const NANOS_PER_SEC: u32 = 1_000_000_000;
const MAX_VARINT_BYTES: usize = 10;

/// Encode one record into a standalone frame.
pub fn encode(record: &LogRecord) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(frame_size_hint(record));
    write_frame(record, &mut buf);
    buf.to_vec()
}

/// Decode exactly one frame; trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<LogRecord, FrameError> {
    let (record, used) = read_frame(bytes)?;
    if used != bytes.len() {
        return Err(FrameError::TrailingBytes);
    }
    Ok(record)
}

/// Stream codec used with `FramedRead` / `FramedWrite` over a TCP stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRecordCodec;

impl LogRecordCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for LogRecordCodec {
    type Item = LogRecord;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<LogRecord>, CodecError> {
        if src.is_empty() {
            return Ok(None);
        }
        match read_frame(src) {
            Ok((record, used)) => {
                src.advance(used);
                Ok(Some(record))
            }
            // Wait for more bytes from the socket.
            Err(FrameError::Truncated) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<LogRecord>, CodecError> {
        match self.decode(src)? {
            Some(record) => Ok(Some(record)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Truncated.into()),
        }
    }
}

impl<'a> Encoder<&'a LogRecord> for LogRecordCodec {
    type Error = CodecError;

    fn encode(&mut self, record: &'a LogRecord, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.reserve(frame_size_hint(record));
        write_frame(record, dst);
        Ok(())
    }
}

fn frame_size_hint(record: &LogRecord) -> usize {
    2 + 2 * MAX_VARINT_BYTES + record.source().len() + record.message().len() + 2 + 2 * 13
}

fn write_frame(record: &LogRecord, dst: &mut BytesMut) {
    dst.put_u8(TAG_RECORD);
    dst.put_u8(FRAME_VERSION);
    write_str(record.source(), dst);
    write_str(record.message(), dst);
    dst.put_u8(TAG_LEVEL);
    dst.put_u8(record.level().ordinal());
    write_instant(record.created_at(), dst);
    match record.processed_at() {
        Some(at) => write_instant(at, dst),
        None => dst.put_u8(TAG_NONE),
    }
}

fn write_str(value: &str, dst: &mut BytesMut) {
    write_varint(value.len() as u64, dst);
    dst.put_slice(value.as_bytes());
}

fn write_varint(mut value: u64, dst: &mut BytesMut) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

fn write_instant(at: DateTime<Utc>, dst: &mut BytesMut) {
    dst.put_u8(TAG_INSTANT);
    dst.put_i64(at.timestamp());
    // LogRecord keeps nanos below one second, leap seconds included.
    dst.put_u32(at.timestamp_subsec_nanos());
}

/// Parse one frame from the front of `bytes`, returning it and the number
/// of bytes it occupied.
fn read_frame(bytes: &[u8]) -> Result<(LogRecord, usize), FrameError> {
    let mut reader = FrameReader { buf: bytes, pos: 0 };

    match reader.u8()? {
        TAG_RECORD => {}
        other => return Err(FrameError::UnknownTag(other)),
    }
    let version = reader.u8()?;
    if version != FRAME_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }

    let source = reader.string()?;
    let message = reader.string()?;
    let level = reader.level()?;
    let created_at = match reader.u8()? {
        TAG_INSTANT => reader.instant()?,
        other => return Err(FrameError::UnknownTag(other)),
    };
    let processed_at = match reader.u8()? {
        TAG_NONE => None,
        TAG_INSTANT => Some(reader.instant()?),
        other => return Err(FrameError::UnknownTag(other)),
    };

    let record = LogRecord::from_parts(source, message, level, created_at, processed_at);
    Ok((record, reader.pos))
}

struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        let end = self.pos.checked_add(n).ok_or(FrameError::LengthOverflow)?;
        let slice = self.buf.get(self.pos..end).ok_or(FrameError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn varint(&mut self) -> Result<u64, FrameError> {
        let mut value = 0u64;
        for i in 0..MAX_VARINT_BYTES {
            let byte = self.u8()?;
            let bits = u64::from(byte & 0x7f);
            if i == MAX_VARINT_BYTES - 1 && bits > 1 {
                return Err(FrameError::LengthOverflow);
            }
            value |= bits << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(FrameError::LengthOverflow)
    }

    fn string(&mut self) -> Result<String, FrameError> {
        let len = usize::try_from(self.varint()?).map_err(|_| FrameError::LengthOverflow)?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::InvalidUtf8)
    }

    fn level(&mut self) -> Result<Level, FrameError> {
        match self.u8()? {
            TAG_LEVEL => {}
            other => return Err(FrameError::UnknownTag(other)),
        }
        let ordinal = self.u8()?;
        Level::from_ordinal(ordinal).ok_or(FrameError::UnknownLevel(ordinal))
    }

    fn instant(&mut self) -> Result<DateTime<Utc>, FrameError> {
        let mut secs = self.take(8)?;
        let secs = secs.get_i64();
        let mut nanos = self.take(4)?;
        let nanos = nanos.get_u32();
        if nanos >= NANOS_PER_SEC {
            return Err(FrameError::NanosOutOfRange(nanos));
        }
        DateTime::from_timestamp(secs, nanos).ok_or(FrameError::TimestampOutOfRange(secs))
    }
}
