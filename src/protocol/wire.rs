//! Byte-level helpers shared by the frontend and backend codecs.
//!
//! Every integer on the wire is big-endian. Strings are NUL-terminated and
//! must be valid UTF-8.
use thiserror::Error;

/// Size of the length prefix that follows the tag byte of every frame.
pub(crate) const LENGTH_SIZE: usize = size_of::<i32>();

/// Errors raised while decoding a message body.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown message type '{0}'")]
    UnknownTag(char),

    #[error("message '{0}' ended early")]
    UnexpectedEnd(char),

    #[error("message '{0}' has a string that is not valid UTF-8")]
    InvalidUtf8(char),

    #[error("message '{0}' has {1} trailing bytes")]
    TrailingBytes(char, usize),

    #[error("invalid frame length {0}")]
    InvalidLength(i32),

    #[error("message '{tag}' has invalid field: {reason}")]
    InvalidField { tag: char, reason: String },
}

/// Errors raised while encoding a message that does not fit the wire format.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("message '{tag}' has {count} entries, a count field holds at most 32767")]
    TooManyEntries { tag: char, count: usize },

    #[error("{0} bytes do not fit a length field")]
    TooLarge(usize),
}

/// Appends a framed message: tag, length (including itself) and body.
pub(crate) fn frame(tag: u8, body: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(1 + LENGTH_SIZE + body.len());
    out.push(tag);
    put_len(&mut out, body.len() + LENGTH_SIZE)?;
    out.extend_from_slice(body);
    Ok(out)
}

/// Writes a byte length as an `i32`.
pub(crate) fn put_len(out: &mut Vec<u8>, len: usize) -> Result<(), EncodeError> {
    let len = i32::try_from(len).map_err(|_| EncodeError::TooLarge(len))?;
    put_i32(out, len);
    Ok(())
}

/// Writes the `i16` entry count of an array field.
pub(crate) fn put_count(out: &mut Vec<u8>, tag: u8, count: usize) -> Result<(), EncodeError> {
    let n = i16::try_from(count).map_err(|_| EncodeError::TooManyEntries {
        tag: char::from(tag),
        count,
    })?;
    put_i16(out, n);
    Ok(())
}

/// Checks a frame length read from the wire and returns the body size.
pub(crate) fn body_len(length: i32) -> Result<usize, DecodeError> {
    if (length as i64) < LENGTH_SIZE as i64 {
        return Err(DecodeError::InvalidLength(length));
    }
    Ok(length as usize - LENGTH_SIZE)
}

pub(crate) fn put_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

pub(crate) fn put_i16(out: &mut Vec<u8>, v: i16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Writes a length-prefixed value; `None` is encoded as length `-1`.
pub(crate) fn put_nullable(out: &mut Vec<u8>, value: Option<&[u8]>) -> Result<(), EncodeError> {
    match value {
        Some(bytes) => {
            put_len(out, bytes.len())?;
            out.extend_from_slice(bytes);
        }
        None => put_i32(out, -1),
    }
    Ok(())
}

/// Cursor over the body of a single message.
pub(crate) struct Reader<'a> {
    tag: char,
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(tag: u8, buf: &'a [u8]) -> Self {
        Self {
            tag: char::from(tag),
            buf,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::UnexpectedEnd(self.tag));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn i16(&mut self) -> Result<i16, DecodeError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(self.i16()? as u16)
    }

    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(self.i32()? as u32)
    }

    /// Reads a count prefix, rejecting negative values.
    pub fn count(&mut self) -> Result<usize, DecodeError> {
        let n = self.i16()?;
        usize::try_from(n).map_err(|_| DecodeError::InvalidField {
            tag: self.tag,
            reason: format!("negative count {n}"),
        })
    }

    pub fn cstr(&mut self) -> Result<String, DecodeError> {
        let end = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .ok_or(DecodeError::UnexpectedEnd(self.tag))?;
        let bytes = self.take(end)?;
        self.take(1)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8(self.tag))
    }

    pub fn nullable(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        match self.i32()? {
            -1 => Ok(None),
            n if n < 0 => Err(DecodeError::InvalidField {
                tag: self.tag,
                reason: format!("negative value length {n}"),
            }),
            n => Ok(Some(self.take(n as usize)?.to_vec())),
        }
    }

    pub fn rest(&mut self) -> Vec<u8> {
        let rest = self.buf.to_vec();
        self.buf = &[];
        rest
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Fails unless the whole body has been consumed.
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(self.tag, self.buf.len()))
        }
    }
}
