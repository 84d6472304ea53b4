//! Tagged-field binary encoding primitives.
//!
//! Every message is a flat sequence of tagged fields. A field is a tag
//! (u32 little-endian), a u32 length-or-count word, and a payload:
//! integers are 8-byte little-endian i64, strings are raw UTF-8 bytes,
//! and string arrays are a count followed by length-prefixed strings.
//!
//! The protocol is closed and same-version on both ends, so decoding walks
//! tags in the exact order the encoder wrote them. Any tag mismatch, short
//! read, or absurd declared length is a fatal parse error for that message.

use thiserror::Error;

/// Upper bound on a single string field, in bytes.
pub const MAX_FIELD_BYTES: u32 = 64 * 1024;

/// Upper bound on the number of items in a string array.
pub const MAX_ARRAY_ITEMS: u32 = 4096;

/// Field tags. Tag values are part of the wire format and must not be
/// reordered or reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Tag {
    MessageKind = 1,
    HandshakeMaxVersion = 2,
    HandshakeVersion = 3,
    HandshakeChildCount = 4,
    HandshakeServerPid = 5,
    LaunchPath = 6,
    LaunchArgv = 7,
    LaunchEnv = 8,
    LaunchColumns = 9,
    LaunchRows = 10,
    LaunchUtf8 = 11,
    LaunchWorkdir = 12,
    LaunchUniqueId = 13,
    LaunchStatus = 14,
    LaunchPid = 15,
    LaunchTty = 16,
    WaitPid = 17,
    WaitStatus = 18,
    WaitError = 19,
    ReportIsLast = 20,
    ReportPid = 21,
    ReportTerminated = 22,
    ReportTty = 23,
    TerminationPid = 24,
}

/// Errors produced while decoding a message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer ended before the named element was complete.
    #[error("message truncated while reading {0}")]
    Truncated(&'static str),

    /// The next tag on the wire was not the one the schema expects.
    #[error("expected tag {expected:?} but found tag {found}")]
    UnexpectedTag { expected: Tag, found: u32 },

    /// An integer field did not declare the fixed 8-byte width.
    #[error("integer field {0:?} has a malformed width")]
    BadIntWidth(Tag),

    /// An integer field held a value outside the range its consumer allows.
    #[error("integer field {0:?} is out of range")]
    IntOutOfRange(Tag),

    /// A string field declared more bytes than the sanity bound permits.
    #[error("field of {len} bytes exceeds the {MAX_FIELD_BYTES}-byte bound")]
    FieldTooLarge { len: u32 },

    /// A string array declared more items than the sanity bound permits.
    #[error("array of {len} items exceeds the {MAX_ARRAY_ITEMS}-item bound")]
    ArrayTooLarge { len: u32 },

    /// A string field was not valid UTF-8.
    #[error("string field {0:?} is not valid UTF-8")]
    InvalidUtf8(Tag),

    /// The leading message-kind field named an unknown message type.
    #[error("unknown message kind {0}")]
    UnknownKind(i64),

    /// A known message kind arrived from the wrong side of the connection.
    #[error("message kind {0} is not valid from this peer")]
    WrongDirection(i64),
}

/// Appends tagged fields to a flat byte buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the encoder and returns the encoded bytes.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_int(&mut self, tag: Tag, value: i64) {
        self.header(tag, 8);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_bool(&mut self, tag: Tag, value: bool) {
        self.put_int(tag, i64::from(value));
    }

    pub fn put_string(&mut self, tag: Tag, value: &str) {
        self.header(tag, truncate_len(value.len()));
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn put_string_array(&mut self, tag: Tag, values: &[String]) {
        self.header(tag, truncate_len(values.len()));
        for value in values {
            self.buf
                .extend_from_slice(&truncate_len(value.len()).to_le_bytes());
            self.buf.extend_from_slice(value.as_bytes());
        }
    }

    fn header(&mut self, tag: Tag, len: u32) {
        self.buf.extend_from_slice(&(tag as u32).to_le_bytes());
        self.buf.extend_from_slice(&len.to_le_bytes());
    }
}

// Lengths beyond u32 cannot happen in practice; the transport caps whole
// messages far below that. Saturate rather than panic.
fn truncate_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Walks tagged fields off a byte buffer in schema order.
#[derive(Debug)]
pub struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Reads an integer field with the given tag.
    pub fn int(&mut self, tag: Tag) -> Result<i64, CodecError> {
        let len = self.header(tag)?;
        if len != 8 {
            return Err(CodecError::BadIntWidth(tag));
        }
        let bytes = self.bytes(8, "integer payload")?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(raw))
    }

    /// Reads an integer field and narrows it to i32.
    pub fn int32(&mut self, tag: Tag) -> Result<i32, CodecError> {
        let value = self.int(tag)?;
        i32::try_from(value).map_err(|_| CodecError::IntOutOfRange(tag))
    }

    /// Reads an integer field as a boolean (zero is false).
    pub fn bool(&mut self, tag: Tag) -> Result<bool, CodecError> {
        Ok(self.int(tag)? != 0)
    }

    /// Reads a string field with the given tag.
    pub fn string(&mut self, tag: Tag) -> Result<String, CodecError> {
        let len = self.header(tag)?;
        if len > MAX_FIELD_BYTES {
            return Err(CodecError::FieldTooLarge { len });
        }
        let bytes = self.bytes(len as usize, "string payload")?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8(tag))
    }

    /// Reads a string-array field with the given tag.
    pub fn string_array(&mut self, tag: Tag) -> Result<Vec<String>, CodecError> {
        let count = self.header(tag)?;
        if count > MAX_ARRAY_ITEMS {
            return Err(CodecError::ArrayTooLarge { len: count });
        }
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = self.u32("array item length")?;
            if len > MAX_FIELD_BYTES {
                return Err(CodecError::FieldTooLarge { len });
            }
            let bytes = self.bytes(len as usize, "array item payload")?;
            let value =
                String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8(tag))?;
            values.push(value);
        }
        Ok(values)
    }

    /// Reads a field header, checking the tag, and returns the length word.
    fn header(&mut self, expected: Tag) -> Result<u32, CodecError> {
        let found = self.u32("field tag")?;
        if found != expected as u32 {
            return Err(CodecError::UnexpectedTag { expected, found });
        }
        self.u32("field length")
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, CodecError> {
        let bytes = self.bytes(4, what)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(raw))
    }

    fn bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(CodecError::Truncated(what))?;
        if end > self.buf.len() {
            return Err(CodecError::Truncated(what));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_roundtrip() {
        let mut enc = Encoder::new();
        enc.put_int(Tag::WaitPid, -42);
        enc.put_int(Tag::WaitStatus, i64::MAX);
        let bytes = enc.finish();

        let mut parser = Parser::new(&bytes);
        assert_eq!(parser.int(Tag::WaitPid).unwrap(), -42);
        assert_eq!(parser.int(Tag::WaitStatus).unwrap(), i64::MAX);
    }

    #[test]
    fn string_roundtrip_including_empty() {
        let mut enc = Encoder::new();
        enc.put_string(Tag::LaunchPath, "/bin/sh");
        enc.put_string(Tag::LaunchTty, "");
        let bytes = enc.finish();

        let mut parser = Parser::new(&bytes);
        assert_eq!(parser.string(Tag::LaunchPath).unwrap(), "/bin/sh");
        assert_eq!(parser.string(Tag::LaunchTty).unwrap(), "");
    }

    #[test]
    fn string_array_roundtrip_including_empty() {
        let mut enc = Encoder::new();
        enc.put_string_array(
            Tag::LaunchArgv,
            &["sh".to_string(), String::new(), "-c".to_string()],
        );
        enc.put_string_array(Tag::LaunchEnv, &[]);
        let bytes = enc.finish();

        let mut parser = Parser::new(&bytes);
        assert_eq!(
            parser.string_array(Tag::LaunchArgv).unwrap(),
            vec!["sh".to_string(), String::new(), "-c".to_string()]
        );
        assert_eq!(parser.string_array(Tag::LaunchEnv).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn tag_mismatch_is_an_error() {
        let mut enc = Encoder::new();
        enc.put_int(Tag::WaitPid, 1);
        let bytes = enc.finish();

        let mut parser = Parser::new(&bytes);
        let err = parser.int(Tag::LaunchPid).unwrap_err();
        assert_eq!(
            err,
            CodecError::UnexpectedTag {
                expected: Tag::LaunchPid,
                found: Tag::WaitPid as u32
            }
        );
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut enc = Encoder::new();
        enc.put_string(Tag::LaunchPath, "/bin/sh");
        let mut bytes = enc.finish();
        bytes.truncate(bytes.len() - 3);

        let mut parser = Parser::new(&bytes);
        assert!(matches!(
            parser.string(Tag::LaunchPath).unwrap_err(),
            CodecError::Truncated(_)
        ));
    }

    #[test]
    fn oversized_array_count_is_an_error() {
        // Hand-build a header declaring an absurd item count.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(Tag::LaunchArgv as u32).to_le_bytes());
        bytes.extend_from_slice(&(MAX_ARRAY_ITEMS + 1).to_le_bytes());

        let mut parser = Parser::new(&bytes);
        assert_eq!(
            parser.string_array(Tag::LaunchArgv).unwrap_err(),
            CodecError::ArrayTooLarge {
                len: MAX_ARRAY_ITEMS + 1
            }
        );
    }

    #[test]
    fn array_at_bound_decodes() {
        let values: Vec<String> = (0..MAX_ARRAY_ITEMS).map(|i| i.to_string()).collect();
        let mut enc = Encoder::new();
        enc.put_string_array(Tag::LaunchEnv, &values);
        let bytes = enc.finish();

        let mut parser = Parser::new(&bytes);
        assert_eq!(parser.string_array(Tag::LaunchEnv).unwrap(), values);
    }

    #[test]
    fn oversized_string_is_an_error() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(Tag::LaunchPath as u32).to_le_bytes());
        bytes.extend_from_slice(&(MAX_FIELD_BYTES + 1).to_le_bytes());

        let mut parser = Parser::new(&bytes);
        assert_eq!(
            parser.string(Tag::LaunchPath).unwrap_err(),
            CodecError::FieldTooLarge {
                len: MAX_FIELD_BYTES + 1
            }
        );
    }

    #[test]
    fn bad_int_width_is_an_error() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(Tag::WaitPid as u32).to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 0]);

        let mut parser = Parser::new(&bytes);
        assert_eq!(
            parser.int(Tag::WaitPid).unwrap_err(),
            CodecError::BadIntWidth(Tag::WaitPid)
        );
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(Tag::LaunchTty as u32).to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0xff, 0xfe]);

        let mut parser = Parser::new(&bytes);
        assert_eq!(
            parser.string(Tag::LaunchTty).unwrap_err(),
            CodecError::InvalidUtf8(Tag::LaunchTty)
        );
    }
}
