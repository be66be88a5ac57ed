use std::borrow::Cow;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::config::ConfigError;
use super::types::SocketError;

/// Byte sequence separating messages on a stream transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delimiter(Bytes);

impl Delimiter {
    pub const CRLF: Self = Self(Bytes::from_static(b"\r\n"));

    pub fn new(bytes: impl Into<Bytes>) -> Result<Self, ConfigError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(ConfigError::Invalid {
                field: "delimiter",
                requirement: "non-empty",
            });
        }
        Ok(Self(bytes))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for clippy's `len_without_is_empty`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Delimiter {
    fn default() -> Self {
        Self::CRLF
    }
}

/// One complete application message cut out of the byte stream.
///
/// Cloning shares the underlying buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Frame(Bytes);

impl Frame {
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn from_static(text: &'static str) -> Self {
        Self(Bytes::from_static(text.as_bytes()))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow as UTF-8 when the payload is valid text.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn to_text_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl From<Bytes> for Frame {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Self(Bytes::from(text))
    }
}

impl From<&'static str> for Frame {
    fn from(text: &'static str) -> Self {
        Self::from_static(text)
    }
}

impl From<Frame> for Bytes {
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text_lossy())
    }
}

/// Position of the first complete occurrence of `delimiter` in `haystack`.
///
/// A candidate that matches only partially does not end the search; scanning resumes one byte
/// after the failed candidate's start.
pub fn find_delimiter(haystack: &[u8], delimiter: &[u8]) -> Option<usize> {
    let (&first, rest) = delimiter.split_first()?;
    let width = delimiter.len();
    if haystack.len() < width {
        return None;
    }

    let last_start = haystack.len() - width;
    let mut start = 0;
    while start <= last_start {
        let offset = haystack[start..=last_start]
            .iter()
            .position(|&byte| byte == first)?;
        let candidate = start + offset;
        if &haystack[candidate + 1..candidate + width] == rest {
            return Some(candidate);
        }
        start = candidate + 1;
    }
    None
}

/// Splits inbound bytes on a delimiter and appends it to outbound messages.
///
/// Frames are split off the read buffer and frozen, so they share the buffer's allocation.
#[derive(Debug, Clone)]
pub struct DelimiterCodec {
    delimiter: Delimiter,
    max_frame_bytes: usize,
    // Offset where the next search resumes; bytes before it are known not to start a delimiter.
    next_index: usize,
}

impl DelimiterCodec {
    pub fn new(delimiter: Delimiter, max_frame_bytes: usize) -> Self {
        Self {
            delimiter,
            max_frame_bytes,
            next_index: 0,
        }
    }

    pub fn delimiter(&self) -> &Delimiter {
        &self.delimiter
    }
}

impl Default for DelimiterCodec {
    fn default() -> Self {
        Self::new(Delimiter::CRLF, usize::MAX)
    }
}

impl Decoder for DelimiterCodec {
    type Item = Bytes;
    type Error = SocketError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, SocketError> {
        let width = self.delimiter.len();
        let start = self.next_index.min(buf.len());
        match find_delimiter(&buf[start..], self.delimiter.as_bytes()) {
            Some(offset) => {
                let end = start + offset;
                self.next_index = 0;
                let mut frame = buf.split_to(end + width);
                frame.truncate(end);
                Ok(Some(frame.freeze()))
            }
            None => {
                if buf.len() > self.max_frame_bytes {
                    return Err(SocketError::FrameTooLong {
                        limit: self.max_frame_bytes,
                    });
                }
                // A delimiter may straddle this chunk and the next one.
                self.next_index = buf.len().saturating_sub(width - 1);
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for DelimiterCodec {
    type Error = SocketError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), SocketError> {
        dst.reserve(item.len() + self.delimiter.len());
        dst.put(item);
        dst.put_slice(self.delimiter.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut DelimiterCodec, buf: &mut BytesMut) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn finds_first_full_match_after_false_partial() {
        let haystack = [0u8, 1, 2, 3, 3, 5, 3, 3, 3, 9];
        assert_eq!(find_delimiter(&haystack, &[3, 3, 3]), Some(6));
    }

    #[test]
    fn overlapping_run_reports_earliest_start() {
        let haystack = [0u8, 1, 2, 3, 3, 3, 6, 3, 3, 9];
        assert_eq!(find_delimiter(&haystack, &[3, 3]), Some(3));
    }

    #[test]
    fn gapped_bytes_do_not_match() {
        let haystack = [0u8, 1, 2, 3, 4, 5];
        assert_eq!(find_delimiter(&haystack, &[1, 3]), None);
        assert_eq!(find_delimiter(&haystack, &[5, 6]), None);
        assert_eq!(find_delimiter(&[], b"\r\n"), None);
        assert_eq!(find_delimiter(b"abc", b""), None);
    }

    #[test]
    fn single_byte_delimiter() {
        assert_eq!(find_delimiter(b"abc\ndef", b"\n"), Some(3));
        assert_eq!(find_delimiter(b"\n", b"\n"), Some(0));
    }

    #[test]
    fn delimiter_split_across_reads_is_one_boundary() {
        let mut codec = DelimiterCodec::default();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(b"PING :tmi\r");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"\nPONG");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Bytes::from_static(b"PING :tmi"))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"PONG");
    }

    #[test]
    fn any_chunking_reproduces_the_message_sequence() {
        let messages: [&[u8]; 5] = [b"first", b"", b"a\rb", b":tmi.twitch.tv 001 nick :Welcome", b"\n"];
        let mut wire = Vec::new();
        for message in messages {
            wire.extend_from_slice(message);
            wire.extend_from_slice(b"\r\n");
        }

        for chunk in 1..=wire.len() {
            let mut codec = DelimiterCodec::default();
            let mut buf = BytesMut::new();
            let mut frames = Vec::new();
            for piece in wire.chunks(chunk) {
                buf.extend_from_slice(piece);
                frames.extend(decode_all(&mut codec, &mut buf));
            }
            let frames: Vec<&[u8]> = frames.iter().map(AsRef::as_ref).collect();
            assert_eq!(frames, messages, "chunk size {chunk}");
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn multi_byte_delimiter_with_repeated_prefix() {
        let delimiter = Delimiter::new(Bytes::from_static(&[3, 3, 3])).unwrap();
        let mut codec = DelimiterCodec::new(delimiter, 64);
        let mut buf = BytesMut::from(&[0u8, 1, 2, 3, 3][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&[5, 3, 3]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&[3, 9]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Bytes::from_static(&[0, 1, 2, 3, 3, 5]))
        );
        assert_eq!(&buf[..], &[9]);
    }

    #[test]
    fn oversized_partial_frame_is_an_error() {
        let mut codec = DelimiterCodec::new(Delimiter::CRLF, 8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(SocketError::FrameTooLong { limit: 8 })
        ));
    }

    #[test]
    fn encoder_appends_delimiter() {
        let mut codec = DelimiterCodec::default();
        let mut dst = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"PASS oauth:token"), &mut dst)
            .unwrap();
        codec.encode(Bytes::from_static(b"NICK bot"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"PASS oauth:token\r\nNICK bot\r\n");
    }

    #[test]
    fn empty_delimiter_is_rejected() {
        assert!(Delimiter::new(Bytes::new()).is_err());
    }

    #[test]
    fn frames_share_the_read_buffer() {
        let mut codec = DelimiterCodec::default();
        let mut buf = BytesMut::with_capacity(64);
        buf.extend_from_slice(b"hello\r\nworld\r\n");
        let base = buf.as_ptr();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.as_ptr(), base);
    }
}
