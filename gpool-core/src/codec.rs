use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::IgnoredAny;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame accepted from either side
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Decodes complete JSON values; encodes frames newline-terminated.
///
/// Peers do not agree on a delimiter: most send one object per line, some concatenate
/// objects and some pretty-print across lines. Frames are therefore cut at the end of
/// each complete JSON value and yielded as the exact bytes received.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFrameCodec;

impl JsonFrameCodec {
    pub fn new() -> Self {
        Self
    }

    /// Drop the offending bytes through the next newline so the stream can resync
    fn discard_line(src: &mut BytesMut) {
        match src.iter().position(|&b| b == b'\n') {
            Some(pos) => src.advance(pos + 1),
            None => src.clear(),
        }
    }
}

impl Decoder for JsonFrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        match src.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(start) => src.advance(start),
            None => {
                src.clear();
                return Ok(None);
            }
        }

        let (parsed, end) = {
            let mut values = serde_json::Deserializer::from_slice(&src[..]).into_iter::<IgnoredAny>();
            let parsed = values.next();
            (parsed, values.byte_offset())
        };

        match parsed {
            Some(Ok(_)) => {
                if end > MAX_FRAME_LEN {
                    src.advance(end);
                    return Err(CodecError::Malformed(format!("frame of {} bytes exceeds limit", end)));
                }
                Ok(Some(src.split_to(end).freeze()))
            }
            Some(Err(e)) if e.is_eof() => {
                if src.len() > MAX_FRAME_LEN {
                    let len = src.len();
                    src.clear();
                    return Err(CodecError::Malformed(format!("incomplete frame of {} bytes exceeds limit", len)));
                }
                Ok(None)
            }
            Some(Err(e)) => {
                Self::discard_line(src);
                Err(CodecError::Malformed(e.to_string()))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                let len = src.len();
                src.clear();
                Err(CodecError::Malformed(format!("{} trailing bytes at end of stream", len)))
            }
        }
    }
}

impl Encoder<Bytes> for JsonFrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.reserve(frame.len() + 1);
        dst.put_slice(&frame);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Outcome of a failed read
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The peer went away: reset, aborted, or closed mid-read
    #[error("peer disconnected: {0}")]
    Disconnected(io::Error),

    /// Bytes that do not form a JSON value; already discarded
    #[error("{0}")]
    Malformed(String),

    #[error("read failed: {0}")]
    Io(io::Error),
}

impl From<io::Error> for ReadError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => ReadError::Disconnected(err),
            _ => ReadError::Io(err),
        }
    }
}

impl From<CodecError> for ReadError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Malformed(msg) => ReadError::Malformed(msg),
            CodecError::Io(e) => e.into(),
        }
    }
}

/// Pulls frames off a byte stream.
///
/// Unlike `FramedRead`, a decode or read error does not end the stream: the caller
/// decides whether to keep reading.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    codec: JsonFrameCodec,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
            codec: JsonFrameCodec::new(),
            eof: false,
        }
    }

    /// Next complete frame, or `None` once the peer has closed and the buffer is drained
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, ReadError> {
        loop {
            if self.eof {
                return Ok(self.codec.decode_eof(&mut self.buf)?);
            }

            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }

            if self.inner.read_buf(&mut self.buf).await? == 0 {
                self.eof = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn decode_all(input: &[u8]) -> Vec<Result<Bytes, String>> {
        let mut codec = JsonFrameCodec::new();
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        loop {
            match codec.decode_eof(&mut buf) {
                Ok(Some(frame)) => out.push(Ok(frame)),
                Ok(None) => break,
                Err(e) => out.push(Err(e.to_string())),
            }
        }
        out
    }

    #[test]
    fn test_newline_delimited_frames() {
        let frames = decode_all(b"{\"id\":\"1\"}\n{\"id\":\"2\"}\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap(), &Bytes::from_static(b"{\"id\":\"1\"}"));
        assert_eq!(frames[1].as_ref().unwrap(), &Bytes::from_static(b"{\"id\":\"2\"}"));
    }

    #[test]
    fn test_concatenated_and_multiline_frames() {
        let input = b"{\"a\":1}{\"b\":2}  {\n   \"c\":{\n      \"d\":3\n   }\n}";
        let frames = decode_all(input);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].as_ref().unwrap(), &Bytes::from_static(b"{\n   \"c\":{\n      \"d\":3\n   }\n}"));
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut codec = JsonFrameCodec::new();
        let mut buf = BytesMut::from(&b"{\"id\":\"1\",\"meth"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"od\":\"status\"}\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"{\"id\":\"1\",\"method\":\"status\"}");
    }

    #[test]
    fn test_garbage_is_skipped_through_newline() {
        let frames = decode_all(b"not json at all\n{\"id\":\"7\"}\n");
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_err());
        assert_eq!(frames[1].as_ref().unwrap(), &Bytes::from_static(b"{\"id\":\"7\"}"));
    }

    #[test]
    fn test_truncated_stream_reports_trailing_bytes() {
        let frames = decode_all(b"{\"id\":\"1\"}\n{\"id\":");
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_ok());
        assert!(frames[1].as_ref().unwrap_err().contains("trailing bytes"));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = JsonFrameCodec::new();
        let mut huge = b"{\"pad\":\"".to_vec();
        huge.extend(std::iter::repeat(b'x').take(MAX_FRAME_LEN + 10));
        let mut buf = BytesMut::from(&huge[..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Malformed(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encoder_appends_newline() {
        let mut codec = JsonFrameCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(Bytes::from_static(b"{\"id\":\"1\"}"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"{\"id\":\"1\"}\n");
    }

    #[test]
    fn test_read_error_classification() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(matches!(ReadError::from(reset), ReadError::Disconnected(_)));
        let other = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        assert!(matches!(ReadError::from(other), ReadError::Io(_)));
    }

    #[tokio::test]
    async fn test_frame_reader_over_stream() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        tokio::spawn(async move {
            client.write_all(b"{\"id\":\"1\"}\n").await.unwrap();
            client.write_all(b"}}}\n").await.unwrap();
            client.write_all(b"{\"id\":\"2\"}").await.unwrap();
        });

        assert_eq!(&reader.next_frame().await.unwrap().unwrap()[..], b"{\"id\":\"1\"}");
        assert!(matches!(reader.next_frame().await, Err(ReadError::Malformed(_))));
        assert_eq!(&reader.next_frame().await.unwrap().unwrap()[..], b"{\"id\":\"2\"}");
        assert!(reader.next_frame().await.unwrap().is_none());
    }
}
