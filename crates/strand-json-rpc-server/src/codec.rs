//! Stream framing for concatenated JSON values.
//!
//! Peers separate messages with arbitrary JSON whitespace (usually a newline)
//! or with nothing at all. Unit boundaries are found by an incremental
//! bracket and string scan that keeps its state between reads, so every
//! byte is scanned once and serde_json only sees complete units.

use bytes::{Buf, BytesMut};
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::JsonRpcTransportError;

const READ_CHUNK: usize = 8 * 1024;

type Frame = Result<Box<RawValue>, JsonRpcTransportError>;

/// Boundary scan of the unit starting at the front of the buffer
#[derive(Debug, Default)]
struct UnitScan {
    /// Bytes of the unit examined so far
    pos: usize,
    started: bool,
    /// Not an object, array or string: ends at the next delimiter
    bare: bool,
    stray_closer: bool,
    /// Expected closing brackets, innermost last
    closers: Vec<u8>,
    in_string: bool,
    escaped: bool,
}

impl UnitScan {
    /// Scan the unscanned tail of `bytes` and return the unit length once
    /// its end has been seen.
    ///
    /// A closing bracket that does not match its opener also ends the unit,
    /// which keeps an unbalanced unit from swallowing the ones after it.
    fn feed(&mut self, bytes: &[u8]) -> Option<usize> {
        while let Some(&b) = bytes.get(self.pos) {
            if !self.started {
                self.started = true;
                self.bare = !matches!(b, b'{' | b'[' | b'"');
                self.stray_closer = matches!(b, b'}' | b']');
            } else if self.bare && is_delimiter(b) {
                return Some(self.pos);
            }
            self.pos += 1;

            if self.bare {
                continue;
            }
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                    if self.closers.is_empty() {
                        return Some(self.pos);
                    }
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' => self.closers.push(b'}'),
                b'[' => self.closers.push(b']'),
                b'}' | b']' => {
                    if self.closers.pop() != Some(b) || self.closers.is_empty() {
                        return Some(self.pos);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

fn is_delimiter(b: u8) -> bool {
    b.is_ascii_whitespace() || matches!(b, b'{' | b'}' | b'[' | b']' | b'"' | b',' | b':')
}

/// Pulls complete top-level JSON values out of a byte stream
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    max_frame_bytes: usize,
    scan: UnitScan,
    /// Dropping the rest of an oversized unit
    discarding: bool,
    /// Dropping the rest of a line that held garbage
    skip_line: bool,
    /// The last unit was malformed and nothing valid has followed
    after_error: bool,
    /// No newline has been seen since the last malformed unit
    error_line: bool,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_frame_bytes,
            scan: UnitScan::default(),
            discarding: false,
            skip_line: false,
            after_error: false,
            error_line: false,
            eof: false,
        }
    }

    /// Read the next JSON unit.
    ///
    /// Returns `Ok(None)` once the stream is exhausted. A malformed or
    /// oversized unit is discarded and reported once; the reader stays
    /// usable afterwards unless the error is an I/O failure. Stray closing
    /// brackets left over from a malformed unit, and further garbage on the
    /// same line, are dropped without another report.
    pub async fn next_frame(&mut self) -> Result<Option<Box<RawValue>>, JsonRpcTransportError> {
        loop {
            if let Some(frame) = self.poll_unit() {
                return frame.map(Some);
            }

            if self.eof {
                return self.decode_eof();
            }

            self.buf.reserve(READ_CHUNK);
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                self.eof = true;
            }
        }
    }

    /// Make progress on buffered bytes. `None` means more input is needed.
    fn poll_unit(&mut self) -> Option<Frame> {
        loop {
            if self.skip_line {
                match self.buf.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        self.buf.advance(pos + 1);
                        self.skip_line = false;
                        self.error_line = false;
                    }
                    None => {
                        self.buf.clear();
                        return None;
                    }
                }
            }

            if !self.scan.started {
                let Some(start) = self.buf.iter().position(|b| !b.is_ascii_whitespace()) else {
                    self.skip_whitespace(self.buf.len());
                    return None;
                };
                self.skip_whitespace(start);
            }

            let Some(end) = self.scan.feed(&self.buf) else {
                if self.discarding {
                    let scanned = self.scan.pos;
                    self.buf.advance(scanned);
                    self.scan.pos = 0;
                } else if self.scan.pos > self.max_frame_bytes {
                    let len = self.scan.pos;
                    self.discarding = true;
                    self.buf.advance(len);
                    self.scan.pos = 0;
                    return Some(Err(JsonRpcTransportError::FrameTooLarge(len)));
                }
                return None;
            };

            if self.discarding {
                self.buf.advance(end);
                self.scan = UnitScan::default();
                self.discarding = false;
                trace!("dropped the tail of an oversized frame");
                continue;
            }

            if end > self.max_frame_bytes {
                self.buf.advance(end);
                self.scan = UnitScan::default();
                return Some(Err(JsonRpcTransportError::FrameTooLarge(end)));
            }

            if let Some(frame) = self.finish_unit(end) {
                return Some(frame);
            }
        }
    }

    /// Parse the first `end` buffered bytes as one unit. Returns `None` when
    /// a malformed unit is folded into the previous report.
    fn finish_unit(&mut self, end: usize) -> Option<Frame> {
        let unit = self.buf.split_to(end);
        let scan = std::mem::take(&mut self.scan);

        match serde_json::from_slice::<Box<RawValue>>(&unit) {
            Ok(frame) => {
                self.after_error = false;
                self.error_line = false;
                trace!(bytes = end, "decoded frame");
                Some(Ok(frame))
            }
            Err(e) => {
                let quiet = (scan.stray_closer && self.after_error) || (scan.bare && self.error_line);
                if scan.bare && !scan.stray_closer {
                    self.skip_line = true;
                }
                self.after_error = true;
                self.error_line = true;
                if quiet {
                    debug!(bytes = end, "dropped trailing garbage");
                    return None;
                }
                Some(Err(JsonRpcTransportError::JsonParseError(e)))
            }
        }
    }

    fn skip_whitespace(&mut self, len: usize) {
        if self.buf[..len].contains(&b'\n') {
            self.error_line = false;
        }
        self.buf.advance(len);
    }

    fn decode_eof(&mut self) -> Result<Option<Box<RawValue>>, JsonRpcTransportError> {
        if self.discarding || self.skip_line || self.buf.is_empty() {
            self.buf.clear();
            self.scan = UnitScan::default();
            self.discarding = false;
            self.skip_line = false;
            return Ok(None);
        }

        let end = self.buf.len();
        match self.finish_unit(end) {
            Some(frame) => frame.map(Some),
            None => Ok(None),
        }
    }
}

/// Serialize `message` as one compact JSON line and flush it
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), JsonRpcTransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize + ?Sized,
{
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};

    /// Hands out one chunk per read
    struct Chunked(VecDeque<Vec<u8>>);

    impl Chunked {
        fn new(chunks: &[&[u8]]) -> Self {
            Self(chunks.iter().map(|c| c.to_vec()).collect())
        }
    }

    impl AsyncRead for Chunked {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if let Some(chunk) = self.0.pop_front() {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.0.push_front(chunk[n..].to_vec());
                }
            }
            Poll::Ready(Ok(()))
        }
    }

    async fn drain<R: AsyncRead + Unpin>(mut reader: FrameReader<R>) -> Vec<Result<String, String>> {
        let mut out = Vec::new();
        loop {
            match reader.next_frame().await {
                Ok(Some(frame)) => out.push(Ok(frame.get().to_string())),
                Ok(None) => break,
                Err(e) => out.push(Err(e.to_string())),
            }
        }
        out
    }

    async fn frames(input: &[u8]) -> Vec<Result<String, String>> {
        let (mut tx, rx) = tokio::io::duplex(64);
        let data = input.to_vec();
        tokio::spawn(async move {
            tx.write_all(&data).await.unwrap();
            tx.shutdown().await.unwrap();
        });

        drain(FrameReader::new(rx, 1024)).await
    }

    #[tokio::test]
    async fn test_concatenated_values() {
        let out = frames(br#"{"a":1}{"b":2}  [3,4]
"x" "#)
            .await;
        assert_eq!(
            out,
            vec![
                Ok(r#"{"a":1}"#.to_string()),
                Ok(r#"{"b":2}"#.to_string()),
                Ok("[3,4]".to_string()),
                Ok(r#""x""#.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let big = format!(r#"{{"pad":"{}"}}"#, "y".repeat(300));
        let out = frames(big.as_bytes()).await;
        assert_eq!(out, vec![Ok(big)]);
    }

    #[tokio::test]
    async fn test_syntax_error_resyncs_at_newline() {
        let out = frames(b"{]\n{\"ok\":true}\n").await;
        assert_eq!(out.len(), 2);
        assert!(out[0].is_err());
        assert_eq!(out[1], Ok(r#"{"ok":true}"#.to_string()));
    }

    #[tokio::test]
    async fn test_multiline_malformed_unit_reported_once() {
        let out = frames(b"{\n  \"jsonrpc\": \"2.0\",\n  \"method\": ]\n}\n{\"ok\":true}\n").await;
        assert_eq!(out.len(), 2);
        assert!(out[0].is_err());
        assert_eq!(out[1], Ok(r#"{"ok":true}"#.to_string()));
    }

    #[tokio::test]
    async fn test_valid_unit_after_garbage_on_same_line() {
        let expected = Ok(r#"{"ok":1}"#.to_string());

        let whole = drain(FrameReader::new(Chunked::new(&[b"{] {\"ok\":1}\n"]), 1024)).await;
        assert_eq!(whole.len(), 2);
        assert!(whole[0].is_err());
        assert_eq!(whole[1], expected);

        let split = drain(FrameReader::new(Chunked::new(&[b"{]", b" {\"ok\":1}\n"]), 1024)).await;
        assert_eq!(split.len(), 2);
        assert!(split[0].is_err());
        assert_eq!(split[1], expected);
    }

    #[tokio::test]
    async fn test_garbage_line_reported_once() {
        let out = drain(FrameReader::new(
            Chunked::new(&[b"!!! ??", b"? ,,\n", b"[1]"]),
            1024,
        ))
        .await;
        assert_eq!(out.len(), 2);
        assert!(out[0].is_err());
        assert_eq!(out[1], Ok("[1]".to_string()));
    }

    #[tokio::test]
    async fn test_brackets_inside_strings() {
        let out = frames(br#"{"s":"}]\"{["} "a\"]""#).await;
        assert_eq!(
            out,
            vec![Ok(r#"{"s":"}]\"{["}"#.to_string()), Ok(r#""a\"]""#.to_string())]
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_in_chunks_reported_once() {
        let huge = format!("{{\"pad\":\"{}\",\"n\":[[1],{{}}]}}\n{{\"ok\":1}}\n", "z".repeat(200_000));
        let chunks: Vec<&[u8]> = huge.as_bytes().chunks(4096).collect();

        let mut reader = FrameReader::new(Chunked::new(&chunks), 1024);
        let err = reader.next_frame().await.unwrap_err();
        assert!(matches!(err, JsonRpcTransportError::FrameTooLarge(_)));

        let out = drain(reader).await;
        assert_eq!(out, vec![Ok(r#"{"ok":1}"#.to_string())]);
    }

    #[tokio::test]
    async fn test_large_frame_in_small_chunks() {
        let big = format!("[{}]", vec!["1"; 500_000].join(","));
        let chunks: Vec<&[u8]> = big.as_bytes().chunks(1024).collect();

        let out = drain(FrameReader::new(Chunked::new(&chunks), 16 * 1024 * 1024)).await;
        assert_eq!(out, vec![Ok(big)]);
    }

    #[tokio::test]
    async fn test_truncated_input_at_eof() {
        let out = frames(b"{").await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame() {
        let huge = format!(r#"{{"pad":"{}""#, "z".repeat(4096));
        let (mut tx, rx) = tokio::io::duplex(8192);
        tx.write_all(huge.as_bytes()).await.unwrap();

        let mut reader = FrameReader::new(rx, 1024);
        let err = reader.next_frame().await.unwrap_err();
        assert!(matches!(err, JsonRpcTransportError::FrameTooLarge(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_write_message_appends_newline() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        write_message(&mut tx, &serde_json::json!({"k": "v"})).await.unwrap();
        drop(tx);

        let mut out = String::new();
        rx.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "{\"k\":\"v\"}\n");
    }
}
