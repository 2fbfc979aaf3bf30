//! Base-protocol framing for the server's standard streams.
//!
//! Every message is `Content-Length: N\r\n\r\n` followed by `N` bytes of
//! UTF-8 JSON. [`FrameReader`] and [`FrameWriter`] wrap the child's stdout
//! and stdin respectively.

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single message body.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error on server stream")]
    Io(#[from] std::io::Error),
    #[error("stream ended inside a message header")]
    TruncatedHeader,
    #[error("message header has no Content-Length")]
    MissingContentLength,
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(String),
    #[error("Content-Length {0} exceeds the 4 MiB limit")]
    Oversized(usize),
    #[error("message body is not valid JSON")]
    Json(#[from] serde_json::Error),
}

/// Returns the declared length if `line` is a `Content-Length` header.
///
/// Header names are matched case-insensitively; any other header yields
/// `Ok(None)`.
fn parse_header_line(line: &str) -> Result<Option<usize>, FrameError> {
    let Some((name, value)) = line.split_once(':') else {
        return Ok(None);
    };
    if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
        return Ok(None);
    }
    let value = value.trim();
    value
        .parse()
        .map(Some)
        .map_err(|_| FrameError::InvalidContentLength(value.to_string()))
}

pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Read the next message.
    ///
    /// `Ok(None)` means the server closed the stream between messages.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, FrameError> {
        let Some(len) = self.read_header().await? else {
            return Ok(None);
        };
        if len > MAX_FRAME_BYTES {
            return Err(FrameError::Oversized(len));
        }

        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).await?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn read_header(&mut self) -> Result<Option<usize>, FrameError> {
        let mut content_length = None;
        let mut started = false;

        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line).await? == 0 {
                // EOF is only clean before the first header byte.
                return if started {
                    Err(FrameError::TruncatedHeader)
                } else {
                    Ok(None)
                };
            }
            started = true;

            let line = self.line.trim();
            if line.is_empty() {
                break;
            }
            if let Some(len) = parse_header_line(line)? {
                content_length = Some(len);
            }
        }

        content_length
            .map(Some)
            .ok_or(FrameError::MissingContentLength)
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Serialize `msg` and write it with its header, then flush.
    pub async fn write_frame<T: Serialize + ?Sized>(&mut self, msg: &T) -> Result<(), FrameError> {
        let body = serde_json::to_vec(msg)?;
        let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len());
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(&body).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Flush and close the underlying stream.
    pub async fn close(&mut self) -> Result<(), FrameError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_one(bytes: &[u8]) -> Result<Option<serde_json::Value>, FrameError> {
        FrameReader::new(bytes).read_frame().await
    }

    #[tokio::test]
    async fn test_reads_back_what_was_written() {
        let first = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"});
        let second = serde_json::json!({"jsonrpc": "2.0", "method": "initialized", "params": {}});

        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&first).await.unwrap();
        writer.write_frame(&second).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap(), Some(first));
        assert_eq!(reader.read_frame().await.unwrap(), Some(second));
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clean_eof() {
        assert!(read_one(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_after_header_is_truncation() {
        let err = read_one(b"Content-Length: 10\r\n").await.unwrap_err();
        assert!(matches!(err, FrameError::TruncatedHeader));
    }

    #[tokio::test]
    async fn test_header_without_length() {
        let err = read_one(b"Content-Type: application/json\r\n\r\n{}")
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::MissingContentLength));
    }

    #[tokio::test]
    async fn test_header_name_is_case_insensitive() {
        let body = r#"{"id":7}"#;
        let frame = format!("content-length: {}\r\n\r\n{body}", body.len());
        assert_eq!(read_one(frame.as_bytes()).await.unwrap().unwrap()["id"], 7);
    }

    #[tokio::test]
    async fn test_extra_headers_are_ignored() {
        let body = r#"{"id":3}"#;
        let frame = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        assert_eq!(read_one(frame.as_bytes()).await.unwrap().unwrap()["id"], 3);
    }

    #[tokio::test]
    async fn test_bad_length_value() {
        let err = read_one(b"Content-Length: lots\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidContentLength(v) if v == "lots"));
    }

    #[tokio::test]
    async fn test_oversized_frame() {
        let frame = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let err = read_one(frame.as_bytes()).await.unwrap_err();
        assert!(matches!(err, FrameError::Oversized(_)));
    }

    #[tokio::test]
    async fn test_short_body() {
        let err = read_one(b"Content-Length: 50\r\n\r\n{}").await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[tokio::test]
    async fn test_body_not_json() {
        let err = read_one(b"Content-Length: 5\r\n\r\nhello").await.unwrap_err();
        assert!(matches!(err, FrameError::Json(_)));
    }

    #[tokio::test]
    async fn test_length_counts_bytes() {
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf)
            .write_frame(&serde_json::json!({"tag": "§"}))
            .await
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        let (header, body) = text.split_once("\r\n\r\n").unwrap();
        assert_eq!(header, format!("Content-Length: {}", body.len()));
        assert_ne!(body.len(), body.chars().count());
    }
}
