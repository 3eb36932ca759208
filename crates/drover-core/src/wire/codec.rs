//! FrameStream - 数値と長さ付きバイト列のフレーミング
//!
//! - 数値: u64 big-endian 8 bytes
//! - 文字列: u64 長さ + 生バイト
//!
//! socket に直接触るのはこのモジュールだけ。

use std::io;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for one string frame. Larger lengths are treated as a
/// corrupted stream rather than allocated.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("connection closed by peer")]
    Closed,

    #[error("wire i/o: {0}")]
    Io(#[source] io::Error),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: u64, max: u64 },

    #[error("frame is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("payload json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<io::Error> for WireError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => WireError::Closed,
            _ => WireError::Io(err),
        }
    }
}

/// Bidirectional framed connection.
pub struct FrameStream<S> {
    inner: S,
    max_len: u64,
}

impl<S> FrameStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            max_len: MAX_FRAME_LEN,
        }
    }

    pub fn with_max_len(mut self, max_len: u64) -> Self {
        self.max_len = max_len;
        self
    }

    pub async fn send_u64(&mut self, value: u64) -> Result<(), WireError> {
        self.inner.write_all(&value.to_be_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn recv_u64(&mut self) -> Result<u64, WireError> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf).await?;
        Ok(u64::from_be_bytes(buf))
    }

    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let len = bytes.len() as u64;
        if len > self.max_len {
            return Err(WireError::FrameTooLarge {
                len,
                max: self.max_len,
            });
        }
        let mut frame = Vec::with_capacity(8 + bytes.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(bytes);
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn recv_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.recv_u64().await?;
        if len > self.max_len {
            return Err(WireError::FrameTooLarge {
                len,
                max: self.max_len,
            });
        }
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf).await?;
        Ok(buf)
    }

    pub async fn send_str(&mut self, s: &str) -> Result<(), WireError> {
        self.send_bytes(s.as_bytes()).await
    }

    pub async fn recv_string(&mut self) -> Result<String, WireError> {
        let bytes = self.recv_bytes().await?;
        Ok(String::from_utf8(bytes)?)
    }

    pub async fn send_json<T: Serialize>(&mut self, value: &T) -> Result<(), WireError> {
        let bytes = serde_json::to_vec(value)?;
        self.send_bytes(&bytes).await
    }

    pub async fn recv_json<T: DeserializeOwned>(&mut self) -> Result<T, WireError> {
        let bytes = self.recv_bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn numbers_and_strings_arrive_in_order() {
        let (a, b) = duplex(1024);
        let mut left = FrameStream::new(a);
        let mut right = FrameStream::new(b);

        left.send_u64(7).await.unwrap();
        left.send_str("hello").await.unwrap();
        left.send_u64(u64::MAX).await.unwrap();

        assert_eq!(right.recv_u64().await.unwrap(), 7);
        assert_eq!(right.recv_string().await.unwrap(), "hello");
        assert_eq!(right.recv_u64().await.unwrap(), u64::MAX);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_allocating() {
        let (a, b) = duplex(1024);
        let mut left = FrameStream::new(a);
        let mut right = FrameStream::new(b).with_max_len(4);

        // length prefix only; the reader must bail out on the header
        left.send_u64(1 << 40).await.unwrap();
        let err = right.recv_bytes().await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { len, max: 4 } if len == 1 << 40));
    }

    #[tokio::test]
    async fn eof_maps_to_closed() {
        let (a, b) = duplex(64);
        drop(a);
        let mut right = FrameStream::new(b);
        assert!(matches!(right.recv_u64().await, Err(WireError::Closed)));
    }

    #[tokio::test]
    async fn invalid_json_surfaces_as_json_error() {
        let (a, b) = duplex(64);
        let mut left = FrameStream::new(a);
        let mut right = FrameStream::new(b);

        left.send_str("{not json").await.unwrap();
        let res: Result<serde_json::Value, _> = right.recv_json().await;
        assert!(matches!(res, Err(WireError::Json(_))));
    }
}
