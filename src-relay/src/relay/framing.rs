//! Length-prefixed JSON framing over any async byte stream.
//!
//! A frame is `u32_le(len) ++ body` with `0 < len < MAX_FRAME_SIZE` and a
//! body that is a JSON object carrying a string `type`. Invalid frames are
//! dropped one at a time; the stream stays usable. EOF is permanent.
//!
//! Two bindings share the same contract: [`framed_stdio`] for the
//! native-messaging host and [`framed_socket`] for relay connections.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::error::FrameError;
use super::protocol::{decode_frame_body, encode_frame, is_valid_frame_len, LENGTH_PREFIX_SIZE};

/// Reading side of a framed channel
pub struct FrameReader<R> {
    inner: R,
    label: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, label: impl Into<String>) -> Self {
        Self {
            inner,
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Wait for the next valid frame.
    ///
    /// Returns `None` once the stream is closed; callers must not read again.
    /// Frames with a bad length or body are logged and skipped.
    pub async fn read_frame(&mut self) -> Option<Map<String, Value>> {
        loop {
            match self.next_frame().await {
                Ok(frame) => return Some(frame),
                Err(e) if e.is_fatal() => {
                    debug!(channel = %self.label, "channel closed: {}", e);
                    return None;
                }
                Err(e) => {
                    warn!(channel = %self.label, "discarding frame: {}", e);
                }
            }
        }
    }

    /// Wait for the next frame that decodes as `T`.
    ///
    /// Frames that are valid JSON objects but do not fit `T` are skipped like
    /// any other invalid frame.
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> Option<T> {
        loop {
            let frame = self.read_frame().await?;
            let kind = frame
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            match serde_json::from_value(Value::Object(frame)) {
                Ok(msg) => return Some(msg),
                Err(e) => {
                    warn!(
                        channel = %self.label,
                        kind = %kind,
                        "discarding undecodable message: {}", e
                    );
                }
            }
        }
    }

    async fn next_frame(&mut self) -> Result<Map<String, Value>, FrameError> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        self.read_exact_or_closed(&mut prefix).await?;
        let len = u32::from_le_bytes(prefix);

        if !is_valid_frame_len(len as usize) {
            self.drain(len as u64).await?;
            return Err(FrameError::InvalidLength(len));
        }

        let mut body = vec![0u8; len as usize];
        self.read_exact_or_closed(&mut body).await?;
        decode_frame_body(&body)
    }

    async fn read_exact_or_closed(&mut self, buf: &mut [u8]) -> Result<(), FrameError> {
        match self.inner.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::Closed),
            Err(e) => Err(FrameError::Io(e)),
        }
    }

    /// Skip the body of a rejected frame so the next prefix lines up
    async fn drain(&mut self, len: u64) -> Result<(), FrameError> {
        if len == 0 {
            return Ok(());
        }
        let mut body = (&mut self.inner).take(len);
        let copied = tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
        if copied < len {
            return Err(FrameError::Closed);
        }
        Ok(())
    }
}

/// Writing side of a framed channel.
///
/// Each frame is written under one lock, so concurrent writers never
/// interleave a prefix with another message's body. After a failed write
/// the channel is must-close and every later write fails fast.
pub struct FrameWriter<W> {
    inner: Mutex<W>,
    must_close: AtomicBool,
    socket_fd: Option<RawFd>,
    label: String,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, label: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(inner),
            must_close: AtomicBool::new(false),
            socket_fd: None,
            label: label.into(),
        }
    }

    pub async fn write_frame<T: Serialize + ?Sized>(&self, msg: &T) -> Result<(), FrameError> {
        if self.must_close() {
            return Err(FrameError::Closed);
        }

        let frame = encode_frame(msg)?;

        let mut inner = self.inner.lock().await;
        // Another writer may have failed while we waited for the lock
        if self.must_close() {
            return Err(FrameError::Closed);
        }

        let result = async {
            inner.write_all(&frame).await?;
            inner.flush().await
        }
        .await;

        if let Err(e) = result {
            self.must_close.store(true, Ordering::SeqCst);
            debug!(channel = %self.label, "write failed, channel must close: {}", e);
            return Err(FrameError::Io(e));
        }

        Ok(())
    }
}

impl<W> FrameWriter<W> {
    pub fn must_close(&self) -> bool {
        self.must_close.load(Ordering::SeqCst)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Half-close the read side of the underlying socket.
    ///
    /// A read blocked on this socket wakes up with EOF. Writes already queued
    /// are unaffected. No-op for channels that are not sockets.
    pub fn shutdown_read(&self) {
        self.shutdown(libc::SHUT_RD, "SHUT_RD");
    }

    /// Tear the socket down in both directions.
    ///
    /// Marks the channel must-close and fails any write parked on a full
    /// send buffer, so a peer that stopped reading cannot pin the writer.
    pub fn abort(&self) {
        self.must_close.store(true, Ordering::SeqCst);
        self.shutdown(libc::SHUT_RDWR, "SHUT_RDWR");
    }

    fn shutdown(&self, how: libc::c_int, name: &str) {
        if let Some(fd) = self.socket_fd {
            // SAFETY: the fd belongs to the socket held by `inner`, which is
            // alive for as long as `self` is.
            let rc = unsafe { libc::shutdown(fd, how) };
            if rc != 0 {
                debug!(
                    channel = %self.label,
                    "shutdown({}) failed: {}",
                    name,
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

/// Frame the process's own stdin/stdout
pub fn framed_stdio() -> (FrameReader<tokio::io::Stdin>, FrameWriter<tokio::io::Stdout>) {
    (
        FrameReader::new(tokio::io::stdin(), "stdio"),
        FrameWriter::new(tokio::io::stdout(), "stdio"),
    )
}

/// Frame a connected Unix socket.
///
/// Returns the raw descriptor alongside the halves; it stays valid while
/// either half is alive.
pub fn framed_socket(
    stream: UnixStream,
    label: impl Into<String>,
) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>, RawFd) {
    let label = label.into();
    let fd = stream.as_raw_fd();
    let (read_half, write_half) = stream.into_split();

    let reader = FrameReader::new(read_half, label.clone());
    let mut writer = FrameWriter::new(write_half, label);
    writer.socket_fd = Some(fd);

    (reader, writer, fd)
}
