//! Envelope framing over one transport stream.
//!
//! Successive envelopes are concatenated JSON documents with no length
//! prefix; document boundaries come from `serde_json`'s streaming parser
//! (newline-insensitive). This framing is a cross-version wire contract
//! between independently-built CLI and helper binaries.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::error::IpcError;
use super::message::Envelope;
use super::transport::BoxedStream;

/// Read chunk size. Envelopes are usually small; catalog listings can run
/// to a few hundred KB and arrive over multiple reads.
const READ_BUF_SIZE: usize = 64 * 1024;

/// One framed duplex connection.
///
/// The write path is serialized by a lock so concurrent senders never
/// interleave partial documents; the read path owns a reassembly buffer.
/// [`Connection::close`] is idempotent and unblocks a pending
/// [`Connection::receive`].
pub struct Connection {
    reader: Mutex<FrameReader>,
    writer: Mutex<WriteHalf<BoxedStream>>,
    deadline: StdMutex<Option<Instant>>,
    closed: AtomicBool,
    close_signal: Notify,
}

struct FrameReader {
    half: ReadHalf<BoxedStream>,
    buf: Vec<u8>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap a transport stream.
    pub fn new(stream: BoxedStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(FrameReader {
                half: read_half,
                buf: Vec::new(),
            }),
            writer: Mutex::new(write_half),
            deadline: StdMutex::new(None),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    /// Serialize `envelope` as one JSON document and write it.
    ///
    /// # Errors
    ///
    /// [`IpcError::ConnectionClosed`] if the connection is closed,
    /// [`IpcError::Timeout`] if a deadline elapses mid-write,
    /// [`IpcError::Transport`] on I/O failure.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), IpcError> {
        if self.is_closed() {
            return Err(IpcError::ConnectionClosed);
        }
        let bytes = serde_json::to_vec(envelope).map_err(IpcError::Serialization)?;
        let deadline = self.current_deadline();
        let mut writer = self.writer.lock().await;
        bounded(deadline, async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        })
        .await?
        .map_err(IpcError::Transport)
    }

    /// Block until one full envelope has arrived.
    ///
    /// # Errors
    ///
    /// [`IpcError::ConnectionClosed`] on clean EOF or local close,
    /// [`IpcError::Decode`] on mid-stream corruption,
    /// [`IpcError::Timeout`] if a deadline elapses,
    /// [`IpcError::Transport`] on I/O failure.
    pub async fn receive(&self) -> Result<Envelope, IpcError> {
        let mut reader = self.reader.lock().await;
        loop {
            if let Some(envelope) = extract_envelope(&mut reader.buf)? {
                return Ok(envelope);
            }

            // Register interest before re-checking the flag, so a close()
            // racing with this receive cannot slip between check and await.
            let closed = self.close_signal.notified();
            tokio::pin!(closed);
            closed.as_mut().enable();
            if self.is_closed() {
                return Err(IpcError::ConnectionClosed);
            }

            let deadline = self.current_deadline();
            let mut chunk = [0u8; READ_BUF_SIZE];
            let read = tokio::select! {
                _ = &mut closed => return Err(IpcError::ConnectionClosed),
                result = bounded(deadline, reader.half.read(&mut chunk)) => result?,
            };
            match read {
                Ok(0) => return Err(IpcError::ConnectionClosed),
                Ok(n) => reader.buf.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(IpcError::Transport(e)),
            }
        }
    }

    /// Bound the next `send` and the next `receive` by an absolute deadline.
    ///
    /// `None` clears the bound.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        *self
            .deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    /// Close the connection.
    ///
    /// Idempotent and safe to call concurrently with a pending `receive`,
    /// which then returns [`IpcError::ConnectionClosed`] rather than hang.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_signal.notify_waiters();
        }
    }

    /// Whether [`Connection::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn current_deadline(&self) -> Option<Instant> {
        *self
            .deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run `fut`, bounded by an optional absolute deadline.
async fn bounded<F>(deadline: Option<Instant>, fut: F) -> Result<F::Output, IpcError>
where
    F: Future,
{
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut)
            .await
            .map_err(|_| IpcError::Timeout),
        None => Ok(fut.await),
    }
}

/// Try to parse one envelope off the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds no complete document yet;
/// consumed bytes are drained on success.
fn extract_envelope(buf: &mut Vec<u8>) -> Result<Option<Envelope>, IpcError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let (item, consumed) = {
        let mut documents = serde_json::Deserializer::from_slice(buf).into_iter::<Envelope>();
        let item = documents.next();
        (item, documents.byte_offset())
    };
    match item {
        None => Ok(None),
        Some(Ok(envelope)) => {
            buf.drain(..consumed);
            Ok(Some(envelope))
        }
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(IpcError::Decode(e)),
    }
}
