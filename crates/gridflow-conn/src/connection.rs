//! The connection type: framed writes, the batched flush task, and the
//! inbound read loop.
//!
//! A [`Connection`] owns one connected [`StreamSocket`] and is only handed
//! out as `Arc<Connection>` by [`Connection::new`]; the flush task and the
//! read loop each hold their own reference, so the handle outlives any
//! in-flight operation it issued.
//!
//! # Write path
//!
//! All writes, synchronous and asynchronous, are serialized through a single
//! flush task that owns the write half of the socket. The task drains the
//! FIFO queue in batches of up to [`ConnectionConfig::write_batch_max`]
//! frames, issues one transport write per batch, and invokes each entry's
//! completion in queue order. One task means at most one flush is ever in
//! flight, and batches are never interleaved.
//!
//! A transport error fails the entire current batch (never report success
//! for bytes not confirmed written) and marks the connection broken; from
//! then on every pending and future write fails immediately without
//! touching the transport.
//!
//! # Read path
//!
//! [`Connection::process_messages`] spawns the read loop: header, cookie
//! check, body, dispatch, next header. Exactly one read is outstanding at a
//! time. The loop ends by invoking the error handler exactly once; resuming
//! is the error handler's decision.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

use crate::error::{ConnectionError, ConnectionResult, DEFAULT_COOKIE};
use crate::frame::{FrameHeader, HEADER_SIZE};
use crate::handshake::Registration;
use crate::socket::StreamSocket;

/// Default maximum number of queued frames coalesced into one flush.
pub const DEFAULT_WRITE_BATCH_MAX: usize = 32;

/// Handler invoked once per fully-decoded inbound message with the
/// connection, the message type tag, and the payload. Must not block.
pub type MessageHandler = Arc<dyn Fn(Arc<Connection>, i64, Bytes) + Send + Sync>;

/// Handler invoked exactly once when the read loop terminates abnormally.
pub type ConnectionErrorHandler = Arc<dyn Fn(Arc<Connection>, ConnectionError) + Send + Sync>;

/// Per-connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Shared-secret protocol cookie stamped on and validated against every
    /// frame. Supplied at startup so test doubles can use distinct values.
    pub cookie: i64,

    /// Maximum queued frames flushed in one transport write.
    pub write_batch_max: usize,

    /// Label printed in the debug string and log messages, identifying the
    /// kind of peer (e.g. `"worker"`, `"scheduler"`).
    pub debug_label: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            cookie: DEFAULT_COOKIE,
            write_batch_max: DEFAULT_WRITE_BATCH_MAX,
            debug_label: "connection".to_string(),
        }
    }
}

impl ConnectionConfig {
    /// Set the protocol cookie.
    #[must_use]
    pub const fn with_cookie(mut self, cookie: i64) -> Self {
        self.cookie = cookie;
        self
    }

    /// Set the flush batch limit.
    #[must_use]
    pub const fn with_write_batch_max(mut self, max: usize) -> Self {
        self.write_batch_max = max;
        self
    }

    /// Set the debug label.
    #[must_use]
    pub fn with_debug_label(mut self, label: impl Into<String>) -> Self {
        self.debug_label = label.into();
        self
    }
}

/// Completion callback for one queued write.
type WriteCompletion = Box<dyn FnOnce(ConnectionResult<()>) + Send>;

/// Whether a queued entry came from the sync or async write API, for the
/// per-kind counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Sync,
    Async,
    Raw,
}

/// One entry in the outbound FIFO queue: pre-encoded bytes plus the
/// completion to invoke after they are confirmed written.
struct PendingWrite {
    buffers: Vec<Bytes>,
    kind: WriteKind,
    completion: WriteCompletion,
}

impl PendingWrite {
    fn len(&self) -> usize {
        self.buffers.iter().map(Bytes::len).sum()
    }
}

/// State shared between the connection handle and its flush task.
#[derive(Debug, Default)]
struct WriteState {
    broken: AtomicBool,
    pending_writes: AtomicU64,
    sync_writes: AtomicU64,
    async_writes: AtomicU64,
    bytes_written: AtomicU64,
}

/// A bidirectional framed-message connection over a local stream socket.
///
/// Created only through [`Connection::new`], which returns a shared handle;
/// see the module docs for the write/read path design.
pub struct Connection {
    config: ConnectionConfig,
    remote_endpoint: String,
    #[cfg(unix)]
    fd: std::os::unix::io::RawFd,
    write_tx: mpsc::UnboundedSender<PendingWrite>,
    write_state: Arc<WriteState>,
    reader: Arc<Mutex<ReadHalf<StreamSocket>>>,
    bytes_read: AtomicU64,
    registered: AtomicBool,
    reading: AtomicBool,
    closed: AtomicBool,
}

impl Connection {
    /// Wrap an already-connected socket in a shared connection handle and
    /// start its flush task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(socket: StreamSocket, config: ConnectionConfig) -> Arc<Self> {
        let remote_endpoint = socket.remote_endpoint_info();
        #[cfg(unix)]
        let fd = socket.as_raw_fd();
        let (read_half, write_half) = tokio::io::split(socket);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let write_state = Arc::new(WriteState::default());

        tokio::spawn(flush_loop(
            write_half,
            write_rx,
            Arc::clone(&write_state),
            config.write_batch_max.max(1),
        ));

        debug!(
            label = %config.debug_label,
            remote = %remote_endpoint,
            "connection created"
        );

        Arc::new(Self {
            config,
            remote_endpoint,
            #[cfg(unix)]
            fd,
            write_tx,
            write_state,
            reader: Arc::new(Mutex::new(read_half)),
            bytes_read: AtomicU64::new(0),
            registered: AtomicBool::new(false),
            reading: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    // --- outbound -----------------------------------------------------

    /// Write one framed message and wait until it is on the wire.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::ConnectionClosed`] if the connection is broken or
    /// closed; the transport error that broke it otherwise.
    pub async fn write_message(&self, message_type: i64, payload: &[u8]) -> ConnectionResult<()> {
        let frame = self.encode_frame(message_type, payload);
        self.enqueue_and_wait(frame, WriteKind::Sync).await
    }

    /// Enqueue one framed message; `handler` is invoked exactly once after
    /// the frame's bytes are fully written or the connection is determined
    /// to be broken.
    ///
    /// Completions fire in enqueue order regardless of batching. On a broken
    /// connection the handler fires immediately without any transport call.
    pub fn write_message_async<F>(&self, message_type: i64, payload: &[u8], handler: F)
    where
        F: FnOnce(ConnectionResult<()>) + Send + 'static,
    {
        let frame = self.encode_frame(message_type, payload);
        self.enqueue(frame, WriteKind::Async, Box::new(handler));
    }

    /// Write raw byte ranges to the transport, unframed, and wait for
    /// completion. Ordered with respect to framed writes.
    pub async fn write_buffers(&self, buffers: Vec<Bytes>) -> ConnectionResult<()> {
        self.enqueue_and_wait(buffers, WriteKind::Raw).await
    }

    fn encode_frame(&self, message_type: i64, payload: &[u8]) -> Vec<Bytes> {
        let header = FrameHeader::new(self.config.cookie, message_type, payload.len() as u64);
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        header.encode(&mut buf);
        // The caller's buffer may not outlive the queued write; own a copy.
        buf.extend_from_slice(payload);
        vec![buf.freeze()]
    }

    fn enqueue(&self, buffers: Vec<Bytes>, kind: WriteKind, completion: WriteCompletion) {
        if self.write_state.broken.load(Ordering::Acquire) {
            completion(Err(ConnectionError::ConnectionClosed));
            return;
        }
        self.write_state.pending_writes.fetch_add(1, Ordering::Relaxed);
        let entry = PendingWrite {
            buffers,
            kind,
            completion,
        };
        if let Err(rejected) = self.write_tx.send(entry) {
            // Flush task already shut down.
            self.write_state.pending_writes.fetch_sub(1, Ordering::Relaxed);
            (rejected.0.completion)(Err(ConnectionError::ConnectionClosed));
        }
    }

    async fn enqueue_and_wait(&self, buffers: Vec<Bytes>, kind: WriteKind) -> ConnectionResult<()> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            buffers,
            kind,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        rx.await.unwrap_or(Err(ConnectionError::ConnectionClosed))
    }

    // --- inbound ------------------------------------------------------

    /// Read one framed message of the expected type, blocking the caller.
    ///
    /// For simple request/response exchanges where no read loop is active on
    /// this connection.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::CookieMismatch`] or
    /// [`ConnectionError::TypeMismatch`] if the header is not the expected
    /// one; [`ConnectionError::ConnectionClosed`] on EOF.
    pub async fn read_message(&self, expected_type: i64) -> ConnectionResult<Bytes> {
        let mut reader = self.reader.lock().await;
        let header = self.read_header(&mut *reader).await?;
        if header.cookie != self.config.cookie {
            return Err(ConnectionError::cookie_mismatch(
                self.config.cookie,
                header.cookie,
                self.remote_endpoint.clone(),
            ));
        }
        if header.message_type != expected_type {
            return Err(ConnectionError::TypeMismatch {
                expected: expected_type,
                received: header.message_type,
            });
        }
        self.read_body(&mut *reader, &header).await
    }

    /// Fill each byte range in turn with raw bytes from the transport.
    pub async fn read_buffers(&self, buffers: &mut [&mut [u8]]) -> ConnectionResult<()> {
        let mut reader = self.reader.lock().await;
        for buf in buffers {
            reader
                .read_exact(buf)
                .await
                .map_err(|err| self.read_failed(err))?;
            self.bytes_read.fetch_add(buf.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    /// A transport failure observed on the read side breaks the connection
    /// just like one observed on the write side: pending and future writes
    /// must fail fast rather than touch the dead transport.
    fn read_failed(&self, err: std::io::Error) -> ConnectionError {
        self.write_state.broken.store(true, Ordering::Release);
        map_read_err(err)
    }

    async fn read_header(
        &self,
        reader: &mut ReadHalf<StreamSocket>,
    ) -> ConnectionResult<FrameHeader> {
        let mut header_buf = [0u8; HEADER_SIZE];
        reader
            .read_exact(&mut header_buf)
            .await
            .map_err(|err| self.read_failed(err))?;
        self.bytes_read
            .fetch_add(HEADER_SIZE as u64, Ordering::Relaxed);
        let header = FrameHeader::decode(&header_buf);
        header.check_length()?;
        Ok(header)
    }

    async fn read_body(
        &self,
        reader: &mut ReadHalf<StreamSocket>,
        header: &FrameHeader,
    ) -> ConnectionResult<Bytes> {
        let mut body = vec![0u8; header.length as usize];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|err| self.read_failed(err))?;
        self.bytes_read.fetch_add(header.length, Ordering::Relaxed);
        Ok(Bytes::from(body))
    }

    // --- registration and the read loop -------------------------------

    /// Announce this process's identity to the peer, once per connection.
    ///
    /// Must be called before [`Connection::process_messages`].
    ///
    /// # Errors
    ///
    /// [`ConnectionError::AlreadyRegistered`] on a second invocation; write
    /// errors otherwise.
    pub async fn register(
        &self,
        message_type: i64,
        registration: &Registration,
    ) -> ConnectionResult<()> {
        if self.registered.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyRegistered);
        }
        let payload = registration.to_bytes()?;
        self.write_message(message_type, &payload).await
    }

    /// Returns `true` once [`Connection::register`] has run.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Begin (or resume) the asynchronous read loop.
    ///
    /// Each cycle reads a header, validates the cookie, reads the body, and
    /// invokes `message_handler` with this connection, the type tag, and the
    /// payload. The loop runs until a transport error or protocol violation,
    /// then invokes `error_handler` exactly once and stops; the error
    /// handler decides whether to resume, close, or escalate.
    ///
    /// A frame with a mismatched cookie from an addressable remote is fatal
    /// (delivered to `error_handler` as an error for which
    /// [`ConnectionError::is_fatal`] is `true`; the hosting process is
    /// expected to terminate). From an unaddressable remote the frame is
    /// dropped with a warning and the loop continues.
    pub fn process_messages(
        self: &Arc<Self>,
        message_handler: MessageHandler,
        error_handler: ConnectionErrorHandler,
    ) {
        debug_assert!(
            self.is_registered(),
            "register() must be called before process_messages()"
        );
        if self.reading.swap(true, Ordering::SeqCst) {
            warn!(
                label = %self.config.debug_label,
                "process_messages() called while the read loop is active"
            );
            return;
        }
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.read_loop(message_handler, error_handler).await;
        });
    }

    async fn read_loop(
        self: Arc<Self>,
        message_handler: MessageHandler,
        error_handler: ConnectionErrorHandler,
    ) {
        let mut reader = Arc::clone(&self.reader).lock_owned().await;
        let terminal = loop {
            let header = match self.read_header(&mut reader).await {
                Ok(header) => header,
                Err(err) => break err,
            };
            if header.cookie != self.config.cookie {
                let err = ConnectionError::cookie_mismatch(
                    self.config.cookie,
                    header.cookie,
                    self.remote_endpoint.clone(),
                );
                if err.is_fatal() {
                    error!(
                        label = %self.config.debug_label,
                        remote = %self.remote_endpoint,
                        received = header.cookie,
                        "fatal cookie mismatch from addressable peer"
                    );
                    break err;
                }
                warn!(
                    label = %self.config.debug_label,
                    received = header.cookie,
                    "dropping frame with mismatched cookie from unaddressable peer"
                );
                // Consume the payload to stay aligned on the next header.
                match self.read_body(&mut reader, &header).await {
                    Ok(_) => continue,
                    Err(err) => break err,
                }
            }
            let payload = match self.read_body(&mut reader, &header).await {
                Ok(payload) => payload,
                Err(err) => break err,
            };
            message_handler(Arc::clone(&self), header.message_type, payload);
        };

        self.write_state.broken.store(true, Ordering::Release);
        self.reading.store(false, Ordering::SeqCst);
        error_handler(Arc::clone(&self), terminal);
    }

    // --- lifecycle and diagnostics ------------------------------------

    /// Eagerly shut down the transport.
    ///
    /// Idempotent. Pending operations are not cancelled; they complete
    /// through their normal paths with a failure outcome.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.write_state.broken.store(true, Ordering::Release);
        #[cfg(unix)]
        {
            use nix::sys::socket::{shutdown, Shutdown};
            // Shutdown rather than close: the split halves still own the
            // descriptor, and pending reads/writes must observe the failure.
            if let Err(err) = shutdown(self.fd, Shutdown::Both) {
                debug!(label = %self.config.debug_label, error = %err, "shutdown failed");
            }
        }
        debug!(label = %self.config.debug_label, "connection closed");
    }

    /// Returns `true` if the peer has closed its end, detected by a
    /// non-blocking peek that consumes no bytes.
    ///
    /// Safe to call while the read loop is outstanding. On platforms without
    /// a non-blocking peek this always returns `false`.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        self.peek_closed()
    }

    #[cfg(unix)]
    fn peek_closed(&self) -> bool {
        crate::socket::peek_disconnected(self.fd)
    }

    #[cfg(not(unix))]
    fn peek_closed(&self) -> bool {
        false
    }

    /// Returns `true` once the connection has hit a transport failure or
    /// been closed; writes fail fast from then on.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.write_state.broken.load(Ordering::Acquire)
    }

    /// Returns `true` after [`Connection::close`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Best-effort remote address, empty when the transport has no
    /// addressable remote (the common case for Unix sockets).
    #[must_use]
    pub fn remote_endpoint_info(&self) -> &str {
        &self.remote_endpoint
    }

    /// Label identifying this connection's peer kind in diagnostics.
    #[must_use]
    pub fn debug_label(&self) -> &str {
        &self.config.debug_label
    }

    /// Total payload and header bytes read from the transport.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Total bytes confirmed written to the transport.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.write_state.bytes_written.load(Ordering::Relaxed)
    }

    /// Messages successfully written through the synchronous API.
    #[must_use]
    pub fn sync_writes(&self) -> u64 {
        self.write_state.sync_writes.load(Ordering::Relaxed)
    }

    /// Messages successfully written through the asynchronous API.
    #[must_use]
    pub fn async_writes(&self) -> u64 {
        self.write_state.async_writes.load(Ordering::Relaxed)
    }

    /// Writes enqueued but not yet completed.
    #[must_use]
    pub fn pending_writes(&self) -> u64 {
        self.write_state.pending_writes.load(Ordering::Relaxed)
    }

    /// Human-readable snapshot of counters and identity for diagnostics.
    #[must_use]
    pub fn debug_string(&self) -> String {
        let remote = if self.remote_endpoint.is_empty() {
            "local"
        } else {
            self.remote_endpoint.as_str()
        };
        format!(
            "{} ({remote}): {} pending writes, {} sync writes, {} async writes, \
             {} bytes written, {} bytes read{}",
            self.config.debug_label,
            self.pending_writes(),
            self.sync_writes(),
            self.async_writes(),
            self.bytes_written(),
            self.bytes_read(),
            if self.is_broken() { ", broken" } else { "" },
        )
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.debug_string())
    }
}

/// Map read errors: EOF means the peer went away, everything else is I/O.
fn map_read_err(err: std::io::Error) -> ConnectionError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ConnectionError::ConnectionClosed
    } else {
        ConnectionError::Io(err)
    }
}

/// The flush task: drains the write queue in FIFO batches, one transport
/// write per batch, completions invoked in order.
async fn flush_loop(
    mut writer: WriteHalf<StreamSocket>,
    mut rx: mpsc::UnboundedReceiver<PendingWrite>,
    state: Arc<WriteState>,
    batch_max: usize,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < batch_max {
            match rx.try_recv() {
                Ok(entry) => batch.push(entry),
                Err(_) => break,
            }
        }

        if state.broken.load(Ordering::Acquire) {
            fail_batch(batch, &state, None);
            continue;
        }

        let total: usize = batch.iter().map(PendingWrite::len).sum();
        let mut buf = BytesMut::with_capacity(total);
        for entry in &batch {
            for bytes in &entry.buffers {
                buf.extend_from_slice(bytes);
            }
        }

        match writer.write_all(&buf).await {
            Ok(()) => {
                state.bytes_written.fetch_add(total as u64, Ordering::Relaxed);
                for entry in batch {
                    match entry.kind {
                        WriteKind::Sync => {
                            state.sync_writes.fetch_add(1, Ordering::Relaxed);
                        }
                        WriteKind::Async => {
                            state.async_writes.fetch_add(1, Ordering::Relaxed);
                        }
                        WriteKind::Raw => {}
                    }
                    state.pending_writes.fetch_sub(1, Ordering::Relaxed);
                    (entry.completion)(Ok(()));
                }
            }
            Err(err) => {
                // Conservative rule: a partially-written batch is a wholly
                // failed batch. Mark broken before completing so writes
                // enqueued by the completions fail fast.
                state.broken.store(true, Ordering::Release);
                warn!(error = %err, "flush failed; marking connection broken");
                fail_batch(batch, &state, Some(err));
            }
        }
    }
}

/// Fail every entry of a batch in order. The first entry receives the
/// transport error when one is available; the rest observe the broken
/// connection.
fn fail_batch(batch: Vec<PendingWrite>, state: &WriteState, err: Option<std::io::Error>) {
    let mut err = err;
    for entry in batch {
        state.pending_writes.fetch_sub(1, Ordering::Relaxed);
        let outcome = match err.take() {
            Some(io_err) => Err(ConnectionError::Io(io_err)),
            None => Err(ConnectionError::ConnectionClosed),
        };
        (entry.completion)(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builders() {
        let config = ConnectionConfig::default()
            .with_cookie(42)
            .with_write_batch_max(4)
            .with_debug_label("worker");
        assert_eq!(config.cookie, 42);
        assert_eq!(config.write_batch_max, 4);
        assert_eq!(config.debug_label, "worker");
    }

    #[tokio::test]
    async fn test_debug_string_reports_counters() {
        let (left, _right) = tokio::net::UnixStream::pair().unwrap();
        let conn = Connection::new(
            StreamSocket::Unix(left),
            ConnectionConfig::default().with_debug_label("worker"),
        );
        conn.write_message(7, b"payload").await.unwrap();

        let snapshot = conn.debug_string();
        assert!(snapshot.starts_with("worker (local):"), "{snapshot}");
        assert!(snapshot.contains("1 sync writes"), "{snapshot}");
        assert!(snapshot.contains("0 async writes"), "{snapshot}");
        assert_eq!(
            conn.bytes_written(),
            (HEADER_SIZE + b"payload".len()) as u64
        );
    }

    #[tokio::test]
    async fn test_register_twice_is_an_error() {
        let (left, _right) = tokio::net::UnixStream::pair().unwrap();
        let conn = Connection::new(StreamSocket::Unix(left), ConnectionConfig::default());
        let registration = Registration::new("gridflow-worker/0.1.0");

        conn.register(0, &registration).await.unwrap();
        assert!(conn.is_registered());
        assert!(matches!(
            conn.register(0, &registration).await,
            Err(ConnectionError::AlreadyRegistered)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_sticky() {
        let (left, _right) = tokio::net::UnixStream::pair().unwrap();
        let conn = Connection::new(StreamSocket::Unix(left), ConnectionConfig::default());

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(conn.is_broken());
        assert!(matches!(
            conn.write_message(1, b"late").await,
            Err(ConnectionError::ConnectionClosed)
        ));
    }
}
