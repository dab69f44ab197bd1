//! The connection: read loop, serialized writer, close lifecycle.
//!
//! Per connection there is exactly one reader task (driven by
//! [`Conn::serve`]) and one writer critical section (the writer mutex).
//! Handler callbacks run on the reader task by default, or on spawned tasks
//! bounded by the dispatch queue when async reads are enabled.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, PoisonError, Weak,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::{
    stream::{SplitSink, SplitStream},
    FutureExt, SinkExt, StreamExt,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;

use crate::{
    close::CloseCode,
    codec::Codec,
    compression::{Compressor, Decompressor, DeflateExt, DeflatePool},
    frame::{Frame, OpCode},
    handler::{EventHandler, Message, SessionStorage},
    options::Config,
    queue::{DispatchQueue, WriteCallback, WriteJob, WriterQueue},
    stream::BoxedStream,
    Result, WebSocketError,
};

/// Bound on the final close-frame write so teardown cannot hang on a dead
/// peer.
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// A close reason must fit a control frame alongside the 2-byte code.
const MAX_CLOSE_REASON: usize = 123;

/// Which end of the connection this endpoint is.
///
/// The role decides the masking contract: clients mask every outbound frame,
/// servers none.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

type WsSink = SplitSink<Framed<BoxedStream, Codec>, Frame>;
type WsSource = SplitStream<Framed<BoxedStream, Codec>>;

/// State owned by the writer critical section.
struct Writer {
    sink: WsSink,
    deflate: Option<WriteDeflate>,
    threshold: usize,
}

/// Write-side compression context: dedicated when this side keeps its
/// dictionary across messages, pooled when it resets per message.
enum WriteDeflate {
    Owned(Compressor),
    Pooled(Arc<DeflatePool>),
}

impl WriteDeflate {
    fn compress(&mut self, input: &[u8]) -> io::Result<BytesMut> {
        match self {
            Self::Owned(compressor) => compressor.compress(input),
            Self::Pooled(pool) => pool.compress(input),
        }
    }
}

/// State owned by the read loop.
struct Reader {
    source: WsSource,
    inflate: Option<ReadDeflate>,
    continuation: Option<Continuation>,
}

enum ReadDeflate {
    Owned(Decompressor),
    Pooled(Arc<DeflatePool>),
}

impl ReadDeflate {
    fn decompress(&mut self, input: &[u8]) -> io::Result<BytesMut> {
        match self {
            Self::Owned(decompressor) => decompressor.decompress(input),
            Self::Pooled(pool) => pool.decompress(input),
        }
    }
}

/// An in-progress fragmented message.
///
/// Present only after a data opcode arrived with FIN clear; reset by the
/// finishing continuation frame or any protocol error.
struct Continuation {
    opcode: OpCode,
    compressed: bool,
    buffer: BytesMut,
}

/// A WebSocket connection, client or server side.
///
/// Created by [`crate::client::connect`] or a [`crate::server::Upgrader`]
/// after a successful handshake. The connection does nothing until
/// [`Conn::serve`] is spawned; from then on the engine reads frames,
/// enforces the protocol and invokes the [`EventHandler`].
///
/// All write methods are safe to call from any task; writes are serialized
/// internally so the frames of one message are never interleaved with
/// another.
pub struct Conn {
    role: Role,
    config: Arc<Config>,
    handler: Arc<dyn EventHandler>,
    session: Arc<dyn SessionStorage>,
    subprotocol: Option<String>,
    closed: AtomicBool,
    writer: Mutex<Writer>,
    reader: StdMutex<Option<Reader>>,
    write_queue: WriterQueue,
    write_jobs: StdMutex<Option<mpsc::UnboundedReceiver<WriteJob>>>,
    dispatch: DispatchQueue,
    read_deadline: StdMutex<Option<Duration>>,
    this: Weak<Conn>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("role", &self.role)
            .field("subprotocol", &self.subprotocol)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Conn {
    pub(crate) fn new(
        role: Role,
        stream: BoxedStream,
        config: Arc<Config>,
        handler: Arc<dyn EventHandler>,
        session: Arc<dyn SessionStorage>,
        subprotocol: Option<String>,
        deflate: Option<DeflateExt>,
    ) -> Arc<Self> {
        let codec = Codec::new(role, config.read_max_payload_size, deflate.is_some());
        let mut framed = Framed::with_capacity(stream, codec, config.read_buffer_size);
        framed.write_buffer_mut().reserve(config.write_buffer_size);
        let (sink, source) = framed.split();

        let (write_deflate, read_deflate, threshold) = match (&deflate, &config.deflate) {
            (Some(ext), Some(cfg)) => {
                let write_bits = match role {
                    Role::Server => ext.server_bits(),
                    Role::Client => ext.client_bits(),
                };
                let pool_bits = match role {
                    Role::Server => cfg.server_max_window_bits,
                    Role::Client => cfg.client_max_window_bits,
                };
                let write = if ext.write_no_takeover(role) {
                    // Pooled contexts carry the configured window; if the
                    // peer negotiated this connection down to a smaller one,
                    // the pool would emit a wider window than advertised.
                    if write_bits == pool_bits {
                        config.deflate_pool.clone().map(WriteDeflate::Pooled)
                    } else {
                        Some(WriteDeflate::Owned(Compressor::with_window_bits(
                            cfg.level, write_bits, true,
                        )))
                    }
                } else {
                    Some(WriteDeflate::Owned(Compressor::with_window_bits(
                        cfg.level, write_bits, false,
                    )))
                };
                let read = if ext.read_no_takeover(role) {
                    config.deflate_pool.clone().map(ReadDeflate::Pooled)
                } else {
                    let bits = match role {
                        Role::Server => ext.client_bits(),
                        Role::Client => ext.server_bits(),
                    };
                    Some(ReadDeflate::Owned(Decompressor::with_window_bits(bits, false)))
                };
                (write, read, cfg.threshold)
            }
            _ => (None, None, 0),
        };

        #[cfg(feature = "logging")]
        log::debug!(
            "established {role} connection (compression: {})",
            deflate.is_some()
        );

        let (write_queue, jobs) = WriterQueue::new();
        let dispatch = DispatchQueue::new(config.read_async_limit);

        Arc::new_cyclic(|this| Self {
            role,
            handler,
            session,
            subprotocol,
            closed: AtomicBool::new(false),
            writer: Mutex::new(Writer {
                sink,
                deflate: write_deflate,
                threshold,
            }),
            reader: StdMutex::new(Some(Reader {
                source,
                inflate: read_deflate,
                continuation: None,
            })),
            write_queue,
            write_jobs: StdMutex::new(Some(jobs)),
            dispatch,
            read_deadline: StdMutex::new(None),
            config,
            this: this.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.this.upgrade().expect("connection is referenced")
    }

    /// Which side of the connection this is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The subprotocol agreed on during the handshake, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Per-connection session storage.
    pub fn session(&self) -> &Arc<dyn SessionStorage> {
        &self.session
    }

    /// Whether the connection has (begun to) close.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Bounds every subsequent frame read. `None` removes the bound.
    ///
    /// When the deadline elapses the connection closes with code 1001.
    pub fn set_read_deadline(&self, deadline: Option<Duration>) {
        *self
            .read_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    /// Runs the connection: invokes `on_open`, reads frames until the
    /// connection closes, and guarantees a single `on_close`.
    ///
    /// Returns `Ok(())` after a clean close (either side's) and the
    /// terminating error otherwise. Spawn this; everything else on the
    /// connection assumes it is running.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        self.spawn_write_worker();

        let mut reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(WebSocketError::ConnectionClosed)?;

        self.handler.on_open(&self).await;

        match self.read_loop(&mut reader).await {
            Ok(()) => Ok(()),
            Err(err) => {
                #[cfg(feature = "logging")]
                log::debug!("{} read loop terminated: {err}", self.role);

                let reason = err.to_string();
                let first = self
                    .shutdown(err.close_code(), reason.as_bytes(), true, true)
                    .await;
                // Someone else already closed the connection; the error is
                // just the read loop observing that teardown.
                if first {
                    Err(err)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Drains the write queue on its own task, serialized by construction.
    fn spawn_write_worker(&self) {
        let Some(mut jobs) = self
            .write_jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let this = self.this.clone();
        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                match this.upgrade() {
                    Some(conn) => {
                        let WriteJob {
                            opcode,
                            payload,
                            callback,
                        } = job;
                        let result = conn.write(opcode, payload).await;
                        if let Some(callback) = callback {
                            callback(result);
                        }
                    }
                    None => job.complete(Err(WebSocketError::ConnectionClosed)),
                }
            }
        });
    }

    async fn read_loop(&self, reader: &mut Reader) -> Result<()> {
        let this = self.arc();
        loop {
            if self.is_closed() {
                return Ok(());
            }

            let deadline = *self
                .read_deadline
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let next = match deadline {
                Some(limit) => tokio::time::timeout(limit, reader.source.next())
                    .await
                    .map_err(|_| WebSocketError::Timeout)?,
                None => reader.source.next().await,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Err(err),
                None => {
                    if self.is_closed() {
                        return Ok(());
                    }
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
            };

            match frame.opcode {
                OpCode::Ping => {
                    self.handler.on_ping(&this, frame.payload.freeze()).await;
                }
                OpCode::Pong => {
                    self.handler.on_pong(&this, frame.payload.freeze()).await;
                }
                OpCode::Close => {
                    let (code, reason) = decode_close(&frame.payload)?;
                    // A partially assembled message is dropped.
                    reader.continuation = None;
                    self.shutdown(code, &reason, true, true).await;
                    return Ok(());
                }
                OpCode::Text | OpCode::Binary => {
                    if reader.continuation.is_some() {
                        return Err(WebSocketError::InvalidFragment);
                    }

                    if frame.fin {
                        let payload = if frame.compressed {
                            inflate(reader, &frame.payload, self.config.read_max_payload_size)?
                        } else {
                            frame.payload
                        };
                        self.deliver(frame.opcode, payload).await?;
                    } else {
                        let mut buffer = self.config.buffer_pool.acquire(frame.payload.len());
                        buffer.extend_from_slice(&frame.payload);
                        reader.continuation = Some(Continuation {
                            opcode: frame.opcode,
                            compressed: frame.compressed,
                            buffer,
                        });
                    }
                }
                OpCode::Continuation => {
                    {
                        let continuation = reader
                            .continuation
                            .as_mut()
                            .ok_or(WebSocketError::InvalidFragment)?;
                        continuation.buffer.extend_from_slice(&frame.payload);
                        if continuation.buffer.len() > self.config.read_max_payload_size {
                            return Err(WebSocketError::MessageTooLarge);
                        }
                    }

                    if frame.fin {
                        let continuation = reader
                            .continuation
                            .take()
                            .ok_or(WebSocketError::InvalidFragment)?;
                        let payload = if continuation.compressed {
                            let inflated = inflate(
                                reader,
                                &continuation.buffer,
                                self.config.read_max_payload_size,
                            )?;
                            self.config.buffer_pool.release(continuation.buffer);
                            inflated
                        } else {
                            continuation.buffer
                        };
                        self.deliver(continuation.opcode, payload).await?;
                    }
                }
            }
        }
    }

    /// Hands a complete message to the handler, inline or on a bounded
    /// parallel task.
    async fn deliver(&self, opcode: OpCode, payload: BytesMut) -> Result<()> {
        if opcode == OpCode::Text && self.config.check_utf8 && !valid_utf8(&payload) {
            return Err(WebSocketError::InvalidUtf8);
        }

        let msg = Message::new(opcode, payload, Arc::clone(&self.config.buffer_pool));

        if self.config.read_async_enabled {
            // Blocks before the next frame is pulled once the limit is
            // saturated, which is the backpressure contract.
            let permit = self.dispatch.admit().await?;
            let conn = self.arc();
            tokio::spawn(async move {
                conn.invoke_handler(msg).await;
                drop(permit);
            });
        } else {
            self.invoke_handler(msg).await;
        }

        Ok(())
    }

    /// The recovery shim: a panicking handler is reported and swallowed so
    /// the read loop stays alive.
    async fn invoke_handler(&self, msg: Message) {
        let conn = self.arc();
        let callback = std::panic::AssertUnwindSafe(self.handler.on_message(&conn, msg));
        if let Err(payload) = callback.catch_unwind().await {
            (self.config.recovery)(payload);
        }
    }

    /// Sends one message, compressing and fragmenting as configured.
    ///
    /// Data payloads at or above the deflate threshold are compressed when
    /// the extension was negotiated; payloads longer than the write max are
    /// split across continuation frames. The writer mutex is held for the
    /// whole message, so concurrent writers cannot interleave frames.
    pub async fn write(&self, opcode: OpCode, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(WebSocketError::ConnectionClosed);
        }
        if opcode == OpCode::Close {
            let (code, reason) = decode_close(&payload)?;
            return self.close(code, &reason).await;
        }
        if opcode == OpCode::Continuation {
            return Err(WebSocketError::InvalidFragment);
        }

        let result = self.write_inner(opcode, payload).await;
        if let Err(err) = &result {
            if matches!(err, WebSocketError::Io(_)) {
                // A failed transport write is unrecoverable; latch the
                // close state and report it.
                let reason = err.to_string();
                self.shutdown(err.close_code(), reason.as_bytes(), false, false)
                    .await;
            }
        }
        result
    }

    async fn write_inner(&self, opcode: OpCode, payload: Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;

        if opcode.is_control() {
            if payload.len() > 125 {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
            let mut frame = Frame::new(true, opcode, &payload[..]);
            if self.role == Role::Client {
                frame.mask();
            }
            return writer.sink.send(frame).await;
        }

        let threshold = writer.threshold;
        let mut compressed = false;
        let mut data = match writer.deflate.as_mut() {
            Some(deflate) if payload.len() >= threshold => {
                compressed = true;
                deflate.compress(&payload)?
            }
            _ => BytesMut::from(&payload[..]),
        };

        let max = self.config.write_max_payload_size.max(1);
        let mut first = true;
        loop {
            let take = data.len().min(max);
            let chunk = data.split_to(take);
            let fin = data.is_empty();

            let frame_opcode = if first { opcode } else { OpCode::Continuation };
            let mut frame = if first && compressed {
                Frame::compress(fin, frame_opcode, chunk)
            } else {
                Frame::new(fin, frame_opcode, chunk)
            };
            if self.role == Role::Client {
                frame.mask();
            }

            writer.sink.feed(frame).await?;
            first = false;
            if fin {
                break;
            }
        }

        writer.sink.flush().await
    }

    /// Sends a text message.
    pub async fn write_text(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.write(OpCode::Text, payload.into()).await
    }

    /// Sends a binary message.
    pub async fn write_binary(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.write(OpCode::Binary, payload.into()).await
    }

    /// Sends a ping control frame (payload at most 125 bytes).
    pub async fn write_ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.write(OpCode::Ping, payload.into()).await
    }

    /// Sends a pong control frame (payload at most 125 bytes).
    pub async fn write_pong(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.write(OpCode::Pong, payload.into()).await
    }

    /// Enqueues a write on the connection's FIFO writer queue and returns
    /// immediately.
    ///
    /// Jobs run strictly in submission order with no concurrency; the
    /// callback observes the write result. Jobs still queued when the
    /// connection closes complete with [`WebSocketError::ConnectionClosed`].
    pub fn write_async(&self, opcode: OpCode, payload: Bytes, callback: Option<WriteCallback>) {
        if self.is_closed() {
            if let Some(callback) = callback {
                callback(Err(WebSocketError::ConnectionClosed));
            }
            return;
        }
        self.write_queue.submit(WriteJob {
            opcode,
            payload,
            callback,
        });
    }

    /// Closes the connection: emits a close frame with `code` and `reason`
    /// (truncated to 123 bytes), then invokes `on_close` exactly once.
    ///
    /// Calling `close` again, from any task, is a no-op.
    pub async fn close(&self, code: CloseCode, reason: &[u8]) -> Result<()> {
        self.shutdown(code, reason, true, false).await;
        Ok(())
    }

    /// The single 0->1 close transition. Returns whether this call won it.
    async fn shutdown(&self, code: CloseCode, reason: &[u8], send_frame: bool, drain: bool) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        #[cfg(feature = "logging")]
        log::debug!("{} closing with code {}", self.role, u16::from(code));

        if send_frame {
            let sending = async {
                let mut writer = self.writer.lock().await;
                let mut frame = Frame::new(true, OpCode::Close, close_payload(code, reason));
                if self.role == Role::Client {
                    frame.mask();
                }
                let _ = writer.sink.send(frame).await;
                let _ = writer.sink.close().await;
            };
            // Best effort: a stuck transport must not block teardown.
            let _ = tokio::time::timeout(CLOSE_WRITE_TIMEOUT, sending).await;
        }

        if drain && self.config.read_async_enabled {
            // on_close happens after every in-flight on_message.
            self.dispatch.drain().await;
        }

        let conn = self.arc();
        self.handler.on_close(&conn, code, reason).await;
        true
    }
}

/// Inflates a reassembled compressed payload, enforcing the message cap on
/// the decompressed size as well.
fn inflate(reader: &mut Reader, input: &[u8], max: usize) -> Result<BytesMut> {
    let deflate = reader
        .inflate
        .as_mut()
        .ok_or(WebSocketError::CompressionNotSupported)?;
    let output = deflate.decompress(input)?;
    if output.len() > max {
        return Err(WebSocketError::MessageTooLarge);
    }
    Ok(output)
}

fn valid_utf8(data: &[u8]) -> bool {
    #[cfg(feature = "simd")]
    {
        simdutf8::basic::from_utf8(data).is_ok()
    }
    #[cfg(not(feature = "simd"))]
    {
        std::str::from_utf8(data).is_ok()
    }
}

/// Decodes a close frame payload into its code and reason.
fn decode_close(payload: &[u8]) -> Result<(CloseCode, Bytes)> {
    match payload.len() {
        0 => Ok((CloseCode::Normal, Bytes::new())),
        1 => Err(WebSocketError::InvalidCloseFrame),
        _ => {
            let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
            if !code.is_allowed() {
                return Err(WebSocketError::InvalidCloseFrame);
            }
            let reason = &payload[2..];
            if std::str::from_utf8(reason).is_err() {
                return Err(WebSocketError::InvalidUtf8);
            }
            Ok((code, Bytes::copy_from_slice(reason)))
        }
    }
}

fn close_payload(code: CloseCode, reason: &[u8]) -> BytesMut {
    let reason = &reason[..reason.len().min(MAX_CLOSE_REASON)];
    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.extend_from_slice(&u16::from(code).to_be_bytes());
    payload.extend_from_slice(reason);
    payload
}
