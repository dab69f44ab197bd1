//! The event surface between the engine and application code.

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::{Bytes, BytesMut};

use crate::{close::CloseCode, conn::Conn, frame::OpCode, pool::BufferPool};

/// Callbacks a connection invokes as protocol events occur.
///
/// For one connection the engine guarantees:
///
/// - `on_open` runs exactly once, before any other callback
/// - `on_message`, `on_ping` and `on_pong` run any number of times
/// - `on_close` runs exactly once, after every `on_message` has finished
///
/// Callbacks receive the connection by reference; handlers that need to keep
/// it (e.g. to write from another task) clone the `Arc`. A panicking
/// `on_message` is caught by the engine, reported through the configured
/// recovery hook, and does not tear down the connection.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Called once after the handshake completes.
    async fn on_open(&self, _conn: &Arc<Conn>) {}

    /// Called once when the connection closes, with the close code and
    /// reason either received from the peer or derived from the error that
    /// ended the connection.
    async fn on_close(&self, _conn: &Arc<Conn>, _code: CloseCode, _reason: &[u8]) {}

    /// Called for every inbound ping. The default replies with a pong
    /// carrying the same payload, as RFC 6455 requires.
    async fn on_ping(&self, conn: &Arc<Conn>, payload: Bytes) {
        let _ = conn.write_pong(payload).await;
    }

    /// Called for every inbound pong.
    async fn on_pong(&self, _conn: &Arc<Conn>, _payload: Bytes) {}

    /// Called with each complete inbound data message.
    async fn on_message(&self, conn: &Arc<Conn>, msg: Message);
}

/// A complete inbound data message.
///
/// The payload buffer is borrowed from the engine's buffer pool. Call
/// [`Message::close`] when done to recycle it; a message that is simply
/// dropped releases its buffer to the allocator instead. Either way the
/// buffer is given up exactly once — `close` consumes the message, so
/// use-after-release does not compile.
pub struct Message {
    opcode: OpCode,
    data: BytesMut,
    pool: Arc<BufferPool>,
}

impl Message {
    pub(crate) fn new(opcode: OpCode, data: BytesMut, pool: Arc<BufferPool>) -> Self {
        Self { opcode, data, pool }
    }

    /// [`OpCode::Text`] or [`OpCode::Binary`].
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// The reassembled (and, if negotiated, decompressed) payload.
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Recycles the payload buffer into the engine's pool.
    pub fn close(self) {
        let Self { data, pool, .. } = self;
        pool.release(data);
    }

    /// Takes ownership of the payload, bypassing the pool.
    pub fn into_payload(self) -> BytesMut {
        self.data
    }
}

impl AsRef<[u8]> for Message {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("opcode", &self.opcode)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Key/value storage attached to a connection for application state.
///
/// The engine never reads or writes sessions itself; it only creates one per
/// connection via the configured factory and exposes it through
/// [`Conn::session`].
pub trait SessionStorage: Send + Sync {
    fn load(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>>;
    fn store(&self, key: &str, value: Arc<dyn Any + Send + Sync>);
    fn delete(&self, key: &str);
}

/// The default [`SessionStorage`]: a mutex-guarded in-memory map.
#[derive(Default)]
pub struct MemorySession {
    map: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemorySession {
    fn load(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn store(&self, key: &str, value: Arc<dyn Any + Send + Sync>) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_session() {
        let session = MemorySession::new();
        session.store("user", Arc::new(42u32));

        let value = session.load("user").expect("stored value");
        assert_eq!(*value.downcast_ref::<u32>().unwrap(), 42);

        session.delete("user");
        assert!(session.load("user").is_none());
        assert!(session.load("missing").is_none());
    }

    #[test]
    fn test_message_accessors() {
        let pool = Arc::new(BufferPool::new());
        let msg = Message::new(OpCode::Text, BytesMut::from("hello"), pool);

        assert_eq!(msg.opcode(), OpCode::Text);
        assert_eq!(msg.payload(), b"hello");
        assert_eq!(msg.as_text(), Some("hello"));
        assert_eq!(msg.len(), 5);
        assert!(!msg.is_empty());
    }

    #[test]
    fn test_message_close_recycles_buffer() {
        let pool = Arc::new(BufferPool::new());
        let buf = pool.acquire(256);
        let ptr = buf.as_ptr();

        Message::new(OpCode::Binary, buf, Arc::clone(&pool)).close();

        let reused = pool.acquire(256);
        assert_eq!(reused.as_ptr(), ptr);
    }

    #[test]
    fn test_binary_message_has_no_text() {
        let pool = Arc::new(BufferPool::new());
        let msg = Message::new(
            OpCode::Binary,
            BytesMut::from(&[0xFF, 0xFE, 0xFD][..]),
            pool,
        );
        assert!(msg.as_text().is_none());
    }
}
