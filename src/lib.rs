//! # evws
//!
//! An event-driven WebSocket protocol engine implementing
//! [RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455) for both client
//! and server endpoints over any reliable byte stream.
//!
//! Unlike stream/sink style WebSocket crates, `evws` hands every protocol
//! event to a user-supplied [`EventHandler`]: the engine owns the read loop,
//! reassembles fragmented messages, answers pings, enforces the protocol
//! invariants, and calls back into the handler with complete messages.
//!
//! ## Features
//!
//! - Client ([`client::connect`]) and server ([`server::Upgrader`]) HTTP
//!   Upgrade handshakes, including subprotocol negotiation
//! - `permessage-deflate` compression (RFC 7692) with context takeover,
//!   sliding-window control and pooled compressors
//! - Serialized writes with an asynchronous write queue
//!   ([`Conn::write_async`]) and optional bounded-parallel message dispatch
//! - Works over TCP, TLS, Unix sockets or any user supplied duplex stream
//!
//! ## Echo server handler
//!
//! ```no_run
//! use std::sync::Arc;
//! use evws::{Conn, EventHandler, Message};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl EventHandler for Echo {
//!     async fn on_message(&self, conn: &Arc<Conn>, msg: Message) {
//!         let _ = conn.write(msg.opcode(), msg.payload().to_vec().into()).await;
//!         msg.close();
//!     }
//! }
//! ```

pub mod client;
pub mod close;
mod codec;
mod compression;
pub mod conn;
mod frame;
pub mod handler;
mod handshake;
mod mask;
pub mod options;
mod pool;
mod queue;
pub mod server;
mod stream;

pub use close::CloseCode;
pub use compression::DeflateExt;
pub use conn::{Conn, Role};
pub use frame::OpCode;
pub use handler::{EventHandler, MemorySession, Message, SessionStorage};
pub use options::{ClientOptions, DeflateOptions, ServerOptions};
pub use queue::WriteCallback;
pub use server::{UpgradeFut, Upgrader};
pub use stream::{BoxedStream, ByteStream};

use thiserror::Error;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Compression level applied to outbound deflate streams.
///
/// Alias of `flate2::Compression`; the engine default is
/// [`CompressionLevel::fast`] (best speed).
pub type CompressionLevel = flate2::Compression;

/// The HTTP response sent to complete or reject a server-side upgrade.
pub type HttpResponse = hyper::Response<http_body_util::Empty<bytes::Bytes>>;

/// Captured pieces of an HTTP upgrade response that failed validation.
///
/// Returned inside [`WebSocketError::Handshake`] so callers can inspect the
/// status code and headers the server actually produced.
#[derive(Debug)]
pub struct RejectedUpgrade {
    /// HTTP status line of the rejected response.
    pub status: hyper::StatusCode,
    /// Response headers as received.
    pub headers: hyper::HeaderMap,
}

/// Represents errors that can occur during WebSocket operations.
///
/// The variants fall into a few broad groups:
///
/// - Handshake errors (upgrade rejected, bad URL scheme, missing headers)
/// - Framing and protocol violations, each mapped to a close code by
///   [`WebSocketError::close_code`]
/// - Data validation errors (payload too large, invalid UTF-8)
/// - Connection lifecycle errors (closed connection, deadline exceeded)
/// - I/O and HTTP transport errors
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The upgrade response did not satisfy RFC 6455: wrong status code,
    /// missing `Upgrade`/`Connection` headers, or a `Sec-WebSocket-Accept`
    /// mismatch. Carries the offending response for inspection.
    #[error("handshake rejected (status {})", .0.status)]
    Handshake(Box<RejectedUpgrade>),

    /// The server's `authorize` predicate refused the upgrade request.
    #[error("upgrade request not authorized")]
    Unauthorized,

    /// A client connection was attempted with a URL scheme other than
    /// `ws` or `wss`.
    #[error("unsupported url scheme: {0}")]
    UnsupportedProtocol(String),

    /// The client requested subprotocols but the server's choice was absent
    /// or not among the requested names.
    #[error("subprotocol negotiation failed")]
    SubprotocolNegotiation,

    /// An upgrade request arrived without the `Sec-WebSocket-Key` header.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// The `Sec-WebSocket-Version` header was not `13`.
    #[error("Sec-WebSocket-Version must be 13")]
    InvalidSecWebSocketVersion,

    /// A frame used an opcode outside the set defined by RFC 6455.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A reserved header bit was set without a negotiated extension that
    /// defines it.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A control frame arrived with the FIN bit clear. Control frames must
    /// not be fragmented.
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame declared a payload longer than 125 bytes.
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    /// The continuation rules were violated: a new data frame interrupted an
    /// unfinished message, or a continuation frame arrived with no message
    /// in progress.
    #[error("invalid continuation sequence")]
    InvalidFragment,

    /// The mask bit contradicted the sender's role: clients must mask every
    /// frame, servers must mask none.
    #[error("mask bit inconsistent with role")]
    MaskViolation,

    /// A close frame carried a one-byte payload or a status code outside the
    /// ranges RFC 6455 permits.
    #[error("invalid close frame")]
    InvalidCloseFrame,

    /// A message (or a single frame's declared length) exceeded the
    /// configured maximum payload size.
    #[error("message too large")]
    MessageTooLarge,

    /// A text message or close reason was not valid UTF-8.
    #[error("invalid utf-8")]
    InvalidUtf8,

    /// A compressed frame arrived on a connection that did not negotiate
    /// `permessage-deflate`.
    #[error("received compressed frame without negotiated compression")]
    CompressionNotSupported,

    /// The operation was attempted on a connection that is already closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// A read deadline or handshake/dial timeout elapsed.
    #[error("operation timed out")]
    Timeout,

    /// An error from the underlying transport.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An error raised by hyper during the HTTP upgrade.
    #[error(transparent)]
    Http(#[from] hyper::Error),

    /// The connection URL could not be parsed.
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),
}

impl WebSocketError {
    /// The close code the engine sends when this error terminates the read
    /// loop.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::MessageTooLarge => CloseCode::Size,
            Self::InvalidUtf8 => CloseCode::InvalidPayload,
            Self::InvalidOpCode(_)
            | Self::ReservedBitsNotZero
            | Self::ControlFrameFragmented
            | Self::ControlFrameTooLarge
            | Self::InvalidFragment
            | Self::MaskViolation
            | Self::InvalidCloseFrame
            | Self::CompressionNotSupported => CloseCode::Protocol,
            Self::Timeout | Self::Io(_) => CloseCode::Away,
            _ => CloseCode::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_violations_map_to_1002() {
        for err in [
            WebSocketError::InvalidOpCode(0x3),
            WebSocketError::ReservedBitsNotZero,
            WebSocketError::ControlFrameFragmented,
            WebSocketError::ControlFrameTooLarge,
            WebSocketError::InvalidFragment,
            WebSocketError::MaskViolation,
            WebSocketError::InvalidCloseFrame,
            WebSocketError::CompressionNotSupported,
        ] {
            assert_eq!(err.close_code(), CloseCode::Protocol);
        }
    }

    #[test]
    fn data_errors_map_to_specific_codes() {
        assert_eq!(WebSocketError::MessageTooLarge.close_code(), CloseCode::Size);
        assert_eq!(
            WebSocketError::InvalidUtf8.close_code(),
            CloseCode::InvalidPayload
        );
        assert_eq!(
            WebSocketError::ConnectionClosed.close_code(),
            CloseCode::Error
        );
    }
}
