//! Connection configuration for servers and clients.
//!
//! Options structs are plain records with every field public; zero or unset
//! values take the engine defaults when the options are turned into the
//! validated [`Config`] snapshot a connection carries.

use std::{any::Any, sync::Arc, time::Duration};

use hyper::{header, HeaderMap, Uri};

use crate::{
    client::Dialer,
    compression::DeflatePool,
    conn::Role,
    handler::{MemorySession, SessionStorage},
    pool::BufferPool,
    CompressionLevel,
};

/// Smallest negotiable LZ77 window exponent (256 byte window).
pub const MIN_WINDOW_BITS: u8 = 8;
/// Largest negotiable LZ77 window exponent (32 KiB window).
pub const MAX_WINDOW_BITS: u8 = 15;

const DEFAULT_READ_ASYNC_LIMIT: usize = 8;
const DEFAULT_READ_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;
const DEFAULT_WRITE_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;
const DEFAULT_COMPRESS_THRESHOLD: usize = 512;
const DEFAULT_COMPRESSOR_POOL_SIZE: usize = 32;
const DEFAULT_READ_BUFFER_SIZE: usize = 4 * 1024;
const DEFAULT_WRITE_BUFFER_SIZE: usize = 4 * 1024;
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Server-side predicate deciding whether an upgrade request may proceed.
pub type Authorize = Arc<dyn Fn(&Uri, &HeaderMap, &dyn SessionStorage) -> bool + Send + Sync>;

/// Factory producing the session storage attached to each new connection.
pub type SessionFactory = Arc<dyn Fn() -> Arc<dyn SessionStorage> + Send + Sync>;

/// Hook invoked with the panic payload when a message handler panics.
pub type Recovery = Arc<dyn Fn(Box<dyn Any + Send>) + Send + Sync>;

/// `permessage-deflate` settings.
///
/// Compression only applies to data messages at least `threshold` bytes
/// long. With context takeover left on (the default) each direction keeps
/// its deflate dictionary across messages and the connection owns dedicated
/// contexts; turning it off lets connections share pooled contexts instead.
#[derive(Clone)]
pub struct DeflateOptions {
    /// Whether to offer/accept the extension at all.
    pub enabled: bool,
    /// Deflate level for outbound messages.
    pub level: CompressionLevel,
    /// Minimum payload size that gets compressed. 0 means the default
    /// (512 bytes).
    pub threshold: usize,
    /// Number of pooled context pairs, rounded up to a power of two.
    /// 0 means the default (32 for servers; clients always use 1).
    pub pool_size: usize,
    /// Demand that the server resets its compression context per message.
    pub server_no_context_takeover: bool,
    /// Demand that the client resets its compression context per message.
    pub client_no_context_takeover: bool,
    /// Server sliding-window exponent; values outside 8..=15 snap to 15.
    pub server_max_window_bits: u8,
    /// Client sliding-window exponent; values outside 8..=15 snap to 15.
    pub client_max_window_bits: u8,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            level: CompressionLevel::fast(),
            threshold: 0,
            pool_size: 0,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: MAX_WINDOW_BITS,
            client_max_window_bits: MAX_WINDOW_BITS,
        }
    }
}

impl DeflateOptions {
    fn validate(&self, role: Role) -> DeflateConfig {
        let pool_size = match role {
            // Clients typically multiplex few connections.
            Role::Client => 1,
            Role::Server => {
                let configured = if self.pool_size == 0 {
                    DEFAULT_COMPRESSOR_POOL_SIZE
                } else {
                    self.pool_size
                };
                configured.next_power_of_two()
            }
        };

        DeflateConfig {
            level: self.level,
            threshold: if self.threshold == 0 {
                DEFAULT_COMPRESS_THRESHOLD
            } else {
                self.threshold
            },
            pool_size,
            server_no_context_takeover: self.server_no_context_takeover,
            client_no_context_takeover: self.client_no_context_takeover,
            server_max_window_bits: snap_window_bits(self.server_max_window_bits),
            client_max_window_bits: snap_window_bits(self.client_max_window_bits),
        }
    }
}

/// Validated deflate settings.
#[derive(Clone)]
pub(crate) struct DeflateConfig {
    pub level: CompressionLevel,
    pub threshold: usize,
    pub pool_size: usize,
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: u8,
    pub client_max_window_bits: u8,
}

fn snap_window_bits(bits: u8) -> u8 {
    if (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        bits
    } else {
        MAX_WINDOW_BITS
    }
}

/// Options for accepting server-side connections via [`crate::Upgrader`].
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Initial capacity of the transport read buffer. 0 means 4096.
    pub read_buffer_size: usize,
    /// Initial capacity of the transport write buffer. 0 means 4096.
    pub write_buffer_size: usize,
    /// Largest accepted inbound message. 0 means 16 MiB.
    pub read_max_payload_size: usize,
    /// Largest single outbound frame; longer messages are fragmented.
    /// 0 means 16 MiB.
    pub write_max_payload_size: usize,
    /// Bound on the whole HTTP upgrade exchange. Zero means 5 seconds.
    pub handshake_timeout: Duration,
    /// Dispatch `on_message` on parallel tasks instead of the read loop.
    pub read_async_enabled: bool,
    /// Maximum concurrent `on_message` invocations in async mode.
    /// 0 means 8.
    pub read_async_limit: usize,
    /// Validate that inbound text messages are UTF-8.
    pub check_utf8: bool,
    /// Subprotocols this server speaks, in preference order.
    pub subprotocols: Vec<String>,
    /// Extra headers added to the 101 response. Protected upgrade headers
    /// are stripped.
    pub response_headers: HeaderMap,
    /// Predicate run against each upgrade request. `None` allows everyone.
    pub authorize: Option<Authorize>,
    /// Session storage factory. `None` produces the in-memory map.
    pub new_session: Option<SessionFactory>,
    /// Panic recovery hook for message handlers. `None` logs and continues.
    pub recovery: Option<Recovery>,
    /// Compression settings.
    pub deflate: DeflateOptions,
}

impl ServerOptions {
    pub(crate) fn build_config(&self) -> Arc<Config> {
        Config::build(
            Role::Server,
            self.read_buffer_size,
            self.write_buffer_size,
            self.read_max_payload_size,
            self.write_max_payload_size,
            self.handshake_timeout,
            Duration::ZERO,
            self.read_async_enabled,
            self.read_async_limit,
            self.check_utf8,
            self.recovery.clone(),
            &self.deflate,
        )
    }

    /// Response headers with the protected upgrade set removed.
    pub(crate) fn sanitized_response_headers(&self) -> HeaderMap {
        let mut headers = self.response_headers.clone();
        for name in [
            header::UPGRADE,
            header::CONNECTION,
            header::SEC_WEBSOCKET_ACCEPT,
            header::SEC_WEBSOCKET_EXTENSIONS,
            header::SEC_WEBSOCKET_PROTOCOL,
        ] {
            headers.remove(name);
        }
        headers
    }
}

/// Options for establishing client connections via [`crate::client`].
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Server address, e.g. `wss://example.com/connect`.
    pub addr: String,
    /// Extra headers added to the upgrade request.
    pub request_headers: HeaderMap,
    /// Subprotocols to request, in preference order.
    pub protocols: Vec<String>,
    /// Initial capacity of the transport read buffer. 0 means 4096.
    pub read_buffer_size: usize,
    /// Initial capacity of the transport write buffer. 0 means 4096.
    pub write_buffer_size: usize,
    /// Largest accepted inbound message. 0 means 16 MiB.
    pub read_max_payload_size: usize,
    /// Largest single outbound frame. 0 means 16 MiB.
    pub write_max_payload_size: usize,
    /// Bound on the HTTP upgrade exchange. Zero means 5 seconds.
    pub handshake_timeout: Duration,
    /// Bound on establishing the TCP/TLS transport. Zero means 5 seconds.
    pub dial_timeout: Duration,
    /// Dispatch `on_message` on parallel tasks instead of the read loop.
    pub read_async_enabled: bool,
    /// Maximum concurrent `on_message` invocations in async mode.
    /// 0 means 8.
    pub read_async_limit: usize,
    /// Validate that inbound text messages are UTF-8.
    pub check_utf8: bool,
    /// TLS connector for `wss` URLs. `None` builds one from the webpki
    /// roots.
    pub tls: Option<tokio_rustls::TlsConnector>,
    /// Custom dial strategy (e.g. a proxy). `None` dials TCP directly.
    pub dialer: Option<Arc<dyn Dialer>>,
    /// Session storage factory. `None` produces the in-memory map.
    pub new_session: Option<SessionFactory>,
    /// Panic recovery hook for message handlers. `None` logs and continues.
    pub recovery: Option<Recovery>,
    /// Compression settings.
    pub deflate: DeflateOptions,
}

impl ClientOptions {
    /// Options pointed at `addr` with everything else defaulted.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    pub(crate) fn build_config(&self) -> Arc<Config> {
        Config::build(
            Role::Client,
            self.read_buffer_size,
            self.write_buffer_size,
            self.read_max_payload_size,
            self.write_max_payload_size,
            self.handshake_timeout,
            self.dial_timeout,
            self.read_async_enabled,
            self.read_async_limit,
            self.check_utf8,
            self.recovery.clone(),
            &self.deflate,
        )
    }

    pub(crate) fn session(&self) -> Arc<dyn SessionStorage> {
        match &self.new_session {
            Some(factory) => factory(),
            None => Arc::new(MemorySession::new()),
        }
    }
}

/// Validated configuration snapshot shared by a connection and its queues.
pub(crate) struct Config {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub read_max_payload_size: usize,
    pub write_max_payload_size: usize,
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
    pub read_async_enabled: bool,
    pub read_async_limit: usize,
    pub check_utf8: bool,
    pub recovery: Recovery,
    pub deflate: Option<DeflateConfig>,
    pub buffer_pool: Arc<BufferPool>,
    pub deflate_pool: Option<Arc<DeflatePool>>,
}

impl Config {
    #[allow(clippy::too_many_arguments)]
    fn build(
        role: Role,
        read_buffer_size: usize,
        write_buffer_size: usize,
        read_max_payload_size: usize,
        write_max_payload_size: usize,
        handshake_timeout: Duration,
        dial_timeout: Duration,
        read_async_enabled: bool,
        read_async_limit: usize,
        check_utf8: bool,
        recovery: Option<Recovery>,
        deflate: &DeflateOptions,
    ) -> Arc<Self> {
        let deflate = deflate.enabled.then(|| deflate.validate(role));
        let deflate_pool = deflate
            .as_ref()
            .map(|cfg| Arc::new(DeflatePool::new(cfg, role)));

        Arc::new(Self {
            read_buffer_size: default_if_zero(read_buffer_size, DEFAULT_READ_BUFFER_SIZE),
            write_buffer_size: default_if_zero(write_buffer_size, DEFAULT_WRITE_BUFFER_SIZE),
            read_max_payload_size: default_if_zero(
                read_max_payload_size,
                DEFAULT_READ_MAX_PAYLOAD_SIZE,
            ),
            write_max_payload_size: default_if_zero(
                write_max_payload_size,
                DEFAULT_WRITE_MAX_PAYLOAD_SIZE,
            ),
            handshake_timeout: default_if_zero_duration(handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT),
            dial_timeout: default_if_zero_duration(dial_timeout, DEFAULT_DIAL_TIMEOUT),
            read_async_enabled,
            read_async_limit: default_if_zero(read_async_limit, DEFAULT_READ_ASYNC_LIMIT),
            check_utf8,
            recovery: recovery.unwrap_or_else(default_recovery),
            deflate,
            buffer_pool: Arc::new(BufferPool::new()),
            deflate_pool,
        })
    }
}

fn default_if_zero(value: usize, default: usize) -> usize {
    if value == 0 {
        default
    } else {
        value
    }
}

fn default_if_zero_duration(value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        default
    } else {
        value
    }
}

fn default_recovery() -> Recovery {
    Arc::new(|payload| {
        #[cfg(feature = "logging")]
        {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".to_string());
            log::error!("recovered from message handler panic: {msg}");
        }
        #[cfg(not(feature = "logging"))]
        let _ = payload;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_fields_take_defaults() {
        let config = ServerOptions::default().build_config();
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.write_buffer_size, 4096);
        assert_eq!(config.read_max_payload_size, 16 * 1024 * 1024);
        assert_eq!(config.write_max_payload_size, 16 * 1024 * 1024);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.read_async_limit, 8);
        assert!(!config.read_async_enabled);
        assert!(!config.check_utf8);
        assert!(config.deflate.is_none());
        assert!(config.deflate_pool.is_none());
    }

    #[test]
    fn test_explicit_fields_survive() {
        let options = ServerOptions {
            read_max_payload_size: 1024,
            read_async_limit: 3,
            ..Default::default()
        };
        let config = options.build_config();
        assert_eq!(config.read_max_payload_size, 1024);
        assert_eq!(config.read_async_limit, 3);
    }

    #[test]
    fn test_window_bits_snap_to_fifteen() {
        for bits in [0u8, 7, 16, 255] {
            let options = DeflateOptions {
                enabled: true,
                server_max_window_bits: bits,
                client_max_window_bits: bits,
                ..Default::default()
            };
            let cfg = options.validate(Role::Server);
            assert_eq!(cfg.server_max_window_bits, 15);
            assert_eq!(cfg.client_max_window_bits, 15);
        }

        let options = DeflateOptions {
            enabled: true,
            server_max_window_bits: 9,
            ..Default::default()
        };
        assert_eq!(options.validate(Role::Server).server_max_window_bits, 9);
    }

    #[test]
    fn test_pool_size_rounding() {
        let options = DeflateOptions {
            enabled: true,
            pool_size: 20,
            ..Default::default()
        };
        assert_eq!(options.validate(Role::Server).pool_size, 32);
        assert_eq!(options.validate(Role::Client).pool_size, 1);

        let options = DeflateOptions {
            enabled: true,
            ..Default::default()
        };
        assert_eq!(options.validate(Role::Server).pool_size, 32);
    }

    #[test]
    fn test_deflate_threshold_default() {
        let options = DeflateOptions {
            enabled: true,
            ..Default::default()
        };
        assert_eq!(options.validate(Role::Server).threshold, 512);
    }

    #[test]
    fn test_protected_response_headers_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("x-app", "1".parse().unwrap());
        headers.insert(header::UPGRADE, "h2c".parse().unwrap());
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, "forged".parse().unwrap());
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, "forged".parse().unwrap());

        let options = ServerOptions {
            response_headers: headers,
            ..Default::default()
        };
        let sanitized = options.sanitized_response_headers();
        assert!(sanitized.contains_key("x-app"));
        assert!(!sanitized.contains_key(header::UPGRADE));
        assert!(!sanitized.contains_key(header::SEC_WEBSOCKET_ACCEPT));
        assert!(!sanitized.contains_key(header::SEC_WEBSOCKET_PROTOCOL));
    }
}
