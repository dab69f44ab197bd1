//! Client-side connection establishment.
//!
//! [`connect`] dials the URL (directly or through a custom [`Dialer`]),
//! wraps the transport in TLS for `wss`, performs the HTTP Upgrade under the
//! handshake timeout and returns the connection.
//! [`connect_with_stream`] performs only the upgrade, over a transport the
//! caller already owns (TCP, Unix socket, or anything else duplex).

use std::{io, str::FromStr, sync::Arc};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{
    header::{self, HeaderValue},
    Request, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{self, pki_types::ServerName},
    TlsConnector,
};
use url::Url;

use crate::{
    compression::DeflateExt,
    conn::{Conn, Role},
    handler::EventHandler,
    handshake::{accept_key, generate_key, header_contains, WS_VERSION},
    options::{ClientOptions, Config},
    stream::{BoxedStream, ByteStream, MaybeTlsStream},
    RejectedUpgrade, Result, WebSocketError,
};

/// Custom dial strategy, e.g. for SOCKS/HTTP proxies or pinned addresses.
///
/// The default dials TCP to the URL's host and port.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream>;
}

/// Establishes a WebSocket connection to `options.addr`.
///
/// Only `ws` and `wss` schemes are accepted. Dialing is bounded by the dial
/// timeout and the HTTP exchange by the handshake timeout. On success the
/// connection is returned ready to [`serve`](Conn::serve); on a rejected
/// upgrade the error carries the server's status and headers.
pub async fn connect(
    handler: Arc<dyn EventHandler>,
    options: ClientOptions,
) -> Result<Arc<Conn>> {
    let url = Url::parse(&options.addr)?;
    let scheme = url.scheme().to_string();
    if scheme != "ws" && scheme != "wss" {
        return Err(WebSocketError::UnsupportedProtocol(scheme));
    }

    let config = options.build_config();
    let host = url
        .host_str()
        .ok_or(WebSocketError::UrlParse(url::ParseError::EmptyHost))?
        .to_string();
    let port = url
        .port_or_known_default()
        .unwrap_or(if scheme == "wss" { 443 } else { 80 });

    let stream: BoxedStream = match &options.dialer {
        Some(dialer) => tokio::time::timeout(config.dial_timeout, dialer.dial(&host, port))
            .await
            .map_err(|_| WebSocketError::Timeout)??,
        None => {
            let tcp = tokio::time::timeout(
                config.dial_timeout,
                TcpStream::connect((host.as_str(), port)),
            )
            .await
            .map_err(|_| WebSocketError::Timeout)??;

            if scheme == "wss" {
                let connector = options.tls.clone().unwrap_or_else(default_tls_connector);
                let domain = ServerName::try_from(host.clone()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "invalid dns name")
                })?;
                let tls = connector.connect(domain, tcp).await?;
                Box::new(MaybeTlsStream::Tls(Box::new(tls)))
            } else {
                Box::new(MaybeTlsStream::Plain(tcp))
            }
        }
    };

    handshake(handler, options, config, url, stream).await
}

/// Performs the WebSocket handshake over an existing duplex connection.
///
/// `options.addr` still supplies the request target and `Host` header; no
/// dialing happens.
pub async fn connect_with_stream<S>(
    handler: Arc<dyn EventHandler>,
    options: ClientOptions,
    io: S,
) -> Result<Arc<Conn>>
where
    S: ByteStream + 'static,
{
    let url = Url::parse(&options.addr)?;
    let config = options.build_config();
    handshake(handler, options, config, url, Box::new(io)).await
}

async fn handshake(
    handler: Arc<dyn EventHandler>,
    options: ClientOptions,
    config: Arc<Config>,
    url: Url,
    io: BoxedStream,
) -> Result<Arc<Conn>> {
    let key = generate_key();

    let mut request = Request::builder()
        .method("GET")
        .uri(&url[url::Position::BeforePath..])
        .body(Empty::<Bytes>::new())
        .expect("bug: failed to build request");

    let headers = request.headers_mut();
    headers.extend(options.request_headers.clone());

    // A user-supplied Host header wins over the URL-derived one.
    if !headers.contains_key(header::HOST) {
        let host = url
            .host_str()
            .ok_or(WebSocketError::UrlParse(url::ParseError::EmptyHost))?;
        let host_header = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        headers.insert(
            header::HOST,
            HeaderValue::from_str(&host_header).map_err(|_| {
                WebSocketError::UrlParse(url::ParseError::InvalidDomainCharacter)
            })?,
        );
    }

    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(
        header::SEC_WEBSOCKET_KEY,
        HeaderValue::from_str(&key).expect("base64 key is a valid header value"),
    );
    headers.insert(
        header::SEC_WEBSOCKET_VERSION,
        HeaderValue::from_static(WS_VERSION),
    );

    if !options.protocols.is_empty() {
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(&options.protocols.join(", "))
                .map_err(|_| WebSocketError::SubprotocolNegotiation)?,
        );
    }

    if let Some(cfg) = &config.deflate {
        let offer = DeflateExt::offer(cfg).to_string();
        headers.insert(
            header::SEC_WEBSOCKET_EXTENSIONS,
            HeaderValue::from_str(&offer).expect("extension offer is a valid header value"),
        );
    }

    let exchange = async {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;

        tokio::spawn(async move {
            if let Err(_err) = conn.with_upgrades().await {
                #[cfg(feature = "logging")]
                log::error!("upgrading connection: {_err:?}");
            }
        });

        let response = sender.send_request(request).await?;
        Ok::<_, WebSocketError>(response)
    };

    let mut response = tokio::time::timeout(config.handshake_timeout, exchange)
        .await
        .map_err(|_| WebSocketError::Timeout)??;

    let (subprotocol, deflate) = verify(&response, &key, &options, &config)?;

    let upgraded = hyper::upgrade::on(&mut response).await?;
    let stream: BoxedStream = Box::new(TokioIo::new(upgraded));

    Ok(Conn::new(
        Role::Client,
        stream,
        config,
        handler,
        options.session(),
        subprotocol,
        deflate,
    ))
}

/// Validates the upgrade response and extracts the negotiated parameters.
fn verify<B>(
    response: &hyper::Response<B>,
    key: &str,
    options: &ClientOptions,
    config: &Config,
) -> Result<(Option<String>, Option<DeflateExt>)> {
    let reject = || {
        WebSocketError::Handshake(Box::new(RejectedUpgrade {
            status: response.status(),
            headers: response.headers().clone(),
        }))
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(reject());
    }

    let headers = response.headers();

    if !headers
        .get(header::UPGRADE)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(reject());
    }

    if !headers
        .get(header::CONNECTION)
        .and_then(|h| h.to_str().ok())
        .map(|h| header_contains(h, "upgrade"))
        .unwrap_or(false)
    {
        return Err(reject());
    }

    if headers
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .and_then(|h| h.to_str().ok())
        != Some(accept_key(key.as_bytes()).as_str())
    {
        return Err(reject());
    }

    let chosen = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|h| h.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    let subprotocol = if options.protocols.is_empty() {
        // An unsolicited choice is ignored rather than fatal.
        None
    } else {
        match chosen {
            Some(name) if options.protocols.iter().any(|p| p == &name) => Some(name),
            _ => return Err(WebSocketError::SubprotocolNegotiation),
        }
    };

    let deflate = match &config.deflate {
        Some(cfg) => headers
            .get(header::SEC_WEBSOCKET_EXTENSIONS)
            .and_then(|h| h.to_str().ok())
            .and_then(|value| DeflateExt::from_str(value).ok())
            .map(|answer| DeflateExt::accept(cfg, &answer)),
        None => None,
    };

    Ok((subprotocol, deflate))
}

/// TLS connector backed by the webpki root set.
///
/// Uses the process-default crypto provider, falling back to ring.
fn default_tls_connector() -> TlsConnector {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .expect("supported protocol versions")
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    config.alpn_protocols = vec!["http/1.1".into()];

    TlsConnector::from(Arc::new(config))
}
