//! Server-side HTTP Upgrade.
//!
//! An [`Upgrader`] is built once per listener from [`ServerOptions`] and
//! turns individual hyper requests into WebSocket connections. The returned
//! response must be sent to the client before the [`UpgradeFut`] is awaited;
//! once hyper completes the protocol switch, the future resolves to a
//! [`Conn`] ready to [`serve`](Conn::serve). Any bytes the client pipelined
//! past the HTTP request travel inside the upgraded transport, so nothing is
//! lost in the transition.

use std::{
    future::Future,
    pin::Pin,
    str::FromStr,
    sync::Arc,
    task::{Context, Poll},
};

use http_body_util::Empty;
use hyper::{header, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;

use crate::{
    compression::DeflateExt,
    conn::{Conn, Role},
    handler::{EventHandler, MemorySession, SessionStorage},
    handshake::{accept_key, select_subprotocol, split_header_list, WS_VERSION},
    options::{Authorize, Config, ServerOptions, SessionFactory},
    HttpResponse, Result, WebSocketError,
};

/// Accepts WebSocket upgrades on behalf of an HTTP server.
pub struct Upgrader {
    handler: Arc<dyn EventHandler>,
    config: Arc<Config>,
    subprotocols: Vec<String>,
    response_headers: hyper::HeaderMap,
    authorize: Authorize,
    new_session: SessionFactory,
}

impl Upgrader {
    /// Builds an upgrader that hands every accepted connection to `handler`.
    pub fn new(handler: Arc<dyn EventHandler>, options: ServerOptions) -> Self {
        let config = options.build_config();
        let response_headers = options.sanitized_response_headers();

        Self {
            handler,
            config,
            subprotocols: options.subprotocols.clone(),
            response_headers,
            authorize: options
                .authorize
                .clone()
                .unwrap_or_else(|| Arc::new(|_, _, _| true)),
            new_session: options
                .new_session
                .clone()
                .unwrap_or_else(|| Arc::new(|| Arc::new(MemorySession::new()))),
        }
    }

    /// Validates an upgrade request and prepares the protocol switch.
    ///
    /// Runs the `authorize` predicate, checks `Sec-WebSocket-Key` and
    /// version 13, selects a subprotocol by client preference order,
    /// negotiates `permessage-deflate`, and builds the 101 response
    /// (user-supplied extras included, protected headers already stripped).
    ///
    /// Returns the response to send plus the future resolving to the
    /// connection once hyper switches protocols.
    pub fn upgrade<B>(&self, request: &mut Request<B>) -> Result<(HttpResponse, UpgradeFut)> {
        let session = (self.new_session)();

        if !(self.authorize)(request.uri(), request.headers(), session.as_ref()) {
            return Err(WebSocketError::Unauthorized);
        }

        let key = request
            .headers()
            .get(header::SEC_WEBSOCKET_KEY)
            .ok_or(WebSocketError::MissingSecWebSocketKey)?;

        if request
            .headers()
            .get(header::SEC_WEBSOCKET_VERSION)
            .map(|v| v.as_bytes())
            != Some(WS_VERSION.as_bytes())
        {
            return Err(WebSocketError::InvalidSecWebSocketVersion);
        }

        let subprotocol = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|h| h.to_str().ok())
            .and_then(|value| select_subprotocol(&split_header_list(value), &self.subprotocols));

        let offer = request
            .headers()
            .get(header::SEC_WEBSOCKET_EXTENSIONS)
            .and_then(|h| h.to_str().ok())
            .and_then(|value| DeflateExt::from_str(value).ok());

        let deflate = match (&self.config.deflate, offer) {
            (Some(cfg), Some(offer)) => Some(DeflateExt::negotiate(cfg, &offer)),
            _ => None,
        };

        let mut builder = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_ACCEPT, accept_key(key.as_bytes()));

        if let Some(deflate) = &deflate {
            builder = builder.header(header::SEC_WEBSOCKET_EXTENSIONS, deflate.to_string());
        }
        if let Some(name) = &subprotocol {
            builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, name.as_str());
        }

        let mut response = builder
            .body(Empty::new())
            .expect("bug: failed to build response");
        response.headers_mut().extend(self.response_headers.clone());

        let fut = UpgradeFut {
            inner: hyper::upgrade::on(request),
            pending: Some(Pending {
                handler: Arc::clone(&self.handler),
                config: Arc::clone(&self.config),
                session,
                subprotocol,
                deflate,
            }),
        };

        Ok((response, fut))
    }
}

/// Everything the connection needs besides the upgraded transport.
struct Pending {
    handler: Arc<dyn EventHandler>,
    config: Arc<Config>,
    session: Arc<dyn SessionStorage>,
    subprotocol: Option<String>,
    deflate: Option<DeflateExt>,
}

/// Resolves to the server-side [`Conn`] once the HTTP response has been
/// sent and hyper has switched protocols.
///
/// The associated 101 response must go out before this future can complete.
pub struct UpgradeFut {
    inner: hyper::upgrade::OnUpgrade,
    pending: Option<Pending>,
}

impl Future for UpgradeFut {
    type Output = Result<Arc<Conn>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let upgraded = match Pin::new(&mut this.inner).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(upgraded)) => upgraded,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(err.into())),
        };

        let pending = this.pending.take().expect("polled after completion");
        let io = TokioIo::new(upgraded);

        Poll::Ready(Ok(Conn::new(
            Role::Server,
            Box::new(io),
            pending.config,
            pending.handler,
            pending.session,
            pending.subprotocol,
            pending.deflate,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handler::Message, options::DeflateOptions};

    struct Nop;

    #[async_trait::async_trait]
    impl EventHandler for Nop {
        async fn on_message(&self, _conn: &Arc<Conn>, msg: Message) {
            msg.close();
        }
    }

    fn upgrader(options: ServerOptions) -> Upgrader {
        Upgrader::new(Arc::new(Nop), options)
    }

    fn request() -> Request<()> {
        Request::builder()
            .uri("/ws")
            .header(header::HOST, "example.test")
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "upgrade")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .body(())
            .unwrap()
    }

    #[tokio::test]
    async fn test_upgrade_response_headers() {
        let upgrader = upgrader(ServerOptions::default());
        let mut request = request();

        let (response, _fut) = upgrader.upgrade(&mut request).unwrap();

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()[header::UPGRADE], "websocket");
        assert_eq!(response.headers()[header::CONNECTION], "upgrade");
        // Accept value for the RFC sample key.
        assert_eq!(
            response.headers()[header::SEC_WEBSOCKET_ACCEPT],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert!(!response.headers().contains_key(header::SEC_WEBSOCKET_PROTOCOL));
        assert!(!response
            .headers()
            .contains_key(header::SEC_WEBSOCKET_EXTENSIONS));
    }

    #[tokio::test]
    async fn test_subprotocol_selected_by_client_order() {
        let options = ServerOptions {
            subprotocols: vec!["chat.v1".to_string()],
            ..Default::default()
        };
        let upgrader = upgrader(options);

        let mut request = request();
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            "chat.v2, chat.v1".parse().unwrap(),
        );

        let (response, _fut) = upgrader.upgrade(&mut request).unwrap();
        assert_eq!(response.headers()[header::SEC_WEBSOCKET_PROTOCOL], "chat.v1");
    }

    #[tokio::test]
    async fn test_no_subprotocol_overlap_omits_header() {
        let options = ServerOptions {
            subprotocols: vec!["graphql-ws".to_string()],
            ..Default::default()
        };
        let upgrader = upgrader(options);

        let mut request = request();
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, "chat.v1".parse().unwrap());

        let (response, _fut) = upgrader.upgrade(&mut request).unwrap();
        assert!(!response.headers().contains_key(header::SEC_WEBSOCKET_PROTOCOL));
    }

    #[tokio::test]
    async fn test_deflate_negotiated_when_both_sides_enable() {
        let options = ServerOptions {
            deflate: DeflateOptions {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let upgrader = upgrader(options);

        let mut request = request();
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_EXTENSIONS,
            "permessage-deflate; client_max_window_bits=10; server_no_context_takeover"
                .parse()
                .unwrap(),
        );

        let (response, _fut) = upgrader.upgrade(&mut request).unwrap();
        let answer = response.headers()[header::SEC_WEBSOCKET_EXTENSIONS]
            .to_str()
            .unwrap()
            .to_string();
        let ext = DeflateExt::from_str(&answer).unwrap();
        assert_eq!(ext.client_bits(), 10);
        assert!(ext.server_no_context_takeover);
    }

    #[tokio::test]
    async fn test_deflate_offer_ignored_when_disabled() {
        let upgrader = upgrader(ServerOptions::default());

        let mut request = request();
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_EXTENSIONS,
            "permessage-deflate".parse().unwrap(),
        );

        let (response, _fut) = upgrader.upgrade(&mut request).unwrap();
        assert!(!response
            .headers()
            .contains_key(header::SEC_WEBSOCKET_EXTENSIONS));
    }

    #[tokio::test]
    async fn test_missing_key_rejected() {
        let upgrader = upgrader(ServerOptions::default());
        let mut request = request();
        request.headers_mut().remove(header::SEC_WEBSOCKET_KEY);

        assert!(matches!(
            upgrader.upgrade(&mut request),
            Err(WebSocketError::MissingSecWebSocketKey)
        ));
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let upgrader = upgrader(ServerOptions::default());
        let mut request = request();
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_VERSION, "8".parse().unwrap());

        assert!(matches!(
            upgrader.upgrade(&mut request),
            Err(WebSocketError::InvalidSecWebSocketVersion)
        ));
    }

    #[tokio::test]
    async fn test_authorize_predicate_rejects() {
        let options = ServerOptions {
            authorize: Some(Arc::new(
                |uri: &hyper::Uri, _headers: &hyper::HeaderMap, _session: &dyn SessionStorage| {
                    uri.path() == "/allowed"
                },
            )),
            ..Default::default()
        };
        let upgrader = upgrader(options);

        let mut request = request();
        assert!(matches!(
            upgrader.upgrade(&mut request),
            Err(WebSocketError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_extra_response_headers_survive_stripping() {
        let mut extra = hyper::HeaderMap::new();
        extra.insert("x-served-by", "evws".parse().unwrap());
        extra.insert(header::SEC_WEBSOCKET_ACCEPT, "forged".parse().unwrap());

        let options = ServerOptions {
            response_headers: extra,
            ..Default::default()
        };
        let upgrader = upgrader(options);

        let (response, _fut) = upgrader.upgrade(&mut request()).unwrap();
        assert_eq!(response.headers()["x-served-by"], "evws");
        // The protected header keeps its computed value.
        assert_eq!(
            response.headers()[header::SEC_WEBSOCKET_ACCEPT],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }
}
