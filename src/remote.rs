//! Websocket client for the Pika! relay.
//!
//! The client owns the connection loop of a live set: connect, feed inbound
//! text frames to the [`Manager`], reconnect with exponential backoff when
//! the connection drops, and give up after the configured number of
//! attempts. Outbound frames do not pass through here: they go through the
//! [`RelayTransport`] handle, which forwards them to this connection's
//! writer task.

use std::{ops::ControlFlow, sync::Arc};

use exponential_backoff::Backoff;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    tungstenite::{
        client::IntoClientRequest,
        handshake::client::Request,
        http::{header::USER_AGENT, HeaderValue},
        Message as WebsocketMessage,
    },
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::ReconnectConfig,
    error::{Error, Result},
    secrets::Token,
    session::Manager,
    transport::RelayTransport,
};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct Client {
    manager: Manager,
    transport: Arc<RelayTransport>,
    url: Url,
    user_agent: String,
    token: Option<Token>,
    reconnect: ReconnectConfig,
}

impl Client {
    /// Largest inbound frame that is parsed at all.
    const MAX_FRAME_SIZE: usize = 64 * 1024;

    /// Creates a client for the relay configured in `manager`.
    ///
    /// `transport` must be the handle the manager sends through.
    #[must_use]
    pub fn new(manager: Manager, transport: Arc<RelayTransport>, token: Option<Token>) -> Self {
        let config = manager.config();
        let url = config.relay_url.clone();
        let user_agent = config.user_agent.clone();
        let reconnect = config.reconnect;

        Self {
            manager,
            transport,
            url,
            user_agent,
            token,
            reconnect,
        }
    }

    /// The relay URL with the access token attached.
    fn endpoint(&self) -> Url {
        let mut url = self.url.clone();
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token.as_str());
        }
        url
    }

    /// The handshake request: [`endpoint`](Self::endpoint) plus our
    /// `User-Agent`.
    fn request(&self) -> Result<Request> {
        let mut request = self.endpoint().as_str().into_client_request()?;
        let user_agent = HeaderValue::from_str(&self.user_agent)
            .map_err(|e| Error::invalid_argument(format!("user agent: {e}")))?;
        request.headers_mut().insert(USER_AGENT, user_agent);
        Ok(request)
    }

    /// Keeps the set connected until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Will return `Err` after the last reconnect attempt failed. The
    /// manager has moved to `error` by then.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let stream = match self.connect(&shutdown).await {
                Ok(stream) => stream,
                Err(e) if shutdown.is_cancelled() => {
                    debug!("stopped connecting: {e}");
                    return Ok(());
                }
                Err(e) => {
                    self.manager.on_reconnect_exhausted(&e.to_string());
                    return Err(e);
                }
            };

            let result = self.serve(stream, &shutdown).await;
            self.transport.detach();
            self.manager.on_transport_closed();

            match result {
                Ok(()) => return Ok(()),
                Err(e) => warn!("connection to relay lost: {e}"),
            }
        }
    }

    /// Connects, retrying with exponential backoff.
    async fn connect(&self, shutdown: &CancellationToken) -> Result<WsStream> {
        let backoff = Backoff::new(
            self.reconnect.attempts,
            self.reconnect.min_delay,
            self.reconnect.max_delay,
        );
        let host = self.url.host_str().unwrap_or("relay").to_owned();
        let mut last_error = Error::unavailable("no connection attempt was made");

        for delay in &backoff {
            let request = match self.request() {
                Ok(request) => request,
                Err(e) => {
                    self.transport.detach();
                    return Err(e);
                }
            };
            self.transport.connecting();
            debug!("connecting to {host}");

            let attempt = tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    self.transport.detach();
                    return Err(Error::cancelled("shutting down"));
                }

                result = tokio_tungstenite::connect_async(request) => result,
            };

            let e = match attempt {
                Ok((stream, _)) => {
                    info!("connected to {host}");
                    return Ok(stream);
                }
                Err(e) => Error::from(e),
            };

            match delay {
                Some(delay) => {
                    info!(
                        "could not connect to {host}: {e}; retrying in {:.1}s",
                        delay.as_secs_f32()
                    );
                    tokio::select! {
                        biased;

                        () = shutdown.cancelled() => {
                            self.transport.detach();
                            return Err(Error::cancelled("shutting down"));
                        }

                        () = tokio::time::sleep(delay) => {}
                    }
                }
                None => error!("could not connect to {host}: {e}"),
            }
            last_error = e;
        }

        self.transport.detach();
        Err(last_error)
    }

    /// Runs one connection until it drops or `shutdown` is cancelled.
    async fn serve(&self, stream: WsStream, shutdown: &CancellationToken) -> Result<()> {
        let (mut ws_tx, mut ws_rx) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        // The writer drains until the transport detaches and drops `tx`.
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let closing = matches!(frame, WebsocketMessage::Close(_));
                if let Err(e) = ws_tx.send(frame).await {
                    debug!("relay writer stopped: {e}");
                    return;
                }
                if closing {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        self.transport.attach(tx);
        self.manager.on_transport_open();

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => return Ok(()),

                frame = ws_rx.next() => match frame {
                    Some(Ok(frame)) => {
                        if let ControlFlow::Break(e) = self.handle_frame(frame) {
                            return Err(e);
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(Error::cancelled("relay closed the stream")),
                },
            }
        }
    }

    fn handle_frame(&self, frame: WebsocketMessage) -> ControlFlow<Error, ()> {
        match frame {
            WebsocketMessage::Text(text) => {
                // Do not parse exceedingly large frames.
                if text.len() > Self::MAX_FRAME_SIZE {
                    warn!("ignoring oversized frame of {} bytes", text.len());
                } else {
                    trace!("<- {}", text.as_str());
                    self.manager.dispatch(text.as_str());
                }
            }
            WebsocketMessage::Ping(payload) => {
                trace!("ping -> pong");
                if let Err(e) = self.transport.send_frame(WebsocketMessage::Pong(payload)) {
                    return ControlFlow::Break(e);
                }
            }
            WebsocketMessage::Close(payload) => {
                return ControlFlow::Break(Error::cancelled(format!(
                    "relay closed the connection: {payload:?}"
                )));
            }
            _ => trace!("ignoring non-text frame"),
        }

        ControlFlow::Continue(())
    }
}
