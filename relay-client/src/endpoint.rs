use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_proto::{CloseCode, CloseStatus, RelayError, Result};
use std::future::Future;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

/// One received transport event: either a discrete binary message or the
/// terminal close status of the channel.
#[derive(Debug)]
pub enum ChannelEvent {
    Message(Bytes),
    Closed(CloseStatus),
}

/// Send half of one transport connection.
pub trait ChannelTx: Send + 'static {
    fn send(&mut self, frame: Bytes) -> impl Future<Output = Result<()>> + Send;
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Receive half of one transport connection. After `Closed` is returned,
/// further calls are not defined.
pub trait ChannelRx: Send + 'static {
    fn receive(&mut self) -> impl Future<Output = ChannelEvent> + Send;
}

/// Produces message channels bound to relay sessions: `connect` opens a
/// brand-new session, `reconnect` resumes an existing one at the given
/// acknowledged byte offset.
pub trait RelayEndpoint: Send + Sync + 'static {
    type Tx: ChannelTx;
    type Rx: ChannelRx;

    fn connect(&self) -> impl Future<Output = Result<(Self::Tx, Self::Rx)>> + Send;

    fn reconnect(
        &self,
        session_id: &[u8],
        acked_bytes: u64,
    ) -> impl Future<Output = Result<(Self::Tx, Self::Rx)>> + Send;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Default endpoint: a WebSocket connection to the cloud tunneling service.
/// Session resumption is requested through query parameters on the upgrade
/// URL; authentication is a bearer token acquired externally.
pub struct WebSocketEndpoint {
    url: Url,
    bearer_token: Option<String>,
}

impl WebSocketEndpoint {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            bearer_token: None,
        }
    }

    pub fn with_bearer_token(url: Url, token: impl Into<String>) -> Self {
        Self {
            url,
            bearer_token: Some(token.into()),
        }
    }

    async fn open(&self, url: Url) -> Result<(WsTx, WsRx)> {
        let mut request = tungstenite::http::Request::builder()
            .uri(url.as_str())
            .header("Host", url.host_str().unwrap_or("localhost"))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key());
        if let Some(token) = &self.bearer_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        let request = request
            .body(())
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        debug!(%url, "websocket connection established");

        let (sink, stream) = ws.split();
        Ok((WsTx { sink }, WsRx { stream }))
    }
}

impl RelayEndpoint for WebSocketEndpoint {
    type Tx = WsTx;
    type Rx = WsRx;

    async fn connect(&self) -> Result<(WsTx, WsRx)> {
        self.open(self.url.clone()).await
    }

    async fn reconnect(&self, session_id: &[u8], acked_bytes: u64) -> Result<(WsTx, WsRx)> {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("sessionId", &hex::encode(session_id))
            .append_pair("ackedBytes", &acked_bytes.to_string());
        self.open(url).await
    }
}

pub struct WsTx {
    sink: WsSink,
}

impl ChannelTx for WsTx {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.sink
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.sink
            .close()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }
}

pub struct WsRx {
    stream: WsStream,
}

impl ChannelRx for WsRx {
    async fn receive(&mut self) -> ChannelEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return ChannelEvent::Message(Bytes::from(data));
                }
                Some(Ok(Message::Close(frame))) => {
                    let status = match frame {
                        Some(f) => {
                            CloseStatus::new(CloseCode::from_u16(u16::from(f.code)), f.reason)
                        }
                        None => CloseStatus::new(CloseCode::NormalClosure, ""),
                    };
                    return ChannelEvent::Closed(status);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Text(_))) => {
                    // The relay protocol is binary-only.
                    warn!("ignoring unexpected text message on relay channel");
                    continue;
                }
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => {
                    debug!(error = %e, "websocket receive failed");
                    return ChannelEvent::Closed(CloseStatus::new(
                        CloseCode::Other(1006),
                        "connection dropped",
                    ));
                }
                None => {
                    return ChannelEvent::Closed(CloseStatus::new(
                        CloseCode::Other(1006),
                        "connection dropped",
                    ));
                }
            }
        }
    }
}
