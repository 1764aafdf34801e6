//! Duplex message channel
//!
//! [`MessageChannel`] is the seam between the session controller and the
//! socket. [`WebSocketChannel`] is the production implementation over
//! tokio-tungstenite.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::constants::CHAT_PATH;
use crate::error::ChannelError;
use crate::network::auth::Credentials;
use crate::network::messages::{ClientMessage, ServerMessage};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake parameters of one chat session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionParams {
    pub config_id: Option<String>,
    pub config_version: Option<u32>,
    /// Continue an earlier conversation
    pub resumed_chat_group_id: Option<String>,
}

#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send(&self, message: &ClientMessage) -> Result<(), ChannelError>;

    /// Next inbound message. Frame-level failures (`Decoding`, `UnknownMessage`)
    /// leave the channel usable; `Closed` / `Disconnected` are terminal.
    async fn receive(&self) -> Result<ServerMessage, ChannelError>;

    async fn close(&self);
}

/// Opens channels
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, params: &SessionParams) -> Result<Arc<dyn MessageChannel>, ChannelError>;
}

/// Inbound messages as a stream. Frame errors are yielded and the stream
/// continues; a closure ends it silently and any other error ends it after
/// being yielded.
pub fn inbound(
    channel: Arc<dyn MessageChannel>,
) -> impl Stream<Item = Result<ServerMessage, ChannelError>> + Send {
    futures_util::stream::unfold(Some(channel), |state| async move {
        let channel = state?;
        match channel.receive().await {
            Ok(message) => Some((Ok(message), Some(channel))),
            Err(e) if e.is_frame_error() => Some((Err(e), Some(channel))),
            Err(e) if e.is_closure() => None,
            Err(e) => Some((Err(e), None)),
        }
    })
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketChannel {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    closed: AtomicBool,
}

impl WebSocketChannel {
    fn new(socket: WsStream) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }

    fn mark_closed(&self, error: ChannelError) -> ChannelError {
        self.closed.store(true, Ordering::SeqCst);
        error
    }
}

#[async_trait]
impl MessageChannel for WebSocketChannel {
    async fn send(&self, message: &ClientMessage) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let json = message.to_json()?;
        tracing::trace!("Sending {} ({} bytes)", message.kind(), json.len());

        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(json.into()))
            .await
            .map_err(|e| self.mark_closed(map_ws_error(e)))
    }

    async fn receive(&self) -> Result<ServerMessage, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }

        let mut stream = self.stream.lock().await;
        loop {
            let frame = match stream.next().await {
                None => return Err(self.mark_closed(ChannelError::Closed)),
                Some(Err(e)) => {
                    let error = map_ws_error(e);
                    return Err(if error.is_frame_error() {
                        error
                    } else {
                        self.mark_closed(error)
                    });
                }
                Some(Ok(frame)) => frame,
            };

            match frame {
                Message::Text(text) => {
                    tracing::trace!("Received {} bytes", text.len());
                    return ServerMessage::parse(text.as_str());
                }
                Message::Binary(data) => {
                    tracing::warn!("Unexpected binary frame of {} bytes", data.len());
                    return Err(ChannelError::Decoding("unexpected binary frame".to_string()));
                }
                Message::Ping(data) => {
                    let _ = self.sink.lock().await.send(Message::Pong(data)).await;
                }
                Message::Close(frame) => {
                    tracing::info!("Chat socket closed by server: {:?}", frame);
                    return Err(self.mark_closed(close_error(frame.as_ref())));
                }
                Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Closing chat socket");
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Close(None)).await {
            tracing::debug!("Close frame not sent: {}", e);
        }
        let _ = sink.close().await;
    }
}

fn close_error(frame: Option<&CloseFrame>) -> ChannelError {
    match frame {
        None => ChannelError::Closed,
        Some(frame) => match frame.code {
            CloseCode::Normal => ChannelError::Closed,
            CloseCode::Away => ChannelError::Disconnected,
            code => ChannelError::Transport(format!(
                "closed with code {}: {}",
                u16::from(code),
                frame.reason.as_str()
            )),
        },
    }
}

fn map_ws_error(error: tungstenite::Error) -> ChannelError {
    use std::io::ErrorKind;
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => ChannelError::Closed,
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => ChannelError::Disconnected,
        tungstenite::Error::Io(e)
            if matches!(
                e.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ) =>
        {
            ChannelError::Disconnected
        }
        tungstenite::Error::Utf8(e) => ChannelError::Decoding(e.to_string()),
        other => ChannelError::Transport(other.to_string()),
    }
}

/// Connects to the chat endpoint over WebSocket
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    endpoint: Url,
    credentials: Option<Credentials>,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// `wss://{host}/v0/evi/chat`
    pub fn new(host: &str, credentials: Credentials) -> Result<Self, ChannelError> {
        let endpoint = Url::parse(&format!("wss://{}{}", host, CHAT_PATH))
            .map_err(|e| ChannelError::Connection(format!("invalid host '{}': {}", host, e)))?;
        Ok(Self::with_endpoint(endpoint, Some(credentials)))
    }

    pub fn with_endpoint(endpoint: Url, credentials: Option<Credentials>) -> Self {
        Self {
            endpoint,
            credentials,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Full handshake URL for `params`
    pub async fn chat_url(&self, params: &SessionParams) -> Result<Url, ChannelError> {
        let auth = match &self.credentials {
            Some(credentials) => Some(credentials.query_pair().await?),
            None => None,
        };

        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            if let Some((name, value)) = &auth {
                query.append_pair(name, value);
            }
            if let Some(config_id) = &params.config_id {
                query.append_pair("config_id", config_id);
            }
            if let Some(version) = params.config_version {
                query.append_pair("config_version", &version.to_string());
            }
            if let Some(group) = &params.resumed_chat_group_id {
                query.append_pair("resumed_chat_group_id", group);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self, params: &SessionParams) -> Result<Arc<dyn MessageChannel>, ChannelError> {
        let url = self.chat_url(params).await?;
        tracing::info!("Connecting to {}", self.endpoint);

        let (socket, response) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ChannelError::Connection("connection timed out".to_string()))?
            .map_err(|e| ChannelError::Connection(e.to_string()))?;

        tracing::info!("Chat socket open (status: {})", response.status());
        Ok(Arc::new(WebSocketChannel::new(socket)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::messages::SessionSettings;
    use tokio::net::TcpListener;

    fn local_connector(addr: std::net::SocketAddr) -> WebSocketConnector {
        let endpoint = Url::parse(&format!("ws://{}{}", addr, CHAT_PATH)).unwrap();
        WebSocketConnector::with_endpoint(endpoint, Some(Credentials::api_key("k")))
    }

    #[tokio::test]
    async fn test_chat_url_query() {
        let connector = WebSocketConnector::new("api.example.com", Credentials::api_key("k")).unwrap();
        let params = SessionParams {
            config_id: Some("cfg".to_string()),
            config_version: Some(2),
            resumed_chat_group_id: Some("g1".to_string()),
        };
        let url = connector.chat_url(&params).await.unwrap();
        assert_eq!(
            url.as_str(),
            "wss://api.example.com/v0/evi/chat?api_key=k&config_id=cfg&config_version=2&resumed_chat_group_id=g1"
        );
    }

    #[tokio::test]
    async fn test_chat_url_without_query() {
        let endpoint = Url::parse("ws://localhost/v0/evi/chat").unwrap();
        let connector = WebSocketConnector::with_endpoint(endpoint, None);
        let url = connector.chat_url(&SessionParams::default()).await.unwrap();
        assert_eq!(url.as_str(), "ws://localhost/v0/evi/chat");
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(close_error(None), ChannelError::Closed);
        let away = CloseFrame {
            code: CloseCode::Away,
            reason: "".into(),
        };
        assert_eq!(close_error(Some(&away)), ChannelError::Disconnected);
        let error = CloseFrame {
            code: CloseCode::Error,
            reason: "boom".into(),
        };
        assert!(matches!(close_error(Some(&error)), ChannelError::Transport(_)));
    }

    #[test]
    fn test_ws_error_mapping() {
        assert_eq!(map_ws_error(tungstenite::Error::ConnectionClosed), ChannelError::Closed);
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(map_ws_error(tungstenite::Error::Io(reset)), ChannelError::Disconnected);
        let other = std::io::Error::new(std::io::ErrorKind::Other, "weird");
        assert!(matches!(map_ws_error(tungstenite::Error::Io(other)), ChannelError::Transport(_)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = local_connector(addr).connect(&SessionParams::default()).await;
        assert!(matches!(result, Err(ChannelError::Connection(_))));
    }

    #[tokio::test]
    async fn test_round_trip_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            let first = first.to_text().unwrap().to_string();

            ws.send(Message::Text(
                r#"{"type":"chat_metadata","chat_id":"c1","chat_group_id":"g1"}"#.into(),
            ))
            .await
            .unwrap();
            ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
            ws.send(Message::Text(r#"{"type":"mystery"}"#.into())).await.unwrap();
            ws.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            })))
            .await
            .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
            first
        });

        let channel = local_connector(addr).connect(&SessionParams::default()).await.unwrap();
        channel
            .send(&ClientMessage::SessionSettings(SessionSettings::default()))
            .await
            .unwrap();

        let mut inbound = Box::pin(inbound(channel.clone()));
        assert!(matches!(inbound.next().await, Some(Ok(ServerMessage::ChatMetadata(_)))));
        assert!(matches!(inbound.next().await, Some(Err(ChannelError::Decoding(_)))));
        assert_eq!(
            inbound.next().await,
            Some(Err(ChannelError::UnknownMessage("mystery".to_string())))
        );
        // normal closure ends the stream
        assert!(inbound.next().await.is_none());

        assert_eq!(
            channel.send(&ClientMessage::PauseAssistantMessage).await,
            Err(ChannelError::Closed)
        );
        // release the socket so the server loop ends
        drop(inbound);
        drop(channel);
        assert_eq!(server.await.unwrap(), r#"{"type":"session_settings"}"#);
    }
}
