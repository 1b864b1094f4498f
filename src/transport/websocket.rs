//! WebSocket connection to a remote destination.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{Connection, Connector, FrameSink, FrameSource};
use crate::config::Auth;
use crate::error::ConnectionError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn transport_error(err: WsError) -> ConnectionError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ConnectionError::Closed,
        other => ConnectionError::Transport(other.to_string()),
    }
}

/// Opens `ws://` / `wss://` connections
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        address: &Url,
        auth: Option<&Auth>,
    ) -> Result<Connection, ConnectionError> {
        let mut request = address
            .as_str()
            .into_client_request()
            .map_err(transport_error)?;

        // Authorization is set once on the handshake, never per message
        if let Some(auth) = auth {
            let value = HeaderValue::from_str(&auth.authorization_header()).map_err(|e| {
                ConnectionError::Transport(format!("Invalid authorization header: {}", e))
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, response) = connect_async(request).await.map_err(transport_error)?;
        tracing::debug!(
            address = %address,
            status = %response.status(),
            "WebSocket connection open"
        );

        let (sink, source) = socket.split();
        Ok(Connection::new(
            WebSocketSink { sink },
            WebSocketSource { source },
        ))
    }
}

struct WebSocketSink {
    sink: SplitSink<Socket, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send_frame(&mut self, frame: String) -> Result<(), ConnectionError> {
        self.sink
            .send(Message::Text(frame))
            .await
            .map_err(transport_error)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        match self.sink.close().await {
            Ok(()) => Ok(()),
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(transport_error(e)),
        }
    }
}

struct WebSocketSource {
    source: SplitStream<Socket>,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn next_frame(&mut self) -> Option<Result<String, ConnectionError>> {
        loop {
            match self.source.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes).map_err(|e| {
                        ConnectionError::Malformed(format!("Binary frame is not UTF-8: {}", e))
                    }))
                }
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "WebSocket close received");
                    return None;
                }
                // Ping/pong replies are handled by tungstenite
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return None,
                Err(e) => return Some(Err(transport_error(e))),
            }
        }
    }
}
