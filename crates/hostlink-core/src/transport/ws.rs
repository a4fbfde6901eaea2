//! WebSocket transports.
//!
//! Text frames carry envelopes. Binary frames are passed through as bytes
//! and left to the codec; control frames are handled by the socket library
//! and never surface here.

use super::{Connector, Transport};
use crate::error::{HostlinkError, Result};
use async_trait::async_trait;
use futures::future::ready;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Connects to a host's WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Transport> {
        let (socket, response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        debug!(url = %self.url, status = %response.status(), "WebSocket handshake complete");
        Ok(client_transport(socket, self.url.clone()))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Wrap a client-side tungstenite socket.
pub fn client_transport<S>(socket: WebSocketStream<S>, peer: impl Into<String>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split();

    let stream = stream
        .take_while(|message| ready(!matches!(message, Ok(Message::Close(_)))))
        .filter_map(|message| {
            ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text.into_bytes())),
                Ok(Message::Binary(bytes)) => Some(Ok(bytes)),
                Ok(_) => None,
                Err(e) => Some(Err(HostlinkError::from(e))),
            })
        });

    let sink = sink.with(|text: String| ready(Ok::<_, HostlinkError>(Message::Text(text))));

    Transport::new(stream, sink, peer)
}

/// Wrap a host-side socket accepted through axum's upgrade extractor.
pub fn axum_transport(socket: axum::extract::ws::WebSocket, peer: impl Into<String>) -> Transport {
    use axum::extract::ws::Message as AxumMessage;

    let (sink, stream) = socket.split();

    let stream = stream
        .take_while(|message| ready(!matches!(message, Ok(AxumMessage::Close(_)))))
        .filter_map(|message| {
            ready(match message {
                Ok(AxumMessage::Text(text)) => Some(Ok(text.into_bytes())),
                Ok(AxumMessage::Binary(bytes)) => Some(Ok(bytes)),
                Ok(_) => None,
                Err(e) => Some(Err(HostlinkError::from(e))),
            })
        });

    let sink = sink.with(|text: String| ready(Ok::<_, HostlinkError>(AxumMessage::Text(text))));

    Transport::new(stream, sink, peer)
}
