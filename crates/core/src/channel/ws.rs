use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{ChannelMessage, Connector, LinkSink, LinkStream};
use crate::error::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket [`Connector`] for a `ws://` or `wss://` URL.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<(Box<dyn LinkSink>, Box<dyn LinkStream>)> {
        tracing::debug!(url = %self.url, "websocket connecting");
        let (ws, _response) = connect_async(self.url.as_str()).await?;
        let (write, read) = ws.split();
        Ok((Box::new(WsSink { write }), Box::new(WsSource { read })))
    }

    fn target(&self) -> &str {
        &self.url
    }
}

struct WsSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl LinkSink for WsSink {
    async fn send(&mut self, msg: ChannelMessage) -> Result<()> {
        let msg = match msg {
            ChannelMessage::Text(text) => Message::Text(text),
            ChannelMessage::Binary(data) => Message::Binary(data),
        };
        self.write.send(msg).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.write.close().await {
            tracing::debug!(error = %e, "websocket close");
        }
    }
}

struct WsSource {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl LinkStream for WsSource {
    async fn recv(&mut self) -> Option<Result<ChannelMessage>> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(ChannelMessage::Text(text))),
                Ok(Message::Binary(data)) => return Some(Ok(ChannelMessage::Binary(data))),
                Ok(Message::Close(_)) => return None,
                // Control frames are answered by tungstenite itself.
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
