use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Opens websocket connections. Test suites swap in an in-memory version.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>>;
}

/// One live websocket. Text frames only; control frames are transport
/// housekeeping handled below this seam.
#[async_trait]
pub trait Connection: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;
    /// `None` once the peer has closed the stream.
    async fn recv_text(&mut self) -> Option<Result<String>>;
}

/// Rewrites an http(s) base URL into the matching ws(s) sync endpoint.
pub fn websocket_url(server_url: &str) -> Result<String> {
    let base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    Ok(format!("{}/ws", base.trim_end_matches('/')))
}

pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn Connection>> {
        let (stream, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        debug!(url, "websocket connected");
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .context("websocket send failed")
    }

    async fn recv_text(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                // Ping frames are answered by tungstenite on the next poll.
                Ok(_) => {}
                Err(err) => return Some(Err(anyhow!("websocket receive failed: {err}"))),
            }
        }
    }
}
