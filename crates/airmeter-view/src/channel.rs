use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

pub const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel connect failed: {0}")]
    Connect(String),
}

/// One open, bidirectional text channel. Frames are delivered in arrival order.
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Far side of an in-memory [`Connection`].
#[derive(Debug)]
pub struct RemoteEnd {
    pub to_client: mpsc::Sender<String>,
    pub from_client: mpsc::Receiver<String>,
}

impl Connection {
    pub fn pair(capacity: usize) -> (Connection, RemoteEnd) {
        let (outbound, from_client) = mpsc::channel(capacity);
        let (to_client, inbound) = mpsc::channel(capacity);
        (
            Connection { outbound, inbound },
            RemoteEnd {
                to_client,
                from_client,
            },
        )
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self) -> Result<Connection, TransportError>;
}

/// Relay channel over a websocket.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: Url,
}

impl WsTransport {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self) -> Result<Connection, TransportError> {
        let (ws, _) = connect_async(self.url.clone())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        info!("ws_connected: {}", self.url);

        let (connection, mut remote) = Connection::pair(CHANNEL_CAPACITY);
        let (mut sink, mut stream) = ws.split();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = stream.next() => {
                        match frame {
                            Some(Ok(WsMessage::Text(text))) => {
                                if remote.to_client.send(text).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(WsMessage::Close(reason))) => {
                                debug!("ws_close: {reason:?}");
                                break;
                            }
                            Some(Ok(WsMessage::Binary(_))) => warn!("ws_unexpected_binary"),
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!("ws_read_error: {err}");
                                break;
                            }
                            None => break,
                        }
                    }
                    out = remote.from_client.recv() => {
                        match out {
                            Some(text) => {
                                if let Err(err) = sink.send(WsMessage::Text(text)).await {
                                    warn!("ws_write_error: {err}");
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            let _ = sink.close().await;
            info!("ws_disconnected");
        });
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_crosses_directions() {
        let (mut connection, mut remote) = Connection::pair(4);
        connection
            .outbound
            .send("/list".to_string())
            .await
            .expect("send outbound");
        assert_eq!(remote.from_client.recv().await.as_deref(), Some("/list"));

        remote
            .to_client
            .send("/list [1]".to_string())
            .await
            .expect("send inbound");
        assert_eq!(connection.inbound.recv().await.as_deref(), Some("/list [1]"));

        drop(remote);
        assert_eq!(connection.inbound.recv().await, None);
    }
}
