use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::SyncError;

/// Write half of an established connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, text: String) -> Result<(), SyncError>;
    async fn close(&mut self);
}

/// Read half of an established connection. `next` returns `None` once the
/// peer has closed.
#[async_trait]
pub trait FrameStream: Send {
    async fn next(&mut self) -> Option<Result<String, SyncError>>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), SyncError>;
}

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn dial(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), SyncError> {
        let (socket, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                SyncError::Connectivity(format!(
                    "connect timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(|err| SyncError::Connectivity(format!("connect failed: {err}")))?;

        let (sink, stream) = socket.split();
        Ok((Box::new(WsSink { inner: sink }), Box::new(WsStream { inner: stream })))
    }
}

struct WsSink {
    inner: SplitSink<WsSocket, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), SyncError> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|err| SyncError::Connectivity(format!("send failed: {err}")))
    }

    async fn close(&mut self) {
        let _ = self.inner.close().await;
    }
}

struct WsStream {
    inner: SplitStream<WsSocket>,
}

#[async_trait]
impl FrameStream for WsStream {
    async fn next(&mut self) -> Option<Result<String, SyncError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                // Transport-level pings are answered by tungstenite itself.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Binary(_)) | Ok(Message::Frame(_)) => {
                    debug!("ignoring non-text frame");
                    continue;
                }
                Ok(Message::Close(_)) => return None,
                Err(err) => {
                    return Some(Err(SyncError::Connectivity(format!("read failed: {err}"))))
                }
            }
        }
    }
}
