//! Transport seam between the lifecycle client and the wire.
//!
//! A [`Connector`] hands back a [`Link`]: a pair of text-frame channels. The
//! link is considered lost as soon as `inbound` closes.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::ClientError;

pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

impl Link {
    /// Two cross-wired in-memory ends: what one sends, the other receives.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Link {
                outbound: a_tx,
                inbound: b_rx,
            },
            Link {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Link, ClientError>;
}

/// WebSocket connector. Spawns one reader and one writer task per link.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, ClientError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::debug!(?e, "ws write error");
                    break;
                }
            }
            // Link dropped by the client (or write failed): close politely.
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(?e, "ws read error");
                        break;
                    }
                }
            }
        });

        tracing::debug!(url = %self.url, "websocket link established");
        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
