//! WebSocket link via tokio-tungstenite

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::connection::{ConnectionHandle, Connector, LinkEvent, Outgoing, WireMessage};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<ConnectionHandle> {
        info!("Connecting to {}", url);

        let (ws_stream, _response) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(url))
            .await
            .context("WebSocket handshake timed out")?
            .with_context(|| format!("Failed to connect to {}", url))?;

        info!("Connected to {}", url);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<LinkEvent>(CHANNEL_CAPACITY);

        let task = tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    outgoing = out_rx.recv() => match outgoing {
                        Some(Outgoing::Message(message)) => {
                            let frame = match message {
                                WireMessage::Text(text) => Message::Text(text.into()),
                                WireMessage::Binary(bytes) => Message::Binary(bytes.into()),
                            };
                            if let Err(e) = ws_tx.send(frame).await {
                                break Some(format!("send failed: {}", e));
                            }
                        }
                        Some(Outgoing::Close) | None => {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            let _ = ws_tx.close().await;
                            debug!("WebSocket closed by client");
                            return;
                        }
                    },
                    incoming = ws_rx.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let event = LinkEvent::Message(WireMessage::Text(text.as_str().to_owned()));
                            if in_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            let event = LinkEvent::Message(WireMessage::Binary(bytes.to_vec()));
                            if in_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map(|f| f.reason.to_string());
                        }
                        // Ping/pong are answered by tungstenite itself
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("WebSocket error: {}", e);
                            break Some(e.to_string());
                        }
                        None => break None,
                    },
                }
            };

            debug!("WebSocket closed by server: {:?}", reason);
            // The handle may be closing concurrently; never block on a full queue
            let _ = in_tx.try_send(LinkEvent::Closed { reason });
        });

        Ok(ConnectionHandle::new(out_tx, in_rx, Some(task)))
    }
}
