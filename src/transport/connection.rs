use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long a graceful close may take before the link task is aborted
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// One message on the link, as framed by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Instructions for the task that owns the socket
#[derive(Debug)]
pub enum Outgoing {
    Message(WireMessage),
    Close,
}

/// What the link task reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Message(WireMessage),
    Closed { reason: Option<String> },
}

/// Opens links to the voice-turn endpoint
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<ConnectionHandle>;
}

/// A single live link
///
/// The socket itself is owned by a background task; the handle talks to it
/// over two channels. Handles are never reused: a reconnect builds a new one
/// after the old one has been closed or dropped, and dropping a handle
/// aborts its task.
pub struct ConnectionHandle {
    outbound: mpsc::Sender<Outgoing>,
    inbound: mpsc::Receiver<LinkEvent>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn new(
        outbound: mpsc::Sender<Outgoing>,
        inbound: mpsc::Receiver<LinkEvent>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            task,
        }
    }

    pub async fn send(&self, message: WireMessage) -> Result<()> {
        self.outbound
            .send(Outgoing::Message(message))
            .await
            .map_err(|_| anyhow!("Connection task has stopped"))
    }

    /// Next event from the link; a vanished task reads as a close
    pub async fn recv(&mut self) -> LinkEvent {
        match self.inbound.recv().await {
            Some(event) => event,
            None => LinkEvent::Closed { reason: None },
        }
    }

    /// Close gracefully, then make sure the task is gone
    pub async fn close(mut self) {
        if self.outbound.send(Outgoing::Close).await.is_err() {
            debug!("Connection task already stopped before close");
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await {
                Ok(_) => debug!("Connection closed"),
                Err(_) => {
                    warn!("Connection did not close within {:?}, aborting", CLOSE_TIMEOUT);
                    task.abort();
                }
            }
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
