use tokio::sync::{mpsc, oneshot, watch};

use super::state::SessionSnapshot;
use crate::error::{VoiceError, VoiceResult};

/// Bounded so a stuck engine pushes back on its callers
pub(crate) const COMMAND_CAPACITY: usize = 32;

#[derive(Debug)]
pub enum Command {
    Start(oneshot::Sender<VoiceResult<()>>),
    Stop(oneshot::Sender<()>),
    /// Stop and forget the server session id
    EndConversation(oneshot::Sender<()>),
    Shutdown,
}

impl Command {
    /// Commands that abort an in-progress device or connection acquisition
    pub(crate) fn cancels_acquisition(&self) -> bool {
        matches!(
            self,
            Command::Stop(_) | Command::EndConversation(_) | Command::Shutdown
        )
    }
}

/// Cloneable control surface for a running session engine
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        snapshot: watch::Receiver<SessionSnapshot>,
    ) -> Self {
        Self { commands, snapshot }
    }

    /// Begin the hands-free loop
    pub async fn start(&self) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Start(tx)).await?;
        rx.await.map_err(|_| VoiceError::SessionClosed)?
    }

    /// Stop capture, playback and the connection; safe to repeat
    pub async fn stop(&self) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stop(tx)).await?;
        rx.await.map_err(|_| VoiceError::SessionClosed)
    }

    pub async fn end_conversation(&self) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::EndConversation(tx)).await?;
        rx.await.map_err(|_| VoiceError::SessionClosed)
    }

    /// Ask the engine to stop and exit its loop
    pub async fn shutdown(&self) -> VoiceResult<()> {
        self.send(Command::Shutdown).await
    }

    /// Latest published state
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch every published change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    async fn send(&self, command: Command) -> VoiceResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| VoiceError::SessionClosed)
    }
}
