//! How the agent reaches the sessions it drives

use async_trait::async_trait;
use tokio::sync::Mutex;

use tether_core::error::SessionError;
use tether_protocol::SessionId;

use crate::pty::{ScreenCapture, ScreenWindow, SessionRegistry};

/// Terminal operations the agent loop needs
#[async_trait]
pub trait TerminalAccess: Send + Sync {
    /// Session to drive when the prompt names none
    async fn default_session(&self) -> Option<SessionId>;

    /// Type into a session; false if it no longer exists
    async fn write(&self, id: &SessionId, data: &[u8]) -> bool;

    /// Read a window of a session's screen
    async fn capture(&self, id: &SessionId, window: ScreenWindow)
        -> Result<ScreenCapture, SessionError>;
}

#[async_trait]
impl TerminalAccess for Mutex<SessionRegistry> {
    async fn default_session(&self) -> Option<SessionId> {
        self.lock().await.active_ids().into_iter().next()
    }

    async fn write(&self, id: &SessionId, data: &[u8]) -> bool {
        self.lock().await.write(id, data)
    }

    async fn capture(
        &self,
        id: &SessionId,
        window: ScreenWindow,
    ) -> Result<ScreenCapture, SessionError> {
        self.lock().await.capture(id, window)
    }
}
