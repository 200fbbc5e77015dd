use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::chat::{Chat, ChatMessage};
use crate::errors::EngineError;
use crate::events::ConnectorEvent;
use crate::ids::UserId;

/// One user's client inside the messaging engine.
///
/// Events flow through the sender handed to `initialize`, in the order the
/// engine emits them. Dropping every clone of that sender ends the stream.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Start the client. May return before pairing or readiness; progress is
    /// reported as events.
    async fn initialize(&self, events: mpsc::Sender<ConnectorEvent>) -> Result<(), EngineError>;

    /// Release the client's resources in the engine.
    async fn destroy(&self) -> Result<(), EngineError>;

    /// All chats, in the engine's order.
    async fn chats(&self) -> Result<Vec<Chat>, EngineError>;

    /// Up to `limit` most recent messages of a chat, newest first.
    async fn recent_messages(&self, chat_id: &str, limit: usize)
        -> Result<Vec<ChatMessage>, EngineError>;
}

/// Builds connectors. Must be cheap and side-effect free: the registry calls
/// it while holding the user's map entry.
pub trait ConnectorFactory: Send + Sync {
    fn create(&self, user_id: &UserId, session_dir: &Path) -> Arc<dyn Connector>;
}
