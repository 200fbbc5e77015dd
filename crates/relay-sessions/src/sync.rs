//! On-demand contact sync for a ready session.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use relay_core::{ChatMessage, ConnectorState, UserId};

use crate::error::SessionError;
use crate::notifier::BackendNotifier;
use crate::registry::SessionRegistry;

/// One chat as reported to the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContactSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "isGroup")]
    pub is_group: bool,
    #[serde(rename = "lastMessage")]
    pub last_message: Option<LastMessage>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LastMessage {
    pub from: String,
    pub body: String,
    pub timestamp: i64,
}

impl From<ChatMessage> for LastMessage {
    fn from(msg: ChatMessage) -> Self {
        Self {
            from: msg.from,
            body: msg.body,
            timestamp: msg.timestamp,
        }
    }
}

/// Collects a ready session's chats and sends them to the backend.
pub struct SyncOrchestrator {
    registry: Arc<SessionRegistry>,
    notifier: Arc<dyn BackendNotifier>,
}

impl SyncOrchestrator {
    pub fn new(registry: Arc<SessionRegistry>, notifier: Arc<dyn BackendNotifier>) -> Self {
        Self { registry, notifier }
    }

    /// Fetch every chat with its most recent message and deliver the list
    /// in one callback.
    ///
    /// A failed message fetch leaves that chat's `last_message` empty. A
    /// failed chat listing or delivery fails the whole sync.
    pub async fn sync(&self, user_id: &UserId) -> Result<Vec<ContactSummary>, SessionError> {
        let handle = self
            .registry
            .lookup(user_id)
            .filter(|h| h.state() == ConnectorState::Ready)
            .ok_or_else(|| SessionError::NotRunning(user_id.clone()))?;
        let connector = handle.connector();

        let chats = connector.chats().await?;
        let mut contacts = Vec::with_capacity(chats.len());
        for chat in &chats {
            let last_message = match connector.recent_messages(&chat.id, 1).await {
                Ok(messages) => messages.into_iter().next().map(LastMessage::from),
                Err(e) => {
                    warn!(user_id = %user_id, chat_id = %chat.id, error = %e, "failed to fetch last message");
                    None
                }
            };
            contacts.push(ContactSummary {
                id: chat.id.clone(),
                name: chat.display_name().to_string(),
                is_group: chat.is_group,
                last_message,
            });
        }

        self.notifier.notify_sync_result(user_id, &contacts).await?;
        info!(user_id = %user_id, contacts = contacts.len(), "contacts synced");

        Ok(contacts)
    }
}
