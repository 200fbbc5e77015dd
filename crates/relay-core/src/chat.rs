use serde::{Deserialize, Serialize};

/// A chat as listed by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    /// Serialized chat id, e.g. `123456@c.us` or `987@g.us`.
    pub id: String,
    /// Display name when the engine knows one.
    #[serde(default)]
    pub name: Option<String>,
    /// User part of the id, used when no display name is set.
    pub user: String,
    #[serde(default)]
    pub is_group: bool,
}

impl Chat {
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.user,
        }
    }
}

/// A single message in a chat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub from: String,
    pub body: String,
    /// Unix seconds.
    pub timestamp: i64,
}
