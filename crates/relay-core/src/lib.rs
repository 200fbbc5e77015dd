pub mod chat;
pub mod connector;
pub mod errors;
pub mod events;
pub mod ids;
pub mod state;

pub use chat::{Chat, ChatMessage};
pub use connector::{Connector, ConnectorFactory};
pub use errors::EngineError;
pub use events::ConnectorEvent;
pub use ids::{SessionId, UserId, UserIdError};
pub use state::ConnectorState;
