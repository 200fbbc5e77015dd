/// Errors surfaced by a messaging engine client.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("engine request failed: {0}")]
    Request(String),
    #[error("engine returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("engine protocol error: {0}")]
    Protocol(String),
    #[error("engine client not initialized")]
    NotInitialized,
}

impl EngineError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Request(_) => "request",
            Self::Status { .. } => "status",
            Self::Protocol(_) => "protocol",
            Self::NotInitialized => "not_initialized",
        }
    }
}
