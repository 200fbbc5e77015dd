use relay_core::{EngineError, UserId};

use crate::notifier::NotifyError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no ready session for user {0}")]
    NotRunning(UserId),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("backend notification failed: {0}")]
    Notify(#[from] NotifyError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_running_names_user() {
        let err = SessionError::NotRunning(UserId::new("42"));
        assert_eq!(err.to_string(), "no ready session for user 42");
    }

    #[test]
    fn engine_error_converts() {
        let err: SessionError = EngineError::NotInitialized.into();
        assert!(matches!(err, SessionError::Engine(EngineError::NotInitialized)));
    }
}
