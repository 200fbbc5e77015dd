use serde::{Deserialize, Serialize};

/// Lifecycle state of one user's connector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorState {
    Initializing,
    AwaitingPairing,
    Ready,
    Disconnected,
    AuthFailed,
}

impl ConnectorState {
    /// Whether a pairing code may still be shown to the user.
    pub fn accepts_pairing(self) -> bool {
        matches!(self, Self::Initializing | Self::AwaitingPairing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::AwaitingPairing => "awaiting_pairing",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::AuthFailed => "auth_failed",
        }
    }
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_only_before_ready() {
        assert!(ConnectorState::Initializing.accepts_pairing());
        assert!(ConnectorState::AwaitingPairing.accepts_pairing());
        assert!(!ConnectorState::Ready.accepts_pairing());
        assert!(!ConnectorState::Disconnected.accepts_pairing());
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&ConnectorState::AwaitingPairing).unwrap();
        assert_eq!(json, "\"awaiting_pairing\"");
        assert_eq!(ConnectorState::AuthFailed.to_string(), "auth_failed");
    }
}
