use serde::{Deserialize, Serialize};

/// Events emitted by a messaging engine client, in emission order.
///
/// This is also the wire shape of the engine sidecar's event stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConnectorEvent {
    /// A fresh pairing token the user must scan.
    #[serde(rename = "qr")]
    Pairing { code: String },

    #[serde(rename = "ready")]
    Ready,

    #[serde(rename = "message")]
    Message { from: String, body: String },

    #[serde(rename = "disconnected")]
    Disconnected { reason: String },

    #[serde(rename = "auth_failure")]
    AuthFailure { message: String },
}

impl ConnectorEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Pairing { .. } => "qr",
            Self::Ready => "ready",
            Self::Message { .. } => "message",
            Self::Disconnected { .. } => "disconnected",
            Self::AuthFailure { .. } => "auth_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_sidecar_events() {
        let qr: ConnectorEvent = serde_json::from_str(r#"{"type":"qr","code":"2@abc"}"#).unwrap();
        assert_eq!(qr, ConnectorEvent::Pairing { code: "2@abc".into() });

        let ready: ConnectorEvent = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(ready, ConnectorEvent::Ready);

        let msg: ConnectorEvent =
            serde_json::from_str(r#"{"type":"message","from":"123@c.us","body":"hi"}"#).unwrap();
        assert_eq!(msg.event_type(), "message");

        let gone: ConnectorEvent =
            serde_json::from_str(r#"{"type":"disconnected","reason":"LOGOUT"}"#).unwrap();
        assert_eq!(gone, ConnectorEvent::Disconnected { reason: "LOGOUT".into() });
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let result = serde_json::from_str::<ConnectorEvent>(r#"{"type":"loading_screen"}"#);
        assert!(result.is_err());
    }
}
