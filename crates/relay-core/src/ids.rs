use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Longest user id accepted from a request.
pub const MAX_USER_ID_LEN: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum UserIdError {
    #[error("missing user_id")]
    Missing,

    #[error("invalid user_id: {0:?}")]
    Invalid(String),
}

/// Tenant identifier assigned by the backend. Opaque to the gateway.
///
/// The backend sends ids as JSON integers or strings; both normalize to the
/// same string form so `42` and `"42"` address the same session.
///
/// Ids name on-disk session directories, so anything parsed from a request
/// is limited to ASCII letters, digits and `-_.@`, with no `..`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap a string without validation.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Parse an id taken from a request path or body.
    pub fn parse(s: &str) -> Result<Self, UserIdError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(UserIdError::Missing);
        }
        if !Self::is_safe(s) {
            return Err(UserIdError::Invalid(s.to_owned()));
        }
        Ok(Self(s.to_owned()))
    }

    /// Extract a user id from a JSON request field. Null, empty and
    /// non-scalar values count as missing.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, UserIdError> {
        match value {
            serde_json::Value::String(s) => Self::parse(s),
            serde_json::Value::Number(n) => Self::parse(&n.to_string()),
            _ => Err(UserIdError::Missing),
        }
    }

    /// Whether `s` is usable as a single path component.
    pub fn is_safe(s: &str) -> bool {
        !s.is_empty()
            && s.len() <= MAX_USER_ID_LEN
            && !s.contains("..")
            && s.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'@'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One start of one user's session. A user gets a fresh id every time their
/// session is started, so a lifecycle can tell its own registry record apart
/// from a successor's.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("sess_{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
