//! Per-user session lifecycle management.
//!
//! The [`SessionRegistry`] owns one record per running user. Each record is
//! driven by a dedicated lifecycle task consuming that user's connector
//! events in order, reporting to the backend through the notifier and
//! handing terminal sessions to the [`CleanupWorker`].

pub mod cleanup;
pub mod error;
mod lifecycle;
pub mod notifier;
pub mod pairing;
pub mod registry;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use cleanup::{CleanupOutcome, CleanupPolicy, CleanupTicket, CleanupWorker, FsSessionStore, SessionStore};
pub use error::SessionError;
pub use notifier::{BackendNotifier, HttpNotifier, NotifyCall, NotifyError, RecordingNotifier};
pub use pairing::{PairingArtifact, PairingRenderer, QrSvgRenderer, RenderError};
pub use registry::{SessionHandle, SessionRegistry, StartOutcome};
pub use sync::{ContactSummary, LastMessage, SyncOrchestrator};
