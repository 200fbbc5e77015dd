//! Messaging engine adapters.
//!
//! `sidecar` talks to an engine process over HTTP and a WebSocket event feed.
//! `mock` provides scripted connectors for tests.

pub mod mock;
pub mod sidecar;

pub use mock::{MockConnector, MockFactory};
pub use sidecar::{SidecarConnector, SidecarFactory};
