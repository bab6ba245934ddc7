//! Client-side synchronization for OpenCode chat sessions.
//!
//! [`ChatEngine`] owns the chat state for one active session and keeps it in
//! step with the server: a shared push stream feeds incremental updates,
//! REST pulls reconcile whole transcripts, and outgoing prompts are shown
//! optimistically until the server confirms them.

pub mod connection;
pub mod durable_settings;
pub mod engine;
pub mod error;
pub mod merge;
pub mod permissions;
pub mod revert;
pub mod send;
pub mod settings;
pub mod sse;
pub mod store;
pub mod transport;

pub use connection::{ConnectionState, EventSubscription, PushConnection, ReconnectConfig};
pub use durable_settings::DurableSettingsStore;
pub use engine::{ChatEngine, EngineConfig, EngineEvent};
pub use error::ChatError;
pub use send::Draft;
pub use settings::{InMemorySettings, SettingsStore};
pub use store::{ChatSnapshot, SessionUiStatus};
pub use transport::{HttpTransport, HttpTransportConfig, Transport};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
