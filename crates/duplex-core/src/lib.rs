//! Core of a one-to-one audio/video calling client.
//!
//! Owns the room session, device probing, publish/play stream lifecycle and
//! room chat on top of an external real-time engine reached through
//! [`engine::RtcEngine`]. Platform shells render from [`CallEvent`]s and
//! [`call::CallSnapshot`]s.

pub mod call;
pub mod chat;
pub mod connection;
pub mod devices;
pub mod engine;
pub mod errors;
pub mod events;
pub mod logging;
pub mod settings;
pub mod streams;

#[cfg(test)]
mod testing;

pub use call::{CallOrchestrator, CallSnapshot};
pub use connection::{Session, SessionCredentials};
pub use engine::{EngineFactory, RtcEngine};
pub use errors::{CallError, EngineError};
pub use events::{CallEvent, CallEventListener, ConnectionState, Direction, StreamState};
pub use logging::init_logging;
pub use settings::{RuntimeProfile, Settings, SettingsStore, VideoCodec};
pub use streams::MediaSink;
