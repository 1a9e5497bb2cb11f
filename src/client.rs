//! Chat client core.
//!
//! | Module | Role |
//! |--------|------|
//! | [`transport`] | `POST /process` and the other server calls over `reqwest` |
//! | [`persistence`] | Saves and restores the transcript |
//! | [`render`] | Output sinks |
//! | [`controller`] | The submission state machine |
//!
//! Validation is shared with the server and lives in [`crate::validation`].

pub mod controller;
pub mod persistence;
pub mod render;
pub mod transport;

pub use controller::{ChatEvent, ChatSession, SessionState};
pub use persistence::{FileStorage, MemoryStorage, PersistenceManager, Storage};
pub use render::{RecordingRenderer, Renderer, TerminalRenderer};
pub use transport::{HttpTransport, Transport};
