//! Session lifecycle: startup, routing state and teardown.

pub mod caps;
mod context;
mod create;
mod delete;
mod orchestrator;

pub use context::{RecordingState, SessionContext};
pub use orchestrator::{Collaborators, SessionHandlers, SessionOrchestrator, SessionState};
