//! Session management for the spresso WebDriver bridge.
//!
//! A [`SessionOrchestrator`] owns at most one session. It prepares the device
//! and the on-device Espresso server through the seams in `spresso_runtime`,
//! and decides per request whether a command is answered locally or forwarded
//! (see [`routing`]).

pub mod commands;
pub mod error;
pub mod routing;
pub mod session;

pub use commands::{AndroidCommands, LocalCommand, execute_local};
pub use error::{Result, SessionError, TROUBLESHOOTING_HINT};
pub use routing::{ProxyRoute, RouteInput, RouteTarget, resolve_route};
pub use session::{
	Collaborators, RecordingState, SessionContext, SessionHandlers, SessionOrchestrator, SessionState,
};
