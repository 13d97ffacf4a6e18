//! Session-level errors.

use thiserror::Error;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Appended to session creation failures.
pub const TROUBLESHOOTING_HINT: &str = "Check https://github.com/appium/appium-espresso-driver#troubleshooting regarding advanced session startup troubleshooting.";

/// Errors surfaced to WebDriver clients.
#[derive(Debug, Error)]
pub enum SessionError {
	/// The requested capabilities cannot be satisfied.
	#[error("{0}")]
	CapabilityValidation(String),

	/// Session creation failed; the session has already been torn down.
	#[error("{message}")]
	SessionNotCreated {
		message: String,
		#[source]
		source: Option<Box<SessionError>>,
	},

	/// No session is running, or the id does not match.
	#[error("A session is either terminated or not started")]
	NoSuchSession,

	#[error("No such context found: {0}")]
	NoSuchContext(String),

	#[error("{0}")]
	InvalidArgument(String),

	/// The command is not implemented by this driver.
	#[error("{0}")]
	UnknownCommand(String),

	/// Device, server or artifact failure.
	#[error(transparent)]
	Runtime(#[from] spresso_runtime::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

impl SessionError {
	/// Failure that is already phrased as a session creation error.
	pub fn not_created(message: impl Into<String>) -> Self {
		SessionError::SessionNotCreated {
			message: message.into(),
			source: None,
		}
	}

	/// Turns a creation failure into [`SessionError::SessionNotCreated`] carrying
	/// the troubleshooting hint. Existing creation errors are not wrapped again.
	pub fn into_session_not_created(self) -> Self {
		match self {
			SessionError::SessionNotCreated { message, source } => SessionError::SessionNotCreated {
				message: with_hint(message),
				source,
			},
			other => SessionError::SessionNotCreated {
				message: with_hint(other.to_string()),
				source: Some(Box::new(other)),
			},
		}
	}

	/// W3C error code reported to the client.
	pub fn error_code(&self) -> &'static str {
		match self {
			SessionError::CapabilityValidation(_) | SessionError::InvalidArgument(_) => {
				"invalid argument"
			}
			SessionError::SessionNotCreated { .. } => "session not created",
			SessionError::NoSuchSession => "invalid session id",
			SessionError::NoSuchContext(_) => "no such context",
			SessionError::UnknownCommand(_) => "unknown command",
			SessionError::Runtime(err) if err.is_timeout() => "timeout",
			SessionError::Runtime(_) => "unknown error",
			SessionError::Json(_) => "invalid argument",
		}
	}

	/// Original error behind a [`SessionError::SessionNotCreated`] wrapper.
	pub fn root(&self) -> &SessionError {
		match self {
			SessionError::SessionNotCreated {
				source: Some(inner), ..
			} => inner.root(),
			other => other,
		}
	}
}

fn with_hint(mut message: String) -> String {
	if message.ends_with(TROUBLESHOOTING_HINT) {
		return message;
	}
	if !message.ends_with('.') {
		message.push('.');
	}
	message.push(' ');
	message.push_str(TROUBLESHOOTING_HINT);
	message
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hint_is_appended_with_period() {
		let err = SessionError::CapabilityValidation("browserName is not supported".into())
			.into_session_not_created();
		assert_eq!(
			err.to_string(),
			format!("browserName is not supported. {TROUBLESHOOTING_HINT}")
		);
		assert!(matches!(err.root(), SessionError::CapabilityValidation(_)));
		assert_eq!(err.error_code(), "session not created");
	}

	#[test]
	fn existing_period_is_kept() {
		let err = SessionError::InvalidArgument("Bad value.".into()).into_session_not_created();
		assert_eq!(err.to_string(), format!("Bad value. {TROUBLESHOOTING_HINT}"));
	}

	#[test]
	fn not_double_wrapped() {
		let once = SessionError::UnknownCommand("x".into()).into_session_not_created();
		let message = once.to_string();
		let twice = once.into_session_not_created();
		assert_eq!(twice.to_string(), message);
		assert!(matches!(twice.root(), SessionError::UnknownCommand(_)));
	}

	#[test]
	fn existing_creation_error_gets_hint() {
		let err = SessionError::not_created("Could not find the package 'a.b' installed on the device")
			.into_session_not_created();
		assert_eq!(
			err.to_string(),
			format!("Could not find the package 'a.b' installed on the device. {TROUBLESHOOTING_HINT}")
		);
		assert!(matches!(err.root(), SessionError::SessionNotCreated { source: None, .. }));
	}

	#[test]
	fn timeouts_have_their_own_code() {
		let err = SessionError::Runtime(spresso_runtime::Error::ServerLaunchTimeout { timeout_ms: 10 });
		assert_eq!(err.error_code(), "timeout");
	}
}
