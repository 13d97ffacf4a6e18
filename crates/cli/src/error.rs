//! W3C error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use spresso::SessionError;
use spresso_protocol::WireError;
use thiserror::Error;
use tracing::debug;

pub type Result<T> = std::result::Result<T, ApiError>;

/// Error returned from an HTTP handler.
#[derive(Debug, Error)]
pub enum ApiError {
	#[error(transparent)]
	Session(#[from] SessionError),

	#[error("{0}")]
	InvalidArgument(String),

	#[error("{0}")]
	UnknownCommand(String),
}

impl From<spresso_runtime::Error> for ApiError {
	fn from(err: spresso_runtime::Error) -> Self {
		ApiError::Session(err.into())
	}
}

impl ApiError {
	pub fn error_code(&self) -> &'static str {
		match self {
			ApiError::Session(err) => err.error_code(),
			ApiError::InvalidArgument(_) => "invalid argument",
			ApiError::UnknownCommand(_) => "unknown command",
		}
	}

	pub fn status(&self) -> StatusCode {
		status_for(self.error_code())
	}

	pub fn to_wire(&self) -> WireError {
		WireError {
			error: self.error_code().to_string(),
			message: self.to_string(),
			stacktrace: String::new(),
		}
	}
}

/// HTTP status for a W3C error code.
pub fn status_for(code: &str) -> StatusCode {
	match code {
		"invalid argument" | "no such context" => StatusCode::BAD_REQUEST,
		"invalid session id" | "unknown command" => StatusCode::NOT_FOUND,
		_ => StatusCode::INTERNAL_SERVER_ERROR,
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = self.status();
		debug!(target = "spresso.http", status = status.as_u16(), error = %self, "request failed");
		(status, Json(json!({ "value": self.to_wire() }))).into_response()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn session_errors_keep_their_code() {
		let err = ApiError::from(SessionError::not_created("boom").into_session_not_created());
		assert_eq!(err.error_code(), "session not created");
		assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
		assert!(err.to_wire().message.starts_with("boom."));

		let err = ApiError::from(SessionError::NoSuchSession);
		assert_eq!(err.status(), StatusCode::NOT_FOUND);
		assert_eq!(err.to_wire().error, "invalid session id");
	}

	#[test]
	fn runtime_errors_map_through_session_errors() {
		let err = ApiError::from(spresso_runtime::Error::ServerLaunchTimeout { timeout_ms: 5 });
		assert_eq!(err.error_code(), "timeout");

		let err = ApiError::from(spresso_runtime::Error::DeviceUnavailable("gone".into()));
		assert_eq!(err.error_code(), "unknown error");
	}

	#[test]
	fn front_end_errors() {
		assert_eq!(ApiError::InvalidArgument("bad json".into()).status(), StatusCode::BAD_REQUEST);
		assert_eq!(ApiError::UnknownCommand("PUT /x".into()).status(), StatusCode::NOT_FOUND);
	}
}
