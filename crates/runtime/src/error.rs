//! Error types for the spresso runtime.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the device layer, the on-device server and artifact resolution.
#[derive(Debug, Error)]
pub enum Error {
	/// Every port in the scanned range is bound.
	#[error("No free port found in range {low}..={high}")]
	PortUnavailable { low: u16, high: u16 },

	/// An archive did not contain any installable package.
	#[error("{app} did not have any of '{extensions}' extension packages. Please make sure the provided .zip archive contains at least one valid application package")]
	NoSupportedPackageFound { app: String, extensions: String },

	/// Package signing (or certificate verification) failed.
	#[error("Failed to sign '{}': {reason}", path.display())]
	SigningFailed { path: PathBuf, reason: String },

	/// The app reference does not point at anything usable.
	#[error("Invalid app reference '{app}': {reason}")]
	InvalidApp { app: String, reason: String },

	/// Downloading a remote app failed.
	#[error("Failed to download '{url}': HTTP {status}")]
	Download { url: String, status: u16 },

	/// No device matched the requested identity or none is connected.
	#[error("Device unavailable: {0}")]
	DeviceUnavailable(String),

	/// The expected activity never came to the foreground.
	#[error("{package}/{activity} never started within {timeout_ms}ms")]
	ActivityWaitTimeout {
		package: String,
		activity: String,
		timeout_ms: u64,
	},

	/// A host tool (adb, apksigner, bundletool, ...) could not be located.
	#[error("Cannot find '{0}'. Make sure it is on PATH or ANDROID_HOME is set")]
	ToolNotFound(String),

	/// A host tool exited unsuccessfully.
	#[error("'{program} {args}' exited with {code:?}: {stderr}")]
	CommandFailed {
		program: String,
		args: String,
		code: Option<i32>,
		stderr: String,
	},

	/// A host tool did not finish in time.
	#[error("'{program}' timed out after {timeout_ms}ms")]
	CommandTimeout { program: String, timeout_ms: u64 },

	/// The on-device server rejected a request or returned garbage.
	#[error("Server error: {0}")]
	ServerError(String),

	/// The on-device server never answered its status endpoint.
	#[error("The on-device server did not start within {timeout_ms}ms")]
	ServerLaunchTimeout { timeout_ms: u64 },

	/// Secondary (web view) engine failure.
	#[error("Web view error: {0}")]
	Webview(String),

	/// The device implementation cannot do this.
	#[error("{0} is not supported by this device")]
	Unsupported(&'static str),

	/// HTTP transport failure.
	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	/// Archive could not be read or unpacked.
	#[error("Archive error: {0}")]
	Archive(#[from] zip::result::ZipError),

	/// I/O error.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// JSON serialization/deserialization error.
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

impl Error {
	/// Returns true for timeouts of any kind.
	pub fn is_timeout(&self) -> bool {
		matches!(
			self,
			Error::ActivityWaitTimeout { .. }
				| Error::CommandTimeout { .. }
				| Error::ServerLaunchTimeout { .. }
		)
	}
}
