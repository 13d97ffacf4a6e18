//! HTTP-level shapes of the WebDriver protocol.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HTTP methods used by WebDriver commands.
///
/// Comparison is exact: `get` is not `GET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
	Get,
	Post,
	Delete,
}

impl Method {
	pub fn as_str(&self) -> &'static str {
		match self {
			Method::Get => "GET",
			Method::Post => "POST",
			Method::Delete => "DELETE",
		}
	}
}

impl fmt::Display for Method {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Method {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"GET" => Ok(Method::Get),
			"POST" => Ok(Method::Post),
			"DELETE" => Ok(Method::Delete),
			other => Err(format!("unsupported method: {other}")),
		}
	}
}

/// A command relayed verbatim to a remote endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRequest {
	pub method: Method,
	/// Path including the `/session/<id>` prefix.
	pub path: String,
	pub body: Vec<u8>,
}

/// Raw response of a relayed command.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyResponse {
	pub status: u16,
	pub content_type: Option<String>,
	pub body: Vec<u8>,
}

/// W3C success envelope: `{"value": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireValue {
	pub value: Value,
}

impl WireValue {
	pub fn new(value: impl Into<Value>) -> Self {
		Self {
			value: value.into(),
		}
	}
}

/// W3C error payload carried inside the `value` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
	pub error: String,
	pub message: String,
	#[serde(default)]
	pub stacktrace: String,
}

/// Response body of a successful `POST /session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
	pub session_id: String,
	pub capabilities: Value,
}
