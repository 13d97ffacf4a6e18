//! Negotiated session capabilities.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Vendor prefix clients may put in front of non-standard capability names.
pub const VENDOR_PREFIX: &str = "appium:";

/// Capability map with unique keys.
///
/// Keys are stored without the [`VENDOR_PREFIX`]; use [`Capabilities::from_map`]
/// to normalize a raw client map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(Map<String, Value>);

impl Capabilities {
	pub fn new() -> Self {
		Self::default()
	}

	/// Builds capabilities from a raw map, stripping vendor prefixes.
	///
	/// When both `appium:foo` and `foo` are present the prefixed entry wins.
	pub fn from_map(raw: Map<String, Value>) -> Self {
		let mut plain = Map::new();
		let mut prefixed = Map::new();
		for (key, value) in raw {
			match key.strip_prefix(VENDOR_PREFIX) {
				Some(stripped) => {
					prefixed.insert(stripped.to_string(), value);
				}
				None => {
					plain.insert(key, value);
				}
			}
		}
		plain.extend(prefixed);
		Self(plain)
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.0.get(key)
	}

	/// Returns a non-empty string capability.
	pub fn get_str(&self, key: &str) -> Option<&str> {
		self.0
			.get(key)
			.and_then(Value::as_str)
			.filter(|s| !s.is_empty())
	}

	pub fn get_bool(&self, key: &str) -> Option<bool> {
		self.0.get(key).and_then(Value::as_bool)
	}

	pub fn contains(&self, key: &str) -> bool {
		self.0.get(key).is_some_and(|v| !v.is_null())
	}

	pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
		self.0.insert(key.into(), value.into());
	}

	/// Inserts `value` only when `key` is absent.
	pub fn set_default(&mut self, key: &str, value: impl Into<Value>) {
		if !self.contains(key) {
			self.0.insert(key.to_string(), value.into());
		}
	}

	pub fn remove(&mut self, key: &str) -> Option<Value> {
		self.0.remove(key)
	}

	/// Overlays `other` on top of `self`; keys from `other` win.
	pub fn merge(&mut self, other: &Capabilities) {
		for (key, value) in &other.0 {
			self.0.insert(key.clone(), value.clone());
		}
	}

	pub fn as_map(&self) -> &Map<String, Value> {
		&self.0
	}

	pub fn into_value(self) -> Value {
		Value::Object(self.0)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl From<Map<String, Value>> for Capabilities {
	fn from(map: Map<String, Value>) -> Self {
		Self::from_map(map)
	}
}

/// Body of a `POST /session` request.
///
/// Accepts both the W3C shape (`capabilities.alwaysMatch` + `firstMatch`) and
/// the legacy `desiredCapabilities` object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionPayload {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub capabilities: Option<W3cCapabilities>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub desired_capabilities: Option<Map<String, Value>>,
}

/// W3C capability request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct W3cCapabilities {
	#[serde(default)]
	pub always_match: Map<String, Value>,
	#[serde(default)]
	pub first_match: Vec<Map<String, Value>>,
}

impl NewSessionPayload {
	/// Flattens the payload into one capability map.
	///
	/// Only the first `firstMatch` entry is considered; W3C values override
	/// legacy desired capabilities.
	pub fn merged(&self) -> Capabilities {
		let mut raw = self.desired_capabilities.clone().unwrap_or_default();
		if let Some(w3c) = &self.capabilities {
			raw.extend(w3c.always_match.clone());
			if let Some(first) = w3c.first_match.first() {
				raw.extend(first.clone());
			}
		}
		Capabilities::from_map(raw)
	}
}
