//! Signing capability tokens.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Names a key held by the key manager.
///
/// Requests and queued jobs carry this reference instead of key material; the
/// chain layer resolves it at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SigningKeyRef(String);

impl SigningKeyRef {
	pub fn new(key_id: impl Into<String>) -> Self {
		Self(key_id.into())
	}

	pub fn key_id(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SigningKeyRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "key:{}", self.0)
	}
}

impl From<&str> for SigningKeyRef {
	fn from(key_id: &str) -> Self {
		Self::new(key_id)
	}
}
