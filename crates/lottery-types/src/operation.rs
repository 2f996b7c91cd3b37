//! Progress records for in-flight blockchain operations.
//!
//! These records live in the TTL-backed status cache only. They are
//! informational: nothing branches on their presence, and a missing record
//! simply means "unknown".

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle step an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPhase {
	Deployment,
	Draw,
	Purchase,
}

impl OperationPhase {
	/// Cache namespace; the full key is `{namespace}:{operation_id}`.
	pub fn namespace(&self) -> &'static str {
		match self {
			Self::Deployment => "lottery:deployment",
			Self::Draw => "lottery:draw",
			Self::Purchase => "ticket:purchase",
		}
	}

	pub fn cache_key(&self, operation_id: &str) -> String {
		format!("{}:{}", self.namespace(), operation_id)
	}
}

impl fmt::Display for OperationPhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Deployment => f.write_str("deployment"),
			Self::Draw => f.write_str("draw"),
			Self::Purchase => f.write_str("purchase"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
	Pending,
	Processing,
	Submitted,
	Completed,
	Failed,
}

/// Cached progress of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
	pub operation_id: String,
	pub lottery_id: String,
	pub phase: OperationPhase,
	pub status: OperationStatus,
	pub created_at: u64,
	pub updated_at: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tx_hash: Option<B256>,
}
