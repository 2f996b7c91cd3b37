//! Errors surfaced by the execution consumers and the reconciliation listener.

use lottery_chain::ChainError;
use lottery_queue::{JobFailure, QueueError};
use lottery_storage::StorageError;
use lottery_types::{truncate_id, ContractEvent};
use thiserror::Error;

use crate::state::LotteryStateError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
	/// A precondition does not hold. Never retried.
	#[error("Validation failed: {0}")]
	Validation(String),
	#[error("Chain error: {0}")]
	Chain(#[from] ChainError),
	/// An on-chain event could not be mapped onto canonical records.
	#[error(transparent)]
	Reconciliation(#[from] ReconciliationAmbiguity),
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Queue error: {0}")]
	Queue(String),
}

impl OrchestratorError {
	/// Whether running the whole job again can succeed.
	///
	/// Chain errors qualify only when transient; infrastructure errors always
	/// do.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::Chain(e) => e.is_transient(),
			Self::Storage(_) | Self::Queue(_) => true,
			Self::Validation(_) | Self::Reconciliation(_) => false,
		}
	}
}

impl From<StorageError> for OrchestratorError {
	fn from(err: StorageError) -> Self {
		Self::Storage(err.to_string())
	}
}

impl From<QueueError> for OrchestratorError {
	fn from(err: QueueError) -> Self {
		Self::Queue(err.to_string())
	}
}

impl From<LotteryStateError> for OrchestratorError {
	fn from(err: LotteryStateError) -> Self {
		match err {
			LotteryStateError::Storage(msg) => Self::Storage(msg),
			LotteryStateError::Queue(msg) => Self::Queue(msg),
			other => Self::Validation(other.to_string()),
		}
	}
}

impl From<OrchestratorError> for JobFailure {
	fn from(err: OrchestratorError) -> Self {
		if err.is_retryable() {
			JobFailure::retryable(err.to_string())
		} else {
			JobFailure::permanent(err.to_string())
		}
	}
}

/// A contract event that is unclassifiable, malformed or refers to records
/// that do not exist. It is logged and dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Ambiguous {event} event in tx {tx_hash}: {reason}")]
pub struct ReconciliationAmbiguity {
	pub event: String,
	pub tx_hash: String,
	pub reason: String,
}

impl ReconciliationAmbiguity {
	pub fn new(event: &ContractEvent, reason: impl Into<String>) -> Self {
		Self {
			event: event.name.clone(),
			tx_hash: truncate_id(&event.tx_hash.to_string()),
			reason: reason.into(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use alloy_primitives::{Address, B256};

	#[test]
	fn test_only_transient_chain_errors_retry() {
		assert!(OrchestratorError::from(ChainError::Network("reset".into())).is_retryable());
		assert!(OrchestratorError::from(ChainError::Timeout("slow".into())).is_retryable());
		assert!(
			!OrchestratorError::from(ChainError::InsufficientFunds("0 < 10".into())).is_retryable()
		);
		assert!(!OrchestratorError::Validation("not active".into()).is_retryable());
		assert!(OrchestratorError::Storage("down".into()).is_retryable());
	}

	#[test]
	fn test_job_failure_follows_retryability() {
		let failure = JobFailure::from(OrchestratorError::Validation("quantity is 0".into()));
		assert!(!failure.retryable);
		let failure = JobFailure::from(OrchestratorError::Chain(ChainError::Network("eof".into())));
		assert!(failure.retryable);
	}

	#[test]
	fn test_ambiguity_names_event() {
		let event = ContractEvent {
			contract_address: Address::ZERO,
			name: "Mystery".into(),
			args: vec![],
			tx_hash: B256::repeat_byte(0xaa),
			block_number: 1,
			log_index: 0,
		};
		let err = OrchestratorError::from(ReconciliationAmbiguity::new(&event, "unknown name"));
		let message = err.to_string();
		assert!(message.contains("Mystery"));
		assert!(message.contains("unknown name"));
	}
}
