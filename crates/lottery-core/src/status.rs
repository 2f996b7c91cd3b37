//! TTL-backed progress records for in-flight operations.
//!
//! The cache is informational. Write failures are logged and swallowed, and a
//! missing record reads as `None`.

use alloy_primitives::B256;
use lottery_storage::{StorageError, StorageService};
use lottery_types::{
	current_timestamp, truncate_id, OperationPhase, OperationRecord, OperationStatus,
};
use std::sync::Arc;
use std::time::Duration;

pub struct StatusCache {
	storage: Arc<StorageService>,
	ttl: Duration,
}

impl StatusCache {
	pub fn new(storage: Arc<StorageService>, ttl: Duration) -> Self {
		Self { storage, ttl }
	}

	pub async fn get(
		&self,
		phase: OperationPhase,
		operation_id: &str,
	) -> Result<Option<OperationRecord>, StorageError> {
		self.storage
			.retrieve_optional(phase.namespace(), operation_id)
			.await
	}

	pub async fn mark(
		&self,
		phase: OperationPhase,
		operation_id: &str,
		lottery_id: &str,
		status: OperationStatus,
	) {
		self.write(phase, operation_id, lottery_id, status, None, None)
			.await;
	}

	/// Records the transaction that carried the operation.
	pub async fn mark_submitted(
		&self,
		phase: OperationPhase,
		operation_id: &str,
		lottery_id: &str,
		status: OperationStatus,
		tx_hash: B256,
	) {
		self.write(phase, operation_id, lottery_id, status, None, Some(tx_hash))
			.await;
	}

	/// Records a failed attempt. A retry still pending leaves the record in
	/// `PENDING` with the error attached.
	pub async fn mark_failed(
		&self,
		phase: OperationPhase,
		operation_id: &str,
		lottery_id: &str,
		error: &str,
		retrying: bool,
	) {
		let status = if retrying {
			OperationStatus::Pending
		} else {
			OperationStatus::Failed
		};
		self.write(
			phase,
			operation_id,
			lottery_id,
			status,
			Some(error.to_string()),
			None,
		)
		.await;
	}

	async fn write(
		&self,
		phase: OperationPhase,
		operation_id: &str,
		lottery_id: &str,
		status: OperationStatus,
		error: Option<String>,
		tx_hash: Option<B256>,
	) {
		let now = current_timestamp();
		let previous = self.get(phase, operation_id).await.ok().flatten();
		let record = OperationRecord {
			operation_id: operation_id.to_string(),
			lottery_id: lottery_id.to_string(),
			phase,
			status,
			created_at: previous.as_ref().map(|r| r.created_at).unwrap_or(now),
			updated_at: now,
			error,
			tx_hash: tx_hash.or_else(|| previous.and_then(|r| r.tx_hash)),
		};
		if let Err(e) = self
			.storage
			.store_with_ttl(phase.namespace(), operation_id, &record, None, Some(self.ttl))
			.await
		{
			tracing::warn!(
				key = %phase.cache_key(&truncate_id(operation_id)),
				error = %e,
				"Failed to write operation status"
			);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::memory_storage;

	#[tokio::test]
	async fn test_missing_record_is_unknown() {
		let cache = StatusCache::new(memory_storage(), Duration::from_secs(60));
		assert!(cache
			.get(OperationPhase::Draw, "nothing")
			.await
			.unwrap()
			.is_none());
	}

	#[tokio::test]
	async fn test_progress_keeps_creation_time_and_tx_hash() {
		let cache = StatusCache::new(memory_storage(), Duration::from_secs(60));
		let phase = OperationPhase::Purchase;
		cache
			.mark(phase, "op-1", "l1", OperationStatus::Processing)
			.await;
		let created_at = cache.get(phase, "op-1").await.unwrap().unwrap().created_at;

		let tx = B256::repeat_byte(7);
		cache
			.mark_submitted(phase, "op-1", "l1", OperationStatus::Submitted, tx)
			.await;
		cache
			.mark(phase, "op-1", "l1", OperationStatus::Completed)
			.await;

		let record = cache.get(phase, "op-1").await.unwrap().unwrap();
		assert_eq!(record.status, OperationStatus::Completed);
		assert_eq!(record.created_at, created_at);
		assert_eq!(record.tx_hash, Some(tx));
	}

	#[tokio::test]
	async fn test_failure_status_depends_on_retry() {
		let cache = StatusCache::new(memory_storage(), Duration::from_secs(60));
		let phase = OperationPhase::Deployment;
		cache
			.mark_failed(phase, "op", "l1", "rpc reset", true)
			.await;
		let record = cache.get(phase, "op").await.unwrap().unwrap();
		assert_eq!(record.status, OperationStatus::Pending);
		assert_eq!(record.error.as_deref(), Some("rpc reset"));

		cache
			.mark_failed(phase, "op", "l1", "rpc reset", false)
			.await;
		let record = cache.get(phase, "op").await.unwrap().unwrap();
		assert_eq!(record.status, OperationStatus::Failed);
	}
}
