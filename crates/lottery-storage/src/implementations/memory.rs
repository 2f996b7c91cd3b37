//! In-memory storage backend.
//!
//! Used by tests and single-process development setups. Data is lost on
//! restart and atomic operations are only atomic within this process. Unlike
//! the durable backends it evaluates [`QueryFilter`]s directly against the
//! index fields kept next to each entry.

use crate::{QueryFilter, StorageError, StorageIndexes, StorageInterface};
use async_trait::async_trait;
use lottery_types::{ConfigSchema, Schema, ValidationError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Clone)]
struct StorageEntry {
	value: Vec<u8>,
	fields: HashMap<String, serde_json::Value>,
	expires_at: Option<Instant>,
}

impl StorageEntry {
	fn new(value: Vec<u8>, fields: HashMap<String, serde_json::Value>, ttl: Option<Duration>) -> Self {
		Self {
			value,
			fields,
			expires_at: ttl.map(|d| Instant::now() + d),
		}
	}

	fn is_expired(&self) -> bool {
		self.expires_at.map(|t| Instant::now() > t).unwrap_or(false)
	}
}

pub struct MemoryStorage {
	store: Arc<RwLock<HashMap<String, StorageEntry>>>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self {
			store: Arc::new(RwLock::new(HashMap::new())),
		}
	}
}

impl Default for MemoryStorage {
	fn default() -> Self {
		Self::new()
	}
}

/// Index fields for a write: the new ones if given, else whatever the live
/// entry had.
fn carried_fields(
	previous: Option<&StorageEntry>,
	indexes: Option<StorageIndexes>,
) -> HashMap<String, serde_json::Value> {
	match indexes {
		Some(indexes) => indexes.fields,
		None => previous
			.filter(|entry| !entry.is_expired())
			.map(|entry| entry.fields.clone())
			.unwrap_or_default(),
	}
}

#[async_trait]
impl StorageInterface for MemoryStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		let store = self.store.read().await;
		match store.get(key) {
			Some(entry) if !entry.is_expired() => Ok(entry.value.clone()),
			_ => Err(StorageError::NotFound(key.to_string())),
		}
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		indexes: Option<StorageIndexes>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let mut store = self.store.write().await;
		let fields = carried_fields(store.get(key), indexes);
		store.insert(key.to_string(), StorageEntry::new(value, fields, ttl));
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		self.store.write().await.remove(key);
		Ok(())
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		let store = self.store.read().await;
		Ok(store.get(key).map(|e| !e.is_expired()).unwrap_or(false))
	}

	async fn query(
		&self,
		namespace: &str,
		filter: QueryFilter,
	) -> Result<Vec<String>, StorageError> {
		let prefix = format!("{}:", namespace);
		let store = self.store.read().await;
		let mut keys: Vec<String> = store
			.iter()
			.filter(|(key, entry)| {
				key.starts_with(&prefix) && !entry.is_expired() && filter.matches(&entry.fields)
			})
			.map(|(key, _)| key.clone())
			.collect();
		keys.sort();
		Ok(keys)
	}

	async fn get_batch(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
		let store = self.store.read().await;
		Ok(keys
			.iter()
			.filter_map(|key| {
				store
					.get(key)
					.filter(|entry| !entry.is_expired())
					.map(|entry| (key.clone(), entry.value.clone()))
			})
			.collect())
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MemoryStorageSchema)
	}

	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		let mut store = self.store.write().await;
		let before = store.len();
		store.retain(|_, entry| !entry.is_expired());
		Ok(before - store.len())
	}

	async fn set_nx(
		&self,
		key: &str,
		value: Vec<u8>,
		indexes: Option<StorageIndexes>,
		ttl: Option<Duration>,
	) -> Result<bool, StorageError> {
		let mut store = self.store.write().await;
		if store.get(key).map(|e| !e.is_expired()).unwrap_or(false) {
			return Ok(false);
		}
		let fields = indexes.map(|i| i.fields).unwrap_or_default();
		store.insert(key.to_string(), StorageEntry::new(value, fields, ttl));
		Ok(true)
	}

	async fn compare_and_swap(
		&self,
		key: &str,
		expected: &[u8],
		new_value: Vec<u8>,
		indexes: Option<StorageIndexes>,
		ttl: Option<Duration>,
	) -> Result<bool, StorageError> {
		let mut store = self.store.write().await;
		let current = store
			.get(key)
			.filter(|entry| !entry.is_expired())
			.ok_or_else(|| StorageError::NotFound(key.to_string()))?;

		if current.value != expected {
			return Ok(false);
		}
		let fields = carried_fields(Some(current), indexes);
		store.insert(key.to_string(), StorageEntry::new(new_value, fields, ttl));
		Ok(true)
	}

	async fn delete_if_exists(&self, key: &str) -> Result<bool, StorageError> {
		let mut store = self.store.write().await;
		Ok(store
			.remove(key)
			.map(|entry| !entry.is_expired())
			.unwrap_or(false))
	}
}

/// The memory backend takes no options.
pub struct MemoryStorageSchema;

impl ConfigSchema for MemoryStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(vec![], vec![]).validate(config)
	}
}

pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	MemoryStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(format!("Invalid configuration: {}", e)))?;
	Ok(Box::new(MemoryStorage::new()))
}

pub struct Registry;

impl lottery_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "memory";
	type Factory = crate::StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl crate::StorageRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn status(value: &str) -> Option<StorageIndexes> {
		Some(StorageIndexes::new().with_field("status", value))
	}

	#[tokio::test]
	async fn test_basic_operations() {
		let storage = MemoryStorage::new();
		storage
			.set_bytes("ns:a", b"one".to_vec(), None, None)
			.await
			.unwrap();
		assert_eq!(storage.get_bytes("ns:a").await.unwrap(), b"one".to_vec());
		assert!(storage.exists("ns:a").await.unwrap());

		storage.delete("ns:a").await.unwrap();
		assert!(!storage.exists("ns:a").await.unwrap());
		assert!(matches!(
			storage.get_bytes("ns:a").await,
			Err(StorageError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn test_query_scopes_to_namespace_and_filter() {
		let storage = MemoryStorage::new();
		storage
			.set_bytes("lotteries:1", b"{}".to_vec(), status("ACTIVE"), None)
			.await
			.unwrap();
		storage
			.set_bytes("lotteries:2", b"{}".to_vec(), status("DRAFT"), None)
			.await
			.unwrap();
		storage
			.set_bytes("tickets:1", b"{}".to_vec(), status("ACTIVE"), None)
			.await
			.unwrap();

		let active = storage
			.query(
				"lotteries",
				QueryFilter::Equals("status".into(), json!("ACTIVE")),
			)
			.await
			.unwrap();
		assert_eq!(active, vec!["lotteries:1".to_string()]);

		let all = storage.query("lotteries", QueryFilter::All).await.unwrap();
		assert_eq!(all.len(), 2);
	}

	#[tokio::test]
	async fn test_set_without_indexes_keeps_previous_ones() {
		let storage = MemoryStorage::new();
		storage
			.set_bytes("lotteries:1", b"a".to_vec(), status("ACTIVE"), None)
			.await
			.unwrap();
		storage
			.set_bytes("lotteries:1", b"b".to_vec(), None, None)
			.await
			.unwrap();
		let hits = storage
			.query(
				"lotteries",
				QueryFilter::Equals("status".into(), json!("ACTIVE")),
			)
			.await
			.unwrap();
		assert_eq!(hits.len(), 1);
	}

	#[tokio::test]
	async fn test_compare_and_swap_semantics() {
		let storage = MemoryStorage::new();
		assert!(matches!(
			storage
				.compare_and_swap("ns:x", b"a", b"b".to_vec(), None, None)
				.await,
			Err(StorageError::NotFound(_))
		));

		storage
			.set_bytes("ns:x", b"a".to_vec(), status("DRAFT"), None)
			.await
			.unwrap();
		assert!(!storage
			.compare_and_swap("ns:x", b"z", b"b".to_vec(), None, None)
			.await
			.unwrap());
		assert!(storage
			.compare_and_swap("ns:x", b"a", b"b".to_vec(), status("PENDING"), None)
			.await
			.unwrap());
		assert_eq!(storage.get_bytes("ns:x").await.unwrap(), b"b".to_vec());

		let pending = storage
			.query("ns", QueryFilter::Equals("status".into(), json!("PENDING")))
			.await
			.unwrap();
		assert_eq!(pending, vec!["ns:x".to_string()]);
	}

	#[tokio::test]
	async fn test_set_nx_and_delete_if_exists() {
		let storage = MemoryStorage::new();
		assert!(storage
			.set_nx("ns:k", b"1".to_vec(), None, None)
			.await
			.unwrap());
		assert!(!storage
			.set_nx("ns:k", b"2".to_vec(), None, None)
			.await
			.unwrap());
		assert!(storage.delete_if_exists("ns:k").await.unwrap());
		assert!(!storage.delete_if_exists("ns:k").await.unwrap());
	}

	#[tokio::test]
	async fn test_expired_entries_are_invisible_and_cleaned() {
		let storage = MemoryStorage::new();
		storage
			.set_bytes("ns:t", b"1".to_vec(), None, Some(Duration::from_millis(1)))
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_millis(5)).await;

		assert!(!storage.exists("ns:t").await.unwrap());
		assert!(storage
			.set_nx("ns:t", b"2".to_vec(), None, None)
			.await
			.unwrap());
		storage
			.set_bytes("ns:u", b"1".to_vec(), None, Some(Duration::from_millis(1)))
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_millis(5)).await;
		assert_eq!(storage.cleanup_expired().await.unwrap(), 1);
	}

	#[test]
	fn test_factory_accepts_empty_table() {
		let config = toml::Value::Table(toml::map::Map::new());
		assert!(create_storage(&config).is_ok());
	}
}
