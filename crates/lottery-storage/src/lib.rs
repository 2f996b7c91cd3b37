//! Storage layer for the lottery orchestrator.
//!
//! Backends implement the byte-level [`StorageInterface`]; the rest of the
//! system talks to the typed [`StorageService`] wrapper. Keys are always
//! `{namespace}:{id}` and every write may carry [`StorageIndexes`] that the
//! backend keeps queryable through [`QueryFilter`].
//!
//! Row-level atomicity comes from [`StorageInterface::compare_and_swap`]:
//! [`StorageService::update_atomic`] wraps it in a read/modify/swap loop so
//! concurrent writers never overwrite each other's changes.

use async_trait::async_trait;
use lottery_types::{ConfigSchema, ImplementationRegistry};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub mod implementations {
	pub mod memory;
	pub mod redis;
}

/// Upper bound on read/modify/swap rounds before giving up.
const MAX_CAS_ATTEMPTS: usize = 32;

/// Filter over indexed fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueryFilter {
	/// Field equals value.
	Equals(String, serde_json::Value),
	/// Field is absent or differs from value.
	NotEquals(String, serde_json::Value),
	/// Field equals one of the values.
	In(String, Vec<serde_json::Value>),
	/// Field is absent or equals none of the values.
	NotIn(String, Vec<serde_json::Value>),
	/// Field is present and `<= value`.
	AtMost(String, serde_json::Value),
	/// Field is present and `> value`.
	GreaterThan(String, serde_json::Value),
	/// Every inner filter matches.
	And(Vec<QueryFilter>),
	/// Every item in the namespace.
	All,
}

impl QueryFilter {
	/// Evaluates the filter against the index fields of one item.
	pub fn matches(&self, fields: &HashMap<String, serde_json::Value>) -> bool {
		match self {
			QueryFilter::Equals(field, value) => fields.get(field) == Some(value),
			QueryFilter::NotEquals(field, value) => fields.get(field) != Some(value),
			QueryFilter::In(field, values) => fields
				.get(field)
				.map(|v| values.contains(v))
				.unwrap_or(false),
			QueryFilter::NotIn(field, values) => fields
				.get(field)
				.map(|v| !values.contains(v))
				.unwrap_or(true),
			QueryFilter::AtMost(field, bound) => fields
				.get(field)
				.and_then(|v| compare_values(v, bound))
				.map(|ord| ord != Ordering::Greater)
				.unwrap_or(false),
			QueryFilter::GreaterThan(field, bound) => fields
				.get(field)
				.and_then(|v| compare_values(v, bound))
				.map(|ord| ord == Ordering::Greater)
				.unwrap_or(false),
			QueryFilter::And(filters) => filters.iter().all(|f| f.matches(fields)),
			QueryFilter::All => true,
		}
	}
}

/// Orders two index values of the same kind; mixed kinds are incomparable.
fn compare_values(a: &serde_json::Value, b: &serde_json::Value) -> Option<Ordering> {
	use serde_json::Value;
	match (a, b) {
		(Value::Number(x), Value::Number(y)) => match (x.as_u64(), y.as_u64()) {
			(Some(x), Some(y)) => Some(x.cmp(&y)),
			_ => x.as_f64()?.partial_cmp(&y.as_f64()?),
		},
		(Value::String(x), Value::String(y)) => Some(x.cmp(y)),
		(Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
		_ => None,
	}
}

/// Index values for a stored item.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StorageIndexes {
	pub fields: HashMap<String, serde_json::Value>,
}

impl StorageIndexes {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_field(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
		self.fields.insert(
			name.into(),
			serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
		);
		self
	}
}

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("Serialization error: {0}")]
	Serialization(String),
	#[error("Backend error: {0}")]
	Backend(String),
	#[error("Configuration error: {0}")]
	Configuration(String),
	/// Optimistic update lost every race.
	#[error("Write conflict: {0}")]
	Conflict(String),
}

/// Low-level byte store implemented by each backend.
///
/// `set_nx`, `compare_and_swap` and `delete_if_exists` must be atomic with
/// respect to other callers of the same backend.
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait StorageInterface: Send + Sync {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Stores bytes. `indexes: None` leaves previously written indexes alone.
	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		indexes: Option<StorageIndexes>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError>;

	/// Deletes the value and drops the key from every index.
	async fn delete(&self, key: &str) -> Result<(), StorageError>;

	async fn exists(&self, key: &str) -> Result<bool, StorageError>;

	/// Keys in `namespace` whose indexes match `filter`.
	async fn query(
		&self,
		namespace: &str,
		filter: QueryFilter,
	) -> Result<Vec<String>, StorageError>;

	/// Values for the keys that exist; missing keys are skipped.
	async fn get_batch(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Removes expired entries and returns how many were dropped.
	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		Ok(0)
	}

	/// Writes only if the key is absent. `Ok(false)` when it already exists.
	async fn set_nx(
		&self,
		key: &str,
		value: Vec<u8>,
		indexes: Option<StorageIndexes>,
		ttl: Option<Duration>,
	) -> Result<bool, StorageError>;

	/// Replaces the value only if it still equals `expected` byte for byte.
	///
	/// `Ok(false)` on mismatch, `Err(NotFound)` when the key is missing.
	async fn compare_and_swap(
		&self,
		key: &str,
		expected: &[u8],
		new_value: Vec<u8>,
		indexes: Option<StorageIndexes>,
		ttl: Option<Duration>,
	) -> Result<bool, StorageError>;

	/// Deletes the key and reports whether it existed.
	async fn delete_if_exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// Factory signature every backend exposes.
pub type StorageFactory = fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>;

/// Marker for storage registries.
pub trait StorageRegistry: ImplementationRegistry<Factory = StorageFactory> {}

/// Every built-in backend as `(name, factory)`.
pub fn get_all_implementations() -> Vec<(&'static str, StorageFactory)> {
	use implementations::{memory, redis};

	vec![
		(memory::Registry::NAME, memory::Registry::factory()),
		(redis::Registry::NAME, redis::Registry::factory()),
	]
}

/// Replaces the userinfo part of a URL so it can be logged.
pub fn redact_url_credentials(url: &str) -> String {
	let Some(scheme_end) = url.find("://") else {
		return url.to_string();
	};
	let after_scheme = &url[scheme_end + 3..];
	let Some(at_pos) = after_scheme.find('@') else {
		return url.to_string();
	};
	format!(
		"{}[REDACTED]@{}",
		&url[..scheme_end + 3],
		&after_scheme[at_pos + 1..]
	)
}

/// Result of [`StorageService::update_atomic`].
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation<T> {
	/// The closure changed the item and the change was persisted.
	Applied(T),
	/// The closure declined; the stored item is returned untouched.
	Unchanged(T),
}

impl<T> Mutation<T> {
	pub fn is_applied(&self) -> bool {
		matches!(self, Mutation::Applied(_))
	}

	pub fn into_inner(self) -> T {
		match self {
			Mutation::Applied(item) | Mutation::Unchanged(item) => item,
		}
	}
}

fn storage_key(namespace: &str, id: &str) -> String {
	format!("{}:{}", namespace, id)
}

fn to_bytes<T: Serialize>(data: &T) -> Result<Vec<u8>, StorageError> {
	serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
	serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Typed JSON access over a backend.
pub struct StorageService {
	backend: Box<dyn StorageInterface>,
}

impl StorageService {
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	pub async fn store_with_ttl<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
		indexes: Option<StorageIndexes>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let key = storage_key(namespace, id);
		self.backend
			.set_bytes(&key, to_bytes(data)?, indexes, ttl)
			.await
	}

	pub async fn store<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
		indexes: Option<StorageIndexes>,
	) -> Result<(), StorageError> {
		self.store_with_ttl(namespace, id, data, indexes, None)
			.await
	}

	/// Writes only if nothing is stored under the id yet.
	pub async fn store_if_absent<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
		indexes: Option<StorageIndexes>,
		ttl: Option<Duration>,
	) -> Result<bool, StorageError> {
		let key = storage_key(namespace, id);
		self.backend
			.set_nx(&key, to_bytes(data)?, indexes, ttl)
			.await
	}

	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<T, StorageError> {
		let key = storage_key(namespace, id);
		let bytes = self.backend.get_bytes(&key).await?;
		from_bytes(&bytes)
	}

	/// Like [`retrieve`](Self::retrieve) but maps `NotFound` to `None`.
	pub async fn retrieve_optional<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<Option<T>, StorageError> {
		match self.retrieve(namespace, id).await {
			Ok(item) => Ok(Some(item)),
			Err(StorageError::NotFound(_)) => Ok(None),
			Err(e) => Err(e),
		}
	}

	pub async fn remove(&self, namespace: &str, id: &str) -> Result<(), StorageError> {
		self.backend.delete(&storage_key(namespace, id)).await
	}

	/// Overwrites an existing item; `NotFound` if it does not exist.
	pub async fn update<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		data: &T,
		indexes: Option<StorageIndexes>,
	) -> Result<(), StorageError> {
		let key = storage_key(namespace, id);
		if !self.backend.exists(&key).await? {
			return Err(StorageError::NotFound(key));
		}
		self.backend
			.set_bytes(&key, to_bytes(data)?, indexes, None)
			.await
	}

	/// Read, modify and compare-and-swap until the write lands.
	///
	/// `mutate` returns `false` to leave the item as it is, in which case
	/// nothing is written. It may run several times when writers race, so it
	/// must only depend on the item it is handed.
	pub async fn update_atomic<T, F, I>(
		&self,
		namespace: &str,
		id: &str,
		mut mutate: F,
		indexes: I,
	) -> Result<Mutation<T>, StorageError>
	where
		T: Serialize + DeserializeOwned,
		F: FnMut(&mut T) -> bool,
		I: Fn(&T) -> StorageIndexes,
	{
		let key = storage_key(namespace, id);
		for attempt in 1..=MAX_CAS_ATTEMPTS {
			let current = self.backend.get_bytes(&key).await?;
			let mut item: T = from_bytes(&current)?;
			if !mutate(&mut item) {
				return Ok(Mutation::Unchanged(item));
			}
			let next = to_bytes(&item)?;
			if self
				.backend
				.compare_and_swap(&key, &current, next, Some(indexes(&item)), None)
				.await?
			{
				return Ok(Mutation::Applied(item));
			}
			tracing::debug!(key = %key, attempt, "compare-and-swap lost a race, retrying");
		}
		Err(StorageError::Conflict(key))
	}

	pub async fn exists(&self, namespace: &str, id: &str) -> Result<bool, StorageError> {
		self.backend.exists(&storage_key(namespace, id)).await
	}

	pub async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		self.backend.cleanup_expired().await
	}

	/// Items matching `filter`, as `(id, item)` pairs.
	pub async fn query<T: DeserializeOwned>(
		&self,
		namespace: &str,
		filter: QueryFilter,
	) -> Result<Vec<(String, T)>, StorageError> {
		let keys = self.backend.query(namespace, filter).await?;
		let results = self.backend.get_batch(&keys).await?;
		let prefix = format!("{}:", namespace);

		let mut items = Vec::with_capacity(results.len());
		for (key, bytes) in results {
			let id = key.strip_prefix(&prefix).unwrap_or(&key).to_string();
			match serde_json::from_slice::<T>(&bytes) {
				Ok(item) => items.push((id, item)),
				Err(e) => {
					tracing::warn!(key = %key, error = %e, "skipping undecodable item");
				},
			}
		}
		Ok(items)
	}

	pub async fn count(&self, namespace: &str, filter: QueryFilter) -> Result<usize, StorageError> {
		Ok(self.backend.query(namespace, filter).await?.len())
	}

	pub async fn retrieve_all<T: DeserializeOwned>(
		&self,
		namespace: &str,
	) -> Result<Vec<(String, T)>, StorageError> {
		self.query(namespace, QueryFilter::All).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use implementations::memory::MemoryStorage;
	use serde_json::json;
	use std::sync::Arc;

	fn fields(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
		pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.clone()))
			.collect()
	}

	#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
	struct Counter {
		value: u64,
	}

	fn service() -> StorageService {
		StorageService::new(Box::new(MemoryStorage::new()))
	}

	#[test]
	fn test_filter_matching() {
		let item = fields(&[("status", json!("ACTIVE")), ("end_time", json!(100))]);

		assert!(QueryFilter::Equals("status".into(), json!("ACTIVE")).matches(&item));
		assert!(!QueryFilter::Equals("status".into(), json!("DRAFT")).matches(&item));
		assert!(QueryFilter::NotEquals("missing".into(), json!(1)).matches(&item));
		assert!(QueryFilter::In("status".into(), vec![json!("DRAFT"), json!("ACTIVE")]).matches(&item));
		assert!(!QueryFilter::NotIn("status".into(), vec![json!("ACTIVE")]).matches(&item));
		assert!(QueryFilter::AtMost("end_time".into(), json!(100)).matches(&item));
		assert!(!QueryFilter::AtMost("end_time".into(), json!(99)).matches(&item));
		assert!(QueryFilter::GreaterThan("end_time".into(), json!(99)).matches(&item));
		assert!(!QueryFilter::AtMost("missing".into(), json!(1000)).matches(&item));
		assert!(QueryFilter::And(vec![
			QueryFilter::Equals("status".into(), json!("ACTIVE")),
			QueryFilter::AtMost("end_time".into(), json!(150)),
		])
		.matches(&item));
	}

	#[test]
	fn test_mixed_kinds_never_compare() {
		let item = fields(&[("end_time", json!("100"))]);
		assert!(!QueryFilter::AtMost("end_time".into(), json!(200)).matches(&item));
	}

	#[test]
	fn test_redact_url_credentials() {
		assert_eq!(
			redact_url_credentials("redis://:secret@localhost:6379"),
			"redis://[REDACTED]@localhost:6379"
		);
		assert_eq!(
			redact_url_credentials("redis://localhost:6379"),
			"redis://localhost:6379"
		);
	}

	#[tokio::test]
	async fn test_retrieve_optional_maps_not_found() {
		let storage = service();
		let missing: Option<Counter> = storage.retrieve_optional("counters", "x").await.unwrap();
		assert!(missing.is_none());
	}

	#[tokio::test]
	async fn test_update_requires_existing_item() {
		let storage = service();
		let err = storage
			.update("counters", "x", &Counter { value: 1 }, None)
			.await
			.unwrap_err();
		assert!(matches!(err, StorageError::NotFound(_)));
	}

	#[tokio::test]
	async fn test_store_if_absent_only_writes_once() {
		let storage = service();
		assert!(storage
			.store_if_absent("counters", "x", &Counter { value: 1 }, None, None)
			.await
			.unwrap());
		assert!(!storage
			.store_if_absent("counters", "x", &Counter { value: 2 }, None, None)
			.await
			.unwrap());
		let stored: Counter = storage.retrieve("counters", "x").await.unwrap();
		assert_eq!(stored.value, 1);
	}

	#[tokio::test]
	async fn test_update_atomic_declined_writes_nothing() {
		let storage = service();
		storage
			.store("counters", "x", &Counter { value: 3 }, None)
			.await
			.unwrap();
		let outcome = storage
			.update_atomic("counters", "x", |c: &mut Counter| {
				c.value += 1;
				false
			}, |_| StorageIndexes::new())
			.await
			.unwrap();
		assert_eq!(outcome, Mutation::Unchanged(Counter { value: 4 }));
		let stored: Counter = storage.retrieve("counters", "x").await.unwrap();
		assert_eq!(stored.value, 3);
	}

	#[tokio::test]
	async fn test_update_atomic_under_contention_loses_no_increment() {
		let storage = Arc::new(service());
		storage
			.store("counters", "x", &Counter { value: 0 }, None)
			.await
			.unwrap();

		let mut handles = Vec::new();
		for _ in 0..16 {
			let storage = storage.clone();
			handles.push(tokio::spawn(async move {
				storage
					.update_atomic("counters", "x", |c: &mut Counter| {
						c.value += 1;
						true
					}, |c| StorageIndexes::new().with_field("value", c.value))
					.await
					.unwrap()
			}));
		}
		for handle in handles {
			assert!(handle.await.unwrap().is_applied());
		}

		let stored: Counter = storage.retrieve("counters", "x").await.unwrap();
		assert_eq!(stored.value, 16);
		let indexed = storage
			.count("counters", QueryFilter::Equals("value".into(), json!(16)))
			.await
			.unwrap();
		assert_eq!(indexed, 1);
	}

	#[tokio::test]
	async fn test_query_returns_ids_with_colons() {
		let storage = service();
		storage
			.store(
				"tickets",
				"lottery-1:7",
				&Counter { value: 7 },
				Some(StorageIndexes::new().with_field("lottery_id", "lottery-1")),
			)
			.await
			.unwrap();
		let items: Vec<(String, Counter)> = storage
			.query(
				"tickets",
				QueryFilter::Equals("lottery_id".into(), json!("lottery-1")),
			)
			.await
			.unwrap();
		assert_eq!(items, vec![("lottery-1:7".to_string(), Counter { value: 7 })]);
	}
}
