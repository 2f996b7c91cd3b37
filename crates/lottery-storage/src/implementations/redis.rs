//! Redis storage backend.
//!
//! Durable, shared storage with native TTLs. Connections are managed by a
//! lazily created `redis::aio::ConnectionManager` so the backend can be built
//! synchronously from configuration and connect on first use.
//!
//! # Configuration
//!
//! ```toml
//! [storage.implementations.redis]
//! redis_url = "redis://localhost:6379"
//! key_prefix = "lottery"
//! connection_timeout_ms = 5000
//! db = 0
//! ttl_jobs = 0
//! ```
//!
//! # Key layout
//!
//! ```text
//! {prefix}:{namespace}:{id}                     JSON value
//! {prefix}:{namespace}:{id}:_fields             hash of index field -> JSON value
//! {prefix}:{namespace}:{id}:_slots              hash of index field -> index set key
//! {prefix}:{namespace}:_all                     set of keys in the namespace
//! {prefix}:{namespace}:_index:{field}:{value}   set of keys with field = value
//! ```
//!
//! Equality filters are answered from the index sets. Range and compound
//! filters are evaluated against the `_fields` hashes of the candidate keys.
//! The namespace of a key is everything before its first `:`.
//!
//! Every write and delete runs as one Lua script that updates the value and
//! its index entries together, so concurrent writers cannot leave a key
//! indexed under a value it no longer has.

use crate::{redact_url_credentials, QueryFilter, StorageError, StorageIndexes, StorageInterface};
use async_trait::async_trait;
use lottery_types::{ConfigSchema, Field, FieldType, Schema, StorageKey, ValidationError};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, warn};

const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 5000;
const DEFAULT_KEY_PREFIX: &str = "lottery";
const ALL_IDS_SUFFIX: &str = "_all";
const INDEX_SUFFIX: &str = "_index";
const FIELDS_SUFFIX: &str = "_fields";
const SLOTS_SUFFIX: &str = "_slots";

/// Writes a value and replaces its index entries atomically.
///
/// KEYS: value, fields hash, slots hash, namespace id set, then one index set
/// per indexed field. ARGV: mode (`set`, `nx` or `cas`), expected value,
/// new value, ttl seconds, member id, `1` when indexes are given, then a
/// field name and JSON value per index set.
///
/// Returns 1 when written, 0 when `nx` found a value or `cas` a different
/// one, -1 when `cas` found no value.
const WRITE_SCRIPT: &str = r#"
local mode = ARGV[1]
if mode == 'cas' then
	local current = redis.call('GET', KEYS[1])
	if not current then
		return -1
	end
	if current ~= ARGV[2] then
		return 0
	end
elseif mode == 'nx' then
	if redis.call('EXISTS', KEYS[1]) == 1 then
		return 0
	end
end
local ttl = tonumber(ARGV[4])
if ttl > 0 then
	redis.call('SET', KEYS[1], ARGV[3], 'EX', ttl)
else
	redis.call('SET', KEYS[1], ARGV[3])
end
if ARGV[6] ~= '1' then
	return 1
end
local member = ARGV[5]
local slots = redis.call('HGETALL', KEYS[3])
for i = 2, #slots, 2 do
	redis.call('SREM', slots[i], member)
end
redis.call('DEL', KEYS[2], KEYS[3])
redis.call('SADD', KEYS[4], member)
for i = 5, #KEYS do
	local field = ARGV[2 * i - 3]
	redis.call('SADD', KEYS[i], member)
	redis.call('HSET', KEYS[2], field, ARGV[2 * i - 2])
	redis.call('HSET', KEYS[3], field, KEYS[i])
end
if ttl > 0 and #KEYS > 4 then
	redis.call('EXPIRE', KEYS[2], ttl)
	redis.call('EXPIRE', KEYS[3], ttl)
end
return 1
"#;

/// Deletes a value together with its index entries.
///
/// KEYS: value, fields hash, slots hash, namespace id set. ARGV: member id,
/// `expired` to only drop the index entries of a value that no longer exists.
///
/// Returns the number of values deleted, or -1 when an `expired` cleanup
/// found the value alive.
const DELETE_SCRIPT: &str = r#"
if ARGV[2] == 'expired' and redis.call('EXISTS', KEYS[1]) == 1 then
	return -1
end
local deleted = redis.call('DEL', KEYS[1])
local slots = redis.call('HGETALL', KEYS[3])
for i = 2, #slots, 2 do
	redis.call('SREM', slots[i], ARGV[1])
end
redis.call('DEL', KEYS[2], KEYS[3])
redis.call('SREM', KEYS[4], ARGV[1])
return deleted
"#;

/// How [`WRITE_SCRIPT`] treats a value already stored under the key.
#[derive(Debug, Clone, Copy)]
enum WriteMode<'a> {
	Overwrite,
	IfAbsent,
	Swap(&'a [u8]),
}

/// Keys and arguments of one [`WRITE_SCRIPT`] call.
#[derive(Debug)]
struct WritePlan {
	keys: Vec<String>,
	args: Vec<Vec<u8>>,
}

/// Per-namespace default TTLs, read from `ttl_{namespace}` keys.
#[derive(Debug, Clone, Default)]
pub struct TtlConfig {
	ttls: HashMap<StorageKey, Duration>,
}

impl TtlConfig {
	fn from_config(config: &toml::Value) -> Self {
		let mut ttls = HashMap::new();
		if let Some(table) = config.as_table() {
			for storage_key in StorageKey::all() {
				let seconds = table
					.get(&format!("ttl_{}", storage_key.as_str()))
					.and_then(|v| v.as_integer())
					.unwrap_or(0);
				if seconds > 0 {
					ttls.insert(storage_key, Duration::from_secs(seconds as u64));
				}
			}
		}
		Self { ttls }
	}

	fn get_ttl(&self, storage_key: StorageKey) -> Option<Duration> {
		self.ttls.get(&storage_key).copied()
	}
}

fn namespace_of(key: &str) -> &str {
	key.split(':').next().unwrap_or("")
}

fn index_value(value: &serde_json::Value) -> String {
	match value {
		serde_json::Value::String(s) => s.clone(),
		serde_json::Value::Number(n) => n.to_string(),
		serde_json::Value::Bool(b) => b.to_string(),
		_ => serde_json::to_string(value).unwrap_or_default(),
	}
}

pub struct RedisStorage {
	client: OnceCell<Arc<ConnectionManager>>,
	redis_url: String,
	timeout_ms: u64,
	key_prefix: String,
	ttl_config: TtlConfig,
}

impl RedisStorage {
	pub fn new(
		redis_url: String,
		timeout_ms: u64,
		key_prefix: String,
		ttl_config: TtlConfig,
	) -> Result<Self, StorageError> {
		if key_prefix.is_empty() {
			return Err(StorageError::Configuration(
				"Redis key prefix cannot be empty".to_string(),
			));
		}
		if redis_url.is_empty() {
			return Err(StorageError::Configuration(
				"Redis URL cannot be empty".to_string(),
			));
		}
		Ok(Self {
			client: OnceCell::new(),
			redis_url,
			timeout_ms,
			key_prefix,
			ttl_config,
		})
	}

	async fn connection(&self) -> Result<ConnectionManager, StorageError> {
		let manager = self
			.client
			.get_or_try_init(|| async {
				initialize_redis_connection(&self.redis_url, self.timeout_ms).await
			})
			.await?;
		Ok(manager.as_ref().clone())
	}

	fn data_key(&self, key: &str) -> String {
		format!("{}:{}", self.key_prefix, key)
	}

	fn fields_key(&self, key: &str) -> String {
		format!("{}:{}:{}", self.key_prefix, key, FIELDS_SUFFIX)
	}

	fn slots_key(&self, key: &str) -> String {
		format!("{}:{}:{}", self.key_prefix, key, SLOTS_SUFFIX)
	}

	fn all_ids_key(&self, namespace: &str) -> String {
		format!("{}:{}:{}", self.key_prefix, namespace, ALL_IDS_SUFFIX)
	}

	fn index_key(&self, namespace: &str, field: &str, value: &serde_json::Value) -> String {
		format!(
			"{}:{}:{}:{}:{}",
			self.key_prefix,
			namespace,
			INDEX_SUFFIX,
			field,
			index_value(value)
		)
	}

	fn ttl_for_key(&self, key: &str) -> Option<Duration> {
		namespace_of(key)
			.parse::<StorageKey>()
			.ok()
			.and_then(|sk| self.ttl_config.get_ttl(sk))
	}

	fn map_redis_error(&self, error: RedisError, context: &str) -> StorageError {
		warn!(context = %context, error = %error, "redis operation failed");
		match error.kind() {
			redis::ErrorKind::AuthenticationFailed => {
				StorageError::Backend("Redis authentication failed".to_string())
			},
			redis::ErrorKind::IoError => StorageError::Backend(format!(
				"Redis connection error in operation '{}': {}",
				context, error
			)),
			_ => StorageError::Backend(format!("Redis operation '{}' failed: {}", context, error)),
		}
	}

	/// Index fields currently recorded for a key.
	async fn stored_fields(
		&self,
		conn: &mut ConnectionManager,
		key: &str,
	) -> Result<HashMap<String, serde_json::Value>, StorageError> {
		let raw: HashMap<String, String> = conn
			.hgetall(self.fields_key(key))
			.await
			.map_err(|e| self.map_redis_error(e, "stored_fields"))?;
		Ok(raw
			.into_iter()
			.filter_map(|(field, json)| serde_json::from_str(&json).ok().map(|v| (field, v)))
			.collect())
	}

	fn write_plan(
		&self,
		key: &str,
		mode: WriteMode<'_>,
		value: Vec<u8>,
		indexes: Option<&StorageIndexes>,
		ttl: Option<Duration>,
	) -> WritePlan {
		let namespace = namespace_of(key);
		let mut keys = vec![
			self.data_key(key),
			self.fields_key(key),
			self.slots_key(key),
			self.all_ids_key(namespace),
		];
		let (mode, expected): (&str, &[u8]) = match mode {
			WriteMode::Overwrite => ("set", &[]),
			WriteMode::IfAbsent => ("nx", &[]),
			WriteMode::Swap(expected) => ("cas", expected),
		};
		let ttl_secs = ttl.map(|t| t.as_secs()).unwrap_or(0);
		let mut args = vec![
			mode.as_bytes().to_vec(),
			expected.to_vec(),
			value,
			ttl_secs.to_string().into_bytes(),
			key.as_bytes().to_vec(),
			if indexes.is_some() { b"1".to_vec() } else { b"0".to_vec() },
		];
		if let Some(indexes) = indexes {
			for (field, value) in &indexes.fields {
				keys.push(self.index_key(namespace, field, value));
				args.push(field.as_bytes().to_vec());
				args.push(value.to_string().into_bytes());
			}
		}
		WritePlan { keys, args }
	}

	/// Runs [`WRITE_SCRIPT`] for `key`.
	async fn write(
		&self,
		key: &str,
		mode: WriteMode<'_>,
		value: Vec<u8>,
		indexes: Option<&StorageIndexes>,
		ttl: Option<Duration>,
	) -> Result<i64, StorageError> {
		let plan = self.write_plan(key, mode, value, indexes, ttl);
		let mut conn = self.connection().await?;
		let script = redis::Script::new(WRITE_SCRIPT);
		let mut invocation = script.prepare_invoke();
		for redis_key in &plan.keys {
			invocation.key(redis_key);
		}
		for arg in &plan.args {
			invocation.arg(arg.as_slice());
		}
		let result: i64 = invocation
			.invoke_async(&mut conn)
			.await
			.map_err(|e| self.map_redis_error(e, "write"))?;
		if result == 1 && indexes.is_some() {
			debug!(key = %key, namespace = %namespace_of(key), "updated indexes");
		}
		Ok(result)
	}

	/// Runs [`DELETE_SCRIPT`] for `key`.
	async fn remove(&self, key: &str, only_expired: bool) -> Result<i64, StorageError> {
		let mut conn = self.connection().await?;
		redis::Script::new(DELETE_SCRIPT)
			.key(self.data_key(key))
			.key(self.fields_key(key))
			.key(self.slots_key(key))
			.key(self.all_ids_key(namespace_of(key)))
			.arg(key)
			.arg(if only_expired { "expired" } else { "all" })
			.invoke_async(&mut conn)
			.await
			.map_err(|e| self.map_redis_error(e, "delete"))
	}

	async fn members(
		&self,
		conn: &mut ConnectionManager,
		set_key: &str,
	) -> Result<HashSet<String>, StorageError> {
		conn.smembers(set_key)
			.await
			.map_err(|e| self.map_redis_error(e, "smembers"))
	}

	/// Keys worth evaluating for `filter`, narrowed by an equality index when
	/// one is available.
	async fn candidates(
		&self,
		conn: &mut ConnectionManager,
		namespace: &str,
		filter: &QueryFilter,
	) -> Result<HashSet<String>, StorageError> {
		match filter {
			QueryFilter::Equals(field, value) => {
				self.members(conn, &self.index_key(namespace, field, value))
					.await
			},
			QueryFilter::In(field, values) => {
				let mut keys = HashSet::new();
				for value in values {
					keys.extend(
						self.members(conn, &self.index_key(namespace, field, value))
							.await?,
					);
				}
				Ok(keys)
			},
			QueryFilter::And(filters) => {
				match filters
					.iter()
					.find(|f| matches!(f, QueryFilter::Equals(..) | QueryFilter::In(..)))
				{
					Some(narrowing) => Box::pin(self.candidates(conn, namespace, narrowing)).await,
					None => self.members(conn, &self.all_ids_key(namespace)).await,
				}
			},
			_ => self.members(conn, &self.all_ids_key(namespace)).await,
		}
	}
}

impl std::fmt::Debug for RedisStorage {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RedisStorage")
			.field("redis_url", &redact_url_credentials(&self.redis_url))
			.field("key_prefix", &self.key_prefix)
			.field("connected", &self.client.initialized())
			.finish()
	}
}

#[async_trait]
impl StorageInterface for RedisStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		let mut conn = self.connection().await?;
		let result: Option<Vec<u8>> = conn
			.get(self.data_key(key))
			.await
			.map_err(|e| self.map_redis_error(e, "get_bytes"))?;
		result.ok_or_else(|| StorageError::NotFound(key.to_string()))
	}

	async fn set_bytes(
		&self,
		key: &str,
		value: Vec<u8>,
		indexes: Option<StorageIndexes>,
		ttl: Option<Duration>,
	) -> Result<(), StorageError> {
		let effective_ttl = ttl.or_else(|| self.ttl_for_key(key));
		self.write(
			key,
			WriteMode::Overwrite,
			value,
			indexes.as_ref(),
			effective_ttl,
		)
		.await?;
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		self.delete_if_exists(key).await.map(|_| ())
	}

	async fn exists(&self, key: &str) -> Result<bool, StorageError> {
		let mut conn = self.connection().await?;
		conn.exists(self.data_key(key))
			.await
			.map_err(|e| self.map_redis_error(e, "exists"))
	}

	async fn query(
		&self,
		namespace: &str,
		filter: QueryFilter,
	) -> Result<Vec<String>, StorageError> {
		let mut conn = self.connection().await?;
		let candidates = self.candidates(&mut conn, namespace, &filter).await?;
		let needs_fields = !matches!(
			filter,
			QueryFilter::All | QueryFilter::Equals(..) | QueryFilter::In(..)
		);

		let mut keys = Vec::with_capacity(candidates.len());
		for key in candidates {
			// Index sets can outlive values that expired.
			if !self.exists(&key).await? {
				continue;
			}
			if needs_fields {
				let fields = self.stored_fields(&mut conn, &key).await?;
				if !filter.matches(&fields) {
					continue;
				}
			}
			keys.push(key);
		}
		keys.sort();

		debug!(namespace = %namespace, count = keys.len(), "query returned keys");
		Ok(keys)
	}

	async fn get_batch(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
		if keys.is_empty() {
			return Ok(Vec::new());
		}
		let mut conn = self.connection().await?;
		let redis_keys: Vec<String> = keys.iter().map(|k| self.data_key(k)).collect();
		let values: Vec<Option<Vec<u8>>> = conn
			.mget(&redis_keys)
			.await
			.map_err(|e| self.map_redis_error(e, "get_batch"))?;

		Ok(keys
			.iter()
			.zip(values)
			.filter_map(|(key, value)| value.map(|data| (key.clone(), data)))
			.collect())
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(RedisStorageSchema)
	}

	/// Values expire natively; this drops index entries left behind by them.
	async fn cleanup_expired(&self) -> Result<usize, StorageError> {
		let mut conn = self.connection().await?;
		let mut removed = 0;
		for storage_key in StorageKey::all() {
			let all_key = self.all_ids_key(storage_key.as_str());
			for key in self.members(&mut conn, &all_key).await? {
				if !self.exists(&key).await? && self.remove(&key, true).await? >= 0 {
					removed += 1;
				}
			}
		}
		if removed > 0 {
			debug!(removed, "dropped stale index entries");
		}
		Ok(removed)
	}

	async fn set_nx(
		&self,
		key: &str,
		value: Vec<u8>,
		indexes: Option<StorageIndexes>,
		ttl: Option<Duration>,
	) -> Result<bool, StorageError> {
		let effective_ttl = ttl.or_else(|| self.ttl_for_key(key));
		let written = self
			.write(key, WriteMode::IfAbsent, value, indexes.as_ref(), effective_ttl)
			.await?;
		Ok(written == 1)
	}

	async fn compare_and_swap(
		&self,
		key: &str,
		expected: &[u8],
		new_value: Vec<u8>,
		indexes: Option<StorageIndexes>,
		ttl: Option<Duration>,
	) -> Result<bool, StorageError> {
		match self
			.write(key, WriteMode::Swap(expected), new_value, indexes.as_ref(), ttl)
			.await?
		{
			1 => Ok(true),
			-1 => Err(StorageError::NotFound(key.to_string())),
			_ => Ok(false),
		}
	}

	async fn delete_if_exists(&self, key: &str) -> Result<bool, StorageError> {
		Ok(self.remove(key, false).await? > 0)
	}
}

pub struct RedisStorageSchema;

impl ConfigSchema for RedisStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let mut optional_fields = vec![
			Field::new("key_prefix", FieldType::String),
			Field::new(
				"connection_timeout_ms",
				FieldType::Integer {
					min: Some(100),
					max: Some(60000),
				},
			),
			Field::new(
				"db",
				FieldType::Integer {
					min: Some(0),
					max: Some(15),
				},
			),
		];
		for storage_key in StorageKey::all() {
			optional_fields.push(Field::new(
				format!("ttl_{}", storage_key.as_str()),
				FieldType::Integer {
					min: Some(0),
					max: None,
				},
			));
		}

		Schema::new(
			vec![Field::new("redis_url", FieldType::String)],
			optional_fields,
		)
		.validate(config)
	}
}

/// Opens a connection manager, failing after `timeout_ms`.
pub async fn initialize_redis_connection(
	redis_url: &str,
	timeout_ms: u64,
) -> Result<Arc<ConnectionManager>, StorageError> {
	let redis_client = redis::Client::open(redis_url).map_err(|e| {
		StorageError::Configuration(format!("Failed to create Redis client: {}", e))
	})?;

	let connection_manager = timeout(
		Duration::from_millis(timeout_ms),
		ConnectionManager::new(redis_client),
	)
	.await
	.map_err(|_| StorageError::Backend(format!("Redis connection timeout after {}ms", timeout_ms)))?
	.map_err(|e| StorageError::Backend(format!("Failed to create connection manager: {}", e)))?;

	debug!(redis_url = %redact_url_credentials(redis_url), "redis connection established");
	Ok(Arc::new(connection_manager))
}

/// Appends the database number unless the URL already names one.
fn url_with_db(redis_url: &str, db: u8) -> String {
	let has_db = redis_url
		.rsplit_once('/')
		.map(|(head, tail)| !head.ends_with('/') && tail.parse::<u8>().is_ok())
		.unwrap_or(false);
	if has_db {
		redis_url.to_string()
	} else {
		format!("{}/{}", redis_url.trim_end_matches('/'), db)
	}
}

/// Builds a lazily connecting backend from its configuration section.
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	RedisStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(format!("Invalid configuration: {}", e)))?;

	let redis_url = config
		.get("redis_url")
		.and_then(|v| v.as_str())
		.ok_or_else(|| StorageError::Configuration("redis_url is required".to_string()))?;
	let key_prefix = config
		.get("key_prefix")
		.and_then(|v| v.as_str())
		.unwrap_or(DEFAULT_KEY_PREFIX)
		.to_string();
	let timeout_ms = config
		.get("connection_timeout_ms")
		.and_then(|v| v.as_integer())
		.map(|v| v as u64)
		.unwrap_or(DEFAULT_CONNECTION_TIMEOUT_MS);
	let db = config
		.get("db")
		.and_then(|v| v.as_integer())
		.map(|v| v as u8)
		.unwrap_or(0);

	Ok(Box::new(RedisStorage::new(
		url_with_db(redis_url, db),
		timeout_ms,
		key_prefix,
		TtlConfig::from_config(config),
	)?))
}

pub struct Registry;

impl lottery_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "redis";
	type Factory = crate::StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl crate::StorageRegistry for Registry {}
