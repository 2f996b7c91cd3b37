//! Private keys read from configuration.
//!
//! ```toml
//! [account.implementations.local.keys]
//! operator = "${OPERATOR_PRIVATE_KEY}"
//! creator-default = "${CREATOR_PRIVATE_KEY}"
//! ```

use crate::{AccountError, AccountSigner, KeyStoreInterface};
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use lottery_types::{
	utils::without_0x_prefix, ConfigSchema, Field, FieldType, Schema, SecretString,
	ValidationError,
};
use std::collections::HashMap;

fn check_private_key(key: &str) -> Result<(), String> {
	let hex_part = without_0x_prefix(key);
	if hex_part.len() != 64 {
		return Err("Private key must be 64 hex characters (32 bytes)".to_string());
	}
	if hex::decode(hex_part).is_err() {
		return Err("Private key must be valid hexadecimal".to_string());
	}
	Ok(())
}

/// In-process key store.
pub struct LocalKeyStore {
	keys: HashMap<String, PrivateKeySigner>,
}

impl LocalKeyStore {
	pub fn new(keys: HashMap<String, SecretString>) -> Result<Self, AccountError> {
		let keys = keys
			.into_iter()
			.map(|(id, secret)| {
				secret
					.with_exposed(|hex| hex.parse::<PrivateKeySigner>())
					.map(|signer| (id.clone(), signer))
					.map_err(|e| AccountError::InvalidKey(format!("key '{}': {}", id, e)))
			})
			.collect::<Result<HashMap<_, _>, _>>()?;
		Ok(Self { keys })
	}
}

pub struct LocalKeyStoreSchema;

impl ConfigSchema for LocalKeyStoreSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![Field::new("keys", FieldType::Table(Schema::new(vec![], vec![])))
				.with_validator(|value| {
					let table = value.as_table().ok_or("keys must be a table")?;
					if table.is_empty() {
						return Err("at least one key is required".to_string());
					}
					for (id, key) in table {
						let key = key
							.as_str()
							.ok_or_else(|| format!("key '{}' must be a string", id))?;
						check_private_key(key).map_err(|e| format!("key '{}': {}", id, e))?;
					}
					Ok(())
				})],
			vec![],
		);
		schema.validate(config)
	}
}

#[async_trait]
impl KeyStoreInterface for LocalKeyStore {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(LocalKeyStoreSchema)
	}

	fn key_ids(&self) -> Vec<String> {
		let mut ids: Vec<String> = self.keys.keys().cloned().collect();
		ids.sort();
		ids
	}

	async fn signer(&self, key_id: &str) -> Result<AccountSigner, AccountError> {
		self.keys
			.get(key_id)
			.cloned()
			.map(AccountSigner::Local)
			.ok_or_else(|| AccountError::UnknownKey(key_id.to_string()))
	}
}

pub fn create_key_store(config: &toml::Value) -> Result<Box<dyn KeyStoreInterface>, AccountError> {
	LocalKeyStoreSchema
		.validate(config)
		.map_err(|e| AccountError::InvalidKey(format!("Invalid configuration: {}", e)))?;

	let keys = config
		.get("keys")
		.and_then(|v| v.as_table())
		.map(|table| {
			table
				.iter()
				.filter_map(|(id, v)| v.as_str().map(|s| (id.clone(), SecretString::from(s))))
				.collect()
		})
		.unwrap_or_default();

	Ok(Box::new(LocalKeyStore::new(keys)?))
}

pub struct Registry;

impl lottery_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "local";
	type Factory = crate::KeyStoreFactory;

	fn factory() -> Self::Factory {
		create_key_store
	}
}

impl crate::KeyStoreRegistry for Registry {}
