//! Key management for transaction signing.
//!
//! Requests and queued jobs never carry key material. They name a key with a
//! [`SigningKeyRef`] and the chain layer asks the [`KeyManager`] to turn that
//! reference into an [`AccountSigner`] right before submission.

use alloy_primitives::Address;
use async_trait::async_trait;
use lottery_types::{ConfigSchema, ImplementationRegistry, SigningKeyRef};
use thiserror::Error;

pub mod signer;

pub use signer::AccountSigner;

pub mod implementations {
	pub mod local;
}

#[derive(Debug, Error)]
pub enum AccountError {
	#[error("Signing failed: {0}")]
	SigningFailed(String),
	#[error("Invalid key: {0}")]
	InvalidKey(String),
	#[error("Unknown signing key: {0}")]
	UnknownKey(String),
	#[error("Implementation error: {0}")]
	Implementation(String),
}

/// A backend holding named signing keys.
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait KeyStoreInterface: Send + Sync {
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Ids of every key the store can sign with.
	fn key_ids(&self) -> Vec<String>;

	/// Signer for `key_id`, or `UnknownKey`.
	async fn signer(&self, key_id: &str) -> Result<AccountSigner, AccountError>;
}

pub type KeyStoreFactory = fn(&toml::Value) -> Result<Box<dyn KeyStoreInterface>, AccountError>;

pub trait KeyStoreRegistry: ImplementationRegistry<Factory = KeyStoreFactory> {}

pub fn get_all_implementations() -> Vec<(&'static str, KeyStoreFactory)> {
	use implementations::local;

	vec![(local::Registry::NAME, local::Registry::factory())]
}

/// Resolves key references against the configured key store.
pub struct KeyManager {
	store: Box<dyn KeyStoreInterface>,
}

impl KeyManager {
	pub fn new(store: Box<dyn KeyStoreInterface>) -> Self {
		Self { store }
	}

	pub async fn resolve(&self, key: &SigningKeyRef) -> Result<AccountSigner, AccountError> {
		self.store.signer(key.key_id()).await
	}

	/// Address controlled by the referenced key.
	pub async fn address_of(&self, key: &SigningKeyRef) -> Result<Address, AccountError> {
		Ok(self.resolve(key).await?.address())
	}

	pub fn contains(&self, key: &SigningKeyRef) -> bool {
		self.store.key_ids().iter().any(|id| id == key.key_id())
	}
}
