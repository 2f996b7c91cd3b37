//! Which user owns which wallet on which chain.
//!
//! Wallets are linked and verified by an external workflow; the orchestrator
//! only reads the outcome.

use alloy_primitives::Address;
use async_trait::async_trait;
use lottery_storage::{QueryFilter, StorageError, StorageIndexes, StorageService};
use lottery_types::{StorageKey, Wallet, WalletOwner};
use serde_json::json;
use std::sync::Arc;

use crate::store::address_key;

#[async_trait]
pub trait WalletDirectory: Send + Sync {
	/// Owner of `address` on `chain_id`. Verified wallets win over
	/// unverified ones registered for the same address.
	async fn resolve(
		&self,
		address: Address,
		chain_id: u64,
	) -> Result<Option<WalletOwner>, StorageError>;

	/// The user's oldest verified wallet on `chain_id`.
	async fn verified_wallet(
		&self,
		user_id: &str,
		chain_id: u64,
	) -> Result<Option<Wallet>, StorageError>;
}

/// Directory backed by the `wallets` namespace of the canonical store.
pub struct StoredWalletDirectory {
	storage: Arc<StorageService>,
}

fn wallet_indexes(wallet: &Wallet) -> StorageIndexes {
	StorageIndexes::new()
		.with_field("address", address_key(&wallet.address))
		.with_field("chain_id", wallet.chain_id)
		.with_field("user_id", &wallet.user_id)
		.with_field("verified", wallet.verified)
}

impl StoredWalletDirectory {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	/// Inserts or replaces a wallet.
	pub async fn register(&self, wallet: &Wallet) -> Result<(), StorageError> {
		self.storage
			.store(
				StorageKey::Wallets.as_str(),
				&wallet.id,
				wallet,
				Some(wallet_indexes(wallet)),
			)
			.await
	}

	async fn find(&self, filter: QueryFilter) -> Result<Vec<Wallet>, StorageError> {
		let mut wallets: Vec<Wallet> = self
			.storage
			.query(StorageKey::Wallets.as_str(), filter)
			.await?
			.into_iter()
			.map(|(_, wallet)| wallet)
			.collect();
		wallets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
		Ok(wallets)
	}
}

#[async_trait]
impl WalletDirectory for StoredWalletDirectory {
	async fn resolve(
		&self,
		address: Address,
		chain_id: u64,
	) -> Result<Option<WalletOwner>, StorageError> {
		let wallets = self
			.find(QueryFilter::And(vec![
				QueryFilter::Equals("address".into(), json!(address_key(&address))),
				QueryFilter::Equals("chain_id".into(), json!(chain_id)),
			]))
			.await?;
		let wallet = wallets
			.iter()
			.find(|w| w.verified)
			.or_else(|| wallets.first());
		Ok(wallet.map(WalletOwner::from))
	}

	async fn verified_wallet(
		&self,
		user_id: &str,
		chain_id: u64,
	) -> Result<Option<Wallet>, StorageError> {
		Ok(self
			.find(QueryFilter::And(vec![
				QueryFilter::Equals("user_id".into(), json!(user_id)),
				QueryFilter::Equals("chain_id".into(), json!(chain_id)),
				QueryFilter::Equals("verified".into(), json!(true)),
			]))
			.await?
			.into_iter()
			.next())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::memory_storage;

	fn wallet(id: &str, user: &str, address: Address, verified: bool, created_at: u64) -> Wallet {
		Wallet {
			id: id.into(),
			user_id: user.into(),
			address,
			chain_id: 31337,
			verified,
			created_at,
		}
	}

	#[tokio::test]
	async fn test_resolve_prefers_verified_wallet() {
		let directory = StoredWalletDirectory::new(memory_storage());
		let address = Address::repeat_byte(0xb2);
		directory
			.register(&wallet("w-old", "someone", address, false, 1))
			.await
			.unwrap();
		directory
			.register(&wallet("w-new", "owner", address, true, 2))
			.await
			.unwrap();

		let owner = directory.resolve(address, 31337).await.unwrap().unwrap();
		assert_eq!(owner.user_id, "owner");
		assert_eq!(owner.wallet_id, "w-new");
		assert!(directory.resolve(address, 1).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_verified_wallet_skips_unverified() {
		let directory = StoredWalletDirectory::new(memory_storage());
		directory
			.register(&wallet("w1", "user-1", Address::repeat_byte(1), false, 1))
			.await
			.unwrap();
		assert!(directory
			.verified_wallet("user-1", 31337)
			.await
			.unwrap()
			.is_none());

		directory
			.register(&wallet("w2", "user-1", Address::repeat_byte(2), true, 2))
			.await
			.unwrap();
		let found = directory
			.verified_wallet("user-1", 31337)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(found.id, "w2");
	}
}
