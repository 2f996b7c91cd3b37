//! Wallets linked to users by the external verification workflow.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
	pub id: String,
	pub user_id: String,
	pub address: Address,
	pub chain_id: u64,
	/// Set once the owner proved control of the address.
	pub verified: bool,
	pub created_at: u64,
}

/// Who owns an on-chain address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletOwner {
	pub wallet_id: String,
	pub user_id: String,
}

impl From<&Wallet> for WalletOwner {
	fn from(wallet: &Wallet) -> Self {
		Self {
			wallet_id: wallet.id.clone(),
			user_id: wallet.user_id.clone(),
		}
	}
}
