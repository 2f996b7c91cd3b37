//! Signer handed to the chain layer for one submission.

use alloy_consensus::SignableTransaction;
use alloy_network::TxSigner;
use alloy_primitives::{Address, Signature};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;

/// Signing backend behind a resolved key reference.
#[derive(Clone)]
pub enum AccountSigner {
	Local(PrivateKeySigner),
}

impl AccountSigner {
	pub fn address(&self) -> Address {
		match self {
			Self::Local(s) => Signer::address(s),
		}
	}

	pub fn with_chain_id(self, chain_id: Option<u64>) -> Self {
		match self {
			Self::Local(s) => Self::Local(Signer::with_chain_id(s, chain_id)),
		}
	}
}

// Lets `EthereumWallet::from(signer)` accept any backend.
#[async_trait]
impl TxSigner<Signature> for AccountSigner {
	fn address(&self) -> Address {
		AccountSigner::address(self)
	}

	async fn sign_transaction(
		&self,
		tx: &mut dyn SignableTransaction<Signature>,
	) -> alloy_signer::Result<Signature> {
		match self {
			Self::Local(s) => TxSigner::sign_transaction(s, tx).await,
		}
	}
}

impl std::fmt::Debug for AccountSigner {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Local(s) => f
				.debug_struct("AccountSigner::Local")
				.field("address", &Signer::address(s))
				.finish_non_exhaustive(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const TEST_PRIVATE_KEY: &str =
		"0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

	fn signer() -> AccountSigner {
		AccountSigner::Local(TEST_PRIVATE_KEY.parse().unwrap())
	}

	#[test]
	fn test_address() {
		assert_eq!(
			format!("{:?}", signer().address()).to_lowercase(),
			"0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
		);
	}

	#[test]
	fn test_debug_hides_key() {
		let debug = format!("{:?}", signer());
		assert!(debug.contains("AccountSigner::Local"));
		assert!(!debug.contains("ac0974bec39a17e3"));
	}

	#[test]
	fn test_tx_signer_address_matches() {
		let s = signer();
		assert_eq!(TxSigner::address(&s), s.address());
	}
}
