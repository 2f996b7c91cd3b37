//! Blockchain access for the orchestrator.
//!
//! A [`ChainInterface`] implementation talks to one or more chains: it deploys
//! lottery contracts through the network's factory, submits purchases and
//! draws, reads contract state and streams decoded contract events. The
//! [`ChainService`] routes every call to the implementation registered for the
//! target chain, resolves [`SigningKeyRef`]s through the key manager and bounds
//! each call with a timeout.

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use lottery_account::{AccountError, AccountSigner, KeyManager};
use lottery_types::{
	truncate_id, ConfigSchema, ContractEvent, DeployParams, DeployReceipt, ImplementationRegistry,
	LotteryDetails, NetworksConfig, PurchaseCheck, SigningKeyRef,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub mod implementations {
	pub mod evm {
		pub mod alloy;
	}
	pub mod mock;
}

#[derive(Debug, Clone, Error)]
pub enum ChainError {
	#[error("Network error: {0}")]
	Network(String),
	#[error("Chain call timed out: {0}")]
	Timeout(String),
	#[error("Transaction failed: {0}")]
	TransactionFailed(String),
	#[error("Insufficient funds: {0}")]
	InsufficientFunds(String),
	#[error("No provider configured for chain {0}")]
	NoProviderForChain(u64),
	#[error("Invalid response: {0}")]
	InvalidResponse(String),
	#[error("Signing error: {0}")]
	Signing(String),
	#[error("Configuration error: {0}")]
	Configuration(String),
}

impl ChainError {
	/// Whether retrying the same call later may succeed.
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::Network(_) | Self::Timeout(_))
	}

	/// Maps a provider or RPC error onto a variant by its message.
	pub fn from_rpc(context: &str, err: impl std::fmt::Display) -> Self {
		let message = format!("{}: {}", context, err);
		let lower = message.to_lowercase();
		if lower.contains("insufficient funds")
			|| lower.contains("exceeds balance")
			|| lower.contains("insufficient allowance")
		{
			Self::InsufficientFunds(message)
		} else if lower.contains("revert") {
			Self::TransactionFailed(message)
		} else {
			Self::Network(message)
		}
	}
}

impl From<AccountError> for ChainError {
	fn from(err: AccountError) -> Self {
		Self::Signing(err.to_string())
	}
}

/// Receiving side of a contract event stream.
pub type EventSink = mpsc::UnboundedSender<ContractEvent>;

/// Live event stream for one contract.
///
/// Dropping the subscription or calling [`Subscription::unsubscribe`] stops
/// the background task feeding the sink.
#[derive(Debug)]
pub struct Subscription {
	stop: Option<oneshot::Sender<()>>,
	handle: JoinHandle<()>,
}

impl Subscription {
	pub fn new(stop: oneshot::Sender<()>, handle: JoinHandle<()>) -> Self {
		Self {
			stop: Some(stop),
			handle,
		}
	}

	pub fn is_active(&self) -> bool {
		self.stop.is_some() && !self.handle.is_finished()
	}

	pub fn unsubscribe(mut self) {
		self.signal_stop();
	}

	fn signal_stop(&mut self) {
		if let Some(stop) = self.stop.take() {
			let _ = stop.send(());
		}
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		self.signal_stop();
	}
}

/// Operations the orchestrator performs against lottery contracts.
///
/// Write operations receive an already resolved signer; implementations never
/// see key references or key material through any other path.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ChainInterface: Send + Sync {
	fn config_schema(&self) -> Box<dyn ConfigSchema>;

	/// Chains served by this implementation.
	fn chain_ids(&self) -> Vec<u64>;

	/// Creates a lottery contract through the chain's factory and waits for
	/// the creation receipt.
	async fn deploy_lottery(
		&self,
		params: DeployParams,
		signer: AccountSigner,
	) -> Result<DeployReceipt, ChainError>;

	/// Submits a purchase of `quantity` tickets for `buyer`.
	async fn buy_tickets(
		&self,
		contract: Address,
		chain_id: u64,
		quantity: u64,
		buyer: Address,
		signer: AccountSigner,
	) -> Result<B256, ChainError>;

	/// Dry-run purchase check. Failures are reported as a denial.
	async fn can_buy_tickets(
		&self,
		contract: Address,
		chain_id: u64,
		buyer: Address,
		quantity: u64,
	) -> PurchaseCheck;

	/// Submits the draw request.
	async fn draw(
		&self,
		contract: Address,
		chain_id: u64,
		signer: AccountSigner,
	) -> Result<B256, ChainError>;

	async fn get_lottery_details(
		&self,
		contract: Address,
		chain_id: u64,
	) -> Result<LotteryDetails, ChainError>;

	/// Streams every decoded event of `contract` into `sink`.
	async fn watch(
		&self,
		contract: Address,
		chain_id: u64,
		sink: EventSink,
	) -> Result<Subscription, ChainError>;
}

pub type ChainFactory =
	fn(&toml::Value, &NetworksConfig) -> Result<Box<dyn ChainInterface>, ChainError>;

pub trait ChainRegistry: ImplementationRegistry<Factory = ChainFactory> {}

pub fn get_all_implementations() -> Vec<(&'static str, ChainFactory)> {
	use implementations::{evm::alloy, mock};

	vec![
		(alloy::Registry::NAME, alloy::Registry::factory()),
		(mock::Registry::NAME, mock::Registry::factory()),
	]
}

/// Routes chain operations by chain id.
pub struct ChainService {
	implementations: HashMap<u64, Arc<dyn ChainInterface>>,
	keys: Arc<KeyManager>,
	call_timeout: Duration,
}

impl ChainService {
	pub fn new(
		implementations: HashMap<u64, Arc<dyn ChainInterface>>,
		keys: Arc<KeyManager>,
		call_timeout: Duration,
	) -> Self {
		Self {
			implementations,
			keys,
			call_timeout,
		}
	}

	/// Registers `implementation` for every chain it reports.
	pub fn from_implementations(
		implementations: Vec<Arc<dyn ChainInterface>>,
		keys: Arc<KeyManager>,
		call_timeout: Duration,
	) -> Self {
		let mut by_chain = HashMap::new();
		for implementation in implementations {
			for chain_id in implementation.chain_ids() {
				by_chain.insert(chain_id, implementation.clone());
			}
		}
		Self::new(by_chain, keys, call_timeout)
	}

	pub fn chain_ids(&self) -> Vec<u64> {
		let mut ids: Vec<u64> = self.implementations.keys().copied().collect();
		ids.sort_unstable();
		ids
	}

	pub fn supports(&self, chain_id: u64) -> bool {
		self.implementations.contains_key(&chain_id)
	}

	fn implementation(&self, chain_id: u64) -> Result<&Arc<dyn ChainInterface>, ChainError> {
		self.implementations
			.get(&chain_id)
			.ok_or(ChainError::NoProviderForChain(chain_id))
	}

	async fn signer(&self, key: &SigningKeyRef, chain_id: u64) -> Result<AccountSigner, ChainError> {
		Ok(self.keys.resolve(key).await?.with_chain_id(Some(chain_id)))
	}

	/// Address the referenced key signs as.
	pub async fn address_of(&self, key: &SigningKeyRef) -> Result<Address, ChainError> {
		Ok(self.keys.address_of(key).await?)
	}

	async fn bounded<T>(
		&self,
		operation: &str,
		call: impl Future<Output = Result<T, ChainError>>,
	) -> Result<T, ChainError> {
		match tokio::time::timeout(self.call_timeout, call).await {
			Ok(result) => result,
			Err(_) => Err(ChainError::Timeout(format!(
				"{} exceeded {}s",
				operation,
				self.call_timeout.as_secs()
			))),
		}
	}

	pub async fn deploy_lottery(
		&self,
		params: DeployParams,
		key: &SigningKeyRef,
	) -> Result<DeployReceipt, ChainError> {
		let implementation = self.implementation(params.chain_id)?;
		let signer = self.signer(key, params.chain_id).await?;
		tracing::debug!(chain_id = params.chain_id, key = %key, "Deploying lottery contract");
		self.bounded("deploy_lottery", implementation.deploy_lottery(params, signer))
			.await
	}

	pub async fn buy_tickets(
		&self,
		contract: Address,
		chain_id: u64,
		quantity: u64,
		buyer: Address,
		key: &SigningKeyRef,
	) -> Result<B256, ChainError> {
		let implementation = self.implementation(chain_id)?;
		let signer = self.signer(key, chain_id).await?;
		self.bounded(
			"buy_tickets",
			implementation.buy_tickets(contract, chain_id, quantity, buyer, signer),
		)
		.await
	}

	pub async fn can_buy_tickets(
		&self,
		contract: Address,
		chain_id: u64,
		buyer: Address,
		quantity: u64,
	) -> PurchaseCheck {
		let Ok(implementation) = self.implementation(chain_id) else {
			return PurchaseCheck::denied(format!("No provider configured for chain {}", chain_id));
		};
		let check = implementation.can_buy_tickets(contract, chain_id, buyer, quantity);
		match tokio::time::timeout(self.call_timeout, check).await {
			Ok(check) => check,
			Err(_) => PurchaseCheck::denied("Purchase check timed out"),
		}
	}

	pub async fn draw(
		&self,
		contract: Address,
		chain_id: u64,
		key: &SigningKeyRef,
	) -> Result<B256, ChainError> {
		let implementation = self.implementation(chain_id)?;
		let signer = self.signer(key, chain_id).await?;
		let tx_hash = self
			.bounded("draw", implementation.draw(contract, chain_id, signer))
			.await?;
		tracing::debug!(
			contract = %contract,
			tx_hash = %truncate_id(&tx_hash.to_string()),
			"Draw submitted"
		);
		Ok(tx_hash)
	}

	pub async fn get_lottery_details(
		&self,
		contract: Address,
		chain_id: u64,
	) -> Result<LotteryDetails, ChainError> {
		let implementation = self.implementation(chain_id)?;
		self.bounded(
			"get_lottery_details",
			implementation.get_lottery_details(contract, chain_id),
		)
		.await
	}

	pub async fn watch(
		&self,
		contract: Address,
		chain_id: u64,
		sink: EventSink,
	) -> Result<Subscription, ChainError> {
		let implementation = self.implementation(chain_id)?;
		self.bounded("watch", implementation.watch(contract, chain_id, sink))
			.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use lottery_account::implementations::local::create_key_store;

	const ANVIL_KEY_0: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

	fn key_manager() -> Arc<KeyManager> {
		let config: toml::Value =
			toml::from_str(&format!("[keys]\noperator = \"{}\"\n", ANVIL_KEY_0)).unwrap();
		Arc::new(KeyManager::new(create_key_store(&config).unwrap()))
	}

	#[test]
	fn test_transient_classification() {
		assert!(ChainError::Network("reset".into()).is_transient());
		assert!(ChainError::Timeout("slow".into()).is_transient());
		assert!(!ChainError::InsufficientFunds("poor".into()).is_transient());
		assert!(!ChainError::TransactionFailed("revert".into()).is_transient());
		assert!(!ChainError::NoProviderForChain(1).is_transient());
		assert!(!ChainError::Signing("key".into()).is_transient());
	}

	#[test]
	fn test_from_rpc_classification() {
		assert!(matches!(
			ChainError::from_rpc("send", "insufficient funds for gas * price + value"),
			ChainError::InsufficientFunds(_)
		));
		assert!(matches!(
			ChainError::from_rpc("send", "execution reverted: sold out"),
			ChainError::TransactionFailed(_)
		));
		assert!(matches!(
			ChainError::from_rpc("send", "connection refused"),
			ChainError::Network(_)
		));
	}

	#[tokio::test]
	async fn test_missing_chain_is_reported() {
		let service = ChainService::new(HashMap::new(), key_manager(), Duration::from_secs(5));
		let err = service
			.draw(Address::ZERO, 8453, &SigningKeyRef::new("operator"))
			.await
			.unwrap_err();
		assert!(matches!(err, ChainError::NoProviderForChain(8453)));

		let check = service
			.can_buy_tickets(Address::ZERO, 8453, Address::ZERO, 1)
			.await;
		assert!(!check.can_buy);
	}

	#[tokio::test]
	async fn test_unknown_key_is_signing_error() {
		let mut mock = MockChainInterface::new();
		mock.expect_chain_ids().return_const(vec![31337u64]);
		mock.expect_draw().never();
		let service = ChainService::from_implementations(
			vec![Arc::new(mock)],
			key_manager(),
			Duration::from_secs(5),
		);
		let err = service
			.draw(Address::ZERO, 31337, &SigningKeyRef::new("missing"))
			.await
			.unwrap_err();
		assert!(matches!(err, ChainError::Signing(_)));
		assert!(!err.is_transient());
	}

	#[tokio::test]
	async fn test_resolved_signer_reaches_implementation() {
		let mut mock = MockChainInterface::new();
		mock.expect_chain_ids().return_const(vec![31337u64]);
		mock.expect_draw()
			.withf(|_, chain_id, signer| {
				*chain_id == 31337
					&& format!("{:?}", signer.address()).to_lowercase()
						== "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
			})
			.times(1)
			.returning(|_, _, _| Ok(B256::repeat_byte(7)));
		let service = ChainService::from_implementations(
			vec![Arc::new(mock)],
			key_manager(),
			Duration::from_secs(5),
		);
		let tx = service
			.draw(Address::ZERO, 31337, &SigningKeyRef::new("operator"))
			.await
			.unwrap();
		assert_eq!(tx, B256::repeat_byte(7));
	}

	#[tokio::test(start_paused = true)]
	async fn test_slow_call_times_out() {
		let mut mock = MockChainInterface::new();
		mock.expect_chain_ids().return_const(vec![31337u64]);
		mock.expect_get_lottery_details().returning(|_, _| {
			Err(ChainError::InvalidResponse("unused".into()))
		});
		let service = ChainService::from_implementations(
			vec![Arc::new(SlowChain(mock))],
			key_manager(),
			Duration::from_secs(1),
		);
		let err = service
			.get_lottery_details(Address::ZERO, 31337)
			.await
			.unwrap_err();
		assert!(matches!(err, ChainError::Timeout(_)));
		assert!(err.is_transient());
	}

	struct SlowChain(MockChainInterface);

	#[async_trait]
	impl ChainInterface for SlowChain {
		fn config_schema(&self) -> Box<dyn ConfigSchema> {
			self.0.config_schema()
		}
		fn chain_ids(&self) -> Vec<u64> {
			self.0.chain_ids()
		}
		async fn deploy_lottery(
			&self,
			params: DeployParams,
			signer: AccountSigner,
		) -> Result<DeployReceipt, ChainError> {
			self.0.deploy_lottery(params, signer).await
		}
		async fn buy_tickets(
			&self,
			contract: Address,
			chain_id: u64,
			quantity: u64,
			buyer: Address,
			signer: AccountSigner,
		) -> Result<B256, ChainError> {
			self.0
				.buy_tickets(contract, chain_id, quantity, buyer, signer)
				.await
		}
		async fn can_buy_tickets(
			&self,
			contract: Address,
			chain_id: u64,
			buyer: Address,
			quantity: u64,
		) -> PurchaseCheck {
			self.0
				.can_buy_tickets(contract, chain_id, buyer, quantity)
				.await
		}
		async fn draw(
			&self,
			contract: Address,
			chain_id: u64,
			signer: AccountSigner,
		) -> Result<B256, ChainError> {
			self.0.draw(contract, chain_id, signer).await
		}
		async fn get_lottery_details(
			&self,
			contract: Address,
			chain_id: u64,
		) -> Result<LotteryDetails, ChainError> {
			tokio::time::sleep(Duration::from_secs(30)).await;
			self.0.get_lottery_details(contract, chain_id).await
		}
		async fn watch(
			&self,
			contract: Address,
			chain_id: u64,
			sink: EventSink,
		) -> Result<Subscription, ChainError> {
			self.0.watch(contract, chain_id, sink).await
		}
	}
}
