//! In-process chain used by tests and by nodes running without an RPC endpoint.
//!
//! Contract addresses and transaction hashes are derived from a counter, reads
//! always succeed, and tests drive reconciliation by emitting events into the
//! registered watchers. With `auto_confirm` enabled the mock emits the purchase
//! and draw-completion events itself after each submission.

use crate::{ChainError, ChainInterface, EventSink, Subscription};
use alloy_primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use lottery_account::AccountSigner;
use lottery_types::{
	ConfigSchema, ContractEvent, DeployParams, DeployReceipt, EventArg, Field,
	FieldType, LotteryDetails, NetworksConfig, PurchaseCheck, Schema, ValidationError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

/// Event names emitted by the mock's lottery contracts.
pub const TICKETS_PURCHASED: &str = "TicketsPurchased";
pub const DRAW_COMPLETED: &str = "DrawCompleted";

/// Operation a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
	Deploy,
	Buy,
	PurchaseCheck,
	Draw,
}

#[derive(Debug, Clone)]
struct MockContract {
	details: LotteryDetails,
	ranks: usize,
}

#[derive(Default)]
struct MockState {
	nonce: u64,
	block: u64,
	contracts: HashMap<Address, MockContract>,
	watchers: HashMap<Address, Vec<EventSink>>,
	failures: HashMap<MockOperation, VecDeque<ChainError>>,
	calls: HashMap<MockOperation, usize>,
}

impl MockState {
	fn next_hash(&mut self, domain: &str) -> B256 {
		self.nonce += 1;
		keccak256(format!("{}:{}", domain, self.nonce))
	}

	fn record(&mut self, operation: MockOperation) -> Result<(), ChainError> {
		*self.calls.entry(operation).or_default() += 1;
		match self.failures.get_mut(&operation).and_then(|q| q.pop_front()) {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	fn dispatch(&mut self, event: ContractEvent) {
		if let Some(sinks) = self.watchers.get_mut(&event.contract_address) {
			sinks.retain(|sink| sink.send(event.clone()).is_ok());
		}
	}

	fn build_event(
		&mut self,
		contract: Address,
		name: &str,
		args: Vec<EventArg>,
		tx_hash: B256,
	) -> ContractEvent {
		self.block += 1;
		ContractEvent {
			contract_address: contract,
			name: name.to_string(),
			args,
			tx_hash,
			block_number: self.block,
			log_index: 0,
		}
	}
}

/// Deterministic stand-in for a lottery-capable chain.
#[derive(Clone)]
pub struct MockChain {
	chain_ids: Vec<u64>,
	auto_confirm: bool,
	state: Arc<Mutex<MockState>>,
}

impl MockChain {
	pub fn new(chain_ids: Vec<u64>, auto_confirm: bool) -> Self {
		Self {
			chain_ids,
			auto_confirm,
			state: Arc::new(Mutex::new(MockState::default())),
		}
	}

	/// Makes the next call to `operation` fail with `error`.
	pub async fn fail_next(&self, operation: MockOperation, error: ChainError) {
		self.state
			.lock()
			.await
			.failures
			.entry(operation)
			.or_default()
			.push_back(error);
	}

	/// Number of calls made to `operation`, failed ones included.
	pub async fn call_count(&self, operation: MockOperation) -> usize {
		self.state
			.lock()
			.await
			.calls
			.get(&operation)
			.copied()
			.unwrap_or(0)
	}

	/// Number of live watchers on `contract`.
	pub async fn watcher_count(&self, contract: Address) -> usize {
		self.state
			.lock()
			.await
			.watchers
			.get(&contract)
			.map(|sinks| sinks.iter().filter(|s| !s.is_closed()).count())
			.unwrap_or(0)
	}

	/// Emits a new event from `contract` with a fresh transaction hash.
	pub async fn emit(&self, contract: Address, name: &str, args: Vec<EventArg>) -> ContractEvent {
		let mut state = self.state.lock().await;
		let tx_hash = state.next_hash("event");
		let event = state.build_event(contract, name, args, tx_hash);
		state.dispatch(event.clone());
		event
	}

	/// Delivers an already built event, e.g. to replay one.
	pub async fn emit_event(&self, event: ContractEvent) {
		self.state.lock().await.dispatch(event);
	}

	/// Sets the on-chain sold counter of a deployed contract.
	pub async fn set_tickets_sold(&self, contract: Address, sold: u64) {
		if let Some(entry) = self.state.lock().await.contracts.get_mut(&contract) {
			entry.details.tickets_sold = sold;
		}
	}

	fn unknown_contract(contract: Address) -> LotteryDetails {
		LotteryDetails {
			contract_address: contract,
			token_address: Address::ZERO,
			ticket_price: U256::ZERO,
			max_tickets: 0,
			min_tickets: 0,
			tickets_sold: 0,
			start_time: 0,
			end_time: 0,
			draw_time: 0,
			is_drawn: false,
		}
	}

	/// Picks `ranks` distinct ticket numbers out of `1..=sold`.
	fn pick_winners(seed: B256, sold: u64, ranks: usize) -> Vec<u64> {
		let mut winners = Vec::new();
		let mut round = 0u64;
		while winners.len() < ranks.min(sold as usize) {
			let mut input = seed.to_vec();
			input.extend_from_slice(&round.to_be_bytes());
			let digest = keccak256(&input);
			let value = u64::from_be_bytes(digest[..8].try_into().unwrap_or([0u8; 8]));
			let number = value % sold + 1;
			if !winners.contains(&number) {
				winners.push(number);
			}
			round += 1;
		}
		winners
	}
}

pub struct MockChainSchema;

impl ConfigSchema for MockChainSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![Field::new(
				"chain_ids",
				FieldType::Array(Box::new(FieldType::Integer {
					min: Some(1),
					max: None,
				})),
			)
			.with_validator(|value| match value.as_array() {
				Some(ids) if !ids.is_empty() => Ok(()),
				_ => Err("chain_ids cannot be empty".to_string()),
			})],
			vec![Field::new("auto_confirm", FieldType::Boolean)],
		);
		schema.validate(config)
	}
}

#[async_trait]
impl ChainInterface for MockChain {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MockChainSchema)
	}

	fn chain_ids(&self) -> Vec<u64> {
		self.chain_ids.clone()
	}

	async fn deploy_lottery(
		&self,
		params: DeployParams,
		_signer: AccountSigner,
	) -> Result<DeployReceipt, ChainError> {
		let mut state = self.state.lock().await;
		state.record(MockOperation::Deploy)?;
		let contract_address = Address::from_slice(&state.next_hash("contract")[12..]);
		let tx_hash = state.next_hash("deploy");
		state.contracts.insert(
			contract_address,
			MockContract {
				details: LotteryDetails {
					contract_address,
					token_address: params.token_address,
					ticket_price: params.ticket_price,
					max_tickets: params.max_tickets,
					min_tickets: params.min_tickets,
					tickets_sold: 0,
					start_time: params.start_time,
					end_time: params.end_time,
					draw_time: params.draw_time,
					is_drawn: false,
				},
				ranks: params.prize_distribution.len(),
			},
		);
		Ok(DeployReceipt {
			contract_address,
			tx_hash,
		})
	}

	async fn buy_tickets(
		&self,
		contract: Address,
		_chain_id: u64,
		quantity: u64,
		buyer: Address,
		_signer: AccountSigner,
	) -> Result<B256, ChainError> {
		let mut state = self.state.lock().await;
		state.record(MockOperation::Buy)?;
		let tx_hash = state.next_hash("buy");
		let first = match state.contracts.get_mut(&contract) {
			Some(entry) => {
				let first = entry.details.tickets_sold + 1;
				entry.details.tickets_sold += quantity;
				first
			},
			None => 1,
		};
		if self.auto_confirm {
			let args = vec![
				EventArg::from(buyer),
				EventArg::from(first),
				EventArg::from(quantity),
			];
			let event = state.build_event(contract, TICKETS_PURCHASED, args, tx_hash);
			state.dispatch(event);
		}
		Ok(tx_hash)
	}

	async fn can_buy_tickets(
		&self,
		contract: Address,
		_chain_id: u64,
		_buyer: Address,
		quantity: u64,
	) -> PurchaseCheck {
		let mut state = self.state.lock().await;
		if let Err(err) = state.record(MockOperation::PurchaseCheck) {
			return PurchaseCheck::denied(err.to_string());
		}
		match state.contracts.get(&contract) {
			Some(entry) if entry.details.is_drawn => PurchaseCheck::denied("Lottery already drawn"),
			Some(entry)
				if entry.details.max_tickets > 0
					&& entry.details.tickets_sold + quantity > entry.details.max_tickets =>
			{
				PurchaseCheck::denied("Not enough tickets left")
			},
			_ => PurchaseCheck::allowed(),
		}
	}

	async fn draw(
		&self,
		contract: Address,
		_chain_id: u64,
		_signer: AccountSigner,
	) -> Result<B256, ChainError> {
		let mut state = self.state.lock().await;
		state.record(MockOperation::Draw)?;
		let tx_hash = state.next_hash("draw");
		let (sold, ranks) = match state.contracts.get_mut(&contract) {
			Some(entry) => {
				entry.details.is_drawn = true;
				(entry.details.tickets_sold, entry.ranks)
			},
			None => (0, 0),
		};
		if self.auto_confirm {
			let winners = Self::pick_winners(tx_hash, sold, ranks)
				.into_iter()
				.map(EventArg::from)
				.collect();
			let event =
				state.build_event(contract, DRAW_COMPLETED, vec![EventArg::Array(winners)], tx_hash);
			state.dispatch(event);
		}
		Ok(tx_hash)
	}

	async fn get_lottery_details(
		&self,
		contract: Address,
		_chain_id: u64,
	) -> Result<LotteryDetails, ChainError> {
		let state = self.state.lock().await;
		Ok(state
			.contracts
			.get(&contract)
			.map(|entry| entry.details.clone())
			.unwrap_or_else(|| Self::unknown_contract(contract)))
	}

	async fn watch(
		&self,
		contract: Address,
		chain_id: u64,
		sink: EventSink,
	) -> Result<Subscription, ChainError> {
		self.state
			.lock()
			.await
			.watchers
			.entry(contract)
			.or_default()
			.push(sink.clone());

		let (stop_tx, stop_rx) = oneshot::channel::<()>();
		let state = self.state.clone();
		let handle = tokio::spawn(async move {
			let _ = stop_rx.await;
			let mut state = state.lock().await;
			if let Some(sinks) = state.watchers.get_mut(&contract) {
				sinks.retain(|s| !s.same_channel(&sink));
			}
			tracing::debug!(contract = %contract, chain_id, "Mock watcher removed");
		});
		Ok(Subscription::new(stop_tx, handle))
	}
}

/// Builds a mock chain.
///
/// Configuration:
/// - `chain_ids`: chains the mock answers for
/// - `auto_confirm`: emit purchase and draw events after submissions (default false)
pub fn create_chain(
	config: &toml::Value,
	_networks: &NetworksConfig,
) -> Result<Box<dyn ChainInterface>, ChainError> {
	MockChainSchema
		.validate(config)
		.map_err(|e| ChainError::Configuration(format!("Invalid configuration: {}", e)))?;

	let chain_ids = config
		.get("chain_ids")
		.and_then(|v| v.as_array())
		.map(|ids| {
			ids.iter()
				.filter_map(|v| v.as_integer().map(|i| i as u64))
				.collect::<Vec<_>>()
		})
		.unwrap_or_default();
	let auto_confirm = config
		.get("auto_confirm")
		.and_then(|v| v.as_bool())
		.unwrap_or(false);

	tracing::info!(?chain_ids, auto_confirm, "Using mock chain");
	Ok(Box::new(MockChain::new(chain_ids, auto_confirm)))
}

pub struct Registry;

impl lottery_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "mock";
	type Factory = crate::ChainFactory;

	fn factory() -> Self::Factory {
		create_chain
	}
}

impl crate::ChainRegistry for Registry {}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::sync::mpsc;

	fn signer() -> AccountSigner {
		AccountSigner::Local(
			"0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
				.parse()
				.unwrap(),
		)
	}

	fn params() -> DeployParams {
		DeployParams {
			chain_id: 31337,
			token_address: Address::repeat_byte(0x11),
			ticket_price: U256::from(10),
			max_tickets: 100,
			min_tickets: 2,
			start_time: 1_000,
			end_time: 2_000,
			draw_time: 3_000,
			prize_distribution: vec![70, 30],
			creator_address: Address::repeat_byte(0x22),
		}
	}

	#[tokio::test]
	async fn test_deploy_generates_distinct_addresses() {
		let chain = MockChain::new(vec![31337], false);
		let a = chain.deploy_lottery(params(), signer()).await.unwrap();
		let b = chain.deploy_lottery(params(), signer()).await.unwrap();
		assert_ne!(a.contract_address, b.contract_address);
		assert_ne!(a.tx_hash, b.tx_hash);

		let details = chain.get_lottery_details(a.contract_address, 31337).await.unwrap();
		assert_eq!(details.max_tickets, 100);
		assert_eq!(details.ticket_price, U256::from(10));
	}

	#[tokio::test]
	async fn test_failure_injection_is_consumed_once() {
		let chain = MockChain::new(vec![31337], false);
		chain
			.fail_next(MockOperation::Draw, ChainError::Network("down".into()))
			.await;
		let err = chain.draw(Address::ZERO, 31337, signer()).await.unwrap_err();
		assert!(err.is_transient());
		assert!(chain.draw(Address::ZERO, 31337, signer()).await.is_ok());
		assert_eq!(chain.call_count(MockOperation::Draw).await, 2);
	}

	#[tokio::test]
	async fn test_emit_reaches_watcher_until_unsubscribed() {
		let chain = MockChain::new(vec![31337], false);
		let contract = Address::repeat_byte(0x33);
		let (tx, mut rx) = mpsc::unbounded_channel();
		let subscription = chain.watch(contract, 31337, tx).await.unwrap();

		let emitted = chain
			.emit(contract, TICKETS_PURCHASED, vec![EventArg::from("1")])
			.await;
		assert_eq!(rx.recv().await.unwrap(), emitted);

		subscription.unsubscribe();
		// Let the watcher task run its cleanup.
		for _ in 0..10 {
			tokio::task::yield_now().await;
		}
		assert_eq!(chain.watcher_count(contract).await, 0);
	}

	#[tokio::test]
	async fn test_auto_confirm_emits_purchase_and_draw() {
		let chain = MockChain::new(vec![31337], true);
		let receipt = chain.deploy_lottery(params(), signer()).await.unwrap();
		let contract = receipt.contract_address;
		let (tx, mut rx) = mpsc::unbounded_channel();
		let _subscription = chain.watch(contract, 31337, tx).await.unwrap();

		let buyer = Address::repeat_byte(0x44);
		chain
			.buy_tickets(contract, 31337, 3, buyer, signer())
			.await
			.unwrap();
		let purchase = rx.recv().await.unwrap();
		assert_eq!(purchase.name, TICKETS_PURCHASED);
		assert_eq!(purchase.args[0].as_address(), Some(buyer));
		assert_eq!(purchase.args[1].as_u64(), Some(1));
		assert_eq!(purchase.args[2].as_u64(), Some(3));

		chain.draw(contract, 31337, signer()).await.unwrap();
		let drawn = rx.recv().await.unwrap();
		assert_eq!(drawn.name, DRAW_COMPLETED);
		let winners = drawn.args[0].as_array().unwrap();
		assert_eq!(winners.len(), 2);
		assert_ne!(winners[0], winners[1]);
	}

	#[tokio::test]
	async fn test_purchase_check_respects_capacity() {
		let chain = MockChain::new(vec![31337], false);
		let receipt = chain.deploy_lottery(params(), signer()).await.unwrap();
		chain.set_tickets_sold(receipt.contract_address, 99).await;

		let ok = chain
			.can_buy_tickets(receipt.contract_address, 31337, Address::ZERO, 1)
			.await;
		assert!(ok.can_buy);
		let denied = chain
			.can_buy_tickets(receipt.contract_address, 31337, Address::ZERO, 2)
			.await;
		assert!(!denied.can_buy);
	}

	#[test]
	fn test_pick_winners_distinct_and_bounded() {
		let winners = MockChain::pick_winners(B256::repeat_byte(1), 3, 5);
		assert_eq!(winners.len(), 3);
		assert!(winners.iter().all(|n| (1..=3).contains(n)));
	}

	#[test]
	fn test_create_chain_requires_chain_ids() {
		let config: toml::Value = toml::from_str("auto_confirm = true").unwrap();
		assert!(create_chain(&config, &NetworksConfig::new()).is_err());

		let config: toml::Value = toml::from_str("chain_ids = [31337]").unwrap();
		let chain = create_chain(&config, &NetworksConfig::new()).unwrap();
		assert_eq!(chain.chain_ids(), vec![31337]);
	}
}
