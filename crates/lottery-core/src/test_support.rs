//! Shared fixtures for the unit tests of this crate.

use alloy_primitives::{address, Address, U256};
use lottery_account::implementations::local::create_key_store;
use lottery_account::KeyManager;
use lottery_chain::implementations::mock::MockChain;
use lottery_chain::{ChainInterface, ChainService};
use lottery_config::Config;
use lottery_queue::{JobOptions, QueueConfig, TaskQueue};
use lottery_storage::implementations::memory::MemoryStorage;
use lottery_storage::StorageService;
use lottery_types::{
	current_timestamp, ContractEvent, DeployParams, DeployRequest, DrawRequest, Lottery,
	LotteryStatus, LotteryTerms, OrchestratorEvent, PrizeDistribution, PurchaseRequest,
	SigningKeyRef, Wallet, WalletOwner,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::engine::event_bus::EventBus;
use crate::engine::LotteryEngine;
use crate::handlers::{DeployHandler, DrawHandler, PurchaseHandler};
use crate::reconciliation::classifier::NamePatternClassifier;
use crate::reconciliation::{EventListener, SubscriptionRegistry};
use crate::state::LotteryStateMachine;
use crate::status::StatusCache;
use crate::store::{LotteryStore, TicketRange};
use crate::wallets::StoredWalletDirectory;

pub(crate) const ANVIL_KEY: &str =
	"0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
/// Address of [`ANVIL_KEY`]; the verified wallet of `creator-1`.
pub(crate) const CREATOR: Address = address!("f39fd6e51aad88f6f4ce6ab8827279cfffb92266");
/// Verified wallet of `user-1`.
pub(crate) const BUYER: Address = address!("b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2");

pub(crate) fn memory_storage() -> Arc<StorageService> {
	Arc::new(StorageService::new(Box::new(MemoryStorage::new())))
}

fn key_manager() -> Arc<KeyManager> {
	let config: toml::Value =
		toml::from_str(&format!("[keys]\noperator = \"{}\"\n", ANVIL_KEY)).unwrap();
	Arc::new(KeyManager::new(create_key_store(&config).unwrap()))
}

fn chain_service(mock: &MockChain) -> Arc<ChainService> {
	let implementation: Arc<dyn ChainInterface> = Arc::new(mock.clone());
	Arc::new(ChainService::from_implementations(
		vec![implementation],
		key_manager(),
		Duration::from_secs(5),
	))
}

async fn wallet_directory(storage: Arc<StorageService>) -> Arc<StoredWalletDirectory> {
	let wallets = Arc::new(StoredWalletDirectory::new(storage));
	for (id, user, address) in [("w-creator", "creator-1", CREATOR), ("w-user", "user-1", BUYER)] {
		wallets
			.register(&Wallet {
				id: id.into(),
				user_id: user.into(),
				address,
				chain_id: 31337,
				verified: true,
				created_at: 1,
			})
			.await
			.unwrap();
	}
	wallets
}

/// DRAFT lottery on chain 31337: 10 per ticket, 5 to 1000 tickets, 70/30
/// split, selling for the next hour and drawn an hour later.
pub(crate) fn draft_lottery(id: &str) -> Lottery {
	let now = current_timestamp();
	Lottery::draft(
		id,
		"creator-1",
		31337,
		LotteryTerms {
			ticket_price: U256::from(10u64),
			token_address: Address::repeat_byte(0x11),
			max_tickets: 1000,
			min_tickets: 5,
			prize_distribution: PrizeDistribution::new(vec![70, 30]),
			start_time: Some(now - 60),
			end_time: Some(now + 3_600),
			draw_time: Some(now + 7_200),
		},
	)
}

pub(crate) fn deploy_request(operation_id: &str, lottery_id: &str) -> DeployRequest {
	DeployRequest {
		operation_id: operation_id.into(),
		lottery_id: lottery_id.into(),
		signer: SigningKeyRef::new("operator"),
	}
}

pub(crate) fn draw_request(lottery_id: &str) -> DrawRequest {
	DrawRequest {
		operation_id: lottery_id.into(),
		lottery_id: lottery_id.into(),
		signer: SigningKeyRef::new("operator"),
	}
}

pub(crate) fn purchase_request(
	operation_id: &str,
	lottery_id: &str,
	user_id: &str,
	quantity: u64,
) -> PurchaseRequest {
	PurchaseRequest {
		operation_id: operation_id.into(),
		lottery_id: lottery_id.into(),
		user_id: user_id.into(),
		quantity,
		signer: SigningKeyRef::new("operator"),
	}
}

/// Every event currently buffered for `bus`.
pub(crate) fn drain_bus(bus: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
	let mut events = Vec::new();
	while let Ok(event) = bus.try_recv() {
		events.push(event);
	}
	events
}

/// Components wired as the engine wires them, over memory storage and a
/// mock chain that never confirms on its own.
pub(crate) struct Fixture {
	pub storage: Arc<StorageService>,
	pub store: Arc<LotteryStore>,
	pub queue: Arc<TaskQueue>,
	pub mock: MockChain,
	pub chain: Arc<ChainService>,
	pub wallets: Arc<StoredWalletDirectory>,
	pub subscriptions: Arc<SubscriptionRegistry>,
	pub state_machine: Arc<LotteryStateMachine>,
	pub status: Arc<StatusCache>,
	pub event_bus: EventBus,
	pub bus: broadcast::Receiver<OrchestratorEvent>,
	pub contract_events: mpsc::UnboundedReceiver<ContractEvent>,
}

impl Fixture {
	pub async fn new() -> Self {
		Self::with_storage(memory_storage()).await
	}

	pub async fn with_storage(storage: Arc<StorageService>) -> Self {
		let store = Arc::new(LotteryStore::new(storage.clone()));
		let queue = Arc::new(TaskQueue::new(
			storage.clone(),
			QueueConfig {
				poll_interval: Duration::from_millis(10),
				..QueueConfig::default()
			},
		));
		let mock = MockChain::new(vec![31337], false);
		let chain = chain_service(&mock);
		let wallets = wallet_directory(storage.clone()).await;
		let (event_tx, contract_events) = mpsc::unbounded_channel();
		let subscriptions = Arc::new(SubscriptionRegistry::new(chain.clone(), event_tx));
		let event_bus = EventBus::new(100);
		let bus = event_bus.subscribe();
		let state_machine = Arc::new(LotteryStateMachine::new(
			store.clone(),
			queue.clone(),
			subscriptions.clone(),
			event_bus.clone(),
			SigningKeyRef::new("operator"),
			JobOptions::default(),
		));
		let status = Arc::new(StatusCache::new(storage.clone(), Duration::from_secs(60)));

		Self {
			storage,
			store,
			queue,
			mock,
			chain,
			wallets,
			subscriptions,
			state_machine,
			status,
			event_bus,
			bus,
			contract_events,
		}
	}

	pub fn listener(&self) -> EventListener {
		EventListener::new(
			self.store.clone(),
			self.state_machine.clone(),
			self.wallets.clone(),
			Box::new(NamePatternClassifier),
			self.subscriptions.clone(),
			self.event_bus.clone(),
		)
	}

	pub fn deploy_handler(&self) -> DeployHandler {
		DeployHandler::new(
			self.store.clone(),
			self.state_machine.clone(),
			self.chain.clone(),
			self.wallets.clone(),
			self.subscriptions.clone(),
			self.status.clone(),
			self.event_bus.clone(),
		)
	}

	pub fn draw_handler(&self) -> DrawHandler {
		DrawHandler::new(
			self.store.clone(),
			self.state_machine.clone(),
			self.chain.clone(),
			self.status.clone(),
			self.event_bus.clone(),
		)
	}

	pub fn purchase_handler(&self) -> PurchaseHandler {
		PurchaseHandler::new(
			self.store.clone(),
			self.chain.clone(),
			self.wallets.clone(),
			self.status.clone(),
			self.event_bus.clone(),
		)
	}

	/// Records tickets `1..=count` for `user-1`.
	pub async fn seed_tickets(&self, lottery: &Lottery, count: u64) {
		if count == 0 {
			return;
		}
		let owner = WalletOwner {
			wallet_id: "w-user".into(),
			user_id: "user-1".into(),
		};
		self.store
			.record_tickets(
				&lottery.id,
				TicketRange {
					first: 1,
					last: count,
				},
				&owner,
				BUYER,
				alloy_primitives::B256::repeat_byte(0x5e),
			)
			.await
			.unwrap();
	}
}

/// Deploys a contract on the mock chain and stores the lottery as ACTIVE
/// with `end_time` and `draw_time` offset from now by the given seconds.
pub(crate) async fn active_lottery(
	fixture: &Fixture,
	id: &str,
	end_offset: i64,
	draw_offset: i64,
) -> Lottery {
	let now = current_timestamp() as i64;
	let mut lottery = draft_lottery(id);
	lottery.terms.start_time = Some((now + end_offset - 600) as u64);
	lottery.terms.end_time = Some((now + end_offset) as u64);
	lottery.terms.draw_time = Some((now + draw_offset) as u64);

	let params = DeployParams::from_lottery(&lottery, CREATOR).unwrap();
	let receipt = fixture
		.chain
		.deploy_lottery(params, &SigningKeyRef::new("operator"))
		.await
		.unwrap();
	lottery.status = LotteryStatus::Active;
	lottery.contract_address = Some(receipt.contract_address);
	lottery.deploy_tx_hash = Some(receipt.tx_hash);
	fixture.store.create(&lottery).await.unwrap();
	lottery
}

const ENGINE_CONFIG: &str = r#"
[orchestrator]
id = "lottery-test"
operator_key = "operator"
sweep_interval_seconds = 3600

[networks.31337]
factory_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
[[networks.31337.rpc_urls]]
http = "http://localhost:8545"

[storage]
primary = "memory"
[storage.implementations.memory]

[queue]
poll_interval_ms = 20

[chain.implementations.mock]
chain_ids = [31337]

[account]
primary = "local"
[account.implementations.local.keys]
operator = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
"#;

/// An engine over memory storage and the returned mock chain.
pub(crate) async fn engine_fixture() -> (LotteryEngine, MockChain) {
	let config: Config = ENGINE_CONFIG.parse().unwrap();
	let storage = memory_storage();
	let mock = MockChain::new(vec![31337], false);
	let wallets = wallet_directory(storage.clone()).await;
	let engine = LotteryEngine::new(config, storage, chain_service(&mock), wallets);
	(engine, mock)
}
