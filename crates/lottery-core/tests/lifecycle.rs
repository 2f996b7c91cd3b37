//! End-to-end lifecycle runs against the mock chain.

use alloy_primitives::{address, Address, U256};
use lottery_account::implementations::local::create_key_store;
use lottery_account::KeyManager;
use lottery_chain::implementations::mock::MockChain;
use lottery_chain::{ChainInterface, ChainService};
use lottery_config::Config;
use lottery_core::{LotteryEngine, StoredWalletDirectory};
use lottery_storage::implementations::memory::MemoryStorage;
use lottery_storage::StorageService;
use lottery_types::{
	current_timestamp, DeployRequest, Lottery, LotteryEvent, LotteryStatus, LotteryTerms,
	OperationPhase, OperationStatus, OrchestratorEvent, PrizeDistribution, PurchaseRequest,
	SigningKeyRef, TicketEvent, Wallet,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const OPERATOR_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
const CREATOR: Address = address!("f39fd6e51aad88f6f4ce6ab8827279cfffb92266");
const BUYER: Address = address!("b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2");

const CONFIG: &str = r#"
[orchestrator]
id = "lifecycle-test"
operator_key = "operator"
sweep_interval_seconds = 1

[networks.31337]
factory_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
[[networks.31337.rpc_urls]]
http = "http://localhost:8545"

[storage]
primary = "memory"
[storage.implementations.memory]

[queue]
poll_interval_ms = 20
backoff_base_ms = 50

[chain.implementations.mock]
chain_ids = [31337]

[account]
primary = "local"
[account.implementations.local.keys]
operator = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
"#;

async fn engine(mock: &MockChain) -> LotteryEngine {
	let config: Config = CONFIG.parse().unwrap();
	let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));

	let keys: toml::Value =
		toml::from_str(&format!("[keys]\noperator = \"{}\"\n", OPERATOR_KEY)).unwrap();
	let keys = Arc::new(KeyManager::new(create_key_store(&keys).unwrap()));
	let implementation: Arc<dyn ChainInterface> = Arc::new(mock.clone());
	let chain = Arc::new(ChainService::from_implementations(
		vec![implementation],
		keys,
		Duration::from_secs(5),
	));

	let wallets = Arc::new(StoredWalletDirectory::new(storage.clone()));
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
	LotteryEngine::new(config, storage, chain, wallets)
}

/// Lottery that stops selling in `end_in` seconds and draws one second later.
fn lottery(id: &str, min_tickets: u64, end_in: u64) -> Lottery {
	let now = current_timestamp();
	Lottery::draft(
		id,
		"creator-1",
		31337,
		LotteryTerms {
			ticket_price: U256::from(10u64),
			token_address: Address::repeat_byte(0x11),
			max_tickets: 100,
			min_tickets,
			prize_distribution: PrizeDistribution::new(vec![70, 30]),
			start_time: Some(now - 60),
			end_time: Some(now + end_in),
			draw_time: Some(now + end_in + 1),
		},
	)
}

fn deploy(engine: &LotteryEngine, lottery_id: &str) {
	engine
		.event_bus()
		.publish(OrchestratorEvent::Lottery(LotteryEvent::DeployRequested(
			DeployRequest {
				operation_id: format!("deploy-{}", lottery_id),
				lottery_id: lottery_id.into(),
				signer: SigningKeyRef::new("operator"),
			},
		)))
		.unwrap();
}

fn purchase(engine: &LotteryEngine, operation_id: &str, lottery_id: &str, quantity: u64) {
	engine
		.event_bus()
		.publish(OrchestratorEvent::Ticket(TicketEvent::PurchaseRequested(
			PurchaseRequest {
				operation_id: operation_id.into(),
				lottery_id: lottery_id.into(),
				user_id: "user-1".into(),
				quantity,
				signer: SigningKeyRef::new("operator"),
			},
		)))
		.unwrap();
}

/// Polls `condition` until it holds or ten seconds pass.
async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	for _ in 0..500 {
		if condition().await {
			return;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	panic!("timed out waiting for {}", what);
}

async fn status_of(engine: &LotteryEngine, lottery_id: &str) -> LotteryStatus {
	engine
		.store()
		.get(lottery_id)
		.await
		.unwrap()
		.map(|l| l.status)
		.unwrap()
}

fn topics(bus: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<&'static str> {
	let mut topics = Vec::new();
	while let Ok(event) = bus.try_recv() {
		topics.push(event.topic());
	}
	topics
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lottery_runs_from_draft_to_completed() {
	let mock = MockChain::new(vec![31337], true);
	let engine = &engine(&mock).await;
	engine.store().create(&lottery("l1", 2, 3)).await.unwrap();
	let mut bus = engine.event_bus().subscribe();
	let handle = engine.start().await.unwrap();

	deploy(engine, "l1");
	wait_until("deployment", move || async move {
		status_of(engine, "l1").await == LotteryStatus::Active
	})
	.await;

	purchase(engine, "buy-1", "l1", 3);
	wait_until("confirmed tickets", move || async move {
		engine.store().tickets_sold("l1").await.unwrap() == 3
	})
	.await;

	wait_until("completion", move || async move {
		status_of(engine, "l1").await == LotteryStatus::Completed
	})
	.await;

	let completed = engine.store().get("l1").await.unwrap().unwrap();
	assert!(completed.contract_address.is_some());
	assert!(completed.draw_tx_hash.is_some());

	let winners = engine.store().winners_for_lottery("l1").await.unwrap();
	assert_eq!(winners.len(), 2);
	assert_eq!(winners[0].amount, U256::from(21u64));
	assert_eq!(winners[1].amount, U256::from(9u64));
	assert!(winners.iter().all(|w| w.user_id == "user-1"));
	assert_ne!(winners[0].ticket_number, winners[1].ticket_number);

	let seen = topics(&mut bus);
	for expected in [
		"lottery.deployed",
		"ticket.purchase.submitted",
		"ticket.purchased",
		"lottery.closing",
		"lottery.draw.submitted",
		"ticket.winning",
		"lottery.drawn",
	] {
		assert!(seen.contains(&expected), "missing {}", expected);
	}
	assert!(!engine
		.subscriptions()
		.is_watching(&completed.contract_address.unwrap())
		.await);

	handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_undersold_lottery_is_cancelled_with_refund() {
	let mock = MockChain::new(vec![31337], true);
	let engine = &engine(&mock).await;
	engine.store().create(&lottery("l1", 5, 2)).await.unwrap();
	let mut bus = engine.event_bus().subscribe();
	let handle = engine.start().await.unwrap();

	deploy(engine, "l1");
	purchase(engine, "buy-1", "l1", 1);
	wait_until("cancellation", move || async move {
		status_of(engine, "l1").await == LotteryStatus::Cancelled
	})
	.await;

	let cancelled = engine.store().get("l1").await.unwrap().unwrap();
	assert!(cancelled.contract_address.is_none());
	assert!(engine.store().winners_for_lottery("l1").await.unwrap().is_empty());

	let mut refund = None;
	while let Ok(event) = bus.try_recv() {
		if let OrchestratorEvent::Lottery(LotteryEvent::RefundRequired {
			contract_address, ..
		}) = event
		{
			refund = Some(contract_address);
		}
	}
	assert!(matches!(refund, Some(Some(_))));
	assert!(engine.subscriptions().is_empty().await);

	handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unconfirmed_purchase_creates_no_tickets() {
	let mock = MockChain::new(vec![31337], false);
	let engine = &engine(&mock).await;
	engine.store().create(&lottery("l1", 1, 3_600)).await.unwrap();
	let handle = engine.start().await.unwrap();

	deploy(engine, "l1");
	wait_until("deployment", move || async move {
		status_of(engine, "l1").await == LotteryStatus::Active
	})
	.await;

	purchase(engine, "buy-1", "l1", 2);
	wait_until("submission", move || async move {
		engine
			.status()
			.get(OperationPhase::Purchase, "buy-1")
			.await
			.unwrap()
			.map(|r| r.status == OperationStatus::Submitted)
			.unwrap_or(false)
	})
	.await;

	assert_eq!(engine.store().tickets_sold("l1").await.unwrap(), 0);
	assert_eq!(status_of(engine, "l1").await, LotteryStatus::Active);

	handle.shutdown().await;
}
