//! Lottery contracts on EVM chains through alloy.
//!
//! One retrying RPC client is created per configured network and shared by
//! every call. Writes wrap that client in a provider carrying the resolved
//! signer; reads and event polling use a signer-less provider.

use crate::{ChainError, ChainInterface, EventSink, Subscription};
use alloy_dyn_abi::{DynSolValue, EventExt};
use alloy_json_abi::Event;
use alloy_network::{EthereumWallet, TransactionBuilder};
use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types::{Filter, Log, TransactionRequest};
use alloy_sol_types::{sol, SolCall};
use alloy_transport::layers::RetryBackoffLayer;
use async_trait::async_trait;
use lottery_account::AccountSigner;
use lottery_types::{
	current_timestamp, truncate_id, ConfigSchema, ContractEvent, DeployParams, DeployReceipt,
	EventArg, Field, FieldType, LotteryDetails, NetworksConfig, PurchaseCheck, Schema,
	ValidationError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

const DEFAULT_POLLING_INTERVAL_SECS: u64 = 3;

/// Events decoded by default; other logs of a watched contract are skipped.
pub const DEFAULT_EVENT_SIGNATURES: &[&str] = &[
	"event TicketsPurchased(address indexed buyer, uint256 firstTicketId, uint256 quantity)",
	"event DrawRequested(uint256 indexed requestId)",
	"event DrawCompleted(uint256[] winningTickets)",
	"event RefundClaimed(address indexed buyer, uint256 amount)",
];

sol! {
	interface ILotteryFactory {
		event LotteryCreated(address indexed lottery, address indexed creator);

		function createLottery(
			address token,
			uint256 ticketPrice,
			uint256 maxTickets,
			uint256 minTickets,
			uint256 startTime,
			uint256 endTime,
			uint256 drawTime,
			uint256[] prizeDistribution
		) external returns (address lottery);
	}

	interface ILottery {
		struct LotteryInfo {
			address token;
			uint256 ticketPrice;
			uint256 maxTickets;
			uint256 minTickets;
			uint256 ticketsSold;
			uint256 startTime;
			uint256 endTime;
			uint256 drawTime;
			bool drawn;
		}

		event TicketsPurchased(address indexed buyer, uint256 firstTicketId, uint256 quantity);
		event DrawCompleted(uint256[] winningTickets);

		function buyTickets(address buyer, uint256 quantity) external;
		function requestDraw() external;
		function getLotteryInfo() external view returns (LotteryInfo memory info);
	}

	interface IERC20 {
		function balanceOf(address account) external view returns (uint256);
		function allowance(address owner, address spender) external view returns (uint256);
	}
}

struct ChainEndpoint {
	client: RpcClient,
	reader: DynProvider,
	factory: Address,
}

/// Alloy-backed lottery chain access for a set of networks.
pub struct AlloyChain {
	endpoints: HashMap<u64, ChainEndpoint>,
	events: Arc<HashMap<B256, Event>>,
	polling_interval: Duration,
	lookback_blocks: u64,
	confirmations: u64,
}

/// Tuning for [`AlloyChain`].
#[derive(Debug, Clone)]
pub struct AlloyChainOptions {
	pub polling_interval_secs: u64,
	/// Blocks before the current head scanned when a watch starts.
	pub lookback_blocks: u64,
	/// Confirmations awaited for the deployment receipt.
	pub confirmations: u64,
	pub event_signatures: Vec<String>,
}

impl Default for AlloyChainOptions {
	fn default() -> Self {
		Self {
			polling_interval_secs: DEFAULT_POLLING_INTERVAL_SECS,
			lookback_blocks: 0,
			confirmations: 1,
			event_signatures: DEFAULT_EVENT_SIGNATURES
				.iter()
				.map(|s| s.to_string())
				.collect(),
		}
	}
}

/// Parses human readable event signatures into a topic0 lookup table.
pub fn parse_event_signatures(signatures: &[String]) -> Result<HashMap<B256, Event>, ChainError> {
	signatures
		.iter()
		.map(|signature| {
			Event::parse(signature)
				.map(|event| (event.selector(), event))
				.map_err(|e| {
					ChainError::Configuration(format!("Invalid event signature '{}': {}", signature, e))
				})
		})
		.collect()
}

impl AlloyChain {
	pub fn new(
		network_ids: Vec<u64>,
		networks: &NetworksConfig,
		options: AlloyChainOptions,
	) -> Result<Self, ChainError> {
		if network_ids.is_empty() {
			return Err(ChainError::Configuration(
				"At least one network_id must be specified".to_string(),
			));
		}

		let mut endpoints = HashMap::new();
		for network_id in network_ids {
			let network = networks.get(&network_id).ok_or_else(|| {
				ChainError::Configuration(format!(
					"Network {} not found in configuration",
					network_id
				))
			})?;
			let http_url = network.http_url().ok_or_else(|| {
				ChainError::Configuration(format!(
					"No HTTP RPC URL configured for network {}",
					network_id
				))
			})?;
			let url = http_url.parse().map_err(|e| {
				ChainError::Configuration(format!(
					"Invalid RPC URL for network {}: {}",
					network_id, e
				))
			})?;

			// Retries rate limits and transport errors before they reach the queue.
			let retry_layer = RetryBackoffLayer::new(5, 1000, 10);
			let client = RpcClient::builder().layer(retry_layer).http(url);
			let reader = ProviderBuilder::new()
				.connect_client(client.clone())
				.erased();

			tracing::info!(
				chain_id = network_id,
				name = network.name.as_deref().unwrap_or("unnamed"),
				factory = %network.factory_address,
				"Configured lottery chain"
			);
			endpoints.insert(
				network_id,
				ChainEndpoint {
					client,
					reader,
					factory: network.factory_address,
				},
			);
		}

		Ok(Self {
			endpoints,
			events: Arc::new(parse_event_signatures(&options.event_signatures)?),
			polling_interval: Duration::from_secs(options.polling_interval_secs.max(1)),
			lookback_blocks: options.lookback_blocks,
			confirmations: options.confirmations,
		})
	}

	fn endpoint(&self, chain_id: u64) -> Result<&ChainEndpoint, ChainError> {
		self.endpoints
			.get(&chain_id)
			.ok_or(ChainError::NoProviderForChain(chain_id))
	}

	fn writer(&self, chain_id: u64, signer: AccountSigner) -> Result<DynProvider, ChainError> {
		let endpoint = self.endpoint(chain_id)?;
		Ok(ProviderBuilder::new()
			.wallet(EthereumWallet::from(signer))
			.connect_client(endpoint.client.clone())
			.erased())
	}

	async fn send<C: SolCall + Send>(
		&self,
		chain_id: u64,
		to: Address,
		call: C,
		signer: AccountSigner,
	) -> Result<B256, ChainError> {
		let provider = self.writer(chain_id, signer)?;
		let request = TransactionRequest::default()
			.with_to(to)
			.with_input(call.abi_encode());
		let pending = provider
			.send_transaction(request)
			.await
			.map_err(|e| ChainError::from_rpc(C::SIGNATURE, e))?;
		let tx_hash = *pending.tx_hash();
		tracing::info!(
			chain_id,
			to = %to,
			call = C::SIGNATURE,
			tx_hash = %truncate_id(&tx_hash.to_string()),
			"Transaction submitted"
		);
		Ok(tx_hash)
	}

	async fn purchase_check(
		&self,
		contract: Address,
		chain_id: u64,
		buyer: Address,
		quantity: u64,
	) -> Result<PurchaseCheck, ChainError> {
		let details = self.get_lottery_details(contract, chain_id).await?;
		let now = current_timestamp();
		if details.is_drawn {
			return Ok(PurchaseCheck::denied("Lottery already drawn"));
		}
		if now < details.start_time {
			return Ok(PurchaseCheck::denied("Ticket sales have not started"));
		}
		if now >= details.end_time {
			return Ok(PurchaseCheck::denied("Ticket sales have ended"));
		}
		if details.max_tickets > 0 && details.tickets_sold + quantity > details.max_tickets {
			return Ok(PurchaseCheck::denied(format!(
				"Only {} tickets left",
				details.max_tickets.saturating_sub(details.tickets_sold)
			)));
		}

		let cost = details.ticket_price.saturating_mul(U256::from(quantity));
		let reader = &self.endpoint(chain_id)?.reader;
		let balance = call_view(
			reader,
			details.token_address,
			IERC20::balanceOfCall { account: buyer },
		)
		.await?;
		if balance < cost {
			return Ok(PurchaseCheck::denied("Insufficient token balance"));
		}
		let allowance = call_view(
			reader,
			details.token_address,
			IERC20::allowanceCall {
				owner: buyer,
				spender: contract,
			},
		)
		.await?;
		if allowance < cost {
			return Ok(PurchaseCheck::denied("Insufficient token allowance"));
		}
		Ok(PurchaseCheck::allowed())
	}
}

async fn call_view<C: SolCall + Send>(
	provider: &DynProvider,
	to: Address,
	call: C,
) -> Result<C::Return, ChainError> {
	let request = TransactionRequest::default()
		.with_to(to)
		.with_input(call.abi_encode());
	let output = provider
		.call(request)
		.await
		.map_err(|e| ChainError::from_rpc(C::SIGNATURE, e))?;
	C::abi_decode_returns(&output)
		.map_err(|e| ChainError::InvalidResponse(format!("{}: {}", C::SIGNATURE, e)))
}

fn to_u64(field: &str, value: U256) -> Result<u64, ChainError> {
	u64::try_from(value)
		.map_err(|_| ChainError::InvalidResponse(format!("{} does not fit in u64", field)))
}

/// Flattens a decoded ABI value.
pub fn to_event_arg(value: DynSolValue) -> EventArg {
	match value {
		DynSolValue::Address(address) => EventArg::from(address),
		DynSolValue::Uint(v, _) => EventArg::Uint(v),
		DynSolValue::Int(v, _) => EventArg::Int(v),
		DynSolValue::Bool(b) => EventArg::Bool(b),
		DynSolValue::String(s) => EventArg::Text(s),
		DynSolValue::Bytes(b) => EventArg::Bytes(Bytes::from(b)),
		DynSolValue::FixedBytes(word, size) => EventArg::Bytes(Bytes::copy_from_slice(&word[..size])),
		DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
			EventArg::Array(items.into_iter().map(to_event_arg).collect())
		},
		other => EventArg::Bytes(Bytes::from(other.abi_encode())),
	}
}

/// Decodes a log against the known events, restoring declaration order of
/// indexed and non-indexed parameters.
pub fn decode_contract_event(events: &HashMap<B256, Event>, log: &Log) -> Option<ContractEvent> {
	let event = events.get(log.topics().first()?)?;
	let decoded = match event.decode_log(log.data()) {
		Ok(decoded) => decoded,
		Err(e) => {
			tracing::warn!(event = %event.name, "Failed to decode log: {}", e);
			return None;
		},
	};

	let mut indexed = decoded.indexed.into_iter();
	let mut body = decoded.body.into_iter();
	let args = event
		.inputs
		.iter()
		.map(|input| {
			if input.indexed {
				indexed.next()
			} else {
				body.next()
			}
		})
		.collect::<Option<Vec<_>>>()?
		.into_iter()
		.map(to_event_arg)
		.collect();

	Some(ContractEvent {
		contract_address: log.address(),
		name: event.name.clone(),
		args,
		tx_hash: log.transaction_hash?,
		block_number: log.block_number?,
		log_index: log.log_index?,
	})
}

/// Polls `contract` for logs from `next_block` on until stopped or until the
/// sink is closed.
#[allow(clippy::too_many_arguments)]
async fn poll_contract_events(
	provider: DynProvider,
	contract: Address,
	chain_id: u64,
	events: Arc<HashMap<B256, Event>>,
	mut next_block: u64,
	polling_interval: Duration,
	sink: EventSink,
	mut stop_rx: oneshot::Receiver<()>,
) {
	let mut interval = tokio::time::interval(polling_interval);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

	loop {
		tokio::select! {
			_ = interval.tick() => {
				let current_block = match provider.get_block_number().await {
					Ok(block) => block,
					Err(e) => {
						tracing::warn!(chain_id, contract = %contract, "Failed to get block number: {}", e);
						continue;
					}
				};
				if current_block < next_block {
					continue;
				}

				let filter = Filter::new()
					.address(contract)
					.from_block(next_block)
					.to_block(current_block);
				let logs = match provider.get_logs(&filter).await {
					Ok(logs) => logs,
					Err(e) => {
						tracing::warn!(chain_id, contract = %contract, "Failed to get logs: {}", e);
						continue;
					}
				};

				for log in &logs {
					if let Some(event) = decode_contract_event(&events, log) {
						if sink.send(event).is_err() {
							tracing::debug!(contract = %contract, "Event sink closed");
							return;
						}
					}
				}
				next_block = current_block + 1;
			}
			_ = &mut stop_rx => {
				tracing::debug!(chain_id, contract = %contract, "Stopping contract watch");
				break;
			}
		}
	}
}

pub struct AlloyChainSchema;

impl ConfigSchema for AlloyChainSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![Field::new(
				"network_ids",
				FieldType::Array(Box::new(FieldType::Integer {
					min: Some(1),
					max: None,
				})),
			)
			.with_validator(|value| match value.as_array() {
				Some(ids) if !ids.is_empty() => Ok(()),
				_ => Err("network_ids cannot be empty".to_string()),
			})],
			vec![
				Field::new(
					"polling_interval_secs",
					FieldType::Integer {
						min: Some(1),
						max: Some(300),
					},
				),
				Field::new(
					"lookback_blocks",
					FieldType::Integer {
						min: Some(0),
						max: None,
					},
				),
				Field::new(
					"confirmations",
					FieldType::Integer {
						min: Some(0),
						max: Some(64),
					},
				),
				Field::new(
					"event_signatures",
					FieldType::Array(Box::new(FieldType::String)),
				)
				.with_validator(|value| {
					let signatures: Vec<String> = value
						.as_array()
						.map(|items| {
							items
								.iter()
								.filter_map(|v| v.as_str().map(str::to_string))
								.collect()
						})
						.unwrap_or_default();
					parse_event_signatures(&signatures)
						.map(|_| ())
						.map_err(|e| e.to_string())
				}),
			],
		);
		schema.validate(config)
	}
}

#[async_trait]
impl ChainInterface for AlloyChain {
	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(AlloyChainSchema)
	}

	fn chain_ids(&self) -> Vec<u64> {
		self.endpoints.keys().copied().collect()
	}

	async fn deploy_lottery(
		&self,
		params: DeployParams,
		signer: AccountSigner,
	) -> Result<DeployReceipt, ChainError> {
		let chain_id = params.chain_id;
		let factory = self.endpoint(chain_id)?.factory;
		let call = ILotteryFactory::createLotteryCall {
			token: params.token_address,
			ticketPrice: params.ticket_price,
			maxTickets: U256::from(params.max_tickets),
			minTickets: U256::from(params.min_tickets),
			startTime: U256::from(params.start_time),
			endTime: U256::from(params.end_time),
			drawTime: U256::from(params.draw_time),
			prizeDistribution: params
				.prize_distribution
				.iter()
				.map(|p| U256::from(*p))
				.collect(),
		};

		let provider = self.writer(chain_id, signer)?;
		let request = TransactionRequest::default()
			.with_to(factory)
			.with_input(call.abi_encode());
		let pending = provider
			.send_transaction(request)
			.await
			.map_err(|e| ChainError::from_rpc("createLottery", e))?;
		let tx_hash = *pending.tx_hash();
		tracing::info!(
			chain_id,
			tx_hash = %truncate_id(&tx_hash.to_string()),
			"Lottery deployment submitted"
		);

		let receipt = pending
			.with_required_confirmations(self.confirmations)
			.get_receipt()
			.await
			.map_err(|e| ChainError::Network(format!("Failed to get deployment receipt: {}", e)))?;
		if !receipt.status() {
			return Err(ChainError::TransactionFailed(format!(
				"Deployment transaction {} reverted",
				tx_hash
			)));
		}

		let contract_address = receipt
			.inner
			.logs()
			.iter()
			.find_map(|log| log.log_decode::<ILotteryFactory::LotteryCreated>().ok())
			.map(|log| log.inner.data.lottery)
			.ok_or_else(|| {
				ChainError::InvalidResponse(
					"Deployment receipt has no LotteryCreated event".to_string(),
				)
			})?;

		Ok(DeployReceipt {
			contract_address,
			tx_hash,
		})
	}

	async fn buy_tickets(
		&self,
		contract: Address,
		chain_id: u64,
		quantity: u64,
		buyer: Address,
		signer: AccountSigner,
	) -> Result<B256, ChainError> {
		let call = ILottery::buyTicketsCall {
			buyer,
			quantity: U256::from(quantity),
		};
		self.send(chain_id, contract, call, signer).await
	}

	async fn can_buy_tickets(
		&self,
		contract: Address,
		chain_id: u64,
		buyer: Address,
		quantity: u64,
	) -> PurchaseCheck {
		match self
			.purchase_check(contract, chain_id, buyer, quantity)
			.await
		{
			Ok(check) => check,
			Err(e) => PurchaseCheck::denied(format!("Purchase check failed: {}", e)),
		}
	}

	async fn draw(
		&self,
		contract: Address,
		chain_id: u64,
		signer: AccountSigner,
	) -> Result<B256, ChainError> {
		self.send(chain_id, contract, ILottery::requestDrawCall {}, signer)
			.await
	}

	async fn get_lottery_details(
		&self,
		contract: Address,
		chain_id: u64,
	) -> Result<LotteryDetails, ChainError> {
		let reader = &self.endpoint(chain_id)?.reader;
		let info = call_view(reader, contract, ILottery::getLotteryInfoCall {}).await?;
		Ok(LotteryDetails {
			contract_address: contract,
			token_address: info.token,
			ticket_price: info.ticketPrice,
			max_tickets: to_u64("maxTickets", info.maxTickets)?,
			min_tickets: to_u64("minTickets", info.minTickets)?,
			tickets_sold: to_u64("ticketsSold", info.ticketsSold)?,
			start_time: to_u64("startTime", info.startTime)?,
			end_time: to_u64("endTime", info.endTime)?,
			draw_time: to_u64("drawTime", info.drawTime)?,
			is_drawn: info.drawn,
		})
	}

	async fn watch(
		&self,
		contract: Address,
		chain_id: u64,
		sink: EventSink,
	) -> Result<Subscription, ChainError> {
		let provider = self.endpoint(chain_id)?.reader.clone();
		let head = provider
			.get_block_number()
			.await
			.map_err(|e| ChainError::from_rpc("eth_blockNumber", e))?;
		let from_block = head.saturating_sub(self.lookback_blocks);

		let (stop_tx, stop_rx) = oneshot::channel();
		let handle = tokio::spawn(poll_contract_events(
			provider,
			contract,
			chain_id,
			self.events.clone(),
			from_block,
			self.polling_interval,
			sink,
			stop_rx,
		));
		tracing::info!(chain_id, contract = %contract, from_block, "Watching lottery contract");
		Ok(Subscription::new(stop_tx, handle))
	}
}

/// Builds the alloy chain implementation.
///
/// Configuration:
/// - `network_ids`: chains to serve (each must exist under `[networks]`)
/// - `polling_interval_secs`: log polling interval (default 3)
/// - `lookback_blocks`: blocks re-scanned when a watch starts (default 0)
/// - `confirmations`: confirmations awaited for deployments (default 1)
/// - `event_signatures`: human readable event signatures to decode
pub fn create_chain(
	config: &toml::Value,
	networks: &NetworksConfig,
) -> Result<Box<dyn ChainInterface>, ChainError> {
	AlloyChainSchema
		.validate(config)
		.map_err(|e| ChainError::Configuration(format!("Invalid configuration: {}", e)))?;

	let network_ids = config
		.get("network_ids")
		.and_then(|v| v.as_array())
		.map(|ids| {
			ids.iter()
				.filter_map(|v| v.as_integer().map(|i| i as u64))
				.collect::<Vec<_>>()
		})
		.unwrap_or_default();

	let defaults = AlloyChainOptions::default();
	let read_u64 = |key: &str, default: u64| {
		config
			.get(key)
			.and_then(|v| v.as_integer())
			.map(|v| v as u64)
			.unwrap_or(default)
	};
	let options = AlloyChainOptions {
		polling_interval_secs: read_u64("polling_interval_secs", defaults.polling_interval_secs),
		lookback_blocks: read_u64("lookback_blocks", defaults.lookback_blocks),
		confirmations: read_u64("confirmations", defaults.confirmations),
		event_signatures: config
			.get("event_signatures")
			.and_then(|v| v.as_array())
			.map(|items| {
				items
					.iter()
					.filter_map(|v| v.as_str().map(str::to_string))
					.collect()
			})
			.unwrap_or(defaults.event_signatures),
	};

	Ok(Box::new(AlloyChain::new(network_ids, networks, options)?))
}

pub struct Registry;

impl lottery_types::ImplementationRegistry for Registry {
	const NAME: &'static str = "evm_alloy";
	type Factory = crate::ChainFactory;

	fn factory() -> Self::Factory {
		create_chain
	}
}

impl crate::ChainRegistry for Registry {}
