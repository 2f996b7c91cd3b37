//! Reconciliation of canonical records against on-chain events.
//!
//! The [`SubscriptionRegistry`] keeps one chain subscription per watched
//! contract and funnels every decoded log into a single channel. The
//! [`EventListener`] drains that channel, classifies each event and applies
//! the authoritative update: it is the only writer of ticket rows and the
//! only path from DRAWING to COMPLETED.

pub mod classifier;

use alloy_primitives::Address;
use lottery_chain::{ChainError, ChainService, EventSink, Subscription};
use lottery_types::{
	current_timestamp, truncate_id, winner_id, ContractEvent, Lottery, LotteryEvent,
	LotteryStatus, LotteryWinner, OrchestratorEvent, TicketEvent,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::instrument;

use self::classifier::{ClassifiedEvent, EventClassifier, PurchaseConfirmation};
use crate::engine::event_bus::EventBus;
use crate::error::{OrchestratorError, ReconciliationAmbiguity};
use crate::state::{LotteryStateMachine, TransitionOutcome};
use crate::store::{LotteryStore, Reservation};
use crate::wallets::WalletDirectory;

/// Live contract subscriptions keyed by contract address.
///
/// Never persisted; rebuilt from the canonical store at startup.
pub struct SubscriptionRegistry {
	chain: Arc<ChainService>,
	sink: EventSink,
	subscriptions: RwLock<HashMap<Address, Subscription>>,
}

impl SubscriptionRegistry {
	pub fn new(chain: Arc<ChainService>, sink: EventSink) -> Self {
		Self {
			chain,
			sink,
			subscriptions: RwLock::new(HashMap::new()),
		}
	}

	/// Starts watching the lottery's contract. Returns `false` when it has no
	/// contract or is already watched.
	pub async fn add_lottery(&self, lottery: &Lottery) -> Result<bool, ChainError> {
		let Some(contract) = lottery.contract_address else {
			return Ok(false);
		};
		if self.is_watching(&contract).await {
			return Ok(false);
		}

		let subscription = self
			.chain
			.watch(contract, lottery.chain_id, self.sink.clone())
			.await?;

		let mut subscriptions = self.subscriptions.write().await;
		if subscriptions
			.get(&contract)
			.map(Subscription::is_active)
			.unwrap_or(false)
		{
			// Lost a race with another caller; dropping ours unsubscribes it.
			return Ok(false);
		}
		subscriptions.insert(contract, subscription);
		tracing::info!(
			lottery_id = %truncate_id(&lottery.id),
			contract = %contract,
			chain_id = lottery.chain_id,
			"Listening to lottery contract"
		);
		Ok(true)
	}

	/// Removes the contract's subscription. Returns whether one existed.
	pub async fn stop_listening(&self, contract: &Address) -> bool {
		let removed = self.subscriptions.write().await.remove(contract);
		match removed {
			Some(subscription) => {
				subscription.unsubscribe();
				tracing::info!(contract = %contract, "Stopped listening to lottery contract");
				true
			},
			None => false,
		}
	}

	pub async fn is_watching(&self, contract: &Address) -> bool {
		self.subscriptions
			.read()
			.await
			.get(contract)
			.map(Subscription::is_active)
			.unwrap_or(false)
	}

	pub async fn len(&self) -> usize {
		self.subscriptions.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}

	/// Replaces every subscription with one per lottery in `lotteries`.
	///
	/// Lotteries whose subscription cannot be opened are logged and skipped.
	pub async fn rebuild(&self, lotteries: &[Lottery]) -> usize {
		self.stop_all().await;
		let mut watched = 0;
		for lottery in lotteries {
			match self.add_lottery(lottery).await {
				Ok(true) => watched += 1,
				Ok(false) => {},
				Err(e) => {
					tracing::error!(
						lottery_id = %truncate_id(&lottery.id),
						error = %e,
						"Failed to subscribe to lottery contract"
					);
				},
			}
		}
		watched
	}

	/// Drops every subscription. Returns how many were stopped.
	pub async fn stop_all(&self) -> usize {
		let drained: Vec<Subscription> = self
			.subscriptions
			.write()
			.await
			.drain()
			.map(|(_, subscription)| subscription)
			.collect();
		let count = drained.len();
		for subscription in drained {
			subscription.unsubscribe();
		}
		count
	}
}

/// Applies classified contract events to the canonical store.
pub struct EventListener {
	store: Arc<LotteryStore>,
	state_machine: Arc<LotteryStateMachine>,
	wallets: Arc<dyn WalletDirectory>,
	classifier: Box<dyn EventClassifier>,
	subscriptions: Arc<SubscriptionRegistry>,
	event_bus: EventBus,
}

impl EventListener {
	pub fn new(
		store: Arc<LotteryStore>,
		state_machine: Arc<LotteryStateMachine>,
		wallets: Arc<dyn WalletDirectory>,
		classifier: Box<dyn EventClassifier>,
		subscriptions: Arc<SubscriptionRegistry>,
		event_bus: EventBus,
	) -> Self {
		Self {
			store,
			state_machine,
			wallets,
			classifier,
			subscriptions,
			event_bus,
		}
	}

	pub async fn add_lottery(&self, lottery: &Lottery) -> Result<bool, ChainError> {
		self.subscriptions.add_lottery(lottery).await
	}

	pub async fn stop_listening(&self, contract: &Address) -> bool {
		self.subscriptions.stop_listening(contract).await
	}

	/// Subscribes to every lottery that can still emit purchase or draw
	/// events: ACTIVE, CLOSING and DRAWING.
	pub async fn rebuild(&self) -> Result<usize, OrchestratorError> {
		let lotteries = self
			.store
			.by_status(&[
				LotteryStatus::Active,
				LotteryStatus::Closing,
				LotteryStatus::Drawing,
			])
			.await?;
		Ok(self.subscriptions.rebuild(&lotteries).await)
	}

	/// Consumes contract events until `shutdown` fires.
	pub async fn run(
		self: Arc<Self>,
		mut events: mpsc::UnboundedReceiver<ContractEvent>,
		mut shutdown: broadcast::Receiver<()>,
	) {
		loop {
			tokio::select! {
				Some(event) = events.recv() => {
					self.process(&event).await;
				}
				_ = shutdown.recv() => {
					tracing::info!("Event listener stopping");
					break;
				}
			}
		}
	}

	/// Handles one event, logging instead of returning failures.
	pub async fn process(&self, event: &ContractEvent) {
		match self.handle_event(event).await {
			Ok(()) => {},
			Err(OrchestratorError::Reconciliation(e)) => {
				tracing::warn!(contract = %event.contract_address, "Dropping contract event: {}", e);
			},
			Err(e) => {
				tracing::error!(
					contract = %event.contract_address,
					event = %event.name,
					tx_hash = %truncate_id(&event.tx_hash.to_string()),
					error = %e,
					"Failed to reconcile contract event"
				);
			},
		}
	}

	#[instrument(skip_all, fields(event = %event.name, tx_hash = %truncate_id(&event.tx_hash.to_string())))]
	pub async fn handle_event(&self, event: &ContractEvent) -> Result<(), OrchestratorError> {
		match self.classifier.classify(event)? {
			ClassifiedEvent::Purchase(purchase) => self.reconcile_purchase(event, purchase).await,
			ClassifiedEvent::DrawCompleted { winning_numbers } => {
				self.reconcile_draw(event, winning_numbers).await
			},
		}
	}

	async fn lottery_for(&self, event: &ContractEvent) -> Result<Lottery, OrchestratorError> {
		let lottery = self
			.store
			.by_contract(&event.contract_address)
			.await?
			.ok_or_else(|| {
				ReconciliationAmbiguity::new(
					event,
					format!("no lottery uses contract {}", event.contract_address),
				)
			})?;
		Ok(lottery)
	}

	async fn reconcile_purchase(
		&self,
		event: &ContractEvent,
		purchase: PurchaseConfirmation,
	) -> Result<(), OrchestratorError> {
		let lottery = self.lottery_for(event).await?;
		let owner = self
			.wallets
			.resolve(purchase.buyer, lottery.chain_id)
			.await?
			.ok_or_else(|| {
				ReconciliationAmbiguity::new(
					event,
					format!(
						"buyer {} has no wallet on chain {}",
						purchase.buyer, lottery.chain_id
					),
				)
			})?;

		let reservation = self
			.store
			.reserve_ticket_numbers(
				&lottery.id,
				&event.dedup_key(),
				purchase.quantity,
				lottery.terms.max_tickets,
			)
			.await?
			.ok_or_else(|| {
				ReconciliationAmbiguity::new(
					event,
					format!(
						"quantity {} does not fit under max_tickets {}",
						purchase.quantity,
						lottery.terms.max_tickets
					),
				)
			})?;
		let range = reservation.range();
		let created = self
			.store
			.record_tickets(&lottery.id, range, &owner, purchase.buyer, event.tx_hash)
			.await?;

		match reservation {
			Reservation::Fresh(range) => {
				tracing::info!(
					lottery_id = %truncate_id(&lottery.id),
					user_id = %owner.user_id,
					first = range.first,
					last = range.last,
					"Tickets confirmed"
				);
				self.event_bus
					.publish(OrchestratorEvent::Ticket(TicketEvent::Purchased {
						lottery_id: lottery.id.clone(),
						user_id: owner.user_id.clone(),
						ticket_numbers: range.numbers().collect(),
						tx_hash: event.tx_hash,
					}))
					.ok();
			},
			Reservation::Replayed(_) => {
				tracing::debug!(
					lottery_id = %truncate_id(&lottery.id),
					restored = created,
					"Ignoring replayed purchase event"
				);
			},
		}
		Ok(())
	}

	async fn reconcile_draw(
		&self,
		event: &ContractEvent,
		winning_numbers: Vec<u64>,
	) -> Result<(), OrchestratorError> {
		let lottery = self.lottery_for(event).await?;
		match lottery.status {
			LotteryStatus::Drawing => {},
			LotteryStatus::Completed => {
				tracing::debug!(
					lottery_id = %truncate_id(&lottery.id),
					"Ignoring draw completion of a completed lottery"
				);
				return Ok(());
			},
			status => {
				return Err(ReconciliationAmbiguity::new(
					event,
					format!("draw completed while lottery is {}", status),
				)
				.into());
			},
		}

		let distribution = &lottery.terms.prize_distribution;
		if winning_numbers.len() > distribution.ranks() {
			return Err(ReconciliationAmbiguity::new(
				event,
				format!(
					"{} winning numbers for {} prize ranks",
					winning_numbers.len(),
					distribution.ranks()
				),
			)
			.into());
		}

		let tickets_sold = self.store.tickets_sold(&lottery.id).await?;
		let pool = lottery.prize_pool(tickets_sold);
		let now = current_timestamp();
		let mut winners = Vec::with_capacity(winning_numbers.len());
		for (index, number) in winning_numbers.iter().enumerate() {
			let rank = index as u32 + 1;
			let ticket = self.store.ticket(&lottery.id, *number).await?.ok_or_else(|| {
				ReconciliationAmbiguity::new(event, format!("winning ticket {} is unknown", number))
			})?;
			let amount = distribution.payout(rank, pool).ok_or_else(|| {
				ReconciliationAmbiguity::new(event, format!("no prize for rank {}", rank))
			})?;
			winners.push(LotteryWinner {
				id: winner_id(&lottery.id, rank),
				lottery_id: lottery.id.clone(),
				ticket_id: ticket.id,
				ticket_number: ticket.ticket_number,
				user_id: ticket.user_id,
				rank,
				amount,
				created_at: now,
			});
		}

		for winner in &winners {
			self.store.record_winner(winner).await?;
		}

		let outcome = self
			.state_machine
			.complete_draw(&lottery.id, event.tx_hash)
			.await?;
		let TransitionOutcome::Applied(completed) = outcome else {
			return Ok(());
		};

		if let Some(contract) = completed.contract_address {
			self.subscriptions.stop_listening(&contract).await;
		}
		tracing::info!(
			lottery_id = %truncate_id(&lottery.id),
			winners = winners.len(),
			tickets_sold,
			"Draw reconciled"
		);
		for winner in &winners {
			self.event_bus
				.publish(OrchestratorEvent::Ticket(TicketEvent::Winning {
					lottery_id: lottery.id.clone(),
					user_id: winner.user_id.clone(),
					ticket_number: winner.ticket_number,
					rank: winner.rank,
					amount: winner.amount,
				}))
				.ok();
		}
		self.event_bus
			.publish(OrchestratorEvent::Lottery(LotteryEvent::Drawn {
				lottery_id: lottery.id.clone(),
				winning_numbers,
			}))
			.ok();
		Ok(())
	}
}
