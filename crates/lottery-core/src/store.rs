//! Canonical records: lotteries, tickets, winners and per-lottery ticket
//! ledgers.
//!
//! Lottery rows are only ever changed through compare-and-swap so concurrent
//! writers (queue consumers, the sweep and the reconciliation listener) cannot
//! overwrite each other. Ticket numbers come from a per-lottery ledger that is
//! advanced atomically and remembers which on-chain log produced which range,
//! so replayed logs never mint new numbers.

use alloy_primitives::{Address, B256};
use lottery_storage::{Mutation, QueryFilter, StorageError, StorageIndexes, StorageService};
use lottery_types::{
	current_timestamp, ticket_id, Lottery, LotteryStatus, LotteryWinner, StorageKey, Ticket,
	WalletOwner,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

const LOTTERIES: StorageKey = StorageKey::Lotteries;
const TICKETS: StorageKey = StorageKey::Tickets;
const WINNERS: StorageKey = StorageKey::Winners;
const LEDGERS: StorageKey = StorageKey::TicketLedgers;

/// Index value of an address; lowercase so lookups ignore checksum casing.
pub(crate) fn address_key(address: &Address) -> String {
	address.to_string().to_lowercase()
}

fn lottery_indexes(lottery: &Lottery) -> StorageIndexes {
	let mut indexes = StorageIndexes::new()
		.with_field("status", lottery.status.as_str())
		.with_field("chain_id", lottery.chain_id)
		.with_field("creator_id", &lottery.creator_id);
	if let Some(end_time) = lottery.terms.end_time {
		indexes = indexes.with_field("end_time", end_time);
	}
	if let Some(draw_time) = lottery.terms.draw_time {
		indexes = indexes.with_field("draw_time", draw_time);
	}
	if let Some(contract) = &lottery.contract_address {
		indexes = indexes.with_field("contract_address", address_key(contract));
	}
	indexes
}

fn ticket_indexes(ticket: &Ticket) -> StorageIndexes {
	StorageIndexes::new()
		.with_field("lottery_id", &ticket.lottery_id)
		.with_field("ticket_number", ticket.ticket_number)
		.with_field("user_id", &ticket.user_id)
}

fn winner_indexes(winner: &LotteryWinner) -> StorageIndexes {
	StorageIndexes::new()
		.with_field("lottery_id", &winner.lottery_id)
		.with_field("rank", winner.rank)
		.with_field("user_id", &winner.user_id)
}

/// Inclusive range of ticket numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRange {
	pub first: u64,
	pub last: u64,
}

impl TicketRange {
	pub fn numbers(&self) -> impl Iterator<Item = u64> {
		self.first..=self.last
	}

	pub fn len(&self) -> u64 {
		self.last + 1 - self.first
	}

	pub fn is_empty(&self) -> bool {
		self.last < self.first
	}
}

/// Result of reserving ticket numbers for one purchase log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
	/// Numbers handed out for the first time.
	Fresh(TicketRange),
	/// The log was seen before; this is the range it got back then.
	Replayed(TicketRange),
}

impl Reservation {
	pub fn range(&self) -> TicketRange {
		match self {
			Reservation::Fresh(range) | Reservation::Replayed(range) => *range,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TicketLedger {
	lottery_id: String,
	last_number: u64,
	/// Range assigned per purchase log, keyed by `ContractEvent::dedup_key`.
	applied: HashMap<String, TicketRange>,
}

/// Typed access to the canonical store.
pub struct LotteryStore {
	storage: Arc<StorageService>,
}

impl LotteryStore {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	/// Inserts a new lottery; `Conflict` if the id is taken.
	pub async fn create(&self, lottery: &Lottery) -> Result<(), StorageError> {
		let created = self
			.storage
			.store_if_absent(
				LOTTERIES.as_str(),
				&lottery.id,
				lottery,
				Some(lottery_indexes(lottery)),
				None,
			)
			.await?;
		if !created {
			return Err(StorageError::Conflict(format!(
				"lottery {} already exists",
				lottery.id
			)));
		}
		Ok(())
	}

	pub async fn get(&self, lottery_id: &str) -> Result<Option<Lottery>, StorageError> {
		self.storage
			.retrieve_optional(LOTTERIES.as_str(), lottery_id)
			.await
	}

	/// Applies `mutate` with compare-and-swap and bumps `updated_at` when it
	/// reports a change. `mutate` may run more than once.
	pub async fn update_with<F>(
		&self,
		lottery_id: &str,
		mut mutate: F,
	) -> Result<Mutation<Lottery>, StorageError>
	where
		F: FnMut(&mut Lottery) -> bool,
	{
		self.storage
			.update_atomic(
				LOTTERIES.as_str(),
				lottery_id,
				|lottery: &mut Lottery| {
					if !mutate(lottery) {
						return false;
					}
					lottery.updated_at = current_timestamp();
					true
				},
				lottery_indexes,
			)
			.await
	}

	pub async fn by_status(&self, statuses: &[LotteryStatus]) -> Result<Vec<Lottery>, StorageError> {
		let values = statuses.iter().map(|s| json!(s.as_str())).collect();
		self.query_lotteries(QueryFilter::In("status".into(), values))
			.await
	}

	pub async fn by_contract(&self, contract: &Address) -> Result<Option<Lottery>, StorageError> {
		let filter = QueryFilter::Equals("contract_address".into(), json!(address_key(contract)));
		Ok(self.query_lotteries(filter).await?.into_iter().next())
	}

	/// ACTIVE lotteries whose end time is at or before `now`.
	pub async fn due_for_close(&self, now: u64) -> Result<Vec<Lottery>, StorageError> {
		self.query_lotteries(QueryFilter::And(vec![
			QueryFilter::Equals("status".into(), json!(LotteryStatus::Active.as_str())),
			QueryFilter::AtMost("end_time".into(), json!(now)),
		]))
		.await
	}

	/// ACTIVE or CLOSING lotteries whose draw time is at or before `now`.
	pub async fn due_for_draw(&self, now: u64) -> Result<Vec<Lottery>, StorageError> {
		self.query_lotteries(QueryFilter::And(vec![
			QueryFilter::In(
				"status".into(),
				vec![
					json!(LotteryStatus::Active.as_str()),
					json!(LotteryStatus::Closing.as_str()),
				],
			),
			QueryFilter::AtMost("draw_time".into(), json!(now)),
		]))
		.await
	}

	async fn query_lotteries(&self, filter: QueryFilter) -> Result<Vec<Lottery>, StorageError> {
		let mut lotteries: Vec<Lottery> = self
			.storage
			.query(LOTTERIES.as_str(), filter)
			.await?
			.into_iter()
			.map(|(_, lottery)| lottery)
			.collect();
		lotteries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
		Ok(lotteries)
	}

	/// Number of confirmed tickets.
	pub async fn tickets_sold(&self, lottery_id: &str) -> Result<u64, StorageError> {
		let count = self
			.storage
			.count(
				TICKETS.as_str(),
				QueryFilter::Equals("lottery_id".into(), json!(lottery_id)),
			)
			.await?;
		Ok(count as u64)
	}

	/// Tickets ordered by number.
	pub async fn tickets_for_lottery(&self, lottery_id: &str) -> Result<Vec<Ticket>, StorageError> {
		let mut tickets: Vec<Ticket> = self
			.storage
			.query(
				TICKETS.as_str(),
				QueryFilter::Equals("lottery_id".into(), json!(lottery_id)),
			)
			.await?
			.into_iter()
			.map(|(_, ticket)| ticket)
			.collect();
		tickets.sort_by_key(|t| t.ticket_number);
		Ok(tickets)
	}

	pub async fn ticket(&self, lottery_id: &str, number: u64) -> Result<Option<Ticket>, StorageError> {
		self.storage
			.retrieve_optional(TICKETS.as_str(), &ticket_id(lottery_id, number))
			.await
	}

	/// Winners ordered by rank.
	pub async fn winners_for_lottery(
		&self,
		lottery_id: &str,
	) -> Result<Vec<LotteryWinner>, StorageError> {
		let mut winners: Vec<LotteryWinner> = self
			.storage
			.query(
				WINNERS.as_str(),
				QueryFilter::Equals("lottery_id".into(), json!(lottery_id)),
			)
			.await?
			.into_iter()
			.map(|(_, winner)| winner)
			.collect();
		winners.sort_by_key(|w| w.rank);
		Ok(winners)
	}

	/// Highest ticket number handed out so far, 0 if none.
	pub async fn max_ticket_number(&self, lottery_id: &str) -> Result<u64, StorageError> {
		let ledger: Option<TicketLedger> = self
			.storage
			.retrieve_optional(LEDGERS.as_str(), lottery_id)
			.await?;
		match ledger {
			Some(ledger) => Ok(ledger.last_number),
			None => self.highest_stored_ticket(lottery_id).await,
		}
	}

	async fn highest_stored_ticket(&self, lottery_id: &str) -> Result<u64, StorageError> {
		Ok(self
			.tickets_for_lottery(lottery_id)
			.await?
			.last()
			.map(|t| t.ticket_number)
			.unwrap_or(0))
	}

	/// Reserves `quantity` consecutive numbers for the purchase log `event_key`.
	///
	/// `quantity` must be positive. Numbers continue from the lottery's
	/// current maximum and never pass `capacity`; a purchase that does not
	/// fit reserves nothing and returns `None`. Reserving again for the same
	/// log returns the original range as [`Reservation::Replayed`].
	pub async fn reserve_ticket_numbers(
		&self,
		lottery_id: &str,
		event_key: &str,
		quantity: u64,
		capacity: u64,
	) -> Result<Option<Reservation>, StorageError> {
		if !self.storage.exists(LEDGERS.as_str(), lottery_id).await? {
			let ledger = TicketLedger {
				lottery_id: lottery_id.to_string(),
				last_number: self.highest_stored_ticket(lottery_id).await?,
				applied: HashMap::new(),
			};
			// Losing this race is fine; the winner's ledger is used below.
			self.storage
				.store_if_absent(LEDGERS.as_str(), lottery_id, &ledger, None, None)
				.await?;
		}

		let mutation = self
			.storage
			.update_atomic(
				LEDGERS.as_str(),
				lottery_id,
				|ledger: &mut TicketLedger| {
					if ledger.applied.contains_key(event_key) || quantity == 0 {
						return false;
					}
					let Some(last) = ledger
						.last_number
						.checked_add(quantity)
						.filter(|last| *last <= capacity)
					else {
						return false;
					};
					let range = TicketRange {
						first: ledger.last_number + 1,
						last,
					};
					ledger.last_number = range.last;
					ledger.applied.insert(event_key.to_string(), range);
					true
				},
				|_| StorageIndexes::new(),
			)
			.await?;

		let fresh = mutation.is_applied();
		let ledger = mutation.into_inner();
		Ok(ledger.applied.get(event_key).map(|range| {
			if fresh {
				Reservation::Fresh(*range)
			} else {
				Reservation::Replayed(*range)
			}
		}))
	}

	/// Writes one ticket per number in `range`; existing rows are kept.
	///
	/// Returns how many rows were new.
	pub async fn record_tickets(
		&self,
		lottery_id: &str,
		range: TicketRange,
		owner: &WalletOwner,
		owner_address: Address,
		purchase_tx_hash: B256,
	) -> Result<usize, StorageError> {
		let now = current_timestamp();
		let mut created = 0;
		for number in range.numbers() {
			let ticket = Ticket {
				id: ticket_id(lottery_id, number),
				lottery_id: lottery_id.to_string(),
				ticket_number: number,
				wallet_id: owner.wallet_id.clone(),
				user_id: owner.user_id.clone(),
				owner_address,
				purchase_tx_hash,
				created_at: now,
			};
			if self
				.storage
				.store_if_absent(
					TICKETS.as_str(),
					&ticket.id,
					&ticket,
					Some(ticket_indexes(&ticket)),
					None,
				)
				.await?
			{
				created += 1;
			}
		}
		Ok(created)
	}

	/// Writes a winner unless its rank is already awarded.
	pub async fn record_winner(&self, winner: &LotteryWinner) -> Result<bool, StorageError> {
		self.storage
			.store_if_absent(
				WINNERS.as_str(),
				&winner.id,
				winner,
				Some(winner_indexes(winner)),
				None,
			)
			.await
	}
}
