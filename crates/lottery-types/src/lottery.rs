//! The lottery aggregate and the rows that hang off it.
//!
//! A [`Lottery`] is the canonical record of one draw event. [`Ticket`] rows are
//! created exclusively from confirmed on-chain purchase events and
//! [`LotteryWinner`] rows exclusively from draw-completion reconciliation.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a lottery.
///
/// ```text
/// DRAFT -> PENDING -> ACTIVE -> CLOSING -> DRAWING -> COMPLETED
///            |          |                   |
///            v          +-------> DRAWING   +-> CANCELLED
///          DRAFT
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LotteryStatus {
	Draft,
	Pending,
	Active,
	Closing,
	Drawing,
	Completed,
	Cancelled,
}

impl LotteryStatus {
	pub const ALL: [LotteryStatus; 7] = [
		Self::Draft,
		Self::Pending,
		Self::Active,
		Self::Closing,
		Self::Drawing,
		Self::Completed,
		Self::Cancelled,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Draft => "DRAFT",
			Self::Pending => "PENDING",
			Self::Active => "ACTIVE",
			Self::Closing => "CLOSING",
			Self::Drawing => "DRAWING",
			Self::Completed => "COMPLETED",
			Self::Cancelled => "CANCELLED",
		}
	}

	/// No transition leaves a terminal status.
	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Completed | Self::Cancelled)
	}

	/// Statuses in which the lottery must carry a contract address.
	pub fn has_contract(&self) -> bool {
		matches!(
			self,
			Self::Active | Self::Closing | Self::Drawing | Self::Completed
		)
	}
}

impl fmt::Display for LotteryStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for LotteryStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|status| status.as_str() == s)
			.ok_or_else(|| format!("unknown lottery status '{}'", s))
	}
}

/// Percentage of the pool awarded per rank; index 0 is rank 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrizeDistribution(Vec<u32>);

impl PrizeDistribution {
	pub fn new(percentages: Vec<u32>) -> Self {
		Self(percentages)
	}

	pub fn percentages(&self) -> &[u32] {
		&self.0
	}

	/// Number of ranks that receive a payout.
	pub fn ranks(&self) -> usize {
		self.0.len()
	}

	/// Percentage for a 1-based rank.
	pub fn percentage_for_rank(&self, rank: u32) -> Option<u32> {
		let index = usize::try_from(rank).ok()?.checked_sub(1)?;
		self.0.get(index).copied()
	}

	/// Payout for a 1-based rank: `pool * percentage / 100`.
	pub fn payout(&self, rank: u32, pool: U256) -> Option<U256> {
		let percentage = self.percentage_for_rank(rank)?;
		Some(pool * U256::from(percentage) / U256::from(100u8))
	}

	pub fn validate(&self) -> Result<(), String> {
		if self.0.is_empty() {
			return Err("prize distribution has no ranks".to_string());
		}
		if self.0.iter().any(|p| *p == 0) {
			return Err("prize distribution contains a zero percentage".to_string());
		}
		let total: u32 = self.0.iter().sum();
		if total != 100 {
			return Err(format!("prize distribution sums to {}, expected 100", total));
		}
		Ok(())
	}
}

/// Start, end and draw time of a lottery once all three are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LotterySchedule {
	pub start_time: u64,
	pub end_time: u64,
	pub draw_time: u64,
}

impl LotterySchedule {
	pub fn validate(&self) -> Result<(), String> {
		if self.start_time >= self.end_time {
			return Err(format!(
				"start time {} is not before end time {}",
				self.start_time, self.end_time
			));
		}
		if self.draw_time < self.end_time {
			return Err(format!(
				"draw time {} is before end time {}",
				self.draw_time, self.end_time
			));
		}
		Ok(())
	}
}

/// Economic terms and timing chosen by the creator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotteryTerms {
	/// Price of one ticket in token base units.
	pub ticket_price: U256,
	pub token_address: Address,
	pub max_tickets: u64,
	pub min_tickets: u64,
	pub prize_distribution: PrizeDistribution,
	#[serde(default)]
	pub start_time: Option<u64>,
	#[serde(default)]
	pub end_time: Option<u64>,
	#[serde(default)]
	pub draw_time: Option<u64>,
}

/// Canonical lottery record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lottery {
	pub id: String,
	pub creator_id: String,
	pub chain_id: u64,
	pub status: LotteryStatus,
	pub terms: LotteryTerms,
	/// Set exactly while the status is one of ACTIVE, CLOSING, DRAWING, COMPLETED.
	#[serde(default)]
	pub contract_address: Option<Address>,
	#[serde(default)]
	pub deploy_tx_hash: Option<B256>,
	#[serde(default)]
	pub draw_tx_hash: Option<B256>,
	pub created_at: u64,
	pub updated_at: u64,
}

impl Lottery {
	/// A fresh lottery in DRAFT.
	pub fn draft(
		id: impl Into<String>,
		creator_id: impl Into<String>,
		chain_id: u64,
		terms: LotteryTerms,
	) -> Self {
		let now = crate::current_timestamp();
		Self {
			id: id.into(),
			creator_id: creator_id.into(),
			chain_id,
			status: LotteryStatus::Draft,
			terms,
			contract_address: None,
			deploy_tx_hash: None,
			draw_tx_hash: None,
			created_at: now,
			updated_at: now,
		}
	}

	/// All three timestamps, or `None` while any is missing.
	pub fn schedule(&self) -> Option<LotterySchedule> {
		Some(LotterySchedule {
			start_time: self.terms.start_time?,
			end_time: self.terms.end_time?,
			draw_time: self.terms.draw_time?,
		})
	}

	/// Total prize pool for the given number of sold tickets.
	pub fn prize_pool(&self, tickets_sold: u64) -> U256 {
		self.terms.ticket_price * U256::from(tickets_sold)
	}
}

/// Deterministic ticket row id.
pub fn ticket_id(lottery_id: &str, ticket_number: u64) -> String {
	format!("{}:{}", lottery_id, ticket_number)
}

/// Deterministic winner row id.
pub fn winner_id(lottery_id: &str, rank: u32) -> String {
	format!("{}:rank-{}", lottery_id, rank)
}

/// One purchased unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
	pub id: String,
	pub lottery_id: String,
	/// Sequential, gap-free within the lottery, starting at 1.
	pub ticket_number: u64,
	pub wallet_id: String,
	pub user_id: String,
	pub owner_address: Address,
	pub purchase_tx_hash: B256,
	pub created_at: u64,
}

/// One awarded rank of a completed draw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotteryWinner {
	pub id: String,
	pub lottery_id: String,
	pub ticket_id: String,
	pub ticket_number: u64,
	pub user_id: String,
	/// 1-based.
	pub rank: u32,
	pub amount: U256,
	pub created_at: u64,
}
