//! Values exchanged with the blockchain layer.

use alloy_primitives::{Address, Bytes, B256, I256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::lottery::Lottery;

/// Everything the factory contract needs to create a lottery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployParams {
	pub chain_id: u64,
	pub token_address: Address,
	pub ticket_price: U256,
	pub max_tickets: u64,
	pub min_tickets: u64,
	pub start_time: u64,
	pub end_time: u64,
	pub draw_time: u64,
	pub prize_distribution: Vec<u32>,
	pub creator_address: Address,
}

impl DeployParams {
	/// Builds the parameters from a canonical lottery, or `None` when its
	/// schedule is incomplete.
	pub fn from_lottery(lottery: &Lottery, creator_address: Address) -> Option<Self> {
		let schedule = lottery.schedule()?;
		Some(Self {
			chain_id: lottery.chain_id,
			token_address: lottery.terms.token_address,
			ticket_price: lottery.terms.ticket_price,
			max_tickets: lottery.terms.max_tickets,
			min_tickets: lottery.terms.min_tickets,
			start_time: schedule.start_time,
			end_time: schedule.end_time,
			draw_time: schedule.draw_time,
			prize_distribution: lottery.terms.prize_distribution.percentages().to_vec(),
			creator_address,
		})
	}
}

/// Result of a successful deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployReceipt {
	pub contract_address: Address,
	pub tx_hash: B256,
}

/// Outcome of the read-only purchase pre-check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseCheck {
	pub can_buy: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
}

impl PurchaseCheck {
	pub fn allowed() -> Self {
		Self {
			can_buy: true,
			reason: None,
		}
	}

	pub fn denied(reason: impl Into<String>) -> Self {
		Self {
			can_buy: false,
			reason: Some(reason.into()),
		}
	}
}

/// Read-only projection of a deployed lottery contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotteryDetails {
	pub contract_address: Address,
	pub token_address: Address,
	pub ticket_price: U256,
	pub max_tickets: u64,
	pub min_tickets: u64,
	pub tickets_sold: u64,
	pub start_time: u64,
	pub end_time: u64,
	pub draw_time: u64,
	pub is_drawn: bool,
}

/// A decoded event argument.
///
/// Contracts deployed from different templates do not share one ABI, so the
/// reconciliation layer works on this loosely typed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventArg {
	/// Strings and addresses (checksummed hex).
	Text(String),
	Uint(U256),
	Int(I256),
	Bool(bool),
	Bytes(Bytes),
	/// Dynamic and fixed arrays as well as tuples.
	Array(Vec<EventArg>),
}

impl EventArg {
	pub fn as_text(&self) -> Option<&str> {
		match self {
			Self::Text(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_array(&self) -> Option<&[EventArg]> {
		match self {
			Self::Array(items) => Some(items),
			_ => None,
		}
	}

	/// Numeric value when it fits a `u64`; decimal strings are accepted.
	pub fn as_u64(&self) -> Option<u64> {
		match self {
			Self::Uint(v) => u64::try_from(*v).ok(),
			Self::Int(v) => u64::try_from(*v).ok(),
			Self::Text(s) => s.trim().parse().ok(),
			_ => None,
		}
	}

	/// The address carried by an address-shaped text argument.
	pub fn as_address(&self) -> Option<Address> {
		self.as_text()
			.filter(|s| crate::utils::is_address_like(s))
			.and_then(|s| s.parse().ok())
	}
}

impl fmt::Display for EventArg {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Text(s) => f.write_str(s),
			Self::Uint(v) => write!(f, "{}", v),
			Self::Int(v) => write!(f, "{}", v),
			Self::Bool(v) => write!(f, "{}", v),
			Self::Bytes(v) => write!(f, "{}", v),
			Self::Array(items) => {
				f.write_str("[")?;
				for (i, item) in items.iter().enumerate() {
					if i > 0 {
						f.write_str(", ")?;
					}
					write!(f, "{}", item)?;
				}
				f.write_str("]")
			},
		}
	}
}

impl From<&str> for EventArg {
	fn from(value: &str) -> Self {
		Self::Text(value.to_string())
	}
}

impl From<Address> for EventArg {
	fn from(value: Address) -> Self {
		Self::Text(value.to_checksum(None))
	}
}

impl From<u64> for EventArg {
	fn from(value: u64) -> Self {
		Self::Uint(U256::from(value))
	}
}

impl From<U256> for EventArg {
	fn from(value: U256) -> Self {
		Self::Uint(value)
	}
}

/// One decoded log emitted by a lottery contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractEvent {
	pub contract_address: Address,
	pub name: String,
	/// Positional arguments in declaration order, indexed ones included.
	pub args: Vec<EventArg>,
	pub tx_hash: B256,
	pub block_number: u64,
	pub log_index: u64,
}

impl ContractEvent {
	/// Identity of the log; replays of the same log share it.
	pub fn dedup_key(&self) -> String {
		format!("{:x}:{}", self.tx_hash, self.log_index)
	}
}
