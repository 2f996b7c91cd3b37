//! Namespaces of the canonical store.

use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	Lotteries,
	Tickets,
	Winners,
	/// Per-lottery ticket-number counters.
	TicketLedgers,
	Wallets,
	/// Durable task queue jobs.
	Jobs,
}

impl StorageKey {
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageKey::Lotteries => "lotteries",
			StorageKey::Tickets => "tickets",
			StorageKey::Winners => "winners",
			StorageKey::TicketLedgers => "ticket_ledgers",
			StorageKey::Wallets => "wallets",
			StorageKey::Jobs => "jobs",
		}
	}

	pub fn all() -> impl Iterator<Item = Self> {
		[
			Self::Lotteries,
			Self::Tickets,
			Self::Winners,
			Self::TicketLedgers,
			Self::Wallets,
			Self::Jobs,
		]
		.into_iter()
	}
}

impl FromStr for StorageKey {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::all().find(|key| key.as_str() == s).ok_or(())
	}
}

impl From<StorageKey> for &'static str {
	fn from(key: StorageKey) -> Self {
		key.as_str()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_storage_key_round_trip() {
		for key in StorageKey::all() {
			assert_eq!(key.as_str().parse::<StorageKey>(), Ok(key));
		}
		assert!("Lotteries".parse::<StorageKey>().is_err());
	}
}
