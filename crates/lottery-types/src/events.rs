//! Notifications exchanged over the event bus.
//!
//! Every variant maps to one routing key (see [`OrchestratorEvent::topic`]).
//! Three of them are inbound requests (`lottery.deploy`, `lottery.draw`,
//! `ticket.purchase`); the rest are outbound notifications produced by the
//! state machine, the execution consumers and the reconciliation listener.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use crate::account::SigningKeyRef;

/// Top-level bus event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrchestratorEvent {
	Lottery(LotteryEvent),
	Ticket(TicketEvent),
}

/// Request to deploy a DRAFT lottery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
	pub operation_id: String,
	pub lottery_id: String,
	/// Key that pays for and signs the deployment.
	pub signer: SigningKeyRef,
}

/// Request to submit the draw of a DRAWING lottery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawRequest {
	pub operation_id: String,
	pub lottery_id: String,
	pub signer: SigningKeyRef,
}

/// Request to buy tickets on behalf of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRequest {
	pub operation_id: String,
	pub lottery_id: String,
	pub user_id: String,
	pub quantity: u64,
	pub signer: SigningKeyRef,
}

/// Lifecycle notifications of a lottery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LotteryEvent {
	/// `lottery.deploy`
	DeployRequested(DeployRequest),
	/// `lottery.deployed`
	Deployed {
		lottery_id: String,
		contract_address: Address,
		tx_hash: B256,
	},
	/// `lottery.deployment.failed`
	DeploymentFailed { lottery_id: String, error: String },
	/// `lottery.closing`
	Closing { lottery_id: String },
	/// `lottery.draw`
	DrawRequested(DrawRequest),
	/// `lottery.draw.submitted`
	DrawSubmitted { lottery_id: String, tx_hash: B256 },
	/// `lottery.draw.failed`
	DrawFailed { lottery_id: String, error: String },
	/// `lottery.drawn`
	Drawn {
		lottery_id: String,
		winning_numbers: Vec<u64>,
	},
	/// `lottery.insufficient_tickets`
	InsufficientTickets {
		lottery_id: String,
		tickets_sold: u64,
		min_tickets: u64,
	},
	/// `lottery.refund`
	RefundRequired {
		lottery_id: String,
		/// Contract holding the buyers' funds; `None` if never deployed.
		contract_address: Option<Address>,
		tickets_sold: u64,
	},
}

/// Ticket-level notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TicketEvent {
	/// `ticket.purchase`
	PurchaseRequested(PurchaseRequest),
	/// `ticket.purchase.submitted`
	PurchaseSubmitted {
		operation_id: String,
		lottery_id: String,
		user_id: String,
		quantity: u64,
		tx_hash: B256,
	},
	/// `ticket.purchase.failed`
	PurchaseFailed {
		operation_id: String,
		lottery_id: String,
		user_id: String,
		error: String,
	},
	/// `ticket.purchased`
	Purchased {
		lottery_id: String,
		user_id: String,
		ticket_numbers: Vec<u64>,
		tx_hash: B256,
	},
	/// `ticket.winning`
	Winning {
		lottery_id: String,
		user_id: String,
		ticket_number: u64,
		rank: u32,
		amount: U256,
	},
}

impl OrchestratorEvent {
	/// Routing key of the event.
	pub fn topic(&self) -> &'static str {
		match self {
			Self::Lottery(event) => match event {
				LotteryEvent::DeployRequested(_) => "lottery.deploy",
				LotteryEvent::Deployed { .. } => "lottery.deployed",
				LotteryEvent::DeploymentFailed { .. } => "lottery.deployment.failed",
				LotteryEvent::Closing { .. } => "lottery.closing",
				LotteryEvent::DrawRequested(_) => "lottery.draw",
				LotteryEvent::DrawSubmitted { .. } => "lottery.draw.submitted",
				LotteryEvent::DrawFailed { .. } => "lottery.draw.failed",
				LotteryEvent::Drawn { .. } => "lottery.drawn",
				LotteryEvent::InsufficientTickets { .. } => "lottery.insufficient_tickets",
				LotteryEvent::RefundRequired { .. } => "lottery.refund",
			},
			Self::Ticket(event) => match event {
				TicketEvent::PurchaseRequested(_) => "ticket.purchase",
				TicketEvent::PurchaseSubmitted { .. } => "ticket.purchase.submitted",
				TicketEvent::PurchaseFailed { .. } => "ticket.purchase.failed",
				TicketEvent::Purchased { .. } => "ticket.purchased",
				TicketEvent::Winning { .. } => "ticket.winning",
			},
		}
	}

	/// Lottery the event concerns.
	pub fn lottery_id(&self) -> &str {
		match self {
			Self::Lottery(event) => match event {
				LotteryEvent::DeployRequested(r) => &r.lottery_id,
				LotteryEvent::DrawRequested(r) => &r.lottery_id,
				LotteryEvent::Deployed { lottery_id, .. }
				| LotteryEvent::DeploymentFailed { lottery_id, .. }
				| LotteryEvent::Closing { lottery_id }
				| LotteryEvent::DrawSubmitted { lottery_id, .. }
				| LotteryEvent::DrawFailed { lottery_id, .. }
				| LotteryEvent::Drawn { lottery_id, .. }
				| LotteryEvent::InsufficientTickets { lottery_id, .. }
				| LotteryEvent::RefundRequired { lottery_id, .. } => lottery_id,
			},
			Self::Ticket(event) => match event {
				TicketEvent::PurchaseRequested(r) => &r.lottery_id,
				TicketEvent::PurchaseSubmitted { lottery_id, .. }
				| TicketEvent::PurchaseFailed { lottery_id, .. }
				| TicketEvent::Purchased { lottery_id, .. }
				| TicketEvent::Winning { lottery_id, .. } => lottery_id,
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_topics() {
		let closing = OrchestratorEvent::Lottery(LotteryEvent::Closing {
			lottery_id: "l1".into(),
		});
		assert_eq!(closing.topic(), "lottery.closing");
		assert_eq!(closing.lottery_id(), "l1");

		let refund = OrchestratorEvent::Lottery(LotteryEvent::RefundRequired {
			lottery_id: "l2".into(),
			contract_address: None,
			tickets_sold: 1,
		});
		assert_eq!(refund.topic(), "lottery.refund");

		let purchase = OrchestratorEvent::Ticket(TicketEvent::PurchaseRequested(PurchaseRequest {
			operation_id: "op".into(),
			lottery_id: "l3".into(),
			user_id: "u".into(),
			quantity: 2,
			signer: SigningKeyRef::new("buyer"),
		}));
		assert_eq!(purchase.topic(), "ticket.purchase");
		assert_eq!(purchase.lottery_id(), "l3");
	}

	#[test]
	fn test_requests_carry_key_reference_only() {
		let request = DeployRequest {
			operation_id: "op".into(),
			lottery_id: "l1".into(),
			signer: SigningKeyRef::new("creator-7"),
		};
		let json = serde_json::to_value(&request).unwrap();
		assert_eq!(json["signer"], "creator-7");
	}
}
