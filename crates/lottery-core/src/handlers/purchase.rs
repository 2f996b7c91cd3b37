//! Purchase consumer.
//!
//! Submits a ticket purchase for a user's verified wallet. Tickets are never
//! created here: they appear when the listener reconciles the contract's
//! purchase event, which is the only source of truth for ownership.

use alloy_primitives::B256;
use async_trait::async_trait;
use lottery_chain::ChainService;
use lottery_queue::{Job, JobContext, JobFailure, JobHandler};
use lottery_types::{
	truncate_id, LotteryStatus, OperationPhase, OperationStatus, OrchestratorEvent,
	PurchaseRequest, TicketEvent,
};
use std::sync::Arc;
use tracing::instrument;

use super::{is_final_failure, request_payload};
use crate::engine::event_bus::EventBus;
use crate::error::OrchestratorError;
use crate::status::StatusCache;
use crate::store::LotteryStore;
use crate::wallets::WalletDirectory;

pub struct PurchaseHandler {
	store: Arc<LotteryStore>,
	chain: Arc<ChainService>,
	wallets: Arc<dyn WalletDirectory>,
	status: Arc<StatusCache>,
	event_bus: EventBus,
}

impl PurchaseHandler {
	pub fn new(
		store: Arc<LotteryStore>,
		chain: Arc<ChainService>,
		wallets: Arc<dyn WalletDirectory>,
		status: Arc<StatusCache>,
		event_bus: EventBus,
	) -> Self {
		Self {
			store,
			chain,
			wallets,
			status,
			event_bus,
		}
	}

	#[instrument(skip_all, fields(
		operation_id = %truncate_id(&request.operation_id),
		lottery_id = %truncate_id(&request.lottery_id),
		attempt = ctx.attempt
	))]
	pub async fn handle_purchase(
		&self,
		request: &PurchaseRequest,
		ctx: JobContext,
	) -> Result<(), OrchestratorError> {
		let phase = OperationPhase::Purchase;
		self.status
			.mark(
				phase,
				&request.operation_id,
				&request.lottery_id,
				OperationStatus::Processing,
			)
			.await;

		match self.submit(request).await {
			Ok(tx_hash) => {
				self.status
					.mark_submitted(
						phase,
						&request.operation_id,
						&request.lottery_id,
						OperationStatus::Submitted,
						tx_hash,
					)
					.await;
				self.event_bus
					.publish(OrchestratorEvent::Ticket(TicketEvent::PurchaseSubmitted {
						operation_id: request.operation_id.clone(),
						lottery_id: request.lottery_id.clone(),
						user_id: request.user_id.clone(),
						quantity: request.quantity,
						tx_hash,
					}))
					.ok();
				Ok(())
			},
			Err(err) => {
				let last = is_final_failure(&err, ctx);
				self.status
					.mark_failed(
						phase,
						&request.operation_id,
						&request.lottery_id,
						&err.to_string(),
						!last,
					)
					.await;
				if last {
					tracing::warn!(user_id = %request.user_id, error = %err, "Purchase failed");
					self.event_bus
						.publish(OrchestratorEvent::Ticket(TicketEvent::PurchaseFailed {
							operation_id: request.operation_id.clone(),
							lottery_id: request.lottery_id.clone(),
							user_id: request.user_id.clone(),
							error: err.to_string(),
						}))
						.ok();
				}
				Err(err)
			},
		}
	}

	async fn submit(&self, request: &PurchaseRequest) -> Result<B256, OrchestratorError> {
		if request.quantity == 0 {
			return Err(OrchestratorError::Validation(
				"Quantity must be positive".into(),
			));
		}
		let lottery = self
			.store
			.get(&request.lottery_id)
			.await?
			.ok_or_else(|| {
				OrchestratorError::Validation(format!("Lottery {} not found", request.lottery_id))
			})?;
		if lottery.status != LotteryStatus::Active {
			return Err(OrchestratorError::Validation(format!(
				"Lottery is not on sale while {}",
				lottery.status
			)));
		}
		let contract = lottery.contract_address.ok_or_else(|| {
			OrchestratorError::Validation("Active lottery has no contract".into())
		})?;

		let wallet = self
			.wallets
			.verified_wallet(&request.user_id, lottery.chain_id)
			.await?
			.ok_or_else(|| {
				OrchestratorError::Validation(format!(
					"User {} has no verified wallet on chain {}",
					request.user_id, lottery.chain_id
				))
			})?;

		let check = self
			.chain
			.can_buy_tickets(contract, lottery.chain_id, wallet.address, request.quantity)
			.await;
		if !check.can_buy {
			return Err(OrchestratorError::Validation(format!(
				"Purchase refused by contract: {}",
				check.reason.as_deref().unwrap_or("no reason given")
			)));
		}

		let tx_hash = self
			.chain
			.buy_tickets(
				contract,
				lottery.chain_id,
				request.quantity,
				wallet.address,
				&request.signer,
			)
			.await?;
		tracing::info!(
			quantity = request.quantity,
			buyer = %wallet.address,
			tx_hash = %truncate_id(&tx_hash.to_string()),
			"Purchase submitted"
		);
		Ok(tx_hash)
	}
}

#[async_trait]
impl JobHandler for PurchaseHandler {
	async fn handle(&self, job: &Job, ctx: JobContext) -> Result<(), JobFailure> {
		let request: PurchaseRequest = request_payload(job)?;
		self.handle_purchase(&request, ctx).await?;
		Ok(())
	}
}
