//! Draw consumer. Submits the draw transaction of a DRAWING lottery; the
//! lottery only completes once the listener sees the draw event.

use alloy_primitives::B256;
use async_trait::async_trait;
use lottery_chain::ChainService;
use lottery_queue::{Job, JobContext, JobFailure, JobHandler};
use lottery_types::{
	truncate_id, DrawRequest, LotteryEvent, LotteryStatus, OperationPhase, OperationStatus,
	OrchestratorEvent,
};
use std::sync::Arc;
use tracing::instrument;

use super::{is_final_failure, request_payload};
use crate::engine::event_bus::EventBus;
use crate::error::OrchestratorError;
use crate::state::LotteryStateMachine;
use crate::status::StatusCache;
use crate::store::LotteryStore;

pub struct DrawHandler {
	store: Arc<LotteryStore>,
	state_machine: Arc<LotteryStateMachine>,
	chain: Arc<ChainService>,
	status: Arc<StatusCache>,
	event_bus: EventBus,
}

impl DrawHandler {
	pub fn new(
		store: Arc<LotteryStore>,
		state_machine: Arc<LotteryStateMachine>,
		chain: Arc<ChainService>,
		status: Arc<StatusCache>,
		event_bus: EventBus,
	) -> Self {
		Self {
			store,
			state_machine,
			chain,
			status,
			event_bus,
		}
	}

	#[instrument(skip_all, fields(lottery_id = %truncate_id(&request.lottery_id), attempt = ctx.attempt))]
	pub async fn handle_draw(
		&self,
		request: &DrawRequest,
		ctx: JobContext,
	) -> Result<(), OrchestratorError> {
		let phase = OperationPhase::Draw;
		self.status
			.mark(
				phase,
				&request.operation_id,
				&request.lottery_id,
				OperationStatus::Processing,
			)
			.await;

		match self.submit(request).await {
			Ok(Some(tx_hash)) => {
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
					.publish(OrchestratorEvent::Lottery(LotteryEvent::DrawSubmitted {
						lottery_id: request.lottery_id.clone(),
						tx_hash,
					}))
					.ok();
				Ok(())
			},
			Ok(None) => Ok(()),
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
					// The lottery stays DRAWING; the sweep requests the draw again.
					tracing::error!(error = %err, "Draw submission failed");
					self.event_bus
						.publish(OrchestratorEvent::Lottery(LotteryEvent::DrawFailed {
							lottery_id: request.lottery_id.clone(),
							error: err.to_string(),
						}))
						.ok();
				}
				Err(err)
			},
		}
	}

	/// Returns `None` when the draw was already submitted or confirmed.
	async fn submit(
		&self,
		request: &DrawRequest,
	) -> Result<Option<B256>, OrchestratorError> {
		let lottery = self
			.store
			.get(&request.lottery_id)
			.await?
			.ok_or_else(|| {
				OrchestratorError::Validation(format!("Lottery {} not found", request.lottery_id))
			})?;

		match lottery.status {
			LotteryStatus::Drawing if lottery.draw_tx_hash.is_some() => {
				tracing::info!("Draw already submitted");
				return Ok(None);
			},
			LotteryStatus::Drawing => {},
			LotteryStatus::Completed => {
				tracing::info!("Draw already completed");
				return Ok(None);
			},
			status => {
				return Err(OrchestratorError::Validation(format!(
					"Lottery cannot be drawn while {}",
					status
				)));
			},
		}
		let contract = lottery.contract_address.ok_or_else(|| {
			OrchestratorError::Validation("Drawing lottery has no contract".into())
		})?;

		let tx_hash = self
			.chain
			.draw(contract, lottery.chain_id, &request.signer)
			.await?;
		if !self
			.state_machine
			.record_draw_tx(&lottery.id, tx_hash)
			.await?
		{
			tracing::debug!("Draw transaction already recorded");
		}
		tracing::info!(tx_hash = %truncate_id(&tx_hash.to_string()), "Draw submitted");
		Ok(Some(tx_hash))
	}
}

#[async_trait]
impl JobHandler for DrawHandler {
	async fn handle(&self, job: &Job, ctx: JobContext) -> Result<(), JobFailure> {
		let request: DrawRequest = request_payload(job)?;
		self.handle_draw(&request, ctx).await?;
		Ok(())
	}
}
