//! Deployment consumer.
//!
//! Takes a DRAFT lottery through PENDING to ACTIVE: validates the terms,
//! deploys the contract through the chain's factory, links the contract
//! address, schedules the close and draw transitions and starts listening to
//! the contract. A deployment that ends in failure returns the lottery to
//! DRAFT.
//!
//! A receipt is held until the contract address is stored on the lottery.
//! When linking fails after the contract exists, the next attempt links the
//! held receipt instead of deploying again.

use async_trait::async_trait;
use lottery_chain::ChainService;
use lottery_queue::{Job, JobContext, JobFailure, JobHandler};
use lottery_types::{
	truncate_id, DeployParams, DeployReceipt, DeployRequest, Lottery, LotteryEvent,
	LotteryStatus, OperationPhase, OperationStatus, OrchestratorEvent,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;

use super::{is_final_failure, request_payload};
use crate::engine::event_bus::EventBus;
use crate::error::OrchestratorError;
use crate::reconciliation::SubscriptionRegistry;
use crate::state::{LotteryStateMachine, TransitionOutcome};
use crate::status::StatusCache;
use crate::store::LotteryStore;
use crate::wallets::WalletDirectory;

pub struct DeployHandler {
	store: Arc<LotteryStore>,
	state_machine: Arc<LotteryStateMachine>,
	chain: Arc<ChainService>,
	wallets: Arc<dyn WalletDirectory>,
	subscriptions: Arc<SubscriptionRegistry>,
	status: Arc<StatusCache>,
	event_bus: EventBus,
	/// Deployed contracts not yet linked to their lottery, by lottery id.
	unlinked: Mutex<HashMap<String, DeployReceipt>>,
}

impl DeployHandler {
	pub fn new(
		store: Arc<LotteryStore>,
		state_machine: Arc<LotteryStateMachine>,
		chain: Arc<ChainService>,
		wallets: Arc<dyn WalletDirectory>,
		subscriptions: Arc<SubscriptionRegistry>,
		status: Arc<StatusCache>,
		event_bus: EventBus,
	) -> Self {
		Self {
			store,
			state_machine,
			chain,
			wallets,
			subscriptions,
			status,
			event_bus,
			unlinked: Mutex::new(HashMap::new()),
		}
	}

	/// Runs one attempt of a deployment request.
	#[instrument(skip_all, fields(lottery_id = %truncate_id(&request.lottery_id), attempt = ctx.attempt))]
	pub async fn handle_deploy(
		&self,
		request: &DeployRequest,
		ctx: JobContext,
	) -> Result<(), OrchestratorError> {
		let phase = OperationPhase::Deployment;
		self.status
			.mark(
				phase,
				&request.operation_id,
				&request.lottery_id,
				OperationStatus::Processing,
			)
			.await;

		match self.deploy(request).await {
			Ok(Some(receipt)) => {
				self.status
					.mark_submitted(
						phase,
						&request.operation_id,
						&request.lottery_id,
						OperationStatus::Completed,
						receipt.tx_hash,
					)
					.await;
				tracing::info!(
					contract = %receipt.contract_address,
					tx_hash = %truncate_id(&receipt.tx_hash.to_string()),
					"Lottery deployed"
				);
				self.event_bus
					.publish(OrchestratorEvent::Lottery(LotteryEvent::Deployed {
						lottery_id: request.lottery_id.clone(),
						contract_address: receipt.contract_address,
						tx_hash: receipt.tx_hash,
					}))
					.ok();
				Ok(())
			},
			Ok(None) => {
				self.status
					.mark(
						phase,
						&request.operation_id,
						&request.lottery_id,
						OperationStatus::Completed,
					)
					.await;
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
					self.abandon(request, &err).await;
				}
				Err(err)
			},
		}
	}

	/// Returns `None` when the lottery is already deployed.
	async fn deploy(&self, request: &DeployRequest) -> Result<Option<DeployReceipt>, OrchestratorError> {
		let lottery = self
			.store
			.get(&request.lottery_id)
			.await?
			.ok_or_else(|| {
				OrchestratorError::Validation(format!("Lottery {} not found", request.lottery_id))
			})?;

		match lottery.status {
			LotteryStatus::Draft | LotteryStatus::Pending => {},
			status if status.has_contract() => {
				tracing::info!(status = %status, "Lottery already deployed");
				return Ok(None);
			},
			status => {
				return Err(OrchestratorError::Validation(format!(
					"Lottery cannot be deployed while {}",
					status
				)));
			},
		}

		let params = self.validate(&lottery).await?;

		if lottery.status == LotteryStatus::Draft {
			if let TransitionOutcome::Skipped { current } =
				self.state_machine.accept_deployment(&lottery.id).await?
			{
				return Err(OrchestratorError::Validation(format!(
					"Lottery moved to {} before deployment started",
					current
				)));
			}
		}

		let held = self.unlinked.lock().await.get(&lottery.id).copied();
		let receipt = match held {
			Some(receipt) => {
				tracing::info!(
					contract = %receipt.contract_address,
					"Linking contract from an earlier attempt"
				);
				receipt
			},
			None => {
				let receipt = self.chain.deploy_lottery(params, &request.signer).await?;
				self.unlinked
					.lock()
					.await
					.insert(lottery.id.clone(), receipt);
				receipt
			},
		};

		let outcome = self.state_machine.mark_deployed(&lottery.id, receipt).await?;
		self.unlinked.lock().await.remove(&lottery.id);
		let deployed = match outcome {
			TransitionOutcome::Applied(deployed) => deployed,
			TransitionOutcome::Skipped { current } => {
				return Err(OrchestratorError::Validation(format!(
					"Lottery moved to {} while its contract was deployed at {}",
					current, receipt.contract_address
				)));
			},
		};

		if let Err(e) = self.state_machine.schedule_transitions(&deployed).await {
			// The sweeper still closes and draws it on time.
			tracing::warn!(error = %e, "Failed to schedule lottery transitions");
		}
		if let Err(e) = self.subscriptions.add_lottery(&deployed).await {
			tracing::error!(error = %e, "Failed to listen to deployed contract");
		}
		Ok(Some(receipt))
	}

	/// Checks the terms and resolves the creator's wallet.
	async fn validate(&self, lottery: &Lottery) -> Result<DeployParams, OrchestratorError> {
		if !self.chain.supports(lottery.chain_id) {
			return Err(OrchestratorError::Validation(format!(
				"Chain {} is not supported",
				lottery.chain_id
			)));
		}
		let schedule = lottery.schedule().ok_or_else(|| {
			OrchestratorError::Validation("Lottery schedule is incomplete".into())
		})?;
		schedule.validate().map_err(OrchestratorError::Validation)?;
		lottery
			.terms
			.prize_distribution
			.validate()
			.map_err(OrchestratorError::Validation)?;

		let creator = self
			.wallets
			.verified_wallet(&lottery.creator_id, lottery.chain_id)
			.await?
			.ok_or_else(|| {
				OrchestratorError::Validation(format!(
					"Creator {} has no verified wallet on chain {}",
					lottery.creator_id, lottery.chain_id
				))
			})?;

		DeployParams::from_lottery(lottery, creator.address).ok_or_else(|| {
			OrchestratorError::Validation("Lottery schedule is incomplete".into())
		})
	}

	async fn abandon(&self, request: &DeployRequest, err: &OrchestratorError) {
		if let Some(receipt) = self.unlinked.lock().await.get(&request.lottery_id) {
			tracing::error!(
				contract = %receipt.contract_address,
				tx_hash = %truncate_id(&receipt.tx_hash.to_string()),
				"Contract deployed but not linked; the next deployment links it"
			);
		}
		match self.state_machine.revert_deployment(&request.lottery_id).await {
			Ok(_) => {},
			Err(e) => {
				tracing::error!(error = %e, "Failed to return lottery to draft");
			},
		}
		tracing::error!(error = %err, "Deployment failed");
		self.event_bus
			.publish(OrchestratorEvent::Lottery(LotteryEvent::DeploymentFailed {
				lottery_id: request.lottery_id.clone(),
				error: err.to_string(),
			}))
			.ok();
	}
}

#[async_trait]
impl JobHandler for DeployHandler {
	async fn handle(&self, job: &Job, ctx: JobContext) -> Result<(), JobFailure> {
		let request: DeployRequest = request_payload(job)?;
		self.handle_deploy(&request, ctx).await?;
		Ok(())
	}
}
