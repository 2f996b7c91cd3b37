//! Lottery state machine.
//!
//! Owns the canonical `status` field. Every transition is a compare-and-swap
//! guarded on the expected pre-state: when another writer got there first the
//! transition is skipped with a warning instead of failing. The machine also
//! schedules the time-driven transitions (close at `end_time`, draw at
//! `draw_time`) on the task queue.

use alloy_primitives::{Address, B256};
use lottery_queue::{JobOptions, TaskQueue, CLOSE_LOTTERY, DRAW_LOTTERY};
use lottery_storage::StorageError;
use lottery_types::{
	current_timestamp, truncate_id, DeployReceipt, DrawRequest, Lottery, LotteryEvent,
	LotteryStatus, OrchestratorEvent, SigningKeyRef,
};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::engine::event_bus::EventBus;
use crate::reconciliation::SubscriptionRegistry;
use crate::scheduling::TransitionJob;
use crate::store::LotteryStore;

#[derive(Debug, Error)]
pub enum LotteryStateError {
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Lottery not found: {0}")]
	LotteryNotFound(String),
	#[error("Invalid state transition from {from} to {to}")]
	InvalidTransition {
		from: LotteryStatus,
		to: LotteryStatus,
	},
	#[error("Transition of {lottery_id} to {to} would break the contract address invariant")]
	ContractInvariant {
		lottery_id: String,
		to: LotteryStatus,
	},
	#[error("Queue error: {0}")]
	Queue(String),
}

impl From<StorageError> for LotteryStateError {
	fn from(err: StorageError) -> Self {
		Self::Storage(err.to_string())
	}
}

/// Result of a guarded transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
	/// The row was in an expected status and now carries the new one.
	Applied(Lottery),
	/// The row was in `current`; nothing was written.
	Skipped { current: LotteryStatus },
}

impl TransitionOutcome {
	pub fn is_applied(&self) -> bool {
		matches!(self, Self::Applied(_))
	}
}

static TRANSITIONS: Lazy<HashMap<LotteryStatus, HashSet<LotteryStatus>>> = Lazy::new(|| {
	use LotteryStatus::*;
	HashMap::from([
		(Draft, HashSet::from([Pending])),
		(Pending, HashSet::from([Active, Draft])),
		// CANCELLED is reached from ACTIVE/CLOSING when the draw finds too few tickets.
		(Active, HashSet::from([Closing, Drawing, Cancelled])),
		(Closing, HashSet::from([Drawing, Cancelled])),
		(Drawing, HashSet::from([Completed, Cancelled])),
	])
});

pub struct LotteryStateMachine {
	store: Arc<LotteryStore>,
	queue: Arc<TaskQueue>,
	subscriptions: Arc<SubscriptionRegistry>,
	event_bus: EventBus,
	/// Signs draws requested by the scheduler.
	operator_key: SigningKeyRef,
	/// Attempts and backoff for close/draw jobs.
	job_options: JobOptions,
}

impl LotteryStateMachine {
	pub fn new(
		store: Arc<LotteryStore>,
		queue: Arc<TaskQueue>,
		subscriptions: Arc<SubscriptionRegistry>,
		event_bus: EventBus,
		operator_key: SigningKeyRef,
		job_options: JobOptions,
	) -> Self {
		Self {
			store,
			queue,
			subscriptions,
			event_bus,
			operator_key,
			job_options,
		}
	}

	pub fn is_valid_transition(from: LotteryStatus, to: LotteryStatus) -> bool {
		TRANSITIONS
			.get(&from)
			.map(|targets| targets.contains(&to))
			.unwrap_or(false)
	}

	/// Moves the lottery from one of `expected` to `to`, applying `apply` to
	/// the row in the same write.
	///
	/// A row in any other status is left alone and reported as
	/// [`TransitionOutcome::Skipped`]. `apply` may run more than once when
	/// writers race.
	pub async fn transition<F>(
		&self,
		lottery_id: &str,
		expected: &[LotteryStatus],
		to: LotteryStatus,
		mut apply: F,
	) -> Result<TransitionOutcome, LotteryStateError>
	where
		F: FnMut(&mut Lottery),
	{
		if let Some(from) = expected
			.iter()
			.find(|from| !Self::is_valid_transition(**from, to))
		{
			return Err(LotteryStateError::InvalidTransition { from: *from, to });
		}

		let mut previous = None;
		let mut broken_invariant = false;
		let result = self
			.store
			.update_with(lottery_id, |lottery| {
				if !expected.contains(&lottery.status) {
					return false;
				}
				previous = Some(lottery.status);
				apply(lottery);
				lottery.status = to;
				broken_invariant = lottery.contract_address.is_some() != to.has_contract();
				!broken_invariant
			})
			.await;

		let mutation = match result {
			Ok(mutation) => mutation,
			Err(StorageError::NotFound(_)) => {
				return Err(LotteryStateError::LotteryNotFound(lottery_id.to_string()))
			},
			Err(e) => return Err(e.into()),
		};
		if broken_invariant {
			return Err(LotteryStateError::ContractInvariant {
				lottery_id: lottery_id.to_string(),
				to,
			});
		}

		if mutation.is_applied() {
			let lottery = mutation.into_inner();
			tracing::info!(
				lottery_id = %truncate_id(lottery_id),
				from = ?previous,
				to = %to,
				"Lottery transitioned"
			);
			Ok(TransitionOutcome::Applied(lottery))
		} else {
			let current = mutation.into_inner().status;
			tracing::warn!(
				lottery_id = %truncate_id(lottery_id),
				current = %current,
				expected = ?expected,
				to = %to,
				"Transition skipped, lottery is not in an expected status"
			);
			Ok(TransitionOutcome::Skipped { current })
		}
	}

	/// DRAFT -> PENDING.
	pub async fn accept_deployment(
		&self,
		lottery_id: &str,
	) -> Result<TransitionOutcome, LotteryStateError> {
		self.transition(
			lottery_id,
			&[LotteryStatus::Draft],
			LotteryStatus::Pending,
			|_| {},
		)
		.await
	}

	/// PENDING -> ACTIVE, linking the deployed contract.
	pub async fn mark_deployed(
		&self,
		lottery_id: &str,
		receipt: DeployReceipt,
	) -> Result<TransitionOutcome, LotteryStateError> {
		self.transition(
			lottery_id,
			&[LotteryStatus::Pending],
			LotteryStatus::Active,
			|lottery| {
				lottery.contract_address = Some(receipt.contract_address);
				lottery.deploy_tx_hash = Some(receipt.tx_hash);
			},
		)
		.await
	}

	/// PENDING -> DRAFT after a failed deployment.
	pub async fn revert_deployment(
		&self,
		lottery_id: &str,
	) -> Result<TransitionOutcome, LotteryStateError> {
		self.transition(
			lottery_id,
			&[LotteryStatus::Pending],
			LotteryStatus::Draft,
			|lottery| {
				lottery.contract_address = None;
				lottery.deploy_tx_hash = None;
			},
		)
		.await
	}

	/// Enqueues the close and draw jobs still ahead of the lottery, or runs
	/// the transition immediately when its time has already come.
	///
	/// Job ids are derived from the lottery id, so scheduling twice leaves a
	/// single pending job per transition.
	pub async fn schedule_transitions(&self, lottery: &Lottery) -> Result<(), LotteryStateError> {
		let Some(schedule) = lottery.schedule() else {
			tracing::warn!(
				lottery_id = %truncate_id(&lottery.id),
				"Lottery has no complete schedule, nothing to plan"
			);
			return Ok(());
		};
		let now = current_timestamp();

		if lottery.status == LotteryStatus::Active {
			if schedule.end_time > now {
				self.enqueue_transition(CLOSE_LOTTERY, &lottery.id, schedule.end_time - now)
					.await?;
			} else {
				self.close_lottery(&lottery.id).await?;
			}
		}

		if matches!(
			lottery.status,
			LotteryStatus::Active | LotteryStatus::Closing
		) {
			if schedule.draw_time > now {
				self.enqueue_transition(DRAW_LOTTERY, &lottery.id, schedule.draw_time - now)
					.await?;
			} else {
				self.begin_draw(&lottery.id).await?;
			}
		}
		Ok(())
	}

	async fn enqueue_transition(
		&self,
		topic: &str,
		lottery_id: &str,
		delay_secs: u64,
	) -> Result<(), LotteryStateError> {
		let options = self
			.job_options
			.clone()
			.with_delay(Duration::from_secs(delay_secs))
			.with_job_id(format!("{}:{}", topic, lottery_id));
		self.queue
			.enqueue(
				topic,
				&TransitionJob {
					lottery_id: lottery_id.to_string(),
				},
				options,
			)
			.await
			.map_err(|e| LotteryStateError::Queue(e.to_string()))?;
		tracing::debug!(
			lottery_id = %truncate_id(lottery_id),
			topic,
			delay_secs,
			"Scheduled transition"
		);
		Ok(())
	}

	/// ACTIVE -> CLOSING. Publishes `lottery.closing` only when applied.
	pub async fn close_lottery(
		&self,
		lottery_id: &str,
	) -> Result<TransitionOutcome, LotteryStateError> {
		let outcome = self
			.transition(
				lottery_id,
				&[LotteryStatus::Active],
				LotteryStatus::Closing,
				|_| {},
			)
			.await?;
		if outcome.is_applied() {
			self.event_bus
				.publish(OrchestratorEvent::Lottery(LotteryEvent::Closing {
					lottery_id: lottery_id.to_string(),
				}))
				.ok();
		}
		Ok(outcome)
	}

	/// Draw time reached: checks eligibility and moves ACTIVE/CLOSING to
	/// DRAWING, or to CANCELLED when fewer than `min_tickets` were sold.
	///
	/// A cancelled lottery releases its contract address, which travels in the
	/// `lottery.refund` notification. The chain is not contacted here; DRAWING
	/// publishes a `lottery.draw` request signed by the operator key.
	pub async fn begin_draw(
		&self,
		lottery_id: &str,
	) -> Result<TransitionOutcome, LotteryStateError> {
		let lottery = self
			.store
			.get(lottery_id)
			.await?
			.ok_or_else(|| LotteryStateError::LotteryNotFound(lottery_id.to_string()))?;
		let drawable = [LotteryStatus::Active, LotteryStatus::Closing];
		if !drawable.contains(&lottery.status) {
			tracing::warn!(
				lottery_id = %truncate_id(lottery_id),
				current = %lottery.status,
				"Draw skipped, lottery is not open"
			);
			return Ok(TransitionOutcome::Skipped {
				current: lottery.status,
			});
		}

		let tickets_sold = self.store.tickets_sold(lottery_id).await?;
		let min_tickets = lottery.terms.min_tickets;
		if tickets_sold < min_tickets {
			let mut released: Option<Address> = None;
			let outcome = self
				.transition(lottery_id, &drawable, LotteryStatus::Cancelled, |lottery| {
					released = lottery.contract_address.take();
				})
				.await?;
			if outcome.is_applied() {
				tracing::info!(
					lottery_id = %truncate_id(lottery_id),
					tickets_sold,
					min_tickets,
					"Lottery cancelled for insufficient tickets"
				);
				if let Some(contract) = released {
					self.subscriptions.stop_listening(&contract).await;
				}
				self.event_bus
					.publish(OrchestratorEvent::Lottery(
						LotteryEvent::InsufficientTickets {
							lottery_id: lottery_id.to_string(),
							tickets_sold,
							min_tickets,
						},
					))
					.ok();
				self.event_bus
					.publish(OrchestratorEvent::Lottery(LotteryEvent::RefundRequired {
						lottery_id: lottery_id.to_string(),
						contract_address: released,
						tickets_sold,
					}))
					.ok();
			}
			return Ok(outcome);
		}

		let outcome = self
			.transition(lottery_id, &drawable, LotteryStatus::Drawing, |_| {})
			.await?;
		if let TransitionOutcome::Applied(drawing) = &outcome {
			self.request_draw(drawing);
		}
		Ok(outcome)
	}

	/// Publishes a `lottery.draw` request for a DRAWING lottery.
	///
	/// The lottery id doubles as the operation id so every request for the
	/// same draw shares one status record.
	pub fn request_draw(&self, lottery: &Lottery) {
		self.event_bus
			.publish(OrchestratorEvent::Lottery(LotteryEvent::DrawRequested(
				DrawRequest {
					operation_id: lottery.id.clone(),
					lottery_id: lottery.id.clone(),
					signer: self.operator_key.clone(),
				},
			)))
			.ok();
	}

	/// Stores the draw transaction of a DRAWING lottery unless one is already
	/// known. Returns whether it was written.
	pub async fn record_draw_tx(
		&self,
		lottery_id: &str,
		tx_hash: B256,
	) -> Result<bool, LotteryStateError> {
		let mutation = self
			.store
			.update_with(lottery_id, |lottery| {
				if lottery.status != LotteryStatus::Drawing || lottery.draw_tx_hash.is_some() {
					return false;
				}
				lottery.draw_tx_hash = Some(tx_hash);
				true
			})
			.await?;
		Ok(mutation.is_applied())
	}

	/// DRAWING -> COMPLETED once the draw is confirmed on-chain.
	pub async fn complete_draw(
		&self,
		lottery_id: &str,
		draw_tx_hash: B256,
	) -> Result<TransitionOutcome, LotteryStateError> {
		self.transition(
			lottery_id,
			&[LotteryStatus::Drawing],
			LotteryStatus::Completed,
			|lottery| {
				lottery.draw_tx_hash.get_or_insert(draw_tx_hash);
			},
		)
		.await
	}
}
