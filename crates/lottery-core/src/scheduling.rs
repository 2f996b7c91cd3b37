//! Time-driven transitions.
//!
//! Close and draw are normally fired by delayed queue jobs. The [`Sweeper`]
//! is the safety net: it periodically looks for lotteries whose end or draw
//! time has passed while they are still open and runs the transition itself,
//! and it asks again for draws that never got a transaction.

use async_trait::async_trait;
use lottery_queue::{Job, JobContext, JobFailure, JobHandler};
use lottery_types::{current_timestamp, truncate_id, LotteryStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::OrchestratorError;
use crate::state::LotteryStateMachine;
use crate::store::LotteryStore;

/// Payload of the `close-lottery` and `draw-lottery` jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionJob {
	pub lottery_id: String,
}

fn transition_payload(job: &Job) -> Result<TransitionJob, JobFailure> {
	job.payload()
		.map_err(|e| JobFailure::permanent(format!("Malformed transition job: {}", e)))
}

/// Fires ACTIVE -> CLOSING at `end_time`.
pub struct CloseLotteryJob {
	state_machine: Arc<LotteryStateMachine>,
}

impl CloseLotteryJob {
	pub fn new(state_machine: Arc<LotteryStateMachine>) -> Self {
		Self { state_machine }
	}
}

#[async_trait]
impl JobHandler for CloseLotteryJob {
	async fn handle(&self, job: &Job, _ctx: JobContext) -> Result<(), JobFailure> {
		let payload = transition_payload(job)?;
		self.state_machine
			.close_lottery(&payload.lottery_id)
			.await
			.map_err(OrchestratorError::from)?;
		Ok(())
	}
}

/// Fires the draw eligibility check at `draw_time`.
pub struct DrawLotteryJob {
	state_machine: Arc<LotteryStateMachine>,
}

impl DrawLotteryJob {
	pub fn new(state_machine: Arc<LotteryStateMachine>) -> Self {
		Self { state_machine }
	}
}

#[async_trait]
impl JobHandler for DrawLotteryJob {
	async fn handle(&self, job: &Job, _ctx: JobContext) -> Result<(), JobFailure> {
		let payload = transition_payload(job)?;
		self.state_machine
			.begin_draw(&payload.lottery_id)
			.await
			.map_err(OrchestratorError::from)?;
		Ok(())
	}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
	pub closed: usize,
	pub drawing_started: usize,
	/// DRAWING lotteries without a draw transaction whose draw was requested
	/// again.
	pub draws_requested: usize,
}

/// Periodic pass over overdue lotteries.
pub struct Sweeper {
	store: Arc<LotteryStore>,
	state_machine: Arc<LotteryStateMachine>,
}

impl Sweeper {
	pub fn new(store: Arc<LotteryStore>, state_machine: Arc<LotteryStateMachine>) -> Self {
		Self {
			store,
			state_machine,
		}
	}

	/// Closes lotteries past `end_time`, then starts the draw of those past
	/// `draw_time`, then requests the draw again for DRAWING lotteries that
	/// still have no draw transaction. A failure on one lottery does not stop
	/// the pass.
	pub async fn sweep(&self) -> Result<SweepReport, OrchestratorError> {
		let now = current_timestamp();
		let mut report = SweepReport::default();

		for lottery in self.store.due_for_close(now).await? {
			match self.state_machine.close_lottery(&lottery.id).await {
				Ok(outcome) if outcome.is_applied() => report.closed += 1,
				Ok(_) => {},
				Err(e) => {
					tracing::warn!(
						lottery_id = %truncate_id(&lottery.id),
						error = %e,
						"Sweep failed to close lottery"
					);
				},
			}
		}

		let mut started = HashSet::new();
		for lottery in self.store.due_for_draw(now).await? {
			match self.state_machine.begin_draw(&lottery.id).await {
				Ok(outcome) if outcome.is_applied() => {
					report.drawing_started += 1;
					started.insert(lottery.id);
				},
				Ok(_) => {},
				Err(e) => {
					tracing::warn!(
						lottery_id = %truncate_id(&lottery.id),
						error = %e,
						"Sweep failed to start draw"
					);
				},
			}
		}

		// Draws whose request was lost or whose job ran out of attempts.
		// Execution jobs are keyed by lottery, so a queued draw absorbs the
		// repeat.
		for lottery in self.store.by_status(&[LotteryStatus::Drawing]).await? {
			if lottery.draw_tx_hash.is_none() && !started.contains(&lottery.id) {
				self.state_machine.request_draw(&lottery);
				report.draws_requested += 1;
			}
		}

		if report != SweepReport::default() {
			tracing::info!(
				closed = report.closed,
				drawing_started = report.drawing_started,
				draws_requested = report.draws_requested,
				"Sweep applied overdue transitions"
			);
		}
		Ok(report)
	}
}
