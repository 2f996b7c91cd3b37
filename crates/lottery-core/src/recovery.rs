//! Startup recovery.
//!
//! Subscriptions and in-memory progress are lost on restart. Recovery brings
//! every non-terminal lottery back under control from the canonical store:
//! stranded deployments return to DRAFT, open lotteries get their transitions
//! scheduled again, draws without a transaction are requested again and the
//! contract subscriptions are rebuilt.

use lottery_types::{truncate_id, LotteryStatus};
use std::sync::Arc;
use thiserror::Error;

use crate::reconciliation::SubscriptionRegistry;
use crate::state::LotteryStateMachine;
use crate::store::LotteryStore;

#[derive(Debug, Error)]
pub enum RecoveryError {
	#[error("Storage error: {0}")]
	Storage(String),
}

impl From<lottery_storage::StorageError> for RecoveryError {
	fn from(err: lottery_storage::StorageError) -> Self {
		Self::Storage(err.to_string())
	}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
	/// PENDING lotteries returned to DRAFT.
	pub reverted_deployments: usize,
	/// ACTIVE and CLOSING lotteries whose transitions were scheduled.
	pub rescheduled: usize,
	/// DRAWING lotteries whose draw was requested again.
	pub draws_requested: usize,
	pub subscriptions: usize,
}

pub struct RecoveryService {
	store: Arc<LotteryStore>,
	state_machine: Arc<LotteryStateMachine>,
	subscriptions: Arc<SubscriptionRegistry>,
}

impl RecoveryService {
	pub fn new(
		store: Arc<LotteryStore>,
		state_machine: Arc<LotteryStateMachine>,
		subscriptions: Arc<SubscriptionRegistry>,
	) -> Self {
		Self {
			store,
			state_machine,
			subscriptions,
		}
	}

	/// Runs the recovery pass. Failures on single lotteries are logged and
	/// skipped; only failing to read the store aborts it.
	pub async fn recover(&self) -> Result<RecoveryReport, RecoveryError> {
		let mut report = RecoveryReport::default();

		// A deployment that was in flight has no receipt to resume from; a new
		// request deploys it from scratch.
		for lottery in self.store.by_status(&[LotteryStatus::Pending]).await? {
			match self.state_machine.revert_deployment(&lottery.id).await {
				Ok(outcome) if outcome.is_applied() => report.reverted_deployments += 1,
				Ok(_) => {},
				Err(e) => {
					tracing::error!(
						lottery_id = %truncate_id(&lottery.id),
						error = %e,
						"Failed to revert stranded deployment"
					);
				},
			}
		}

		for lottery in self
			.store
			.by_status(&[LotteryStatus::Active, LotteryStatus::Closing])
			.await?
		{
			match self.state_machine.schedule_transitions(&lottery).await {
				Ok(()) => report.rescheduled += 1,
				Err(e) => {
					tracing::error!(
						lottery_id = %truncate_id(&lottery.id),
						error = %e,
						"Failed to reschedule lottery transitions"
					);
				},
			}
		}

		for lottery in self.store.by_status(&[LotteryStatus::Drawing]).await? {
			if lottery.draw_tx_hash.is_none() {
				self.state_machine.request_draw(&lottery);
				report.draws_requested += 1;
			}
		}

		// Rescheduling may have moved lotteries on, so read the open set again.
		let watched = self
			.store
			.by_status(&[
				LotteryStatus::Active,
				LotteryStatus::Closing,
				LotteryStatus::Drawing,
			])
			.await?;
		report.subscriptions = self.subscriptions.rebuild(&watched).await;

		tracing::info!(
			reverted_deployments = report.reverted_deployments,
			rescheduled = report.rescheduled,
			draws_requested = report.draws_requested,
			subscriptions = report.subscriptions,
			"Recovery complete"
		);
		Ok(report)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::{active_lottery, draft_lottery, drain_bus, Fixture};
	use lottery_queue::{JobState, CLOSE_LOTTERY};
	use lottery_types::{LotteryEvent, OrchestratorEvent};

	#[tokio::test]
	async fn test_recovery_restores_every_open_lottery() {
		let mut fixture = Fixture::new().await;
		fixture.store.create(&draft_lottery("pending")).await.unwrap();
		fixture.state_machine.accept_deployment("pending").await.unwrap();
		let open = active_lottery(&fixture, "open", 3_600, 7_200).await;
		let drawing = active_lottery(&fixture, "drawing", -120, -60).await;
		fixture.seed_tickets(&drawing, 10).await;
		fixture
			.store
			.update_with("drawing", |l| {
				l.status = LotteryStatus::Drawing;
				true
			})
			.await
			.unwrap();
		drain_bus(&mut fixture.bus);

		let recovery = RecoveryService::new(
			fixture.store.clone(),
			fixture.state_machine.clone(),
			fixture.subscriptions.clone(),
		);
		let report = recovery.recover().await.unwrap();
		assert_eq!(
			report,
			RecoveryReport {
				reverted_deployments: 1,
				rescheduled: 1,
				draws_requested: 1,
				subscriptions: 2,
			}
		);

		let pending = fixture.store.get("pending").await.unwrap().unwrap();
		assert_eq!(pending.status, LotteryStatus::Draft);
		assert!(fixture
			.subscriptions
			.is_watching(&open.contract_address.unwrap())
			.await);
		assert!(fixture
			.subscriptions
			.is_watching(&drawing.contract_address.unwrap())
			.await);
		assert_eq!(
			fixture.queue.jobs(CLOSE_LOTTERY, JobState::Waiting).await.unwrap().len(),
			1
		);

		let events = drain_bus(&mut fixture.bus);
		assert!(matches!(
			&events[..],
			[OrchestratorEvent::Lottery(LotteryEvent::DrawRequested(request))]
				if request.lottery_id == "drawing"
		));
	}

	#[tokio::test]
	async fn test_recovery_is_repeatable() {
		let fixture = Fixture::new().await;
		active_lottery(&fixture, "open", 3_600, 7_200).await;
		let recovery = RecoveryService::new(
			fixture.store.clone(),
			fixture.state_machine.clone(),
			fixture.subscriptions.clone(),
		);

		recovery.recover().await.unwrap();
		let second = recovery.recover().await.unwrap();
		assert_eq!(second.subscriptions, 1);
		assert_eq!(fixture.subscriptions.len().await, 1);
		assert_eq!(
			fixture.queue.jobs(CLOSE_LOTTERY, JobState::Waiting).await.unwrap().len(),
			1
		);
	}
}
