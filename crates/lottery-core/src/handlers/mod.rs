//! Execution consumers for the three blockchain-bound requests.
//!
//! Each handler runs behind a task queue topic. A failed attempt updates the
//! operation's status record; the failure notification is published only once
//! the queue will not run the job again.

pub mod deploy;
pub mod draw;
pub mod purchase;

pub use deploy::DeployHandler;
pub use draw::DrawHandler;
pub use purchase::PurchaseHandler;

use lottery_queue::{Job, JobContext, JobFailure};
use serde::de::DeserializeOwned;

use crate::error::OrchestratorError;

/// Whether `err` ends the operation: it cannot be retried or this was the
/// last attempt.
pub(crate) fn is_final_failure(err: &OrchestratorError, ctx: JobContext) -> bool {
	!err.is_retryable() || ctx.is_final_attempt()
}

pub(crate) fn request_payload<T: DeserializeOwned>(job: &Job) -> Result<T, JobFailure> {
	job.payload()
		.map_err(|e| JobFailure::permanent(format!("Malformed request payload: {}", e)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use lottery_chain::ChainError;

	#[test]
	fn test_final_failure() {
		let first = JobContext {
			attempt: 1,
			max_attempts: 3,
		};
		let last = JobContext {
			attempt: 3,
			max_attempts: 3,
		};
		let transient = OrchestratorError::from(ChainError::Network("reset".into()));
		let invalid = OrchestratorError::Validation("not active".into());

		assert!(!is_final_failure(&transient, first));
		assert!(is_final_failure(&transient, last));
		assert!(is_final_failure(&invalid, first));
	}
}
