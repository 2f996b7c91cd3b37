//! Durable task queue.
//!
//! Jobs live in the `jobs` namespace of the canonical store, so they survive
//! restarts. Each job carries a topic, a JSON payload, a `fire_at` time and an
//! attempt budget. Workers poll for due jobs, claim one with a
//! compare-and-swap from `WAITING` to `ACTIVE` and run the handler registered
//! for its topic:
//!
//! - success removes the job;
//! - a retryable failure with attempts left puts it back to `WAITING` after
//!   `backoff_base * 2^(attempt - 1)`;
//! - anything else marks it `FAILED` and keeps it for inspection until its TTL
//!   runs out.

use async_trait::async_trait;
use lottery_storage::{QueryFilter, StorageError, StorageIndexes, StorageService};
use lottery_types::{current_timestamp_millis, truncate_id, StorageKey};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::task::JoinHandle;

/// Transition jobs fired at a lottery's end time and draw time.
pub const CLOSE_LOTTERY: &str = "close-lottery";
pub const DRAW_LOTTERY: &str = "draw-lottery";
/// Execution jobs bridged from inbound bus requests.
pub const DEPLOY_LOTTERY: &str = "deploy-lottery";
pub const EXECUTE_DRAW: &str = "execute-draw";
pub const PURCHASE_TICKETS: &str = "purchase-tickets";

const JOBS: StorageKey = StorageKey::Jobs;

#[derive(Debug, Error)]
pub enum QueueError {
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Serialization error: {0}")]
	Serialization(String),
	#[error("No handler registered for topic '{0}'")]
	UnknownTopic(String),
}

impl From<StorageError> for QueueError {
	fn from(err: StorageError) -> Self {
		Self::Storage(err.to_string())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
	Waiting,
	Active,
	Failed,
}

/// A stored job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
	pub id: String,
	pub topic: String,
	pub payload: serde_json::Value,
	pub state: JobState,
	/// Attempts started so far.
	pub attempts_made: u32,
	pub max_attempts: u32,
	pub backoff_base_ms: u64,
	/// Unix milliseconds at which the job becomes due.
	pub fire_at: u64,
	pub created_at: u64,
	pub updated_at: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_error: Option<String>,
}

impl Job {
	pub fn payload<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
		serde_json::from_value(self.payload.clone())
			.map_err(|e| QueueError::Serialization(e.to_string()))
	}

	pub fn attempts_remaining(&self) -> u32 {
		self.max_attempts.saturating_sub(self.attempts_made)
	}

	/// Delay before retrying after `attempt` failed.
	pub fn backoff_delay(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1).min(16);
		Duration::from_millis(self.backoff_base_ms.saturating_mul(1u64 << exponent))
	}

	fn indexes(&self) -> StorageIndexes {
		StorageIndexes::new()
			.with_field("state", self.state)
			.with_field("topic", &self.topic)
			.with_field("fire_at", self.fire_at)
	}
}

/// Enqueue options.
#[derive(Debug, Clone)]
pub struct JobOptions {
	pub delay: Duration,
	pub max_attempts: u32,
	pub backoff_base: Duration,
	/// Fixed id; enqueueing the same id again while it is pending is a no-op.
	pub job_id: Option<String>,
}

impl Default for JobOptions {
	fn default() -> Self {
		Self {
			delay: Duration::ZERO,
			max_attempts: 3,
			backoff_base: Duration::from_secs(5),
			job_id: None,
		}
	}
}

impl JobOptions {
	pub fn with_delay(mut self, delay: Duration) -> Self {
		self.delay = delay;
		self
	}

	pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
		self.job_id = Some(job_id.into());
		self
	}

	pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
		self.max_attempts = max_attempts.max(1);
		self
	}

	pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
		self.backoff_base = backoff_base;
		self
	}
}

/// Attempt information passed to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobContext {
	/// 1-based number of the running attempt.
	pub attempt: u32,
	pub max_attempts: u32,
}

impl JobContext {
	pub fn is_final_attempt(&self) -> bool {
		self.attempt >= self.max_attempts
	}
}

/// Why a handler run failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct JobFailure {
	pub retryable: bool,
	pub message: String,
}

impl JobFailure {
	pub fn retryable(message: impl Into<String>) -> Self {
		Self {
			retryable: true,
			message: message.into(),
		}
	}

	pub fn permanent(message: impl Into<String>) -> Self {
		Self {
			retryable: false,
			message: message.into(),
		}
	}
}

#[async_trait]
pub trait JobHandler: Send + Sync {
	async fn handle(&self, job: &Job, context: JobContext) -> Result<(), JobFailure>;
}

/// Worker settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
	pub poll_interval: Duration,
	/// Jobs run at the same time.
	pub concurrency: usize,
	/// How long `FAILED` jobs are kept.
	pub failed_job_ttl: Duration,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_millis(500),
			concurrency: 8,
			failed_job_ttl: Duration::from_secs(7 * 24 * 3600),
		}
	}
}

/// Storage-backed delayed job queue.
pub struct TaskQueue {
	storage: Arc<StorageService>,
	handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
	config: QueueConfig,
	permits: Arc<Semaphore>,
}

impl TaskQueue {
	pub fn new(storage: Arc<StorageService>, config: QueueConfig) -> Self {
		let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
		Self {
			storage,
			handlers: RwLock::new(HashMap::new()),
			config,
			permits,
		}
	}

	pub async fn register(&self, topic: &str, handler: Arc<dyn JobHandler>) {
		self.handlers
			.write()
			.await
			.insert(topic.to_string(), handler);
	}

	/// Stores a job and returns its id.
	///
	/// With a fixed `job_id`, a pending job under that id is left as it is; a
	/// `FAILED` one is replaced.
	pub async fn enqueue<T: Serialize>(
		&self,
		topic: &str,
		payload: &T,
		options: JobOptions,
	) -> Result<String, QueueError> {
		let now = current_timestamp_millis();
		let id = options
			.job_id
			.clone()
			.unwrap_or_else(|| format!("{}:{}", topic, uuid::Uuid::new_v4()));
		let job = Job {
			id: id.clone(),
			topic: topic.to_string(),
			payload: serde_json::to_value(payload)
				.map_err(|e| QueueError::Serialization(e.to_string()))?,
			state: JobState::Waiting,
			attempts_made: 0,
			max_attempts: options.max_attempts.max(1),
			backoff_base_ms: options.backoff_base.as_millis() as u64,
			fire_at: now + options.delay.as_millis() as u64,
			created_at: now,
			updated_at: now,
			last_error: None,
		};

		let created = self
			.storage
			.store_if_absent(JOBS.as_str(), &id, &job, Some(job.indexes()), None)
			.await?;
		if created {
			tracing::debug!(
				job_id = %truncate_id(&id),
				topic,
				delay_ms = options.delay.as_millis() as u64,
				"Job enqueued"
			);
			return Ok(id);
		}

		let replaced = self
			.storage
			.update_atomic(
				JOBS.as_str(),
				&id,
				|existing: &mut Job| {
					if existing.state != JobState::Failed {
						return false;
					}
					*existing = job.clone();
					true
				},
				Job::indexes,
			)
			.await?;
		if replaced.is_applied() {
			tracing::debug!(job_id = %truncate_id(&id), topic, "Failed job replaced");
		} else {
			tracing::debug!(job_id = %truncate_id(&id), topic, "Job already pending");
		}
		Ok(id)
	}

	pub async fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
		Ok(self.storage.retrieve_optional(JOBS.as_str(), job_id).await?)
	}

	/// Removes a job that has not started yet.
	pub async fn cancel(&self, job_id: &str) -> Result<bool, QueueError> {
		match self.get(job_id).await? {
			Some(job) if job.state == JobState::Waiting => {
				self.storage.remove(JOBS.as_str(), job_id).await?;
				Ok(true)
			},
			_ => Ok(false),
		}
	}

	/// Jobs of `topic` in `state`.
	pub async fn jobs(&self, topic: &str, state: JobState) -> Result<Vec<Job>, QueueError> {
		let filter = QueryFilter::And(vec![
			QueryFilter::Equals("topic".into(), serde_json::json!(topic)),
			QueryFilter::Equals("state".into(), serde_json::json!(state)),
		]);
		Ok(self
			.storage
			.query::<Job>(JOBS.as_str(), filter)
			.await?
			.into_iter()
			.map(|(_, job)| job)
			.collect())
	}

	/// Puts jobs a crashed worker left `ACTIVE` back to `WAITING`.
	pub async fn requeue_stalled(&self) -> Result<usize, QueueError> {
		let stalled: Vec<(String, Job)> = self
			.storage
			.query(
				JOBS.as_str(),
				QueryFilter::Equals("state".into(), serde_json::json!(JobState::Active)),
			)
			.await?;

		let mut requeued = 0;
		for (id, _) in stalled {
			let result = self
				.storage
				.update_atomic(
					JOBS.as_str(),
					&id,
					|job: &mut Job| {
						if job.state != JobState::Active {
							return false;
						}
						job.state = JobState::Waiting;
						job.updated_at = current_timestamp_millis();
						true
					},
					Job::indexes,
				)
				.await?;
			if result.is_applied() {
				requeued += 1;
			}
		}
		if requeued > 0 {
			tracing::warn!(count = requeued, "Requeued stalled jobs");
		}
		Ok(requeued)
	}

	/// Claims due jobs while permits are free and spawns their handlers.
	pub async fn dispatch_due(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, QueueError> {
		let topics: Vec<serde_json::Value> = self
			.handlers
			.read()
			.await
			.keys()
			.map(|t| serde_json::json!(t))
			.collect();
		if topics.is_empty() {
			return Ok(Vec::new());
		}

		let now = current_timestamp_millis();
		let filter = QueryFilter::And(vec![
			QueryFilter::Equals("state".into(), serde_json::json!(JobState::Waiting)),
			QueryFilter::In("topic".into(), topics),
			QueryFilter::AtMost("fire_at".into(), serde_json::json!(now)),
		]);
		let mut due: Vec<(String, Job)> = self.storage.query(JOBS.as_str(), filter).await?;
		due.sort_by_key(|(_, job)| job.fire_at);

		let mut spawned = Vec::new();
		for (id, _) in due {
			let Ok(permit) = self.permits.clone().try_acquire_owned() else {
				break;
			};
			let Some(job) = self.claim(&id).await? else {
				continue;
			};
			let queue = self.clone();
			spawned.push(tokio::spawn(async move {
				queue.execute(job).await;
				drop(permit);
			}));
		}
		Ok(spawned)
	}

	/// Runs every due job and waits for all of them.
	pub async fn process_due(self: &Arc<Self>) -> Result<usize, QueueError> {
		let handles = self.dispatch_due().await?;
		let count = handles.len();
		for handle in handles {
			if let Err(e) = handle.await {
				tracing::error!("Job task panicked: {}", e);
			}
		}
		Ok(count)
	}

	/// Polls until `shutdown` fires, then waits for running jobs.
	pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
		if let Err(e) = self.requeue_stalled().await {
			tracing::error!("Failed to requeue stalled jobs: {}", e);
		}

		let mut interval = tokio::time::interval(self.config.poll_interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		loop {
			tokio::select! {
				_ = interval.tick() => {
					if let Err(e) = self.dispatch_due().await {
						tracing::error!("Failed to dispatch jobs: {}", e);
					}
				}
				_ = shutdown.recv() => {
					tracing::info!("Queue worker stopping");
					break;
				}
			}
		}

		let total = self.config.concurrency.max(1) as u32;
		let _ = self.permits.acquire_many(total).await;
	}

	async fn claim(&self, id: &str) -> Result<Option<Job>, QueueError> {
		let now = current_timestamp_millis();
		let claimed = self
			.storage
			.update_atomic(
				JOBS.as_str(),
				id,
				|job: &mut Job| {
					if job.state != JobState::Waiting || job.fire_at > now {
						return false;
					}
					job.state = JobState::Active;
					job.attempts_made += 1;
					job.updated_at = now;
					true
				},
				Job::indexes,
			)
			.await;
		match claimed {
			Ok(mutation) if mutation.is_applied() => Ok(Some(mutation.into_inner())),
			Ok(_) => Ok(None),
			// Removed between query and claim.
			Err(StorageError::NotFound(_)) | Err(StorageError::Conflict(_)) => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	async fn execute(&self, job: Job) {
		let handler = self.handlers.read().await.get(&job.topic).cloned();
		let context = JobContext {
			attempt: job.attempts_made,
			max_attempts: job.max_attempts,
		};
		let outcome = match handler {
			Some(handler) => handler.handle(&job, context).await,
			None => Err(JobFailure::permanent(
				QueueError::UnknownTopic(job.topic.clone()).to_string(),
			)),
		};

		let result = match outcome {
			Ok(()) => {
				tracing::debug!(job_id = %truncate_id(&job.id), topic = %job.topic, "Job completed");
				self.storage.remove(JOBS.as_str(), &job.id).await
			},
			Err(failure) if failure.retryable && job.attempts_remaining() > 0 => {
				let delay = job.backoff_delay(job.attempts_made);
				tracing::warn!(
					job_id = %truncate_id(&job.id),
					topic = %job.topic,
					attempt = job.attempts_made,
					retry_in_ms = delay.as_millis() as u64,
					"Job failed, retrying: {}",
					failure.message
				);
				let now = current_timestamp_millis();
				let retry = Job {
					state: JobState::Waiting,
					fire_at: now + delay.as_millis() as u64,
					updated_at: now,
					last_error: Some(failure.message),
					..job.clone()
				};
				self.storage
					.store(JOBS.as_str(), &job.id, &retry, Some(retry.indexes()))
					.await
			},
			Err(failure) => {
				tracing::error!(
					job_id = %truncate_id(&job.id),
					topic = %job.topic,
					attempts = job.attempts_made,
					"Job failed permanently: {}",
					failure.message
				);
				let failed = Job {
					state: JobState::Failed,
					updated_at: current_timestamp_millis(),
					last_error: Some(failure.message),
					..job.clone()
				};
				self.storage
					.store_with_ttl(
						JOBS.as_str(),
						&job.id,
						&failed,
						Some(failed.indexes()),
						Some(self.config.failed_job_ttl),
					)
					.await
			},
		};
		if let Err(e) = result {
			tracing::error!(job_id = %truncate_id(&job.id), "Failed to record job outcome: {}", e);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use lottery_storage::implementations::memory::MemoryStorage;
	use std::sync::atomic::{AtomicU32, Ordering};
	use tokio::sync::Mutex;

	#[derive(Debug, Serialize, Deserialize, PartialEq)]
	struct Payload {
		lottery_id: String,
	}

	fn queue() -> Arc<TaskQueue> {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		Arc::new(TaskQueue::new(storage, QueueConfig::default()))
	}

	fn immediate() -> JobOptions {
		JobOptions::default().with_backoff_base(Duration::ZERO)
	}

	/// Fails the first `failures` attempts with the given retryability.
	struct Flaky {
		failures: u32,
		retryable: bool,
		calls: AtomicU32,
		seen: Mutex<Vec<JobContext>>,
	}

	impl Flaky {
		fn new(failures: u32, retryable: bool) -> Arc<Self> {
			Arc::new(Self {
				failures,
				retryable,
				calls: AtomicU32::new(0),
				seen: Mutex::new(Vec::new()),
			})
		}
	}

	#[async_trait]
	impl JobHandler for Flaky {
		async fn handle(&self, job: &Job, context: JobContext) -> Result<(), JobFailure> {
			let payload: Payload = job.payload().map_err(|e| JobFailure::permanent(e.to_string()))?;
			assert_eq!(payload.lottery_id, "lottery-1");
			self.seen.lock().await.push(context);
			let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
			if call <= self.failures {
				return Err(JobFailure {
					retryable: self.retryable,
					message: format!("attempt {} failed", call),
				});
			}
			Ok(())
		}
	}

	fn payload() -> Payload {
		Payload {
			lottery_id: "lottery-1".to_string(),
		}
	}

	#[tokio::test]
	async fn test_success_removes_job() {
		let queue = queue();
		let handler = Flaky::new(0, true);
		queue.register(CLOSE_LOTTERY, handler.clone()).await;
		let id = queue.enqueue(CLOSE_LOTTERY, &payload(), immediate()).await.unwrap();

		assert_eq!(queue.process_due().await.unwrap(), 1);
		assert!(queue.get(&id).await.unwrap().is_none());
		assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_delayed_job_not_due() {
		let queue = queue();
		let handler = Flaky::new(0, true);
		queue.register(DRAW_LOTTERY, handler.clone()).await;
		let id = queue
			.enqueue(
				DRAW_LOTTERY,
				&payload(),
				JobOptions::default().with_delay(Duration::from_secs(3600)),
			)
			.await
			.unwrap();

		assert_eq!(queue.process_due().await.unwrap(), 0);
		let job = queue.get(&id).await.unwrap().unwrap();
		assert_eq!(job.state, JobState::Waiting);
		assert_eq!(job.attempts_remaining(), 3);
	}

	#[tokio::test]
	async fn test_retryable_failure_retries_until_success() {
		let queue = queue();
		let handler = Flaky::new(2, true);
		queue.register(EXECUTE_DRAW, handler.clone()).await;
		let id = queue.enqueue(EXECUTE_DRAW, &payload(), immediate()).await.unwrap();

		queue.process_due().await.unwrap();
		let job = queue.get(&id).await.unwrap().unwrap();
		assert_eq!(job.state, JobState::Waiting);
		assert_eq!(job.attempts_made, 1);
		assert_eq!(job.last_error.as_deref(), Some("attempt 1 failed"));

		queue.process_due().await.unwrap();
		queue.process_due().await.unwrap();
		assert!(queue.get(&id).await.unwrap().is_none());

		let seen = handler.seen.lock().await;
		assert_eq!(seen.len(), 3);
		assert!(!seen[0].is_final_attempt());
		assert!(seen[2].is_final_attempt());
	}

	#[tokio::test]
	async fn test_attempts_exhausted_marks_failed() {
		let queue = queue();
		let handler = Flaky::new(10, true);
		queue.register(DEPLOY_LOTTERY, handler.clone()).await;
		let id = queue.enqueue(DEPLOY_LOTTERY, &payload(), immediate()).await.unwrap();

		for _ in 0..5 {
			queue.process_due().await.unwrap();
		}
		assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
		let job = queue.get(&id).await.unwrap().unwrap();
		assert_eq!(job.state, JobState::Failed);
		assert_eq!(job.attempts_remaining(), 0);
	}

	#[tokio::test]
	async fn test_permanent_failure_not_retried() {
		let queue = queue();
		let handler = Flaky::new(1, false);
		queue.register(PURCHASE_TICKETS, handler.clone()).await;
		let id = queue.enqueue(PURCHASE_TICKETS, &payload(), immediate()).await.unwrap();

		queue.process_due().await.unwrap();
		queue.process_due().await.unwrap();
		assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
		assert_eq!(
			queue.get(&id).await.unwrap().unwrap().state,
			JobState::Failed
		);
	}

	#[tokio::test]
	async fn test_fixed_job_id_deduplicates() {
		let queue = queue();
		let options = JobOptions::default()
			.with_delay(Duration::from_secs(60))
			.with_job_id("close-lottery:lottery-1");
		queue.enqueue(CLOSE_LOTTERY, &payload(), options.clone()).await.unwrap();
		queue.enqueue(CLOSE_LOTTERY, &payload(), options).await.unwrap();
		assert_eq!(
			queue.jobs(CLOSE_LOTTERY, JobState::Waiting).await.unwrap().len(),
			1
		);
	}

	#[tokio::test]
	async fn test_failed_job_replaced_on_enqueue() {
		let queue = queue();
		queue.register(CLOSE_LOTTERY, Flaky::new(1, false)).await;
		let options = immediate().with_job_id("close-lottery:lottery-1");
		queue.enqueue(CLOSE_LOTTERY, &payload(), options.clone()).await.unwrap();
		queue.process_due().await.unwrap();
		assert_eq!(queue.jobs(CLOSE_LOTTERY, JobState::Failed).await.unwrap().len(), 1);

		queue.enqueue(CLOSE_LOTTERY, &payload(), options).await.unwrap();
		assert_eq!(queue.jobs(CLOSE_LOTTERY, JobState::Waiting).await.unwrap().len(), 1);
		assert!(queue.jobs(CLOSE_LOTTERY, JobState::Failed).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_requeue_stalled_and_cancel() {
		let queue = queue();
		let id = queue.enqueue(CLOSE_LOTTERY, &payload(), immediate()).await.unwrap();
		// Claim without a handler run, as a crashed worker would leave it.
		assert!(queue.claim(&id).await.unwrap().is_some());
		assert!(!queue.cancel(&id).await.unwrap());

		assert_eq!(queue.requeue_stalled().await.unwrap(), 1);
		assert_eq!(queue.get(&id).await.unwrap().unwrap().state, JobState::Waiting);
		assert!(queue.cancel(&id).await.unwrap());
		assert!(queue.get(&id).await.unwrap().is_none());
	}

	#[test]
	fn test_backoff_is_exponential() {
		let job = Job {
			id: "j".into(),
			topic: CLOSE_LOTTERY.into(),
			payload: serde_json::Value::Null,
			state: JobState::Waiting,
			attempts_made: 0,
			max_attempts: 3,
			backoff_base_ms: 5_000,
			fire_at: 0,
			created_at: 0,
			updated_at: 0,
			last_error: None,
		};
		assert_eq!(job.backoff_delay(1), Duration::from_secs(5));
		assert_eq!(job.backoff_delay(2), Duration::from_secs(10));
		assert_eq!(job.backoff_delay(3), Duration::from_secs(20));
	}
}
