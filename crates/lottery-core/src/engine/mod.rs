//! Orchestrator engine.
//!
//! [`LotteryEngine`] builds every component from the configuration and the
//! injected services, then runs the background work: the task queue worker,
//! the contract event listener, the bridge that turns published requests into
//! durable jobs, the backstop sweep and storage cleanup.

pub mod event_bus;

use crate::handlers::{DeployHandler, DrawHandler, PurchaseHandler};
use crate::reconciliation::classifier::classifier_from_config;
use crate::reconciliation::{EventListener, SubscriptionRegistry};
use crate::recovery::RecoveryService;
use crate::scheduling::{CloseLotteryJob, DrawLotteryJob, Sweeper};
use crate::state::LotteryStateMachine;
use crate::status::StatusCache;
use crate::store::LotteryStore;
use crate::wallets::WalletDirectory;
use lottery_chain::ChainService;
use lottery_config::Config;
use lottery_queue::{
	JobOptions, QueueConfig, TaskQueue, CLOSE_LOTTERY, DEPLOY_LOTTERY, DRAW_LOTTERY,
	EXECUTE_DRAW, PURCHASE_TICKETS,
};
use lottery_storage::StorageService;
use lottery_types::{
	truncate_id, ContractEvent, LotteryEvent, OperationPhase, OperationStatus,
	OrchestratorEvent, TicketEvent,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Service error: {0}")]
	Service(String),
	#[error("Handler error: {0}")]
	Handler(String),
}

#[derive(Clone)]
pub struct LotteryEngine {
	pub(crate) config: Config,
	pub(crate) storage: Arc<StorageService>,
	pub(crate) chain: Arc<ChainService>,
	pub(crate) store: Arc<LotteryStore>,
	pub(crate) queue: Arc<TaskQueue>,
	pub(crate) status: Arc<StatusCache>,
	pub(crate) event_bus: event_bus::EventBus,
	pub(crate) subscriptions: Arc<SubscriptionRegistry>,
	pub(crate) state_machine: Arc<LotteryStateMachine>,
	pub(crate) listener: Arc<EventListener>,
	pub(crate) deploy_handler: Arc<DeployHandler>,
	pub(crate) draw_handler: Arc<DrawHandler>,
	pub(crate) purchase_handler: Arc<PurchaseHandler>,
	pub(crate) sweeper: Arc<Sweeper>,
	pub(crate) recovery: Arc<RecoveryService>,
	/// Taken by the listener task on start.
	contract_events: Arc<Mutex<Option<mpsc::UnboundedReceiver<ContractEvent>>>>,
	job_options: JobOptions,
}

/// Running engine. Dropping it leaves the tasks running; call
/// [`EngineHandle::shutdown`] to stop them.
pub struct EngineHandle {
	shutdown: broadcast::Sender<()>,
	/// Stop on the shutdown signal and are awaited.
	workers: Vec<JoinHandle<()>>,
	/// Interval tasks, aborted on shutdown.
	timers: Vec<JoinHandle<()>>,
	subscriptions: Arc<SubscriptionRegistry>,
}

impl EngineHandle {
	/// Stops the background tasks, waits for running jobs and drops every
	/// contract subscription.
	pub async fn shutdown(self) {
		for timer in &self.timers {
			timer.abort();
		}
		let _ = self.shutdown.send(());
		for worker in self.workers {
			if let Err(e) = worker.await {
				if !e.is_cancelled() {
					tracing::error!("Engine task failed: {}", e);
				}
			}
		}
		let stopped = self.subscriptions.stop_all().await;
		tracing::info!(subscriptions = stopped, "Engine stopped");
	}
}

impl LotteryEngine {
	/// Wires the components. Nothing runs until [`LotteryEngine::start`].
	pub fn new(
		config: Config,
		storage: Arc<StorageService>,
		chain: Arc<ChainService>,
		wallets: Arc<dyn WalletDirectory>,
	) -> Self {
		let queue_settings = &config.queue;
		let queue = Arc::new(TaskQueue::new(
			storage.clone(),
			QueueConfig {
				poll_interval: Duration::from_millis(queue_settings.poll_interval_ms),
				concurrency: queue_settings.concurrency,
				failed_job_ttl: Duration::from_secs(queue_settings.failed_job_ttl_seconds),
			},
		));
		let job_options = JobOptions::default()
			.with_max_attempts(queue_settings.max_attempts)
			.with_backoff_base(Duration::from_millis(queue_settings.backoff_base_ms));

		let event_bus = event_bus::EventBus::new(config.orchestrator.event_bus_capacity);
		let store = Arc::new(LotteryStore::new(storage.clone()));
		let status = Arc::new(StatusCache::new(
			storage.clone(),
			Duration::from_secs(config.orchestrator.status_ttl_seconds),
		));

		let (event_tx, event_rx) = mpsc::unbounded_channel();
		let subscriptions = Arc::new(SubscriptionRegistry::new(chain.clone(), event_tx));
		let state_machine = Arc::new(LotteryStateMachine::new(
			store.clone(),
			queue.clone(),
			subscriptions.clone(),
			event_bus.clone(),
			config.orchestrator.operator_key.clone(),
			job_options.clone(),
		));
		let listener = Arc::new(EventListener::new(
			store.clone(),
			state_machine.clone(),
			wallets.clone(),
			classifier_from_config(&config.listener),
			subscriptions.clone(),
			event_bus.clone(),
		));
		let deploy_handler = Arc::new(DeployHandler::new(
			store.clone(),
			state_machine.clone(),
			chain.clone(),
			wallets.clone(),
			subscriptions.clone(),
			status.clone(),
			event_bus.clone(),
		));
		let draw_handler = Arc::new(DrawHandler::new(
			store.clone(),
			state_machine.clone(),
			chain.clone(),
			status.clone(),
			event_bus.clone(),
		));
		let purchase_handler = Arc::new(PurchaseHandler::new(
			store.clone(),
			chain.clone(),
			wallets,
			status.clone(),
			event_bus.clone(),
		));
		let sweeper = Arc::new(Sweeper::new(store.clone(), state_machine.clone()));
		let recovery = Arc::new(RecoveryService::new(
			store.clone(),
			state_machine.clone(),
			subscriptions.clone(),
		));

		Self {
			config,
			storage,
			chain,
			store,
			queue,
			status,
			event_bus,
			subscriptions,
			state_machine,
			listener,
			deploy_handler,
			draw_handler,
			purchase_handler,
			sweeper,
			recovery,
			contract_events: Arc::new(Mutex::new(Some(event_rx))),
			job_options,
		}
	}

	/// Registers the job handlers, recovers from the canonical store and
	/// spawns the background tasks.
	///
	/// Fails if the engine was already started.
	#[instrument(skip_all, fields(orchestrator = %self.config.orchestrator.id))]
	pub async fn start(&self) -> Result<EngineHandle, EngineError> {
		let contract_events = self
			.contract_events
			.lock()
			.await
			.take()
			.ok_or_else(|| EngineError::Service("Engine already started".into()))?;

		// Subscribe before recovery so re-requested draws are bridged.
		let requests = self.event_bus.subscribe();

		self.queue
			.register(
				CLOSE_LOTTERY,
				Arc::new(CloseLotteryJob::new(self.state_machine.clone())),
			)
			.await;
		self.queue
			.register(
				DRAW_LOTTERY,
				Arc::new(DrawLotteryJob::new(self.state_machine.clone())),
			)
			.await;
		self.queue
			.register(DEPLOY_LOTTERY, self.deploy_handler.clone())
			.await;
		self.queue.register(EXECUTE_DRAW, self.draw_handler.clone()).await;
		self.queue
			.register(PURCHASE_TICKETS, self.purchase_handler.clone())
			.await;

		self.recovery
			.recover()
			.await
			.map_err(|e| EngineError::Service(format!("Recovery failed: {}", e)))?;

		let (shutdown_tx, _) = broadcast::channel(1);
		let mut workers = Vec::new();
		workers.push(tokio::spawn(
			self.queue.clone().run(shutdown_tx.subscribe()),
		));
		workers.push(tokio::spawn(
			self.listener
				.clone()
				.run(contract_events, shutdown_tx.subscribe()),
		));
		let engine = self.clone();
		let bridge_shutdown = shutdown_tx.subscribe();
		workers.push(tokio::spawn(async move {
			engine.bridge_requests(requests, bridge_shutdown).await;
		}));

		let timers = vec![self.spawn_sweep(), self.spawn_cleanup()];
		tracing::info!(
			chains = ?self.chain.chain_ids(),
			subscriptions = self.subscriptions.len().await,
			"Lottery engine started"
		);

		Ok(EngineHandle {
			shutdown: shutdown_tx,
			workers,
			timers,
			subscriptions: self.subscriptions.clone(),
		})
	}

	/// Starts the engine and runs until Ctrl-C.
	pub async fn run(&self) -> Result<(), EngineError> {
		let handle = self.start().await?;
		if let Err(e) = tokio::signal::ctrl_c().await {
			tracing::error!("Failed to listen for shutdown signal: {}", e);
		}
		tracing::info!("Shutdown signal received");
		handle.shutdown().await;
		Ok(())
	}

	async fn bridge_requests(
		&self,
		mut requests: broadcast::Receiver<OrchestratorEvent>,
		mut shutdown: broadcast::Receiver<()>,
	) {
		let semaphore = Arc::new(Semaphore::new(100));
		loop {
			tokio::select! {
				received = requests.recv() => match received {
					Ok(event) => {
						self.spawn_handler(&semaphore, move |engine| async move {
							engine.bridge(event).await
						})
						.await;
					},
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						tracing::warn!(skipped, "Request bridge lagged behind the event bus");
					},
					Err(broadcast::error::RecvError::Closed) => break,
				},
				_ = shutdown.recv() => break,
			}
		}
	}

	/// Turns a published request into a durable job. Other events pass by.
	///
	/// The job id is derived from the operation id, so a request published
	/// twice still runs once.
	pub(crate) async fn bridge(&self, event: OrchestratorEvent) -> Result<(), EngineError> {
		match event {
			OrchestratorEvent::Lottery(LotteryEvent::DeployRequested(request)) => {
				self.enqueue_request(
					DEPLOY_LOTTERY,
					OperationPhase::Deployment,
					&request.operation_id,
					&request.lottery_id,
					&request,
				)
				.await
			},
			OrchestratorEvent::Lottery(LotteryEvent::DrawRequested(request)) => {
				self.enqueue_request(
					EXECUTE_DRAW,
					OperationPhase::Draw,
					&request.operation_id,
					&request.lottery_id,
					&request,
				)
				.await
			},
			OrchestratorEvent::Ticket(TicketEvent::PurchaseRequested(request)) => {
				self.enqueue_request(
					PURCHASE_TICKETS,
					OperationPhase::Purchase,
					&request.operation_id,
					&request.lottery_id,
					&request,
				)
				.await
			},
			_ => Ok(()),
		}
	}

	async fn enqueue_request<T: serde::Serialize>(
		&self,
		topic: &str,
		phase: OperationPhase,
		operation_id: &str,
		lottery_id: &str,
		request: &T,
	) -> Result<(), EngineError> {
		let options = self
			.job_options
			.clone()
			.with_job_id(format!("{}:{}", topic, operation_id));
		self.queue
			.enqueue(topic, request, options)
			.await
			.map_err(|e| EngineError::Handler(format!("Failed to enqueue {}: {}", topic, e)))?;
		self.status
			.mark(phase, operation_id, lottery_id, OperationStatus::Pending)
			.await;
		tracing::debug!(
			topic,
			operation_id = %truncate_id(operation_id),
			lottery_id = %truncate_id(lottery_id),
			"Request queued"
		);
		Ok(())
	}

	fn spawn_sweep(&self) -> JoinHandle<()> {
		let sweeper = self.sweeper.clone();
		let interval_seconds = self.config.orchestrator.sweep_interval_seconds.max(1);
		tracing::info!("Starting lifecycle sweep, will run every {} seconds", interval_seconds);
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
			loop {
				interval.tick().await;
				if let Err(e) = sweeper.sweep().await {
					tracing::warn!("Lifecycle sweep failed: {}", e);
				}
			}
		})
	}

	fn spawn_cleanup(&self) -> JoinHandle<()> {
		let storage = self.storage.clone();
		let interval_seconds = self.config.storage.cleanup_interval_seconds.max(1);
		tracing::info!(
			"Starting storage cleanup service, will run every {} seconds",
			interval_seconds
		);
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
			loop {
				interval.tick().await;
				match storage.cleanup_expired().await {
					Ok(0) => {
						tracing::debug!("Storage cleanup: no expired entries found");
					},
					Ok(count) => {
						tracing::info!("Storage cleanup: removed {} expired entries", count);
					},
					Err(e) => {
						tracing::warn!("Storage cleanup failed: {}", e);
					},
				}
			}
		})
	}

	async fn spawn_handler<F, Fut>(&self, semaphore: &Arc<Semaphore>, handler: F)
	where
		F: FnOnce(LotteryEngine) -> Fut + Send + 'static,
		Fut: Future<Output = Result<(), EngineError>> + Send,
	{
		let engine = self.clone();
		match semaphore.clone().acquire_owned().await {
			Ok(permit) => {
				tokio::spawn(async move {
					let _permit = permit;
					if let Err(e) = handler(engine).await {
						tracing::error!("Handler error: {}", e);
					}
				});
			},
			Err(e) => {
				tracing::error!("Failed to acquire semaphore permit: {}", e);
			},
		}
	}

	pub fn event_bus(&self) -> &event_bus::EventBus {
		&self.event_bus
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn storage(&self) -> &Arc<StorageService> {
		&self.storage
	}

	/// Canonical lottery, ticket and winner records.
	pub fn store(&self) -> &Arc<LotteryStore> {
		&self.store
	}

	pub fn queue(&self) -> &Arc<TaskQueue> {
		&self.queue
	}

	/// Operation progress records.
	pub fn status(&self) -> &Arc<StatusCache> {
		&self.status
	}

	pub fn state_machine(&self) -> &Arc<LotteryStateMachine> {
		&self.state_machine
	}

	pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
		&self.subscriptions
	}

	pub fn chain(&self) -> &Arc<ChainService> {
		&self.chain
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::{deploy_request, draft_lottery, engine_fixture, purchase_request};
	use lottery_queue::JobState;

	#[tokio::test]
	async fn test_bridge_enqueues_each_operation_once() {
		let (engine, _mock) = engine_fixture().await;
		let request = deploy_request("op-1", "l1");

		for _ in 0..2 {
			engine
				.bridge(OrchestratorEvent::Lottery(LotteryEvent::DeployRequested(
					request.clone(),
				)))
				.await
				.unwrap();
		}
		let jobs = engine
			.queue()
			.jobs(DEPLOY_LOTTERY, JobState::Waiting)
			.await
			.unwrap();
		assert_eq!(jobs.len(), 1);
		assert_eq!(jobs[0].id, "deploy-lottery:op-1");

		let record = engine
			.status()
			.get(OperationPhase::Deployment, "op-1")
			.await
			.unwrap()
			.unwrap();
		assert_eq!(record.status, OperationStatus::Pending);
	}

	#[tokio::test]
	async fn test_bridge_routes_purchases_and_ignores_notifications() {
		let (engine, _mock) = engine_fixture().await;
		engine
			.bridge(OrchestratorEvent::Ticket(TicketEvent::PurchaseRequested(
				purchase_request("op-7", "l1", "user-1", 2),
			)))
			.await
			.unwrap();
		engine
			.bridge(OrchestratorEvent::Lottery(LotteryEvent::Closing {
				lottery_id: "l1".into(),
			}))
			.await
			.unwrap();

		let purchases = engine
			.queue()
			.jobs(PURCHASE_TICKETS, JobState::Waiting)
			.await
			.unwrap();
		assert_eq!(purchases.len(), 1);
		assert_eq!(purchases[0].id, "purchase-tickets:op-7");
		assert!(engine
			.queue()
			.jobs(EXECUTE_DRAW, JobState::Waiting)
			.await
			.unwrap()
			.is_empty());
	}

	#[tokio::test]
	async fn test_engine_starts_once_and_deploys_published_requests() {
		let (engine, _mock) = engine_fixture().await;
		engine.store().create(&draft_lottery("l1")).await.unwrap();

		let handle = engine.start().await.unwrap();
		assert!(matches!(engine.start().await, Err(EngineError::Service(_))));

		engine
			.event_bus()
			.publish(OrchestratorEvent::Lottery(LotteryEvent::DeployRequested(
				deploy_request("op-1", "l1"),
			)))
			.unwrap();

		let mut active = false;
		for _ in 0..100 {
			let lottery = engine.store().get("l1").await.unwrap().unwrap();
			if lottery.status == lottery_types::LotteryStatus::Active {
				active = true;
				break;
			}
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
		assert!(active);
		assert_eq!(engine.subscriptions().len().await, 1);

		handle.shutdown().await;
		assert!(engine.subscriptions().is_empty().await);
	}
}
