//! Broadcast channel carrying orchestrator notifications and requests.

use lottery_types::OrchestratorEvent;
use tokio::sync::broadcast;

/// Publish/subscribe channel shared by every component.
///
/// Each subscriber receives every event published after it subscribed. The
/// routing key of an event is [`OrchestratorEvent::topic`].
pub struct EventBus {
	sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
	/// Creates a bus buffering up to `capacity` events per subscriber.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
		self.sender.subscribe()
	}

	/// Publishes to all current subscribers.
	///
	/// Fails only when nobody is subscribed, which callers treat as harmless.
	pub fn publish(
		&self,
		event: OrchestratorEvent,
	) -> Result<(), broadcast::error::SendError<OrchestratorEvent>> {
		tracing::trace!(topic = event.topic(), "Publishing event");
		self.sender.send(event)?;
		Ok(())
	}
}

impl Clone for EventBus {
	fn clone(&self) -> Self {
		Self {
			sender: self.sender.clone(),
		}
	}
}
