//! Lottery lifecycle orchestration.
//!
//! This crate drives lotteries through their state machine, submits the
//! blockchain side of every lifecycle step through the durable task queue and
//! reconciles the canonical records against events emitted by the deployed
//! contracts. [`LotteryEngine`] wires the pieces together and owns the
//! background tasks.

pub mod engine;
pub mod error;
pub mod handlers;
pub mod reconciliation;
pub mod recovery;
pub mod scheduling;
pub mod state;
pub mod status;
pub mod store;
pub mod wallets;

#[cfg(test)]
pub(crate) mod test_support;

pub use engine::{event_bus::EventBus, EngineError, EngineHandle, LotteryEngine};
pub use error::{OrchestratorError, ReconciliationAmbiguity};
pub use reconciliation::{EventListener, SubscriptionRegistry};
pub use state::{LotteryStateError, LotteryStateMachine, TransitionOutcome};
pub use status::StatusCache;
pub use store::{LotteryStore, Reservation, TicketRange};
pub use wallets::{StoredWalletDirectory, WalletDirectory};
