//! Lifecycle state of the canonical lottery record.

mod lottery;

pub use lottery::{LotteryStateError, LotteryStateMachine, TransitionOutcome};
