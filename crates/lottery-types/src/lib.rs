//! Shared types for the lottery lifecycle orchestrator.
//!
//! Every other crate in the workspace depends on this one for the lottery
//! aggregate, bus events, chain-facing values and configuration validation.

/// Signing capability tokens.
pub mod account;
/// Values exchanged with the blockchain layer.
pub mod chain;
/// Event bus payloads.
pub mod events;
/// Lottery, ticket and winner records.
pub mod lottery;
/// Per-chain network configuration.
pub mod networks;
/// Cached operation progress.
pub mod operation;
/// Registry trait for self-registering implementations.
pub mod registry;
/// Redacted string for key material.
pub mod secret_string;
/// Canonical store namespaces.
pub mod storage;
pub mod utils;
/// Configuration schema validation.
pub mod validation;
/// User wallets.
pub mod wallet;

pub use account::SigningKeyRef;
pub use chain::{
	ContractEvent, DeployParams, DeployReceipt, EventArg, LotteryDetails, PurchaseCheck,
};
pub use events::{
	DeployRequest, DrawRequest, LotteryEvent, OrchestratorEvent, PurchaseRequest, TicketEvent,
};
pub use lottery::{
	ticket_id, winner_id, Lottery, LotterySchedule, LotteryStatus, LotteryTerms, LotteryWinner,
	PrizeDistribution, Ticket,
};
pub use networks::{deserialize_networks, NetworkConfig, NetworksConfig, RpcEndpoint};
pub use operation::{OperationPhase, OperationRecord, OperationStatus};
pub use registry::ImplementationRegistry;
pub use secret_string::SecretString;
pub use storage::StorageKey;
pub use utils::{current_timestamp, current_timestamp_millis, truncate_id, with_0x_prefix};
pub use validation::{ConfigSchema, Field, FieldType, Schema, ValidationError};
pub use wallet::{Wallet, WalletOwner};
