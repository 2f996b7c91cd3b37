//! Lottery orchestrator service library.
//!
//! Resolves the implementations named in the configuration and wires them
//! into a [`lottery_core::LotteryEngine`].

pub mod factory_registry;

pub use factory_registry::build_orchestrator_from_config;
