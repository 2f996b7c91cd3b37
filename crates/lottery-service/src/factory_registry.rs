//! Dynamic factory registry for orchestrator implementations.
//!
//! Every pluggable crate exposes its implementations through
//! `get_all_implementations()`. The registry collects them once and the
//! builder instantiates whichever ones the configuration names.

use lottery_account::{KeyManager, KeyStoreFactory};
use lottery_chain::{ChainFactory, ChainInterface, ChainService};
use lottery_config::Config;
use lottery_core::{LotteryEngine, StoredWalletDirectory};
use lottery_storage::{StorageFactory, StorageService};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Global registry for all implementation factories
#[derive(Default)]
pub struct FactoryRegistry {
	pub storage: HashMap<String, StorageFactory>,
	pub account: HashMap<String, KeyStoreFactory>,
	pub chain: HashMap<String, ChainFactory>,
}

impl FactoryRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register_storage(&mut self, name: impl Into<String>, factory: StorageFactory) {
		self.storage.insert(name.into(), factory);
	}

	pub fn register_account(&mut self, name: impl Into<String>, factory: KeyStoreFactory) {
		self.account.insert(name.into(), factory);
	}

	pub fn register_chain(&mut self, name: impl Into<String>, factory: ChainFactory) {
		self.chain.insert(name.into(), factory);
	}
}

static REGISTRY: OnceLock<FactoryRegistry> = OnceLock::new();

/// Initialize the global registry with all available implementations
pub fn initialize_registry() -> &'static FactoryRegistry {
	REGISTRY.get_or_init(|| {
		let mut registry = FactoryRegistry::new();

		for (name, factory) in lottery_storage::get_all_implementations() {
			tracing::debug!("Registering storage implementation: {}", name);
			registry.register_storage(name, factory);
		}

		for (name, factory) in lottery_account::get_all_implementations() {
			tracing::debug!("Registering account implementation: {}", name);
			registry.register_account(name, factory);
		}

		for (name, factory) in lottery_chain::get_all_implementations() {
			tracing::debug!("Registering chain implementation: {}", name);
			registry.register_chain(name, factory);
		}

		registry
	})
}

pub fn get_registry() -> &'static FactoryRegistry {
	initialize_registry()
}

/// Looks up the factory for every configured implementation, failing on the
/// first name the registry does not know.
macro_rules! build_factories {
	($registry:expr, $config_impls:expr, $registry_field:ident, $type_name:literal) => {{
		let mut factories = HashMap::new();
		for name in $config_impls.keys() {
			if let Some(factory) = $registry.$registry_field.get(name) {
				factories.insert(name.clone(), *factory);
			} else {
				let mut available: Vec<_> = $registry.$registry_field.keys().cloned().collect();
				available.sort();
				return Err(format!(
					"Unknown {} implementation '{}'. Available: [{}]",
					$type_name,
					name,
					available.join(", ")
				)
				.into());
			}
		}
		factories
	}};
}

/// Builds the engine from configuration.
///
/// Storage and the key store use their `primary` implementation. Every chain
/// implementation is instantiated and serves the chains it reports; a chain
/// claimed by two implementations goes to the one whose name sorts last.
pub fn build_orchestrator_from_config(
	config: Config,
) -> Result<LotteryEngine, Box<dyn std::error::Error>> {
	let registry = get_registry();

	let storage_factories = build_factories!(
		registry,
		config.storage.implementations,
		storage,
		"storage"
	);
	let account_factories = build_factories!(
		registry,
		config.account.implementations,
		account,
		"account"
	);
	let chain_factories = build_factories!(
		registry,
		config.chain.implementations,
		chain,
		"chain"
	);

	let primary = &config.storage.primary;
	let (Some(factory), Some(section)) = (
		storage_factories.get(primary),
		config.storage.implementations.get(primary),
	) else {
		return Err(format!("Primary storage '{}' is not configured", primary).into());
	};
	let storage = Arc::new(StorageService::new(factory(section)?));
	tracing::info!(component = "storage", implementation = %primary, "Loaded");

	let primary = &config.account.primary;
	let (Some(factory), Some(section)) = (
		account_factories.get(primary),
		config.account.implementations.get(primary),
	) else {
		return Err(format!("Primary account '{}' is not configured", primary).into());
	};
	let keys = Arc::new(KeyManager::new(factory(section)?));
	if !keys.contains(&config.orchestrator.operator_key) {
		return Err(format!(
			"Operator key '{}' is not held by the '{}' key store",
			config.orchestrator.operator_key.key_id(),
			primary
		)
		.into());
	}
	tracing::info!(component = "account", implementation = %primary, "Loaded");

	let mut names: Vec<&String> = chain_factories.keys().collect();
	names.sort();
	let mut chains: Vec<Arc<dyn ChainInterface>> = Vec::with_capacity(names.len());
	for name in names {
		let (Some(factory), Some(section)) = (
			chain_factories.get(name),
			config.chain.implementations.get(name),
		) else {
			continue;
		};
		let implementation = factory(section, &config.networks)?;
		tracing::info!(
			component = "chain",
			implementation = %name,
			chain_ids = ?implementation.chain_ids(),
			"Loaded"
		);
		chains.push(Arc::from(implementation));
	}

	let chain = Arc::new(ChainService::from_implementations(
		chains,
		keys,
		Duration::from_secs(config.orchestrator.chain_call_timeout_seconds),
	));
	if chain.chain_ids().is_empty() {
		return Err("No chain implementation serves any chain".into());
	}
	for chain_id in config.networks.keys() {
		if !chain.supports(*chain_id) {
			tracing::warn!(chain_id, "Network has no chain implementation");
		}
	}

	let wallets = Arc::new(StoredWalletDirectory::new(storage.clone()));
	Ok(LotteryEngine::new(config, storage, chain, wallets))
}
