//! Configuration for the lottery orchestrator.
//!
//! Configuration is a single TOML file. String values may reference
//! environment variables as `${VAR}` or `${VAR:-default}`; they are resolved
//! before parsing. Pluggable sections (`storage`, `chain`, `account`) name a
//! `primary` implementation and carry each implementation's settings as a raw
//! table that the implementation validates itself.

use lottery_types::{deserialize_networks, NetworksConfig, SigningKeyRef};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("Configuration error: {0}")]
	Parse(String),
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		ConfigError::Parse(err.message().to_string())
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	pub orchestrator: OrchestratorConfig,
	#[serde(deserialize_with = "deserialize_networks")]
	pub networks: NetworksConfig,
	pub storage: StorageConfig,
	#[serde(default)]
	pub queue: QueueConfig,
	pub chain: ChainConfig,
	pub account: AccountConfig,
	#[serde(default)]
	pub listener: ListenerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
	/// Instance name used in logs.
	pub id: String,
	/// Period of the backstop sweep over due lifecycle transitions.
	#[serde(default = "default_sweep_interval_seconds")]
	pub sweep_interval_seconds: u64,
	/// Lifetime of operation status records.
	#[serde(default = "default_status_ttl_seconds")]
	pub status_ttl_seconds: u64,
	/// Upper bound for one chain call.
	#[serde(default = "default_chain_call_timeout_seconds")]
	pub chain_call_timeout_seconds: u64,
	/// Key used for draws requested by the scheduler.
	pub operator_key: SigningKeyRef,
	#[serde(default = "default_event_bus_capacity")]
	pub event_bus_capacity: usize,
}

fn default_sweep_interval_seconds() -> u64 {
	300
}

fn default_status_ttl_seconds() -> u64 {
	86_400
}

fn default_chain_call_timeout_seconds() -> u64 {
	120
}

fn default_event_bus_capacity() -> usize {
	1000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	pub primary: String,
	pub implementations: HashMap<String, toml::Value>,
	#[serde(default = "default_cleanup_interval_seconds")]
	pub cleanup_interval_seconds: u64,
}

fn default_cleanup_interval_seconds() -> u64 {
	60
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
	#[serde(default = "default_poll_interval_ms")]
	pub poll_interval_ms: u64,
	#[serde(default = "default_concurrency")]
	pub concurrency: usize,
	#[serde(default = "default_max_attempts")]
	pub max_attempts: u32,
	#[serde(default = "default_backoff_base_ms")]
	pub backoff_base_ms: u64,
	#[serde(default = "default_failed_job_ttl_seconds")]
	pub failed_job_ttl_seconds: u64,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			poll_interval_ms: default_poll_interval_ms(),
			concurrency: default_concurrency(),
			max_attempts: default_max_attempts(),
			backoff_base_ms: default_backoff_base_ms(),
			failed_job_ttl_seconds: default_failed_job_ttl_seconds(),
		}
	}
}

fn default_poll_interval_ms() -> u64 {
	500
}

fn default_concurrency() -> usize {
	8
}

fn default_max_attempts() -> u32 {
	3
}

fn default_backoff_base_ms() -> u64 {
	5_000
}

fn default_failed_job_ttl_seconds() -> u64 {
	7 * 86_400
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
	/// Implementations to instantiate; each serves the chains it reports.
	pub implementations: HashMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
	pub primary: String,
	pub implementations: HashMap<String, toml::Value>,
}

/// How contract events are classified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
	#[default]
	NamePattern,
	Schema,
}

/// Event names per contract template for the schema classifier.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EventSchemaConfig {
	#[serde(default)]
	pub purchase_events: Vec<String>,
	#[serde(default)]
	pub draw_events: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ListenerConfig {
	#[serde(default)]
	pub classifier: ClassifierKind,
	#[serde(default)]
	pub schemas: HashMap<String, EventSchemaConfig>,
}

/// Replaces `${VAR}` and `${VAR:-default}` with environment values.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {e}")))?;

	let mut replacements = Vec::new();
	for cap in re.captures_iter(input) {
		let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
			continue;
		};
		let var_name = var_name.as_str();
		let value = match std::env::var(var_name) {
			Ok(v) => v,
			Err(_) => match cap.get(2) {
				Some(default) => default.as_str().to_string(),
				None => {
					return Err(ConfigError::Validation(format!(
						"Environment variable '{var_name}' not found"
					)));
				},
			},
		};
		replacements.push((full_match.start(), full_match.end(), value));
	}

	let mut result = input.to_string();
	for (start, end, value) in replacements.iter().rev() {
		result.replace_range(start..end, value);
	}
	Ok(result)
}

impl Config {
	/// Reads, resolves and validates the file at `path`.
	pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
		let content = tokio::fs::read_to_string(path).await?;
		content.parse()
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.orchestrator.id.is_empty() {
			return Err(ConfigError::Validation(
				"Orchestrator id cannot be empty".into(),
			));
		}
		if self.orchestrator.sweep_interval_seconds == 0 {
			return Err(ConfigError::Validation(
				"sweep_interval_seconds must be greater than 0".into(),
			));
		}
		if self.orchestrator.chain_call_timeout_seconds == 0 {
			return Err(ConfigError::Validation(
				"chain_call_timeout_seconds must be greater than 0".into(),
			));
		}
		if self.orchestrator.event_bus_capacity == 0 {
			return Err(ConfigError::Validation(
				"event_bus_capacity must be greater than 0".into(),
			));
		}

		for (chain_id, network) in &self.networks {
			if network.rpc_urls.is_empty() {
				return Err(ConfigError::Validation(format!(
					"Network {chain_id} must have at least one rpc_url"
				)));
			}
		}

		require_primary("storage", &self.storage.primary, &self.storage.implementations)?;
		if self.storage.cleanup_interval_seconds == 0 || self.storage.cleanup_interval_seconds > 86_400 {
			return Err(ConfigError::Validation(
				"Storage cleanup_interval_seconds must be between 1 and 86400".into(),
			));
		}
		require_primary("account", &self.account.primary, &self.account.implementations)?;
		if self.chain.implementations.is_empty() {
			return Err(ConfigError::Validation(
				"At least one chain implementation must be configured".into(),
			));
		}

		if self.queue.concurrency == 0 {
			return Err(ConfigError::Validation(
				"Queue concurrency must be at least 1".into(),
			));
		}
		if self.queue.max_attempts == 0 {
			return Err(ConfigError::Validation(
				"Queue max_attempts must be at least 1".into(),
			));
		}
		if self.queue.poll_interval_ms == 0 {
			return Err(ConfigError::Validation(
				"Queue poll_interval_ms must be greater than 0".into(),
			));
		}

		if self.listener.classifier == ClassifierKind::Schema && self.listener.schemas.is_empty() {
			return Err(ConfigError::Validation(
				"Schema classifier requires at least one entry under [listener.schemas]".into(),
			));
		}
		Ok(())
	}
}

fn require_primary(
	section: &str,
	primary: &str,
	implementations: &HashMap<String, toml::Value>,
) -> Result<(), ConfigError> {
	if implementations.is_empty() {
		return Err(ConfigError::Validation(format!(
			"At least one {section} implementation must be configured"
		)));
	}
	if !implementations.contains_key(primary) {
		return Err(ConfigError::Validation(format!(
			"Primary {section} '{primary}' not found in implementations"
		)));
	}
	Ok(())
}

impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	const MINIMAL: &str = r#"
[orchestrator]
id = "lottery-test"
operator_key = "operator"

[networks.31337]
factory_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
[[networks.31337.rpc_urls]]
http = "http://localhost:8545"

[storage]
primary = "memory"
[storage.implementations.memory]

[chain.implementations.mock]
chain_ids = [31337]

[account]
primary = "local"
[account.implementations.local.keys]
operator = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
"#;

	#[test]
	fn test_env_var_resolution() {
		std::env::set_var("LOTTERY_TEST_HOST", "localhost");
		std::env::set_var("LOTTERY_TEST_PORT", "6379");

		let input = "url = \"redis://${LOTTERY_TEST_HOST}:${LOTTERY_TEST_PORT}\"";
		let result = resolve_env_vars(input).unwrap();
		assert_eq!(result, "url = \"redis://localhost:6379\"");

		std::env::remove_var("LOTTERY_TEST_HOST");
		std::env::remove_var("LOTTERY_TEST_PORT");
	}

	#[test]
	fn test_env_var_with_default() {
		let input = "value = \"${LOTTERY_MISSING_VAR:-fallback}\"";
		assert_eq!(resolve_env_vars(input).unwrap(), "value = \"fallback\"");
	}

	#[test]
	fn test_missing_env_var_error() {
		let err = resolve_env_vars("value = \"${LOTTERY_MISSING_VAR}\"").unwrap_err();
		assert!(err.to_string().contains("LOTTERY_MISSING_VAR"));
	}

	#[test]
	fn test_minimal_config_defaults() {
		let config: Config = MINIMAL.parse().unwrap();
		assert_eq!(config.orchestrator.sweep_interval_seconds, 300);
		assert_eq!(config.orchestrator.status_ttl_seconds, 86_400);
		assert_eq!(config.orchestrator.operator_key.key_id(), "operator");
		assert_eq!(config.queue.max_attempts, 3);
		assert_eq!(config.queue.backoff_base_ms, 5_000);
		assert_eq!(config.listener.classifier, ClassifierKind::NamePattern);
		assert!(config.networks.contains_key(&31337));
	}

	#[test]
	fn test_unknown_primary_rejected() {
		let broken = MINIMAL.replace("primary = \"memory\"", "primary = \"redis\"");
		let err = broken.parse::<Config>().unwrap_err();
		assert!(err.to_string().contains("Primary storage 'redis'"));
	}

	#[test]
	fn test_schema_classifier_requires_schemas() {
		let with_schema = format!("{}\n[listener]\nclassifier = \"schema\"\n", MINIMAL);
		assert!(with_schema.parse::<Config>().is_err());

		let complete = format!(
			"{}\n[listener]\nclassifier = \"schema\"\n[listener.schemas.standard]\npurchase_events = [\"TicketsPurchased\"]\ndraw_events = [\"DrawCompleted\"]\n",
			MINIMAL
		);
		let config: Config = complete.parse().unwrap();
		assert_eq!(config.listener.schemas["standard"].draw_events, vec!["DrawCompleted"]);
	}

	#[test]
	fn test_zero_sweep_interval_rejected() {
		let broken = MINIMAL.replace(
			"operator_key = \"operator\"",
			"operator_key = \"operator\"\nsweep_interval_seconds = 0",
		);
		assert!(broken.parse::<Config>().is_err());
	}

	#[tokio::test]
	async fn test_from_file() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(MINIMAL.as_bytes()).unwrap();
		let config = Config::from_file(file.path().to_str().unwrap()).await.unwrap();
		assert_eq!(config.orchestrator.id, "lottery-test");

		assert!(matches!(
			Config::from_file("/nonexistent/lottery.toml").await,
			Err(ConfigError::Io(_))
		));
	}
}
