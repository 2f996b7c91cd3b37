//! Per-chain network configuration.

use alloy_primitives::Address;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// One RPC endpoint; HTTP for requests, WebSocket optional.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcEndpoint {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub http: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ws: Option<String>,
}

impl RpcEndpoint {
	pub fn http_only(url: impl Into<String>) -> Self {
		Self {
			http: Some(url.into()),
			ws: None,
		}
	}
}

/// Settings for a single chain.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
	/// Endpoints in fallback order.
	pub rpc_urls: Vec<RpcEndpoint>,
	/// Factory that creates lottery contracts on this chain.
	pub factory_address: Address,
	/// Human readable name used in logs.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
}

impl NetworkConfig {
	/// First configured HTTP endpoint.
	pub fn http_url(&self) -> Option<&str> {
		self.rpc_urls.iter().find_map(|rpc| rpc.http.as_deref())
	}

	/// First configured WebSocket endpoint.
	pub fn ws_url(&self) -> Option<&str> {
		self.rpc_urls.iter().find_map(|rpc| rpc.ws.as_deref())
	}
}

/// Networks keyed by chain id.
pub type NetworksConfig = HashMap<u64, NetworkConfig>;

/// TOML tables cannot have integer keys, so chain ids arrive as strings.
pub fn deserialize_networks<'de, D>(deserializer: D) -> Result<NetworksConfig, D::Error>
where
	D: Deserializer<'de>,
{
	let string_map: HashMap<String, NetworkConfig> = HashMap::deserialize(deserializer)?;
	string_map
		.into_iter()
		.map(|(key, value)| {
			key.parse::<u64>()
				.map(|chain_id| (chain_id, value))
				.map_err(|e| serde::de::Error::custom(format!("Invalid chain_id '{}': {}", key, e)))
		})
		.collect()
}
