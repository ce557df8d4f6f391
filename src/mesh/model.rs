//! Wire types returned by the mesh agent's HTTP API. Field names mirror
//! the agent's JSON responses, not our internal naming.

use std::collections::HashMap;

use serde::Deserialize;

/// Blocking-query metadata returned alongside every agent response: an
/// index for `ConnectCARoots`/`Health().Connect`, a content hash for
/// `Agent().Service`.
#[derive(Debug, Clone, Default)]
pub struct QueryMeta {
	pub last_index: u64,
	pub last_content_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaRoot {
	#[serde(rename = "RootCertPEM")]
	pub root_cert_pem: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaRootList {
	#[serde(rename = "ActiveRootID")]
	pub active_root_id: String,
	#[serde(rename = "Roots")]
	pub roots: Vec<CaRoot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeafCert {
	#[serde(rename = "SerialNumber")]
	pub serial_number: String,
	#[serde(rename = "CertPEM")]
	pub cert_pem: String,
	#[serde(rename = "PrivateKeyPEM")]
	pub private_key_pem: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct UpstreamWeights {
	#[serde(rename = "Passing", default = "default_weight")]
	pub passing: u32,
	#[serde(rename = "Warning", default)]
	pub warning: u32,
}

fn default_weight() -> u32 {
	1
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentUpstream {
	#[serde(rename = "DestinationType", default)]
	pub destination_type: String,
	#[serde(rename = "DestinationName")]
	pub destination_name: String,
	#[serde(rename = "Datacenter", default)]
	pub datacenter: String,
	#[serde(rename = "LocalBindAddress", default)]
	pub local_bind_address: String,
	#[serde(rename = "LocalBindPort", default)]
	pub local_bind_port: u16,
	#[serde(rename = "Config", default)]
	pub config: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentServiceProxy {
	#[serde(rename = "DestinationServiceID", default)]
	pub destination_service_id: String,
	#[serde(rename = "Config", default)]
	pub config: HashMap<String, serde_json::Value>,
	#[serde(rename = "Upstreams", default)]
	pub upstreams: Vec<AgentUpstream>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentService {
	#[serde(rename = "ID", default)]
	pub id: String,
	#[serde(rename = "Service")]
	pub service: String,
	#[serde(rename = "Kind", default)]
	pub kind: String,
	#[serde(rename = "Port", default)]
	pub port: u16,
	#[serde(rename = "Address", default)]
	pub address: String,
	#[serde(rename = "Proxy", default)]
	pub proxy: Option<AgentServiceProxy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceWeights {
	#[serde(default = "default_weight")]
	pub passing: u32,
	#[serde(default)]
	pub warning: u32,
}

impl Default for ServiceWeights {
	fn default() -> Self {
		ServiceWeights { passing: 1, warning: 0 }
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthServiceEntryService {
	#[serde(rename = "Address", default)]
	pub address: String,
	#[serde(rename = "Port")]
	pub port: u16,
	#[serde(rename = "Weights", default)]
	pub weights: ServiceWeights,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthServiceEntryNode {
	#[serde(rename = "Address", default)]
	pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatedStatus {
	Passing,
	Warning,
	Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheck {
	#[serde(rename = "Status", default)]
	pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
	#[serde(rename = "Node")]
	pub node: HealthServiceEntryNode,
	#[serde(rename = "Service")]
	pub service: HealthServiceEntryService,
	#[serde(rename = "Checks", default)]
	pub checks: Vec<HealthCheck>,
}

impl ServiceEntry {
	/// `passing` if every check passes, `warning` if none fail but at
	/// least one warns, otherwise `other` (excluded from rotation).
	pub fn aggregated_status(&self) -> AggregatedStatus {
		let mut warning = false;
		for check in &self.checks {
			match check.status.as_str() {
				"passing" => continue,
				"warning" => warning = true,
				_ => return AggregatedStatus::Other,
			}
		}
		if warning {
			AggregatedStatus::Warning
		} else {
			AggregatedStatus::Passing
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreparedQueryExecuteResponse {
	#[serde(rename = "Nodes", default)]
	pub nodes: Vec<ServiceEntry>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AuthorizeRequest {
	#[serde(rename = "Target")]
	pub target: String,
	#[serde(rename = "ClientCertURI")]
	pub client_cert_uri: String,
	#[serde(rename = "ClientCertSerial")]
	pub client_cert_serial: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeResponse {
	#[serde(rename = "Authorized")]
	pub authorized: bool,
}
