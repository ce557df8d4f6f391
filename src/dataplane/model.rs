//! JSON models for the proxy's management API resources (§6): frontends,
//! binds, backends, servers, filters, tcp/http request rules, log
//! targets. Field names match the data-plane API's JSON schema.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
	Http,
	Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verify {
	None,
	Optional,
	Required,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frontend {
	pub name: String,
	pub mode: Mode,
	pub default_backend: String,
	pub client_timeout: i64,
	#[serde(default)]
	pub httplog: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
	pub name: String,
	pub address: String,
	pub port: i64,
	#[serde(default)]
	pub ssl: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ssl_certificate: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ssl_cafile: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub verify: Option<Verify>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFacility {
	Local0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
	Rfc5424,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTarget {
	#[serde(default)]
	pub index: i64,
	pub address: String,
	pub facility: LogFacility,
	pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
	Spoe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
	#[serde(default)]
	pub index: i64,
	#[serde(rename = "type")]
	pub filter_type: FilterType,
	pub spoe_engine: String,
	pub spoe_config: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpRequestRuleType {
	Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TcpRequestRuleAction {
	Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cond {
	If,
	Unless,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpRequestRule {
	#[serde(default)]
	pub index: i64,
	#[serde(rename = "type")]
	pub rule_type: TcpRequestRuleType,
	pub action: TcpRequestRuleAction,
	pub cond: Cond,
	pub cond_test: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpRequestRuleType {
	AddHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestRule {
	#[serde(default)]
	pub index: i64,
	#[serde(rename = "type")]
	pub rule_type: HttpRequestRuleType,
	pub hdr_name: String,
	pub hdr_format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceAlgorithm {
	Leastconn,
	Roundrobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
	pub algorithm: BalanceAlgorithm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardforEnabled {
	Enabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forwardfor {
	pub enabled: ForwardforEnabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
	pub name: String,
	pub mode: Mode,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub connect_timeout: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub server_timeout: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub balance: Option<Balance>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub forwardfor: Option<Forwardfor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Maintenance {
	Enabled,
	Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
	Enabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
	pub name: String,
	pub address: String,
	pub port: i64,
	pub weight: i64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ssl: Option<SslMode>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ssl_certificate: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ssl_cafile: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub verify: Option<Verify>,
	pub maintenance: Maintenance,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Transaction {
	pub id: String,
}
